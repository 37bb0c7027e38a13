//! OCPP Relay Core
//!
//! Runtime for OCPP networking nodes: charging stations, local controllers
//! and CSMS instances that originate, terminate and relay OCPP messages
//! across multi-hop topologies.
//!
//! ## Architecture
//!
//! ```text
//!            CSMS
//!              │ routed frames
//!              ▼
//! ┌──────────────────────────────────┐
//! │  NetworkingNode (local controller)│
//! │  ┌──────┐  ┌─────────┐  ┌──────┐  │
//! │  │  IN  │─►│ FORWARD │─►│ OUT  │  │
//! │  └──────┘  └─────────┘  └──────┘  │
//! │   codec │ correlator │ routing    │
//! └──────────────┬───────────────────┘
//!                │ plain OCPP
//!                ▼
//!         Charging stations
//! ```
//!
//! Transports (WebSocket, in-memory) are injected through [`Transport`] and
//! push inbound frames with [`NetworkingNode::handle_frame`].
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_relay_core::{HandlerError, MemoryNetwork, NetworkingNode, NodeConfig, Payload, SendRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let network = MemoryNetwork::new();
//! let csms = NetworkingNode::builder(NodeConfig::csms("CSMS-1"))
//!     .handler("Heartbeat", |_ctx, _payload| async {
//!         Payload::json(&serde_json::json!({"currentTime": "2024-01-01T00:00:00Z"})).map_err(HandlerError::from)
//!     })
//!     .build(network.clone())?;
//! let station = NetworkingNode::builder(NodeConfig::new("CS001")).build(network.clone())?;
//! network.link(&station, &csms, ocpp_relay_core::FrameProfile::Routed);
//!
//! let response = station.send(SendRequest::new("Heartbeat", Payload::empty())).await;
//! assert!(response.is_ok());
//! # Ok(())
//! # }
//! ```

mod adapter;
pub mod addressing;
pub mod binary;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod forwarding;
pub mod handler;
pub mod memory;
pub mod messages;
pub mod node;
pub mod registry;
pub mod result;
pub mod routing;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use adapter::SendRequest;
pub use addressing::{classify_call, classify_reply, InboundRoute, NetworkPath, ReplyRoute};
pub use codec::{CodecError, DecodeError, Frame, FrameProfile};
pub use config::{ConfigError, NodeConfig};
pub use correlation::{CorrelationError, Correlator, PendingHandle, Resolution};
pub use forwarding::{
    FnVoter, ForwardingDecision, ForwardingOutcome, ForwardingVoter, RejectResponse, TransitRequest, Vote,
    VoteContext, VoterHandle,
};
pub use handler::{Dispatch, HandlerError, HandlerTable, RequestContext};
pub use memory::{Link, MemoryNetwork, ScriptedPeer};
pub use messages::{Call, CallError, CallResult, Channel, Envelope, ErrorCode, Message, MessageType, Payload};
pub use node::{NetworkingNode, NodeBuilder};
pub use registry::{ActionRegistry, BinaryPayload, ParsedRequest, RegistryError};
pub use result::{ExchangeResult, Response, ResultCode, FILTERED_MARKER};
pub use routing::{ConnectionInfo, ConnectionRole, RoutingTable};
pub use telemetry::{CallbackError, ExchangeObserver, Telemetry, TelemetryEvent, TelemetrySink, TracingSink};
pub use transport::{Transport, TransportError};
pub use types::{ConnectionId, NodeId, RequestId};
