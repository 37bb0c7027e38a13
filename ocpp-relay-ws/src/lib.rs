//! # OCPP Relay WebSocket
//!
//! WebSocket transport for [`ocpp_relay_core`] networking nodes, plus the
//! standard OCPP actions most deployments need.
//!
//! ## Architecture
//!
//! ```text
//!        CSMS / upstream node
//!              ▲ client (reconnecting)
//!              │
//! ┌────────────┴────────────┐
//! │       WsTransport       │──► NetworkingNode
//! └────────────┬────────────┘
//!              │ server
//!              ▼
//!     stations / downstream nodes
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_relay_core::{NetworkingNode, NodeConfig};
//! use ocpp_relay_ws::{standard_registry, WsConfig, WsTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = WsTransport::new(
//!         WsConfig::new()
//!             .with_listen_addr("0.0.0.0:9000".parse()?)
//!             .with_upstream("ws://csms.example.com/ocpp"),
//!     );
//!     let node = NetworkingNode::builder(NodeConfig::new("LC1"))
//!         .with_registry(standard_registry())
//!         .build(transport.clone())?;
//!
//!     tokio::spawn(transport.clone().run_upstream(node.clone()));
//!     transport.serve(node).await?;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod client;
pub mod config;
pub mod server;
pub mod transport;

pub use actions::{csms_handlers, register_standard_actions, standard_registry, CsmsDefaults};
pub use client::next_backoff;
pub use config::{build_ocpp_url, profile_for_subprotocol, WsConfig, SUBPROTOCOL_OCPP201, SUBPROTOCOL_OCPP21};
pub use server::peer_from_path;
pub use transport::{WsError, WsTransport};
