//! IN / OUT / FORWARD adapters
//!
//! One generic code path for every action: IN decodes frames and routes them,
//! OUT sends requests through the correlation engine, FORWARD runs the
//! forwarding pipeline for traffic that only passes through.

mod forward;
mod inbound;
mod outbound;

pub use outbound::SendRequest;

pub(crate) use forward::TransitTable;

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{self, CodecError, Frame};
use crate::config::NodeConfig;
use crate::correlation::Correlator;
use crate::forwarding::ForwardingPipeline;
use crate::handler::HandlerTable;
use crate::messages::Envelope;
use crate::registry::ActionRegistry;
use crate::routing::{ConnectionInfo, RoutingTable};
use crate::telemetry::Telemetry;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub(crate) enum SendFailure {
    #[error("encode failed: {0}")]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// State shared by the adapters of one node
pub(crate) struct NodeCore {
    pub config: NodeConfig,
    pub routing: RoutingTable,
    pub correlator: Correlator,
    pub pipeline: ForwardingPipeline,
    pub handlers: HandlerTable,
    pub registry: Arc<ActionRegistry>,
    pub telemetry: Telemetry,
    pub transport: Arc<dyn Transport>,
    pub transit: TransitTable,
    pub shutdown: CancellationToken,
}

impl NodeCore {
    /// Encode for the connection's profile and hand to the transport
    pub async fn send_envelope(&self, info: &ConnectionInfo, envelope: &Envelope) -> Result<(), SendFailure> {
        let frame = codec::encode(envelope, info.profile)?;
        self.send_frame(info, frame).await
    }

    pub async fn send_frame(&self, info: &ConnectionInfo, frame: Frame) -> Result<(), SendFailure> {
        debug!("-> {} {:?} ({} bytes)", info.peer, frame.channel(), frame.len());
        self.transport.send(&info.id, frame).await?;
        Ok(())
    }
}
