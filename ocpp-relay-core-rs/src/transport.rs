//! Transport seam
//!
//! The node only needs "send this frame on connection X". Inbound frames are
//! pushed into [`crate::NetworkingNode::handle_frame`] by whoever owns the
//! sockets.

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::Frame;
use crate::types::ConnectionId;

/// Errors raised while handing a frame to the transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection {0} is not open")]
    NotConnected(ConnectionId),

    #[error("Connection {0} closed")]
    Closed(ConnectionId),

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Transport error: {0}")]
    Other(String),
}

/// Outbound side of a transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a frame for delivery on a connection
    async fn send(&self, connection: &ConnectionId, frame: Frame) -> Result<(), TransportError>;
}
