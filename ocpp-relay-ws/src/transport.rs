//! WebSocket implementation of the node transport
//!
//! Every connection, accepted or dialed, gets one writer task fed by an mpsc
//! channel. The node sends by connection id; the reader hands each inbound
//! frame to the node on its own task.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, protocol::WebSocketConfig, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use ocpp_relay_core::{ConnectionId, ConnectionInfo, Frame, NetworkingNode, Transport, TransportError};

use crate::config::WsConfig;

/// Errors setting up WebSocket connections
#[derive(Debug, Error)]
pub enum WsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("No upstream configured")]
    NoUpstream,

    #[error("No listen address configured")]
    NoListenAddr,
}

/// WebSocket transport shared by the server and the upstream client
pub struct WsTransport {
    pub(crate) config: WsConfig,
    writers: RwLock<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
}

impl WsTransport {
    pub fn new(config: WsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            writers: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.writers.read().len()
    }

    pub(crate) fn ws_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_frame_size),
            ..Default::default()
        }
    }

    /// Pump one established connection until it closes
    pub(crate) async fn run_connection<S>(
        &self,
        node: &NetworkingNode,
        info: ConnectionInfo,
        stream: WebSocketStream<S>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = info.id.clone();
        let peer = info.peer.clone();
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (send_tx, mut send_rx) = mpsc::channel::<Frame>(self.config.send_queue);

        self.writers.write().insert(connection.clone(), send_tx);
        node.connection_opened(info);

        // Spawn sender task
        let writer_peer = peer.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = send_rx.recv().await {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text),
                    Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
                };
                if let Err(e) = ws_tx.send(message).await {
                    error!("Failed to send WebSocket message to {}: {}", writer_peer, e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(message) = ws_rx.next().await {
            let frame = match message {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Binary(data)) => Frame::Binary(Bytes::from(data)),
                Ok(Message::Close(_)) => {
                    info!("WebSocket closed by {}", peer);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("WebSocket error from {}: {}", peer, e);
                    break;
                }
            };

            let node = node.clone();
            let connection = connection.clone();
            tokio::spawn(async move { node.handle_frame(&connection, frame).await });
        }

        self.writers.write().remove(&connection);
        node.connection_closed(&connection);
        writer.abort();
        debug!("Connection {} finished", connection);
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, connection: &ConnectionId, frame: Frame) -> Result<(), TransportError> {
        if frame.len() > self.config.max_message_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: self.config.max_message_size,
            });
        }

        let writer = self
            .writers
            .read()
            .get(connection)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(connection.clone()))?;

        writer
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed(connection.clone()))
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("connections", &self.connection_count())
            .finish()
    }
}
