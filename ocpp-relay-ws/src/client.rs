//! Upstream WebSocket client
//!
//! Connects the node toward its CSMS (or an upstream networking node) and
//! keeps the link up:
//! - OCPP subprotocol negotiation
//! - Automatic reconnection with exponential backoff and jitter
//! - Connection open/close reported to the node

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tracing::{error, info, warn};

use ocpp_relay_core::{ConnectionId, ConnectionInfo, ConnectionRole, FrameProfile, NetworkingNode};

use crate::config::{build_ocpp_url, profile_for_subprotocol};
use crate::transport::{WsError, WsTransport};

/// Next reconnect delay: doubled, capped
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}

/// Add up to 10% random jitter
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

impl WsTransport {
    /// Keep the upstream connection alive; returns only if no upstream is configured
    pub async fn run_upstream(self: Arc<Self>, node: NetworkingNode) -> Result<(), WsError> {
        let base_url = self.config.upstream_url.clone().ok_or(WsError::NoUpstream)?;
        let url = build_ocpp_url(&base_url, node.id());
        let mut reconnect_delay = self.config.reconnect_delay;

        loop {
            info!("Connecting upstream: {}", url);

            match self.connect_upstream(&url, &node).await {
                Ok(()) => {
                    info!("Upstream connection closed");
                    reconnect_delay = self.config.reconnect_delay;
                }
                Err(e) => {
                    error!("Upstream connection error: {}", e);
                    reconnect_delay = next_backoff(reconnect_delay, self.config.max_reconnect_delay);
                }
            }

            let delay = with_jitter(reconnect_delay);
            info!("Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Connect once and pump frames until disconnection
    async fn connect_upstream(&self, url: &str, node: &NetworkingNode) -> Result<(), WsError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| WsError::InvalidUrl(format!("{}: {}", url, e)))?;
        let subprotocol = HeaderValue::from_str(&self.config.upstream_subprotocol)
            .map_err(|_| WsError::InvalidHeader(self.config.upstream_subprotocol.clone()))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, subprotocol);

        let (ws_stream, response) = connect_async_with_config(request, Some(self.ws_config()), false).await?;

        // Verify subprotocol
        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        let profile = match accepted.and_then(profile_for_subprotocol) {
            Some(profile) => profile,
            None => {
                warn!(
                    "Upstream did not accept {}, got: {:?}; using plain framing",
                    self.config.upstream_subprotocol, accepted
                );
                FrameProfile::Standard
            }
        };

        info!("WebSocket connected to {} ({:?} framing)", url, profile);
        let info = ConnectionInfo::new(
            ConnectionId::new(format!("upstream:{}", self.config.upstream_id)),
            self.config.upstream_id.clone(),
            ConnectionRole::Upstream,
            profile,
        );
        self.run_connection(node, info, ws_stream).await;
        Ok(())
    }
}
