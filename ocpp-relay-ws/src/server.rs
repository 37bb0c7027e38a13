//! WebSocket server for downstream peers
//!
//! Stations and downstream networking nodes connect to
//! `ws://<listen>/<anything>/<nodeId>`. The last path segment names the peer;
//! the negotiated subprotocol picks the framing profile.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tracing::{debug, info, warn};

use ocpp_relay_core::{ConnectionId, ConnectionInfo, ConnectionRole, FrameProfile, NetworkingNode, NodeId};

use crate::config::profile_for_subprotocol;
use crate::transport::{WsError, WsTransport};

/// Outcome of the handshake callback
#[derive(Debug, Clone, PartialEq, Eq)]
struct Negotiated {
    peer: NodeId,
    profile: FrameProfile,
}

/// Peer node id from the request path: the last non-empty segment
pub fn peer_from_path(path: &str) -> Option<NodeId> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .last()
        .map(NodeId::from)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

impl WsTransport {
    /// Accept downstream connections until the listener fails
    pub async fn serve(self: Arc<Self>, node: NetworkingNode) -> Result<(), WsError> {
        let addr = self.config.listen_addr.ok_or(WsError::NoListenAddr)?;
        let listener = TcpListener::bind(addr).await?;
        info!("Accepting OCPP connections on {}", listener.local_addr()?);
        self.accept_loop(listener, node).await
    }

    /// Accept on an already bound listener
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener, node: NetworkingNode) -> Result<(), WsError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("TCP connection from {}", addr);

            let transport = self.clone();
            let node = node.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.handle_downstream(stream, addr, node).await {
                    warn!("Connection from {} failed: {}", addr, e);
                }
            });
        }
    }

    async fn handle_downstream(&self, stream: TcpStream, addr: SocketAddr, node: NetworkingNode) -> Result<(), WsError> {
        let mut negotiated = None;

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let Some(peer) = peer_from_path(request.uri().path()) else {
                return Err(reject(StatusCode::BAD_REQUEST, "missing node id in path"));
            };

            let offered = request
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').collect::<Vec<_>>())
                .unwrap_or_default();

            let profile = match self.config.negotiate(offered.iter().copied()) {
                Some(subprotocol) => {
                    let value = HeaderValue::from_str(subprotocol)
                        .map_err(|_| reject(StatusCode::INTERNAL_SERVER_ERROR, "bad subprotocol"))?;
                    response.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                    profile_for_subprotocol(subprotocol).unwrap_or(FrameProfile::Standard)
                }
                None if offered.is_empty() => FrameProfile::Standard,
                None => {
                    return Err(reject(StatusCode::BAD_REQUEST, "no supported OCPP subprotocol offered"));
                }
            };

            negotiated = Some(Negotiated { peer, profile });
            Ok(response)
        };

        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(self.ws_config())).await?;
        let Some(Negotiated { peer, profile }) = negotiated else {
            return Ok(());
        };

        info!("{} connected from {} ({:?} framing)", peer, addr, profile);
        let connection = ConnectionId::new(format!("{}@{}", peer, addr));
        let info = ConnectionInfo::new(connection, peer, ConnectionRole::Downstream, profile);
        self.run_connection(&node, info, ws_stream).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_from_path() {
        assert_eq!(peer_from_path("/ocpp/CS001"), Some(NodeId::from("CS001")));
        assert_eq!(peer_from_path("/ocpp/CS001/"), Some(NodeId::from("CS001")));
        assert_eq!(peer_from_path("/LC1"), Some(NodeId::from("LC1")));
        assert_eq!(peer_from_path("/"), None);
        assert_eq!(peer_from_path(""), None);
    }

    #[test]
    fn test_reject_sets_status() {
        let response = reject(StatusCode::BAD_REQUEST, "nope");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body().as_deref(), Some("nope"));
    }
}
