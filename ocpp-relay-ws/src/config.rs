//! Configuration for the WebSocket transport

use std::net::SocketAddr;
use std::time::Duration;

use ocpp_relay_core::{FrameProfile, NodeId};

/// Plain OCPP 2.0.1 framing
pub const SUBPROTOCOL_OCPP201: &str = "ocpp2.0.1";

/// OCPP 2.1, whose networking-node links carry the routing header
pub const SUBPROTOCOL_OCPP21: &str = "ocpp2.1";

/// Framing implied by a negotiated subprotocol
pub fn profile_for_subprotocol(subprotocol: &str) -> Option<FrameProfile> {
    match subprotocol {
        SUBPROTOCOL_OCPP201 => Some(FrameProfile::Standard),
        SUBPROTOCOL_OCPP21 => Some(FrameProfile::Routed),
        _ => None,
    }
}

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Address to accept downstream connections on (none: no server)
    pub listen_addr: Option<SocketAddr>,

    /// Upstream WebSocket URL, without the trailing node id
    pub upstream_url: Option<String>,

    /// Node id of whatever sits at the upstream end
    pub upstream_id: NodeId,

    /// Subprotocol requested from the upstream
    pub upstream_subprotocol: String,

    /// Subprotocols accepted from downstream peers, most preferred first
    pub subprotocols: Vec<String>,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// Largest accepted WebSocket message
    pub max_message_size: usize,

    /// Largest accepted WebSocket frame
    pub max_frame_size: usize,

    /// Outgoing frames buffered per connection
    pub send_queue: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            upstream_url: None,
            upstream_id: NodeId::csms(),
            upstream_subprotocol: SUBPROTOCOL_OCPP21.to_string(),
            subprotocols: vec![SUBPROTOCOL_OCPP21.to_string(), SUBPROTOCOL_OCPP201.to_string()],
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
            send_queue: 64,
        }
    }
}

impl WsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept downstream connections on `addr`
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Connect upstream to `url`
    pub fn with_upstream(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = Some(url.into());
        self
    }

    pub fn with_upstream_id(mut self, id: impl Into<NodeId>) -> Self {
        self.upstream_id = id.into();
        self
    }

    /// Pick the upstream framing; plain OCPP unless `Routed`
    pub fn with_upstream_profile(mut self, profile: FrameProfile) -> Self {
        self.upstream_subprotocol = match profile {
            FrameProfile::Standard => SUBPROTOCOL_OCPP201,
            FrameProfile::Routed => SUBPROTOCOL_OCPP21,
        }
        .to_string();
        self
    }

    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    /// Set reconnect backoff
    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Framing expected from the upstream if it accepts our subprotocol
    pub fn upstream_profile(&self) -> FrameProfile {
        profile_for_subprotocol(&self.upstream_subprotocol).unwrap_or(FrameProfile::Standard)
    }

    /// First of our accepted subprotocols that the peer offers
    pub fn negotiate<'a>(&self, offered: impl IntoIterator<Item = &'a str>) -> Option<&str> {
        let offered: Vec<&str> = offered.into_iter().map(str::trim).collect();
        self.subprotocols
            .iter()
            .map(String::as_str)
            .find(|ours| offered.contains(ours))
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, node_id: &NodeId) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WsConfig::default();
        assert!(config.listen_addr.is_none());
        assert!(config.upstream_url.is_none());
        assert_eq!(config.upstream_id, NodeId::csms());
        assert_eq!(config.upstream_profile(), FrameProfile::Routed);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[test]
    fn test_builders() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = WsConfig::new()
            .with_listen_addr(addr)
            .with_upstream("ws://csms.local/ocpp")
            .with_upstream_id("CSMS-1")
            .with_upstream_profile(FrameProfile::Standard)
            .with_reconnect(Duration::from_millis(100), Duration::from_secs(2))
            .with_max_message_size(1024);

        assert_eq!(config.listen_addr, Some(addr));
        assert_eq!(config.upstream_url.as_deref(), Some("ws://csms.local/ocpp"));
        assert_eq!(config.upstream_id, NodeId::from("CSMS-1"));
        assert_eq!(config.upstream_subprotocol, SUBPROTOCOL_OCPP201);
        assert_eq!(config.upstream_profile(), FrameProfile::Standard);
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.max_message_size, 1024);
    }

    #[test]
    fn test_negotiation_prefers_our_order() {
        let config = WsConfig::default();
        assert_eq!(config.negotiate(["ocpp2.0.1", " ocpp2.1"]), Some(SUBPROTOCOL_OCPP21));
        assert_eq!(config.negotiate(["ocpp2.0.1"]), Some(SUBPROTOCOL_OCPP201));
        assert_eq!(config.negotiate(["ocpp1.6"]), None);

        let strict = config.with_subprotocols(vec![SUBPROTOCOL_OCPP201.to_string()]);
        assert_eq!(strict.negotiate(["ocpp2.1"]), None);
    }

    #[test]
    fn test_profile_for_subprotocol() {
        assert_eq!(profile_for_subprotocol("ocpp2.0.1"), Some(FrameProfile::Standard));
        assert_eq!(profile_for_subprotocol("ocpp2.1"), Some(FrameProfile::Routed));
        assert_eq!(profile_for_subprotocol("ocpp1.6"), None);
    }

    #[test]
    fn test_build_ocpp_url() {
        let id = NodeId::from("EK3-001");
        assert_eq!(
            build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService", &id),
            "ws://localhost:8180/steve/websocket/CentralSystemService/EK3-001"
        );
        assert_eq!(
            build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService/", &id),
            "ws://localhost:8180/steve/websocket/CentralSystemService/EK3-001"
        );
    }
}
