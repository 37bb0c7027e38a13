//! Configuration for a networking node

use std::time::Duration;
use thiserror::Error;

use crate::forwarding::ForwardingOutcome;
use crate::types::NodeId;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Node id must not be empty")]
    EmptyNodeId,

    #[error("Node id {0} is reserved for the CSMS")]
    ReservedNodeId(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("Static route to {0} points at itself")]
    SelfRoute(NodeId),
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's identity
    pub node_id: NodeId,

    /// Whether this node is the CSMS (answers the CSMS sentinel destination)
    pub is_csms: bool,

    /// Default timeout for outgoing requests
    pub request_timeout: Duration,

    /// How long a forwarding voter may take before its vote is ignored
    pub vote_timeout: Duration,

    /// Decision when no voter has an opinion
    pub default_forwarding: ForwardingOutcome,

    /// Let requests for actions missing from the registry transit unparsed
    pub forward_unknown_actions: bool,

    /// Interval of the pending-table sweep
    pub sweep_interval: Duration,

    /// Static routes: destination -> directly connected node
    pub static_routes: Vec<(NodeId, NodeId)>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("ocpp-relay"),
            is_csms: false,
            request_timeout: Duration::from_secs(30),
            vote_timeout: Duration::from_secs(5),
            default_forwarding: ForwardingOutcome::Forward,
            forward_unknown_actions: false,
            sweep_interval: Duration::from_secs(1),
            static_routes: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Configuration for the CSMS at the root of the tree
    pub fn csms(node_id: impl Into<NodeId>) -> Self {
        Self::new(node_id).as_csms()
    }

    pub fn as_csms(mut self) -> Self {
        self.is_csms = true;
        self
    }

    /// Set default request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set per-voter timeout
    pub fn with_vote_timeout(mut self, timeout: Duration) -> Self {
        self.vote_timeout = timeout;
        self
    }

    /// Set the decision applied when no voter decides
    pub fn with_default_forwarding(mut self, outcome: ForwardingOutcome) -> Self {
        self.default_forwarding = outcome;
        self
    }

    pub fn with_forward_unknown_actions(mut self, forward: bool) -> Self {
        self.forward_unknown_actions = forward;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Add a static route
    pub fn with_static_route(mut self, destination: impl Into<NodeId>, via: impl Into<NodeId>) -> Self {
        self.static_routes.push((destination.into(), via.into()));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.as_str().is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        if self.node_id.is_csms() && !self.is_csms {
            return Err(ConfigError::ReservedNodeId(self.node_id.to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("request timeout"));
        }
        if self.vote_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("vote timeout"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("sweep interval"));
        }
        if let Some((destination, _)) = self.static_routes.iter().find(|(dest, via)| dest == via) {
            return Err(ConfigError::SelfRoute(destination.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("NN1")
            .with_request_timeout(Duration::from_secs(10))
            .with_default_forwarding(ForwardingOutcome::Reject)
            .with_static_route("CS042", "NN2");

        assert_eq!(config.node_id, NodeId::from("NN1"));
        assert!(!config.is_csms);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.vote_timeout, Duration::from_secs(5));
        assert_eq!(config.default_forwarding, ForwardingOutcome::Reject);
        assert_eq!(config.static_routes, vec![(NodeId::from("CS042"), NodeId::from("NN2"))]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert_eq!(NodeConfig::new("").validate(), Err(ConfigError::EmptyNodeId));
        assert!(matches!(
            NodeConfig::new("CSMS").validate(),
            Err(ConfigError::ReservedNodeId(_))
        ));
        assert!(NodeConfig::csms("CSMS").validate().is_ok());
        assert_eq!(
            NodeConfig::new("NN1").with_request_timeout(Duration::ZERO).validate(),
            Err(ConfigError::ZeroDuration("request timeout"))
        );
        assert!(matches!(
            NodeConfig::new("NN1").with_static_route("X", "X").validate(),
            Err(ConfigError::SelfRoute(_))
        ));
    }
}
