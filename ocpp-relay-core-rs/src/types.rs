//! Core identifiers shared by every layer of the node

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum length of an OCPP message id
pub const MAX_REQUEST_ID_LEN: usize = 36;

/// Identifier of a node in the fleet (charging station, networking node or CSMS)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Sentinel destination meaning "whichever node is the CSMS"
    pub const CSMS: &'static str = "CSMS";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The CSMS sentinel destination
    pub fn csms() -> Self {
        Self(Self::CSMS.to_string())
    }

    pub fn is_csms(&self) -> bool {
        self.0 == Self::CSMS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// OCPP message id correlating a Call with its CallResult/CallError
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validate an id received from the wire
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.len() > MAX_REQUEST_ID_LEN {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one transport connection (one WebSocket, one in-memory link)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
