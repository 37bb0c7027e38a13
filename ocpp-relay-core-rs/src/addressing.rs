//! Multi-hop addressing
//!
//! A request records every node it traverses in its [`NetworkPath`]: the
//! originator first, then one entry per relay. Replies carry the same path
//! back and each relay strips itself off the end before handing the reply to
//! its predecessor, until the path is empty again at the originator.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::types::NodeId;

/// Ordered, acyclic list of hops from origin to the current point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_hops(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }

    pub fn single(hop: NodeId) -> Self {
        Self(vec![hop])
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    pub fn origin(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    /// New path with `hop` appended
    pub fn append(&self, hop: NodeId) -> Self {
        let mut hops = self.0.clone();
        hops.push(hop);
        Self(hops)
    }

    /// New path without its last hop
    pub fn without_last(&self) -> Self {
        let mut hops = self.0.clone();
        hops.pop();
        Self(hops)
    }

    /// True if some hop appears more than once
    pub fn has_cycle(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.0.len());
        !self.0.iter().all(|hop| seen.insert(hop))
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.0.iter().map(NodeId::as_str).collect();
        write!(f, "[{}]", hops.join(" -> "))
    }
}

/// Where an inbound Call goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute {
    /// Addressed to this node
    Local,
    /// Addressed elsewhere; goes through the forwarding pipeline
    Transit,
    /// The path already contains this node
    Loop,
}

/// Decide how to treat an inbound Call.
///
/// Loop detection wins over everything else: a path that already contains the
/// local id is never handled or forwarded.
pub fn classify_call(
    local: &NodeId,
    local_is_csms: bool,
    destination: &NodeId,
    path: &NetworkPath,
) -> InboundRoute {
    if path.contains(local) {
        return InboundRoute::Loop;
    }

    if destination == local || (destination.is_csms() && local_is_csms) {
        InboundRoute::Local
    } else {
        InboundRoute::Transit
    }
}

/// Where an inbound CallResult/CallError goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyRoute {
    /// Deliver to the local correlation engine
    Local,
    /// Hand to the predecessor hop with the shortened path
    Relay { next_hop: NodeId, path: NetworkPath },
}

/// Walk one step back along the reply path
pub fn classify_reply(local: &NodeId, path: &NetworkPath) -> ReplyRoute {
    if path.last() != Some(local) {
        return ReplyRoute::Local;
    }

    let remaining = path.without_last();
    match remaining.last() {
        Some(next_hop) => ReplyRoute::Relay {
            next_hop: next_hop.clone(),
            path: remaining.clone(),
        },
        None => ReplyRoute::Local,
    }
}
