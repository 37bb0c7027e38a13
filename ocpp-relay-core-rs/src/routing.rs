//! Connection registry and next-hop selection

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::addressing::NetworkPath;
use crate::codec::FrameProfile;
use crate::types::{ConnectionId, NodeId};

/// Which side of this node a connection faces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// A charging station or networking node connected to us
    Downstream,
    /// Our link toward the CSMS
    Upstream,
}

/// An open connection as seen by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// Node at the other end
    pub peer: NodeId,
    pub role: ConnectionRole,
    pub profile: FrameProfile,
}

impl ConnectionInfo {
    pub fn new(id: ConnectionId, peer: NodeId, role: ConnectionRole, profile: FrameProfile) -> Self {
        Self { id, peer, role, profile }
    }

    /// Destination assumed for Calls arriving without a routing header.
    ///
    /// Plain stations talk to "the CSMS"; a CSMS talking down to us addresses us.
    pub fn default_destination(&self, local: &NodeId) -> NodeId {
        match self.role {
            ConnectionRole::Downstream => NodeId::csms(),
            ConnectionRole::Upstream => local.clone(),
        }
    }
}

#[derive(Default)]
struct RoutingState {
    connections: HashMap<ConnectionId, ConnectionInfo>,
    direct: HashMap<NodeId, ConnectionId>,
    learned: HashMap<NodeId, ConnectionId>,
    static_routes: HashMap<NodeId, NodeId>,
    upstream: Option<ConnectionId>,
}

/// Routing table: direct peers, static routes, learned routes, default upstream
pub struct RoutingTable {
    local: NodeId,
    local_is_csms: bool,
    state: RwLock<RoutingState>,
}

impl RoutingTable {
    pub fn new(local: NodeId, local_is_csms: bool) -> Self {
        Self {
            local,
            local_is_csms,
            state: RwLock::new(RoutingState::default()),
        }
    }

    /// Register a newly opened connection
    pub fn open(&self, info: ConnectionInfo) {
        let mut state = self.state.write();
        info!("Connection {} opened to {} ({:?})", info.id, info.peer, info.role);

        state.direct.insert(info.peer.clone(), info.id.clone());
        state.learned.remove(&info.peer);
        if info.role == ConnectionRole::Upstream {
            state.upstream = Some(info.id.clone());
        }
        state.connections.insert(info.id.clone(), info);
    }

    /// Forget a connection and every route through it
    pub fn close(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        let mut state = self.state.write();
        let info = state.connections.remove(id)?;

        state.direct.retain(|_, conn| conn != id);
        state.learned.retain(|_, conn| conn != id);
        if state.upstream.as_ref() == Some(id) {
            state.upstream = None;
        }

        info!("Connection {} to {} closed", id, info.peer);
        Some(info)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.state.read().connections.get(id).cloned()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.state.read().connections.values().cloned().collect()
    }

    /// Route `destination` through the directly connected node `via`
    pub fn add_static_route(&self, destination: NodeId, via: NodeId) {
        self.state.write().static_routes.insert(destination, via);
    }

    /// Remember that every hop of `path` is reachable through `connection`
    pub fn learn_from_path(&self, path: &NetworkPath, connection: &ConnectionId) {
        let mut state = self.state.write();
        for hop in path.hops() {
            if *hop == self.local || state.direct.contains_key(hop) {
                continue;
            }
            if state.learned.get(hop) != Some(connection) {
                debug!("Learned route to {} via connection {}", hop, connection);
                state.learned.insert(hop.clone(), connection.clone());
            }
        }
    }

    /// Connection to hand a message for `destination` to, if any
    pub fn next_hop(&self, destination: &NodeId) -> Option<ConnectionInfo> {
        let state = self.state.read();

        let by_id = |id: &ConnectionId| state.connections.get(id).cloned();

        if let Some(info) = state.direct.get(destination).and_then(by_id) {
            return Some(info);
        }

        if let Some(info) = state
            .static_routes
            .get(destination)
            .and_then(|via| state.direct.get(via))
            .and_then(by_id)
        {
            return Some(info);
        }

        if let Some(info) = state.learned.get(destination).and_then(by_id) {
            return Some(info);
        }

        if destination.is_csms() && self.local_is_csms {
            return None;
        }

        state.upstream.as_ref().and_then(by_id)
    }
}
