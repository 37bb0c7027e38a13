//! In-process transport
//!
//! Links nodes inside one process, for tests and for embedding several
//! logical nodes in one service. Every delivered frame is handled on its own
//! task, like a socket reader would do.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::NodeCore;
use crate::codec::{Frame, FrameProfile};
use crate::node::NetworkingNode;
use crate::routing::{ConnectionInfo, ConnectionRole};
use crate::transport::{Transport, TransportError};
use crate::types::{ConnectionId, NodeId};

#[derive(Clone)]
enum Endpoint {
    /// Deliver to `connection` on another node
    Node { node: Weak<NodeCore>, connection: ConnectionId },
    /// Hand frames to a scripted test peer
    Scripted(mpsc::UnboundedSender<Frame>),
}

/// Both ends of a node-to-node link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Connection id on the downstream node
    pub downstream: ConnectionId,
    /// Connection id on the upstream node
    pub upstream: ConnectionId,
}

/// A fake peer attached to a node: sees what the node sends, injects frames
pub struct ScriptedPeer {
    pub connection: ConnectionId,
    node: NetworkingNode,
    frames: mpsc::UnboundedReceiver<Frame>,
}

impl ScriptedPeer {
    /// Deliver a frame to the node as if the peer had sent it
    pub fn inject(&self, frame: Frame) {
        let node = self.node.clone();
        let connection = self.connection.clone();
        tokio::spawn(async move { node.handle_frame(&connection, frame).await });
    }

    pub fn inject_text(&self, text: impl Into<String>) {
        self.inject(Frame::Text(text.into()));
    }

    /// Next frame the node sent to this peer
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Next frame, which must be text
    pub async fn recv_text(&mut self) -> Option<String> {
        match self.recv().await? {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }

    pub fn close(&self) {
        self.node.connection_closed(&self.connection);
    }
}

/// In-memory transport shared by every node it links
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<ConnectionId, Endpoint>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect `downstream` to `upstream` with the given framing
    pub fn link(&self, downstream: &NetworkingNode, upstream: &NetworkingNode, profile: FrameProfile) -> Link {
        let link = Link {
            downstream: ConnectionId::new(format!("{}->{}", downstream.id(), upstream.id())),
            upstream: ConnectionId::new(format!("{}<-{}", upstream.id(), downstream.id())),
        };

        {
            let mut endpoints = self.endpoints.write();
            endpoints.insert(
                link.downstream.clone(),
                Endpoint::Node {
                    node: upstream.downgrade(),
                    connection: link.upstream.clone(),
                },
            );
            endpoints.insert(
                link.upstream.clone(),
                Endpoint::Node {
                    node: downstream.downgrade(),
                    connection: link.downstream.clone(),
                },
            );
        }

        downstream.connection_opened(ConnectionInfo::new(
            link.downstream.clone(),
            upstream.id().clone(),
            ConnectionRole::Upstream,
            profile,
        ));
        upstream.connection_opened(ConnectionInfo::new(
            link.upstream.clone(),
            downstream.id().clone(),
            ConnectionRole::Downstream,
            profile,
        ));

        link
    }

    /// Attach a scripted peer posing as `peer` to `node`
    pub fn attach_peer(
        &self,
        node: &NetworkingNode,
        peer: impl Into<NodeId>,
        role: ConnectionRole,
        profile: FrameProfile,
    ) -> ScriptedPeer {
        let peer = peer.into();
        let connection = ConnectionId::new(format!("{}~{}", node.id(), peer));
        let (tx, frames) = mpsc::unbounded_channel();

        self.endpoints
            .write()
            .insert(connection.clone(), Endpoint::Scripted(tx));
        node.connection_opened(ConnectionInfo::new(connection.clone(), peer, role, profile));

        ScriptedPeer {
            connection,
            node: node.clone(),
            frames,
        }
    }

    /// Tear down a link from either end; both nodes see the connection close
    pub fn unlink(&self, connection: &ConnectionId) {
        let (near, far) = {
            let mut endpoints = self.endpoints.write();
            let Some(Endpoint::Node {
                node: far_node,
                connection: far_conn,
            }) = endpoints.remove(connection)
            else {
                return;
            };
            let near = match endpoints.remove(&far_conn) {
                Some(Endpoint::Node { node, .. }) => node.upgrade(),
                _ => None,
            };
            (near, far_node.upgrade().map(|core| (core, far_conn)))
        };

        if let Some(core) = near {
            NetworkingNode::from_core(core).connection_closed(connection);
        }
        if let Some((core, far_conn)) = far {
            NetworkingNode::from_core(core).connection_closed(&far_conn);
        }
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn send(&self, connection: &ConnectionId, frame: Frame) -> Result<(), TransportError> {
        let endpoint = self
            .endpoints
            .read()
            .get(connection)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(connection.clone()))?;

        match endpoint {
            Endpoint::Node { node, connection: peer_connection } => {
                let core = node
                    .upgrade()
                    .ok_or_else(|| TransportError::Closed(connection.clone()))?;
                debug!("Delivering frame {} -> {}", connection, peer_connection);
                tokio::spawn(async move {
                    core.handle_frame(&peer_connection, frame).await;
                });
                Ok(())
            }
            Endpoint::Scripted(tx) => tx
                .send(frame)
                .map_err(|_| TransportError::Closed(connection.clone())),
        }
    }
}
