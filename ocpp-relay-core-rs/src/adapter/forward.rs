//! FORWARD adapter: per-connection wiring of the forwarding pipeline

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::NodeCore;
use crate::addressing::NetworkPath;
use crate::codec::FrameProfile;
use crate::forwarding::{ForwardingDecision, ForwardingOutcome, RejectResponse, TransitRequest};
use crate::handler::HandlerError;
use crate::messages::{Envelope, ErrorCode, Message};
use crate::routing::ConnectionInfo;
use crate::telemetry::TelemetryEvent;
use crate::types::{ConnectionId, NodeId, RequestId};

struct TransitEntry {
    path: NetworkPath,
    expires: Instant,
}

/// Return paths of requests relayed onto plain links, whose replies come
/// back without a routing header
pub(crate) struct TransitTable {
    ttl: Duration,
    entries: Mutex<HashMap<(ConnectionId, RequestId), TransitEntry>>,
}

impl TransitTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn remember(&self, connection: ConnectionId, request_id: RequestId, path: NetworkPath) {
        let expires = Instant::now() + self.ttl;
        self.entries
            .lock()
            .insert((connection, request_id), TransitEntry { path, expires });
    }

    pub fn take(&self, connection: &ConnectionId, request_id: &RequestId) -> Option<NetworkPath> {
        self.entries
            .lock()
            .remove(&(connection.clone(), request_id.clone()))
            .map(|entry| entry.path)
    }

    pub fn forget_connection(&self, connection: &ConnectionId) {
        self.entries.lock().retain(|(conn, _), _| conn != connection);
    }

    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl NodeCore {
    /// Run the pipeline for a request addressed elsewhere and act on the decision
    pub(crate) async fn forward(&self, info: &ConnectionInfo, envelope: Envelope) {
        let destination = envelope.destination.clone().unwrap_or_else(NodeId::csms);
        let transit = self.transit_request(info, envelope);

        let decision = self.pipeline.decide(&transit).await;
        match decision.outcome {
            ForwardingOutcome::Forward => self.relay_request(info, &transit, &destination).await,
            ForwardingOutcome::Reject => self.send_rejection(info, &decision).await,
            ForwardingOutcome::Drop => {}
        }
    }

    /// A request whose path already contains this node is answered, never forwarded
    pub(crate) async fn reject_loop(&self, info: &ConnectionInfo, envelope: Envelope) {
        warn!(
            "Loop detected for {}: path {} already contains {}",
            envelope.request_id(),
            envelope.network_path,
            self.config.node_id
        );
        let transit = self.transit_request(info, envelope);
        let error = HandlerError::new(
            ErrorCode::FormationViolation,
            format!("Loop detected: {} is already in the network path", self.config.node_id),
        );
        let decision = self.pipeline.rejection(&transit, Some(RejectResponse::Error(error)), "loop detected", None);
        self.report_rejection(&decision);
        self.send_rejection(info, &decision).await;
    }

    fn transit_request(&self, info: &ConnectionInfo, envelope: Envelope) -> TransitRequest {
        TransitRequest {
            envelope: Arc::new(envelope),
            sender: info.peer.clone(),
            connection: info.id.clone(),
            profile: info.profile,
        }
    }

    async fn relay_request(&self, info: &ConnectionInfo, transit: &TransitRequest, destination: &NodeId) {
        let next = match self.routing.next_hop(destination) {
            Some(next) if next.id != info.id => next,
            _ => {
                self.reject_unreachable(info, transit, format!("No route to {}", destination))
                    .await;
                return;
            }
        };

        let relayed = transit.envelope.with_hop(self.config.node_id.clone());
        let request_id = relayed.request_id().clone();
        if next.profile == FrameProfile::Standard {
            self.transit
                .remember(next.id.clone(), request_id.clone(), relayed.network_path.clone());
        }

        match self.send_envelope(&next, &relayed).await {
            Ok(()) => {
                let action = match &relayed.message {
                    Message::Call(call) => call.action.clone(),
                    _ => String::new(),
                };
                self.telemetry.emit(TelemetryEvent::Forwarded {
                    request_id,
                    action,
                    next_hop: next.peer.clone(),
                });
            }
            Err(e) => {
                self.transit.take(&next.id, &request_id);
                self.reject_unreachable(info, transit, format!("Failed to forward to {}: {}", next.peer, e))
                    .await;
            }
        }
    }

    async fn reject_unreachable(&self, info: &ConnectionInfo, transit: &TransitRequest, description: String) {
        let error = HandlerError::new(ErrorCode::GenericError, description.clone());
        let decision = self
            .pipeline
            .rejection(transit, Some(RejectResponse::Error(error)), description, None);
        self.report_rejection(&decision);
        self.send_rejection(info, &decision).await;
    }

    fn report_rejection(&self, decision: &ForwardingDecision) {
        let action = match &decision.request.message {
            Message::Call(call) => call.action.clone(),
            _ => String::new(),
        };
        self.telemetry.emit(TelemetryEvent::Rejected {
            request_id: decision.request.request_id().clone(),
            action,
            reason: decision.log_message.clone(),
        });
    }

    /// Send a rejection back on the connection the request arrived on
    async fn send_rejection(&self, info: &ConnectionInfo, decision: &ForwardingDecision) {
        let sent = match (&decision.serialized_reject, &decision.reject_response) {
            (Some(frame), _) => self.send_frame(info, frame.clone()).await,
            (None, Some(reply)) => self.send_envelope(info, reply).await,
            (None, None) => return,
        };
        match sent {
            Ok(()) => debug!("Rejection for {} sent to {}", decision.request.request_id(), info.peer),
            Err(e) => warn!(
                "Failed to send rejection for {} to {}: {}",
                decision.request.request_id(),
                info.peer,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transit_table() {
        let table = TransitTable::new(Duration::from_secs(30));
        let conn = ConnectionId::from("cs");
        let path = NetworkPath::from_hops(vec![NodeId::from("CSMS-1"), NodeId::from("NN1")]);

        table.remember(conn.clone(), RequestId::from("r1"), path.clone());
        table.remember(conn.clone(), RequestId::from("r2"), path.clone());
        assert_eq!(table.len(), 2);

        assert_eq!(table.take(&conn, &RequestId::from("r1")), Some(path));
        assert_eq!(table.take(&conn, &RequestId::from("r1")), None);
        assert_eq!(table.take(&ConnectionId::from("other"), &RequestId::from("r2")), None);

        table.forget_connection(&conn);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_transit_table_sweep() {
        let table = TransitTable::new(Duration::from_millis(1));
        table.remember(ConnectionId::from("cs"), RequestId::from("r1"), NetworkPath::empty());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(table.sweep(), 1);
    }
}
