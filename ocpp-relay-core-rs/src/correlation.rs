//! Request/response correlation
//!
//! Turns "send a Call, some frame arrives later" into a single awaitable
//! exchange. Each outstanding request owns one slot in the pending table.
//! Every way an exchange can end (reply, error, timeout, cancellation,
//! connection loss, sweep) goes through [`Correlator::complete`], which
//! removes the slot under the table lock before resolving it, so each
//! request resolves exactly once no matter which event fires first.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::addressing::NetworkPath;
use crate::messages::{CallError, CallResult};
use crate::types::{ConnectionId, RequestId};

/// How a pending request ended
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Result(CallResult, NetworkPath),
    Error(CallError, NetworkPath),
    TimedOut,
    ConnectionLost,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("Request id {0} is already outstanding")]
    DuplicateRequestId(RequestId),
}

/// Pending request awaiting response
struct PendingRequest {
    action: String,
    connection: ConnectionId,
    deadline: Instant,
    slot: oneshot::Sender<Resolution>,
}

/// Caller's side of a registered request
#[derive(Debug)]
pub struct PendingHandle {
    pub request_id: RequestId,
    pub sent_at: Instant,
    pub deadline: Instant,
    rx: oneshot::Receiver<Resolution>,
}

/// Pending-request table
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request before it goes on the wire
    pub fn register(
        &self,
        request_id: RequestId,
        connection: ConnectionId,
        action: &str,
        timeout: Duration,
    ) -> Result<PendingHandle, CorrelationError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&request_id) {
            return Err(CorrelationError::DuplicateRequestId(request_id));
        }

        let (slot, rx) = oneshot::channel();
        let sent_at = Instant::now();
        let deadline = sent_at + timeout;

        pending.insert(
            request_id.clone(),
            PendingRequest {
                action: action.to_string(),
                connection,
                deadline,
                slot,
            },
        );

        Ok(PendingHandle {
            request_id,
            sent_at,
            deadline,
            rx,
        })
    }

    /// Resolve a pending request. Returns false if no such request is
    /// outstanding (unknown, late or duplicate reply); nothing else happens then.
    pub fn complete(&self, request_id: &RequestId, resolution: Resolution) -> bool {
        let entry = self.pending.lock().remove(request_id);
        match entry {
            Some(request) => {
                debug!("Resolving {} ({}) as {:?}", request.action, request_id, kind(&resolution));
                // The waiter may have gone away; the slot is consumed either way
                let _ = request.slot.send(resolution);
                true
            }
            None => false,
        }
    }

    /// Drop a registration whose frame never left (send failed)
    pub fn withdraw(&self, request_id: &RequestId) -> bool {
        self.pending.lock().remove(request_id).is_some()
    }

    /// Wait for the request to resolve, enforcing its deadline and the
    /// caller's cancellation. Cancelling only releases this wait.
    pub async fn wait(&self, handle: PendingHandle, cancel: &CancellationToken) -> Resolution {
        let PendingHandle {
            request_id,
            deadline,
            mut rx,
            ..
        } = handle;

        tokio::select! {
            biased;
            resolution = &mut rx => {
                return resolution.unwrap_or(Resolution::ConnectionLost);
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.complete(&request_id, Resolution::TimedOut);
            }
            _ = cancel.cancelled() => {
                self.complete(&request_id, Resolution::Cancelled);
            }
        }

        // Whichever resolution won the race is in the slot now
        rx.await.unwrap_or(Resolution::ConnectionLost)
    }

    /// Resolve every request whose deadline has passed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .pending
            .lock()
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .iter()
            .filter(|id| self.complete(id, Resolution::TimedOut))
            .count()
    }

    /// Resolve every request sent on a connection that went away
    pub fn fail_connection(&self, connection: &ConnectionId) -> usize {
        let lost: Vec<RequestId> = self
            .pending
            .lock()
            .iter()
            .filter(|(_, request)| &request.connection == connection)
            .map(|(id, _)| id.clone())
            .collect();

        let count = lost
            .iter()
            .filter(|id| self.complete(id, Resolution::ConnectionLost))
            .count();
        if count > 0 {
            warn!("Connection {} lost with {} outstanding requests", connection, count);
        }
        count
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    /// Action of an outstanding request
    pub fn action_of(&self, request_id: &RequestId) -> Option<String> {
        self.pending.lock().get(request_id).map(|r| r.action.clone())
    }

    /// Connection an outstanding request was sent on
    pub fn connection_of(&self, request_id: &RequestId) -> Option<ConnectionId> {
        self.pending.lock().get(request_id).map(|r| r.connection.clone())
    }
}

fn kind(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::Result(..) => "result",
        Resolution::Error(..) => "error",
        Resolution::TimedOut => "timeout",
        Resolution::ConnectionLost => "connection lost",
        Resolution::Cancelled => "cancelled",
    }
}
