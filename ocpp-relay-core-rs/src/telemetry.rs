//! Best-effort notifications: telemetry sink and exchange observers
//!
//! Nothing here may influence protocol correctness. Sinks and observers are
//! user code; any error they return or panic they raise is caught at the call
//! site and logged, never propagated into the exchange.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::messages::Envelope;
use crate::result::{Response, ResultCode};
use crate::types::{ConnectionId, NodeId, RequestId};

/// Error returned by user callbacks (sinks, observers)
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Events reported to the telemetry sink
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    RequestSent {
        connection: ConnectionId,
        request_id: RequestId,
        action: String,
    },
    ResponseReceived {
        request_id: RequestId,
        action: String,
        code: ResultCode,
        runtime: Duration,
    },
    RequestReceived {
        connection: ConnectionId,
        request_id: RequestId,
        action: String,
    },
    Forwarded {
        request_id: RequestId,
        action: String,
        next_hop: NodeId,
    },
    Rejected {
        request_id: RequestId,
        action: String,
        reason: String,
    },
    Dropped {
        request_id: RequestId,
        action: String,
        reason: String,
    },
    TimedOut {
        request_id: RequestId,
        action: String,
    },
    DecodeFailed {
        connection: ConnectionId,
        error: String,
    },
    UnknownReply {
        connection: ConnectionId,
        request_id: RequestId,
    },
    CallbackFault {
        callback: String,
        error: String,
    },
}

/// Receiver of telemetry events
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &TelemetryEvent) -> Result<(), CallbackError>;
}

/// Default sink: forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: &TelemetryEvent) -> Result<(), CallbackError> {
        match event {
            TelemetryEvent::RequestSent { connection, request_id, action } => {
                debug!("Sent {} ({}) on {}", action, request_id, connection);
            }
            TelemetryEvent::ResponseReceived { request_id, action, code, runtime } => {
                debug!("{} ({}) completed with {:?} after {:?}", action, request_id, code, runtime);
            }
            TelemetryEvent::RequestReceived { connection, request_id, action } => {
                debug!("Received {} ({}) on {}", action, request_id, connection);
            }
            TelemetryEvent::Forwarded { request_id, action, next_hop } => {
                info!("Forwarded {} ({}) to {}", action, request_id, next_hop);
            }
            TelemetryEvent::Rejected { request_id, action, reason } => {
                info!("Rejected {} ({}): {}", action, request_id, reason);
            }
            TelemetryEvent::Dropped { request_id, action, reason } => {
                info!("Dropped {} ({}): {}", action, request_id, reason);
            }
            TelemetryEvent::TimedOut { request_id, action } => {
                warn!("Timeout waiting for {} ({})", action, request_id);
            }
            TelemetryEvent::DecodeFailed { connection, error } => {
                warn!("Failed to decode frame on {}: {}", connection, error);
            }
            TelemetryEvent::UnknownReply { connection, request_id } => {
                debug!("Discarding reply {} on {}: no pending request", request_id, connection);
            }
            TelemetryEvent::CallbackFault { callback, error } => {
                warn!("Callback {} failed: {}", callback, error);
            }
        }
        Ok(())
    }
}

/// Observer of outgoing requests and their responses
pub trait ExchangeObserver: Send + Sync {
    fn on_request_sent(&self, _request: &Envelope) -> Result<(), CallbackError> {
        Ok(())
    }

    fn on_response_received(&self, _request: &Envelope, _response: &Response) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Describe a caught panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Run a user callback, turning errors and panics into a description
pub(crate) fn guarded<F>(f: F) -> Result<(), String>
where
    F: FnOnce() -> Result<(), CallbackError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

/// Telemetry fan-in shared by all adapters
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    observers: Arc<Vec<Arc<dyn ExchangeObserver>>>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>, observers: Vec<Arc<dyn ExchangeObserver>>) -> Self {
        Self {
            sink,
            observers: Arc::new(observers),
        }
    }

    /// Record an event; a failing sink is logged and otherwise ignored
    pub fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = guarded(|| self.sink.record(&event)) {
            warn!("Telemetry sink failed on {:?}: {}", event, e);
        }
    }

    /// Report a fault raised by user code
    pub fn callback_fault(&self, callback: impl Into<String>, error: impl Into<String>) {
        self.emit(TelemetryEvent::CallbackFault {
            callback: callback.into(),
            error: error.into(),
        });
    }

    pub(crate) fn request_sent(&self, request: &Envelope) {
        for (i, observer) in self.observers.iter().enumerate() {
            if let Err(e) = guarded(|| observer.on_request_sent(request)) {
                self.callback_fault(format!("observer #{} on_request_sent", i), e);
            }
        }
    }

    pub(crate) fn response_received(&self, request: &Envelope, response: &Response) {
        for (i, observer) in self.observers.iter().enumerate() {
            if let Err(e) = guarded(|| observer.on_response_received(request, response)) {
                self.callback_fault(format!("observer #{} on_response_received", i), e);
            }
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink), Vec::new())
    }
}
