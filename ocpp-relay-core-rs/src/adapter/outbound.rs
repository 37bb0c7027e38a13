//! OUT adapter: send requests and await their replies

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::NodeCore;
use crate::addressing::NetworkPath;
use crate::codec;
use crate::correlation::Resolution;
use crate::messages::{Call, Envelope, Payload};
use crate::result::{ExchangeResult, Response};
use crate::telemetry::TelemetryEvent;
use crate::types::{NodeId, RequestId};

/// An outgoing request
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub action: String,
    pub payload: Payload,
    /// Final destination; the CSMS when unset
    pub destination: Option<NodeId>,
    /// Overrides the node's default request timeout
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Fixed request id; random when unset
    pub request_id: Option<RequestId>,
}

impl SendRequest {
    pub fn new(action: impl Into<String>, payload: Payload) -> Self {
        Self {
            action: action.into(),
            payload,
            destination: None,
            timeout: None,
            cancel: None,
            request_id: None,
        }
    }

    pub fn to(mut self, destination: impl Into<NodeId>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

impl NodeCore {
    /// Send a request and wait for its outcome. Never fails: every problem
    /// is reported through the response's result.
    /// The request is registered before the frame is sent and withdrawn if sending fails.
    pub(crate) async fn send_request(&self, request: SendRequest) -> Response {
        let SendRequest {
            action,
            payload,
            destination,
            timeout,
            cancel,
            request_id,
        } = request;

        let request_id = request_id.unwrap_or_else(RequestId::random);
        let destination = destination.unwrap_or_else(NodeId::csms);
        let timeout = timeout.unwrap_or(self.config.request_timeout);

        let Some(connection) = self.routing.next_hop(&destination) else {
            warn!("No route to {} for {}", destination, action);
            return Response::failed(
                request_id,
                ExchangeResult::network_error(format!("No route to {}", destination)),
            );
        };

        let envelope = Envelope::call(Call::with_id(request_id.clone(), action.clone(), payload))
            .to(destination)
            .via(NetworkPath::single(self.config.node_id.clone()));

        let frame = match codec::encode(&envelope, connection.profile) {
            Ok(frame) => frame,
            Err(e) => {
                return Response::failed(
                    request_id,
                    ExchangeResult::generic_error(format!("Failed to encode {}: {}", action, e)),
                );
            }
        };

        let handle = match self
            .correlator
            .register(request_id.clone(), connection.id.clone(), &action, timeout)
        {
            Ok(handle) => handle,
            Err(e) => return Response::failed(request_id, ExchangeResult::generic_error(e.to_string())),
        };
        let sent_at = handle.sent_at;

        if let Err(e) = self.send_frame(&connection, frame).await {
            self.correlator.withdraw(&request_id);
            warn!("Failed to send {} ({}) to {}: {}", action, request_id, connection.peer, e);
            let response = Response::failed(request_id, ExchangeResult::network_error(e.to_string()));
            self.telemetry.response_received(&envelope, &response);
            return response;
        }

        debug!("Sent {} ({}) via {}", action, request_id, connection.peer);
        self.telemetry.emit(TelemetryEvent::RequestSent {
            connection: connection.id.clone(),
            request_id: request_id.clone(),
            action: action.clone(),
        });
        self.telemetry.request_sent(&envelope);

        let cancel = cancel.unwrap_or_default();
        let resolution = self.correlator.wait(handle, &cancel).await;

        let response = match resolution {
            Resolution::Result(result, path) => Response::ok(request_id.clone(), result.payload).with_path(path),
            Resolution::Error(error, path) => {
                Response::failed(request_id.clone(), ExchangeResult::from_call_error(&error)).with_path(path)
            }
            Resolution::TimedOut => {
                self.telemetry.emit(TelemetryEvent::TimedOut {
                    request_id: request_id.clone(),
                    action: action.clone(),
                });
                Response::failed(request_id.clone(), ExchangeResult::timeout())
            }
            Resolution::ConnectionLost => Response::failed(
                request_id.clone(),
                ExchangeResult::network_error(format!("Connection to {} lost", connection.peer)),
            ),
            Resolution::Cancelled => Response::failed(request_id.clone(), ExchangeResult::cancelled()),
        }
        .with_runtime(sent_at.elapsed());

        self.telemetry.emit(TelemetryEvent::ResponseReceived {
            request_id,
            action,
            code: response.result.code,
            runtime: response.runtime,
        });
        self.telemetry.response_received(&envelope, &response);

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_builder() {
        let cancel = CancellationToken::new();
        let request = SendRequest::new("Heartbeat", Payload::empty())
            .to("CS001")
            .with_timeout(Duration::from_secs(3))
            .with_cancel(cancel)
            .with_request_id(RequestId::from("fixed"));

        assert_eq!(request.destination, Some(NodeId::from("CS001")));
        assert_eq!(request.timeout, Some(Duration::from_secs(3)));
        assert!(request.cancel.is_some());
        assert_eq!(request.request_id, Some(RequestId::from("fixed")));
    }
}
