//! IN adapter: decode inbound frames and route them

use tracing::{debug, warn};

use super::NodeCore;
use crate::addressing::{classify_call, classify_reply, InboundRoute, NetworkPath, ReplyRoute};
use crate::codec::{self, DecodeError, Frame};
use crate::correlation::Resolution;
use crate::handler::{Dispatch, RequestContext};
use crate::messages::{CallError, CallResult, Envelope, Message};
use crate::routing::ConnectionInfo;
use crate::telemetry::TelemetryEvent;
use crate::types::{ConnectionId, NodeId};

impl NodeCore {
    /// Process one inbound frame to completion
    pub(crate) async fn handle_frame(&self, connection: &ConnectionId, frame: Frame) {
        let Some(info) = self.routing.connection(connection) else {
            warn!("Dropping frame on unknown connection {}", connection);
            return;
        };
        debug!("<- {} {:?} ({} bytes)", info.peer, frame.channel(), frame.len());

        let envelope = match codec::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.on_decode_error(&info, e).await;
                return;
            }
        };

        match envelope.message {
            Message::Call(_) => self.on_call(&info, envelope).await,
            Message::CallResult(_) | Message::CallError(_) => self.on_reply(&info, envelope).await,
        }
    }

    async fn on_decode_error(&self, info: &ConnectionInfo, error: DecodeError) {
        self.telemetry.emit(TelemetryEvent::DecodeFailed {
            connection: info.id.clone(),
            error: error.to_string(),
        });

        let Some(reply) = error.reply_error() else {
            return;
        };
        let reply = Envelope::call_error(reply)
            .to(info.peer.clone())
            .via(NetworkPath::single(info.peer.clone()));
        if let Err(e) = self.send_envelope(info, &reply).await {
            warn!("Failed to report decode error to {}: {}", info.peer, e);
        }
    }

    /// Fill in what a frame without routing header leaves implicit
    fn normalize_call(&self, info: &ConnectionInfo, envelope: Envelope) -> Envelope {
        let envelope = match envelope.destination {
            Some(_) => envelope,
            None => {
                let destination = info.default_destination(&self.config.node_id);
                envelope.to(destination)
            }
        };
        if envelope.network_path.is_empty() {
            envelope.via(NetworkPath::single(info.peer.clone()))
        } else {
            envelope
        }
    }

    async fn on_call(&self, info: &ConnectionInfo, envelope: Envelope) {
        let envelope = self.normalize_call(info, envelope);
        let destination = envelope.destination.clone().unwrap_or_else(NodeId::csms);

        let route = classify_call(
            &self.config.node_id,
            self.config.is_csms,
            &destination,
            &envelope.network_path,
        );
        if route != InboundRoute::Loop {
            self.routing.learn_from_path(&envelope.network_path, &info.id);
        }

        match route {
            InboundRoute::Local => self.dispatch_local(info, envelope).await,
            InboundRoute::Transit => self.forward(info, envelope).await,
            InboundRoute::Loop => self.reject_loop(info, envelope).await,
        }
    }

    async fn dispatch_local(&self, info: &ConnectionInfo, envelope: Envelope) {
        let Message::Call(call) = &envelope.message else {
            return;
        };
        let request_id = call.request_id.clone();

        self.telemetry.emit(TelemetryEvent::RequestReceived {
            connection: info.id.clone(),
            request_id: request_id.clone(),
            action: call.action.clone(),
        });

        let ctx = RequestContext {
            request_id: request_id.clone(),
            action: call.action.clone(),
            connection: info.id.clone(),
            sender: info.peer.clone(),
            network_path: envelope.network_path.clone(),
            received_at: envelope.created_at,
        };

        let reply = match self.handlers.dispatch(ctx, call.payload.clone()).await {
            Some(Dispatch::Answered(Ok(payload))) => Message::CallResult(CallResult::new(request_id.clone(), payload)),
            Some(Dispatch::Answered(Err(e))) => {
                debug!("Handler for {} ({}) failed: {}", call.action, request_id, e);
                Message::CallError(e.into_call_error(request_id.clone()))
            }
            Some(Dispatch::Panicked(e)) => {
                warn!("{} ({})", e.description, request_id);
                self.telemetry
                    .callback_fault(format!("handler {}", call.action), e.description.clone());
                Message::CallError(e.into_call_error(request_id.clone()))
            }
            None => {
                debug!("No handler for {} from {}", call.action, info.peer);
                Message::CallError(CallError::not_implemented(request_id.clone()))
            }
        };

        let reply = envelope.reply(reply);
        if let Err(e) = self.send_envelope(info, &reply).await {
            warn!("Failed to answer {} ({}) on {}: {}", call.action, request_id, info.id, e);
        }
    }

    async fn on_reply(&self, info: &ConnectionInfo, envelope: Envelope) {
        // Replies on plain links carry no path; recover it for relayed requests
        let envelope = match self.transit.take(&info.id, envelope.request_id()) {
            Some(path) if envelope.network_path.is_empty() => envelope.via(path),
            _ => envelope,
        };

        match classify_reply(&self.config.node_id, &envelope.network_path) {
            ReplyRoute::Local => self.complete_local(info, envelope),
            ReplyRoute::Relay { next_hop, path } => self.relay_reply(envelope, next_hop, path).await,
        }
    }

    fn complete_local(&self, info: &ConnectionInfo, envelope: Envelope) {
        let request_id = envelope.request_id().clone();
        let path = envelope.network_path;
        let resolution = match envelope.message {
            Message::CallResult(result) => Resolution::Result(result, path),
            Message::CallError(error) => Resolution::Error(error, path),
            Message::Call(_) => return,
        };

        if let Some(sent_on) = self.correlator.connection_of(&request_id) {
            if sent_on != info.id {
                debug!("Reply {} arrived on {}, request was sent on {}", request_id, info.id, sent_on);
            }
        }
        if !self.correlator.complete(&request_id, resolution) {
            self.telemetry.emit(TelemetryEvent::UnknownReply {
                connection: info.id.clone(),
                request_id,
            });
        }
    }

    async fn relay_reply(&self, envelope: Envelope, next_hop: NodeId, path: NetworkPath) {
        let Some(next) = self.routing.next_hop(&next_hop) else {
            warn!("No route back to {} for reply {}", next_hop, envelope.request_id());
            return;
        };

        let mut relayed = envelope.with_path(path);
        if relayed.destination.is_none() {
            relayed.destination = relayed.origin().cloned();
        }
        debug!("Relaying reply {} back to {} via {}", relayed.request_id(), next_hop, next.peer);
        if let Err(e) = self.send_envelope(&next, &relayed).await {
            warn!("Failed to relay reply {} to {}: {}", relayed.request_id(), next.peer, e);
        }
    }
}
