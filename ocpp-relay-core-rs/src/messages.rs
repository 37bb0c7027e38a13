//! OCPP message envelope model
//!
//! OCPP frames one message per WebSocket frame:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! An [`Envelope`] wraps one of these together with the multi-hop routing
//! header (destination and network path) and the channel it travels on.
//! Envelopes are built once and never mutated; relaying produces a new one.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::addressing::NetworkPath;
use crate::codec::CodecError;
use crate::types::{NodeId, RequestId};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// OCPP error codes carried by CALLERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
        }
    }

    /// Parse a wire error code, accepting the spellings of other OCPP editions.
    /// Unknown codes degrade to `GenericError`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" | "MessageTypeNotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" | "RpcFrameworkError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            "FormationViolation" | "FormatViolation" => ErrorCode::FormationViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurenceConstraintViolation" | "OccurrenceConstraintViolation" => {
                ErrorCode::OccurenceConstraintViolation
            }
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            _ => ErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of WebSocket frame a message travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Json,
    Binary,
}

/// Message payload.
///
/// JSON payloads keep their exact wire text so a relay can pass them on
/// without re-serializing.
#[derive(Debug, Clone)]
pub enum Payload {
    Json(Box<RawValue>),
    Binary(Bytes),
}

impl Payload {
    /// Serialize a typed value into a JSON payload
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Ok(Payload::Json(serde_json::value::to_raw_value(value)?))
    }

    /// Wrap already-serialized JSON text, validating it
    pub fn raw_json(text: impl Into<String>) -> Result<Self, CodecError> {
        Ok(Payload::Json(RawValue::from_string(text.into())?))
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Payload::Binary(bytes.into())
    }

    /// The empty JSON object `{}`
    pub fn empty() -> Self {
        match RawValue::from_string("{}".to_string()) {
            Ok(raw) => Payload::Json(raw),
            Err(_) => Payload::Binary(Bytes::new()),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Payload::Json(_) => Channel::Json,
            Payload::Binary(_) => Channel::Binary,
        }
    }

    /// Wire text of a JSON payload
    pub fn as_json_str(&self) -> Option<&str> {
        match self {
            Payload::Json(raw) => Some(raw.get()),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Json(raw) => raw.get().as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    /// Parse the payload into a typed value (binary payloads must hold JSON text)
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            Payload::Json(raw) => Ok(serde_json::from_str(raw.get())?),
            Payload::Binary(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    pub fn to_value(&self) -> Result<Value, CodecError> {
        self.parse()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Payload::Json(a), Payload::Json(b)) => a.get() == b.get(),
            (Payload::Binary(a), Payload::Binary(b)) => a == b,
            _ => false,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub request_id: RequestId,
    pub action: String,
    pub payload: Payload,
}

impl Call {
    /// Create a new CALL message with an auto-generated id
    pub fn new(action: impl Into<String>, payload: Payload) -> Self {
        Self {
            request_id: RequestId::random(),
            action: action.into(),
            payload,
        }
    }

    pub fn with_id(request_id: RequestId, action: impl Into<String>, payload: Payload) -> Self {
        Self {
            request_id,
            action: action.into(),
            payload,
        }
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub request_id: RequestId,
    pub payload: Payload,
}

impl CallResult {
    pub fn new(request_id: RequestId, payload: Payload) -> Self {
        Self { request_id, payload }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        self.payload.parse()
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub request_id: RequestId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        request_id: RequestId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    /// Reply to a Call whose action has no local handler
    pub fn not_implemented(request_id: RequestId) -> Self {
        Self::new(
            request_id,
            ErrorCode::NotImplemented,
            "Requested Action is not known by receiver",
        )
    }
}

/// Any OCPP message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Message {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Message::Call(c) => &c.request_id,
            Message::CallResult(r) => &r.request_id,
            Message::CallError(e) => &e.request_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Call(_) => MessageType::Call,
            Message::CallResult(_) => MessageType::CallResult,
            Message::CallError(_) => MessageType::CallError,
        }
    }

    /// Channel implied by the payload; errors follow whatever they answer
    fn natural_channel(&self) -> Channel {
        match self {
            Message::Call(c) => c.payload.channel(),
            Message::CallResult(r) => r.payload.channel(),
            Message::CallError(_) => Channel::Json,
        }
    }
}

/// A message plus its routing header
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Message,
    /// Final destination; `None` when the frame carried no routing header
    pub destination: Option<NodeId>,
    pub network_path: NetworkPath,
    pub channel: Channel,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        let channel = message.natural_channel();
        Self {
            message,
            destination: None,
            network_path: NetworkPath::empty(),
            channel,
            created_at: Utc::now(),
        }
    }

    pub fn call(call: Call) -> Self {
        Self::new(Message::Call(call))
    }

    pub fn call_result(result: CallResult) -> Self {
        Self::new(Message::CallResult(result))
    }

    pub fn call_error(error: CallError) -> Self {
        Self::new(Message::CallError(error))
    }

    pub fn to(mut self, destination: NodeId) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn via(mut self, network_path: NetworkPath) -> Self {
        self.network_path = network_path;
        self
    }

    pub fn on_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn request_id(&self) -> &RequestId {
        self.message.request_id()
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Copy of this envelope with `hop` appended to the network path
    pub fn with_hop(&self, hop: NodeId) -> Self {
        Self {
            message: self.message.clone(),
            destination: self.destination.clone(),
            network_path: self.network_path.append(hop),
            channel: self.channel,
            created_at: self.created_at,
        }
    }

    /// Copy of this envelope with a different network path
    pub fn with_path(&self, network_path: NetworkPath) -> Self {
        Self {
            network_path,
            ..self.clone()
        }
    }

    /// Origin of the message: the first recorded hop
    pub fn origin(&self) -> Option<&NodeId> {
        self.network_path.origin()
    }

    /// Reply to this request, addressed to its origin and carrying its path
    /// back. Stays on the request's channel unless the reply payload is binary.
    pub fn reply(&self, message: Message) -> Self {
        let channel = match message.natural_channel() {
            Channel::Binary => Channel::Binary,
            Channel::Json => self.channel,
        };
        Self {
            message,
            destination: self.origin().cloned(),
            network_path: self.network_path.clone(),
            channel,
            created_at: Utc::now(),
        }
    }
}

impl PartialEq for Envelope {
    /// Structural equality; the local creation timestamp is not part of the wire form
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
            && self.destination == other.destination
            && self.network_path == other.network_path
            && self.channel == other.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct HeartbeatResponse {
        current_time: DateTime<Utc>,
    }

    #[test]
    fn test_payload_keeps_wire_text() {
        let payload = Payload::raw_json(r#"{"b":1,  "a":2}"#).unwrap();
        assert_eq!(payload.as_json_str(), Some(r#"{"b":1,  "a":2}"#));
        assert_eq!(payload.to_value().unwrap(), json!({"a": 2, "b": 1}));
    }

    #[test]
    fn test_payload_rejects_invalid_json() {
        assert!(Payload::raw_json("{not json").is_err());
    }

    #[test]
    fn test_call_result_parse_payload() {
        let result = CallResult::new(
            RequestId::from("1"),
            Payload::raw_json(r#"{"currentTime":"2024-01-01T00:00:00Z"}"#).unwrap(),
        );
        let parsed: HeartbeatResponse = result.parse_payload().unwrap();
        assert_eq!(parsed.current_time.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_error_code_aliases() {
        assert_eq!(ErrorCode::from_wire("FormatViolation"), ErrorCode::FormationViolation);
        assert_eq!(
            ErrorCode::from_wire("OccurrenceConstraintViolation"),
            ErrorCode::OccurenceConstraintViolation
        );
        assert_eq!(ErrorCode::from_wire("SomethingNew"), ErrorCode::GenericError);
        assert_eq!(ErrorCode::NotSupported.as_str(), "NotSupported");
    }

    #[test]
    fn test_envelope_with_hop_does_not_mutate() {
        let envelope = Envelope::call(Call::new("Heartbeat", Payload::empty()))
            .to(NodeId::csms())
            .via(NetworkPath::from_hops(vec![NodeId::from("A")]));

        let relayed = envelope.with_hop(NodeId::from("B"));
        assert_eq!(envelope.network_path.len(), 1);
        assert_eq!(relayed.network_path.len(), 2);
        assert_eq!(relayed.request_id(), envelope.request_id());
        assert_eq!(relayed.origin(), Some(&NodeId::from("A")));
    }

    #[test]
    fn test_reply_retraces_request() {
        let request = Envelope::call(Call::new("BinaryDataTransfer", Payload::binary(vec![7u8])))
            .to(NodeId::from("C"))
            .via(NetworkPath::from_hops(vec![NodeId::from("A"), NodeId::from("B")]));

        let reply = request.reply(Message::CallError(CallError::not_implemented(
            request.request_id().clone(),
        )));
        assert_eq!(reply.destination, Some(NodeId::from("A")));
        assert_eq!(reply.network_path, request.network_path);
        assert_eq!(reply.channel, Channel::Binary);
        assert_eq!(reply.request_id(), request.request_id());
    }

    #[test]
    fn test_binary_payload_selects_binary_channel() {
        let envelope = Envelope::call(Call::new("BinaryDataTransfer", Payload::binary(vec![1u8, 2, 3])));
        assert_eq!(envelope.channel, Channel::Binary);
    }
}
