//! Envelope codec: wire frames <-> [`Envelope`]
//!
//! JSON channel, standard profile (plain OCPP):
//! - CALL: `[2, id, action, payload]`
//! - CALLRESULT: `[3, id, payload]`
//! - CALLERROR: `[4, id, code, description, details]`
//!
//! JSON channel, routed profile (networking-node links), destination and
//! network path precede the id:
//! - CALL: `[2, destination, [hops], id, action, payload]`
//! - CALLRESULT: `[3, destination, [hops], id, payload]`
//! - CALLERROR: `[4, destination, [hops], id, code, description, details]`
//!
//! The binary channel mirrors both layouts with length-prefixed fields, see
//! [`crate::binary`]. Decoding never panics: every malformed input becomes a
//! [`DecodeError`] that still carries whatever request id could be recovered,
//! so the caller can answer a broken Call with a CallError.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use thiserror::Error;

use crate::addressing::NetworkPath;
use crate::binary;
use crate::messages::*;
use crate::types::{NodeId, RequestId};

/// One transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn channel(&self) -> Channel {
        match self {
            Frame::Text(_) => Channel::Json,
            Frame::Binary(_) => Channel::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Framing profile negotiated per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameProfile {
    /// Plain OCPP frames without routing header
    Standard,
    /// Frames carrying destination and network path
    Routed,
}

/// Errors in OCPP frame encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(&'static str),

    #[error("Wrong field count {found} for {message_type:?}")]
    FieldCount {
        message_type: MessageType,
        found: usize,
    },

    #[error("Invalid request id")]
    InvalidRequestId,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Network path contains a repeated hop: {0}")]
    CyclicPath(NetworkPath),

    #[error("Binary payload cannot be sent on the JSON channel")]
    ChannelMismatch,

    #[error("Frame truncated")]
    Truncated,

    #[error("Field too long: {0}")]
    FieldTooLong(&'static str),
}

/// A decode failure plus what could be salvaged from the frame
#[derive(Debug, Error)]
#[error("{source}")]
pub struct DecodeError {
    pub source: CodecError,
    pub request_id: Option<RequestId>,
    pub message_type: Option<MessageType>,
}

impl DecodeError {
    pub(crate) fn new(source: CodecError, recovered: Recovered) -> Self {
        Self {
            source,
            request_id: recovered.request_id,
            message_type: recovered.message_type,
        }
    }

    /// The CallError to send back, if the broken frame deserves an answer.
    ///
    /// Only requests (and frames of unknown type) are answered; a broken reply
    /// is dropped since there is nothing to correlate it with.
    pub fn reply_error(&self) -> Option<CallError> {
        let request_id = self.request_id.clone()?;
        match (&self.source, self.message_type) {
            (CodecError::UnknownMessageType(kind), _) => Some(CallError::new(
                request_id,
                ErrorCode::NotSupported,
                format!("Message type {} is not supported", kind),
            )),
            (source, Some(MessageType::Call)) => Some(CallError::new(
                request_id,
                ErrorCode::FormationViolation,
                source.to_string(),
            )),
            _ => None,
        }
    }
}

/// Partial information gathered while decoding
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    pub request_id: Option<RequestId>,
    pub message_type: Option<MessageType>,
}

/// Decode a frame into an envelope. Pure, no side effects.
pub fn decode(frame: &Frame) -> Result<Envelope, DecodeError> {
    let mut recovered = Recovered::default();
    let result = match frame {
        Frame::Text(text) => decode_json(text.as_bytes(), &mut recovered),
        Frame::Binary(bytes) => binary::decode(bytes, &mut recovered),
    };
    result.map_err(|source| DecodeError::new(source, recovered))
}

/// Encode an envelope for a connection using `profile`.
///
/// The channel recorded in the envelope picks text or binary framing.
pub fn encode(envelope: &Envelope, profile: FrameProfile) -> Result<Frame, CodecError> {
    match envelope.channel {
        Channel::Json => encode_json(envelope, profile).map(Frame::Text),
        Channel::Binary => binary::encode(envelope, profile).map(Frame::Binary),
    }
}

/// Destination written into routed frames
pub(crate) fn wire_destination(envelope: &Envelope) -> NodeId {
    envelope.destination.clone().unwrap_or_else(NodeId::csms)
}

fn json_payload(payload: &Payload) -> Result<&RawValue, CodecError> {
    match payload {
        Payload::Json(raw) => Ok(&**raw),
        Payload::Binary(_) => Err(CodecError::ChannelMismatch),
    }
}

fn encode_json(envelope: &Envelope, profile: FrameProfile) -> Result<String, CodecError> {
    let id = envelope.request_id().as_str();

    let text = match (profile, &envelope.message) {
        (FrameProfile::Standard, Message::Call(call)) => serde_json::to_string(&(
            MessageType::Call as u8,
            id,
            &call.action,
            json_payload(&call.payload)?,
        ))?,
        (FrameProfile::Standard, Message::CallResult(result)) => serde_json::to_string(&(
            MessageType::CallResult as u8,
            id,
            json_payload(&result.payload)?,
        ))?,
        (FrameProfile::Standard, Message::CallError(error)) => serde_json::to_string(&(
            MessageType::CallError as u8,
            id,
            error.error_code.as_str(),
            &error.error_description,
            &error.error_details,
        ))?,
        (FrameProfile::Routed, message) => {
            let destination = wire_destination(envelope);
            let path = &envelope.network_path;
            match message {
                Message::Call(call) => serde_json::to_string(&(
                    MessageType::Call as u8,
                    &destination,
                    path,
                    id,
                    &call.action,
                    json_payload(&call.payload)?,
                ))?,
                Message::CallResult(result) => serde_json::to_string(&(
                    MessageType::CallResult as u8,
                    &destination,
                    path,
                    id,
                    json_payload(&result.payload)?,
                ))?,
                Message::CallError(error) => serde_json::to_string(&(
                    MessageType::CallError as u8,
                    &destination,
                    path,
                    id,
                    error.error_code.as_str(),
                    &error.error_description,
                    &error.error_details,
                ))?,
            }
        }
    };

    Ok(text)
}

fn string_field(raw: &RawValue) -> Option<String> {
    serde_json::from_str::<String>(raw.get()).ok()
}

fn object_field(raw: &RawValue) -> Result<Box<RawValue>, CodecError> {
    if raw.get().trim_start().starts_with('{') {
        Ok(raw.to_owned())
    } else {
        Err(CodecError::InvalidFormat("payload must be a JSON object"))
    }
}

/// Validate a request id read from the wire
pub(crate) fn parse_request_id(text: Option<String>) -> Result<RequestId, CodecError> {
    text.as_deref()
        .and_then(RequestId::parse)
        .ok_or(CodecError::InvalidRequestId)
}

/// Validate a network path read from the wire
pub(crate) fn checked_path(hops: Vec<NodeId>) -> Result<NetworkPath, CodecError> {
    let path = NetworkPath::from_hops(hops);
    if path.has_cycle() {
        return Err(CodecError::CyclicPath(path));
    }
    Ok(path)
}

fn decode_json(bytes: &[u8], recovered: &mut Recovered) -> Result<Envelope, CodecError> {
    let fields: Vec<&RawValue> = serde_json::from_slice(bytes)?;

    let first = fields
        .first()
        .ok_or(CodecError::InvalidFormat("empty frame"))?;
    let kind: i64 = serde_json::from_str(first.get())
        .map_err(|_| CodecError::InvalidFormat("message type is not an integer"))?;

    let routed_hint = fields
        .get(2)
        .map(|f| f.get().trim_start().starts_with('['))
        .unwrap_or(false);
    let id_index = if routed_hint { 3 } else { 1 };
    recovered.request_id = fields
        .get(id_index)
        .and_then(|f| string_field(f))
        .and_then(|s| RequestId::parse(&s));

    let message_type = MessageType::from_wire(kind).ok_or(CodecError::UnknownMessageType(kind))?;
    recovered.message_type = Some(message_type);

    let (standard_len, routed_len) = match message_type {
        MessageType::Call => (4, 6),
        MessageType::CallResult => (3, 5),
        MessageType::CallError => (5, 7),
    };

    let (destination, network_path, rest) = if fields.len() == standard_len {
        (None, NetworkPath::empty(), &fields[1..])
    } else if fields.len() == routed_len {
        let destination = string_field(fields[1])
            .ok_or(CodecError::InvalidFormat("destination must be a string"))?;
        let hops: Vec<NodeId> = serde_json::from_str(fields[2].get())
            .map_err(|_| CodecError::InvalidFormat("network path must be an array of strings"))?;
        (Some(NodeId::new(destination)), checked_path(hops)?, &fields[3..])
    } else {
        return Err(CodecError::FieldCount {
            message_type,
            found: fields.len(),
        });
    };

    let request_id = parse_request_id(string_field(rest[0]))?;

    let message = match message_type {
        MessageType::Call => {
            let action = string_field(rest[1])
                .filter(|a| !a.is_empty())
                .ok_or(CodecError::InvalidFormat("action must be a non-empty string"))?;
            Message::Call(Call {
                request_id,
                action,
                payload: Payload::Json(object_field(rest[2])?),
            })
        }
        MessageType::CallResult => Message::CallResult(CallResult {
            request_id,
            payload: Payload::Json(object_field(rest[1])?),
        }),
        MessageType::CallError => {
            let code = string_field(rest[1])
                .ok_or(CodecError::InvalidFormat("error code must be a string"))?;
            let description = string_field(rest[2])
                .ok_or(CodecError::InvalidFormat("error description must be a string"))?;
            let details: Value = serde_json::from_str(rest[3].get())?;
            Message::CallError(CallError {
                request_id,
                error_code: ErrorCode::from_wire(&code),
                error_description: description,
                error_details: details,
            })
        }
    };

    Ok(Envelope {
        message,
        destination,
        network_path,
        channel: Channel::Json,
        created_at: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> Frame {
        Frame::Text(s.to_string())
    }

    #[test]
    fn test_call_parsing() {
        let envelope = decode(&text(r#"[2, "msg-123", "Heartbeat", {}]"#)).unwrap();

        match &envelope.message {
            Message::Call(call) => {
                assert_eq!(call.request_id.as_str(), "msg-123");
                assert_eq!(call.action, "Heartbeat");
            }
            _ => panic!("Expected Call"),
        }
        assert!(envelope.destination.is_none());
        assert!(envelope.network_path.is_empty());
    }

    #[test]
    fn test_call_result_parsing() {
        let envelope =
            decode(&text(r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#)).unwrap();

        match &envelope.message {
            Message::CallResult(result) => {
                assert_eq!(result.request_id.as_str(), "msg-123");
                assert_eq!(
                    result.payload.to_value().unwrap(),
                    json!({"currentTime": "2026-01-20T12:00:00Z"})
                );
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let envelope =
            decode(&text(r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#)).unwrap();

        match &envelope.message {
            Message::CallError(error) => {
                assert_eq!(error.request_id.as_str(), "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_routed_call_parsing() {
        let envelope = decode(&text(
            r#"[2, "CSMS", ["CS001", "NN1"], "r-1", "BootNotification", {"reason": "PowerUp"}]"#,
        ))
        .unwrap();

        assert_eq!(envelope.destination, Some(NodeId::csms()));
        assert_eq!(envelope.network_path.len(), 2);
        assert_eq!(envelope.origin(), Some(&NodeId::from("CS001")));
    }

    #[test]
    fn test_payload_bytes_survive_reencoding() {
        let original = r#"[2,"CSMS",["CS001"],"r-1","DataTransfer",{"vendorId":"x", "data" : [1,2.50,3]}]"#;
        let envelope = decode(&text(original)).unwrap();
        let relayed = envelope.with_hop(NodeId::from("NN1"));

        match encode(&relayed, FrameProfile::Routed).unwrap() {
            Frame::Text(out) => {
                assert!(out.contains(r#"{"vendorId":"x", "data" : [1,2.50,3]}"#));
                assert!(out.contains(r#"["CS001","NN1"]"#));
            }
            Frame::Binary(_) => panic!("Expected text frame"),
        }
    }

    #[test]
    fn test_standard_encoding_shapes() {
        let call = Envelope::call(Call::with_id(
            RequestId::from("1"),
            "Heartbeat",
            Payload::empty(),
        ));
        assert_eq!(
            encode(&call, FrameProfile::Standard).unwrap(),
            text(r#"[2,"1","Heartbeat",{}]"#)
        );

        let error = Envelope::call_error(CallError::not_implemented(RequestId::from("2")));
        assert_eq!(
            encode(&error, FrameProfile::Standard).unwrap(),
            text(r#"[4,"2","NotImplemented","Requested Action is not known by receiver",{}]"#)
        );
    }

    #[test]
    fn test_wrong_field_count() {
        let err = decode(&text(r#"[2, "msg-1", "Heartbeat"]"#)).unwrap_err();
        assert!(matches!(err.source, CodecError::FieldCount { found: 3, .. }));

        let reply = err.reply_error().unwrap();
        assert_eq!(reply.request_id.as_str(), "msg-1");
        assert_eq!(reply.error_code, ErrorCode::FormationViolation);
    }

    #[test]
    fn test_unknown_message_type() {
        let err = decode(&text(r#"[7, "msg-9", "Whatever", {}]"#)).unwrap_err();
        assert!(matches!(err.source, CodecError::UnknownMessageType(7)));
        assert_eq!(err.reply_error().unwrap().error_code, ErrorCode::NotSupported);
    }

    #[test]
    fn test_broken_reply_gets_no_answer() {
        let err = decode(&text(r#"[3, "msg-1"]"#)).unwrap_err();
        assert!(err.reply_error().is_none());
    }

    #[test]
    fn test_malformed_frames() {
        for bad in [
            "",
            "not json",
            "{}",
            "[]",
            r#"["2", "id", "Heartbeat", {}]"#,
            r#"[2, 17, "Heartbeat", {}]"#,
            r#"[2, "", "Heartbeat", {}]"#,
            r#"[2, "id", "Heartbeat", [1]]"#,
            r#"[2, "CSMS", ["A", "B", "A"], "id", "Heartbeat", {}]"#,
        ] {
            assert!(decode(&text(bad)).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_binary_payload_on_json_channel_rejected() {
        let envelope = Envelope::call(Call::new("BinaryDataTransfer", Payload::binary(vec![1u8])))
            .on_channel(Channel::Json);
        assert!(matches!(
            encode(&envelope, FrameProfile::Standard),
            Err(CodecError::ChannelMismatch)
        ));
    }
}
