//! Binary channel framing
//!
//! Used for actions whose payload is raw bytes (file transfer, encrypted data
//! transfer). All integers are big-endian:
//!
//! ```text
//! kind:u8 | flags:u8 (ROUTED, JSON_BODY) | idLen:u16 | id
//! [flags & ROUTED: destLen:u16 | dest | hopCount:u8 | (hopLen:u16 | hop)*]
//! Call:       actionLen:u16 | action | payloadLen:u32 | payload
//! CallResult: payloadLen:u32 | payload
//! CallError:  codeLen:u16 | code | descLen:u32 | desc | detailsLen:u32 | details(JSON)
//! ```
//!
//! `JSON_BODY` marks a Call/CallResult payload that is JSON text rather than
//! raw bytes; it decodes back into a JSON payload with identical text.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::codec::{checked_path, parse_request_id, wire_destination, CodecError, FrameProfile, Recovered};
use crate::messages::*;
use crate::types::{NodeId, RequestId};

/// Flag bit: a routing header follows the id
const FLAG_ROUTED: u8 = 0x01;

/// Flag bit: the Call/CallResult payload is JSON text
const FLAG_JSON_BODY: u8 = 0x02;

/// Maximum hops representable in a binary routing header
const MAX_HOPS: usize = u8::MAX as usize;

fn put_str16(buf: &mut BytesMut, value: &str, field: &'static str) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::FieldTooLong(field))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_bytes32(buf: &mut BytesMut, value: &[u8], field: &'static str) -> Result<(), CodecError> {
    let len = u32::try_from(value.len()).map_err(|_| CodecError::FieldTooLong(field))?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

/// Encode an envelope as a binary frame
pub fn encode(envelope: &Envelope, profile: FrameProfile) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(64);

    buf.put_u8(envelope.message_type() as u8);
    let mut flags = match profile {
        FrameProfile::Standard => 0,
        FrameProfile::Routed => FLAG_ROUTED,
    };
    let body = match &envelope.message {
        Message::Call(call) => Some(&call.payload),
        Message::CallResult(result) => Some(&result.payload),
        Message::CallError(_) => None,
    };
    if matches!(body, Some(Payload::Json(_))) {
        flags |= FLAG_JSON_BODY;
    }
    buf.put_u8(flags);
    put_str16(&mut buf, envelope.request_id().as_str(), "request id")?;

    if profile == FrameProfile::Routed {
        let destination = wire_destination(envelope);
        put_str16(&mut buf, destination.as_str(), "destination")?;

        let hops = envelope.network_path.hops();
        if hops.len() > MAX_HOPS {
            return Err(CodecError::FieldTooLong("network path"));
        }
        buf.put_u8(hops.len() as u8);
        for hop in hops {
            put_str16(&mut buf, hop.as_str(), "network path hop")?;
        }
    }

    match &envelope.message {
        Message::Call(call) => {
            put_str16(&mut buf, &call.action, "action")?;
            put_bytes32(&mut buf, call.payload.as_bytes(), "payload")?;
        }
        Message::CallResult(result) => {
            put_bytes32(&mut buf, result.payload.as_bytes(), "payload")?;
        }
        Message::CallError(error) => {
            put_str16(&mut buf, error.error_code.as_str(), "error code")?;
            put_bytes32(&mut buf, error.error_description.as_bytes(), "error description")?;
            let details = serde_json::to_vec(&error.error_details)?;
            put_bytes32(&mut buf, &details, "error details")?;
        }
    }

    Ok(buf.freeze())
}

/// Cursor over a binary frame with bounds-checked reads
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn ensure(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn bytes16(&mut self) -> Result<Bytes, CodecError> {
        self.ensure(2)?;
        let len = self.buf.get_u16() as usize;
        self.ensure(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    fn bytes32(&mut self) -> Result<Bytes, CodecError> {
        self.ensure(4)?;
        let len = self.buf.get_u32() as usize;
        self.ensure(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    fn str16(&mut self) -> Result<String, CodecError> {
        let bytes = self.bytes16()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidFormat("string field is not UTF-8"))
    }

    fn str32(&mut self) -> Result<String, CodecError> {
        let bytes = self.bytes32()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidFormat("string field is not UTF-8"))
    }
}

/// Decode a binary frame
pub(crate) fn decode(bytes: &Bytes, recovered: &mut Recovered) -> Result<Envelope, CodecError> {
    let mut reader = Reader { buf: bytes.clone() };

    let kind = reader.u8()?;
    let flags = reader.u8()?;
    let request_id = parse_request_id(reader.str16().ok())?;
    recovered.request_id = Some(request_id.clone());

    let message_type =
        MessageType::from_wire(kind as i64).ok_or(CodecError::UnknownMessageType(kind as i64))?;
    recovered.message_type = Some(message_type);

    let (destination, network_path) = if flags & FLAG_ROUTED != 0 {
        let destination = NodeId::new(reader.str16()?);
        let count = reader.u8()? as usize;
        let mut hops = Vec::with_capacity(count);
        for _ in 0..count {
            hops.push(NodeId::new(reader.str16()?));
        }
        (Some(destination), checked_path(hops)?)
    } else {
        (None, Default::default())
    };

    let json_body = flags & FLAG_JSON_BODY != 0;
    let message = decode_body(message_type, request_id, json_body, &mut reader)?;

    if reader.buf.has_remaining() {
        return Err(CodecError::InvalidFormat("trailing bytes after frame"));
    }

    Ok(Envelope {
        message,
        destination,
        network_path,
        channel: Channel::Binary,
        created_at: chrono::Utc::now(),
    })
}

fn decode_payload(reader: &mut Reader, json_body: bool) -> Result<Payload, CodecError> {
    if json_body {
        let text = reader.str32()?;
        Ok(Payload::Json(RawValue::from_string(text)?))
    } else {
        Ok(Payload::Binary(reader.bytes32()?))
    }
}

fn decode_body(
    message_type: MessageType,
    request_id: RequestId,
    json_body: bool,
    reader: &mut Reader,
) -> Result<Message, CodecError> {
    Ok(match message_type {
        MessageType::Call => {
            let action = reader.str16()?;
            if action.is_empty() {
                return Err(CodecError::InvalidFormat("action must be a non-empty string"));
            }
            Message::Call(Call {
                request_id,
                action,
                payload: decode_payload(reader, json_body)?,
            })
        }
        MessageType::CallResult => Message::CallResult(CallResult {
            request_id,
            payload: decode_payload(reader, json_body)?,
        }),
        MessageType::CallError => {
            let code = reader.str16()?;
            let description = reader.str32()?;
            let details_bytes = reader.bytes32()?;
            let details: Value = if details_bytes.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_slice(&details_bytes)?
            };
            Message::CallError(CallError {
                request_id,
                error_code: ErrorCode::from_wire(&code),
                error_description: description,
                error_details: details,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::NetworkPath;
    use crate::codec::{self, Frame};

    fn binary_call() -> Envelope {
        Envelope::call(Call::with_id(
            RequestId::from("b-1"),
            "BinaryDataTransfer",
            Payload::binary(vec![0xde, 0xad, 0xbe, 0xef]),
        ))
        .to(NodeId::from("CS001"))
        .via(NetworkPath::from_hops(vec![NodeId::from("CSMS-1"), NodeId::from("NN1")]))
    }

    #[test]
    fn test_routed_call_round_trip() {
        let envelope = binary_call();
        let frame = codec::encode(&envelope, FrameProfile::Routed).unwrap();
        assert!(matches!(frame, Frame::Binary(_)));

        let decoded = codec::decode(&frame).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_standard_drops_routing_header() {
        let frame = codec::encode(&binary_call(), FrameProfile::Standard).unwrap();
        let decoded = codec::decode(&frame).unwrap();
        assert!(decoded.destination.is_none());
        assert!(decoded.network_path.is_empty());
        assert_eq!(decoded.request_id().as_str(), "b-1");
    }

    #[test]
    fn test_error_on_binary_channel() {
        let envelope = Envelope::call_error(
            CallError::new(RequestId::from("b-2"), ErrorCode::SecurityError, "denied")
                .with_details(serde_json::json!({"reason": "policy"})),
        )
        .on_channel(Channel::Binary);

        let frame = codec::encode(&envelope, FrameProfile::Standard).unwrap();
        let decoded = codec::decode(&frame).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_json_payload_on_binary_channel() {
        let call = Envelope::call(Call::with_id(
            RequestId::from("b-3"),
            "DataTransfer",
            Payload::raw_json(r#"{"vendorId" : "acme", "data":[1,2.50]}"#).unwrap(),
        ))
        .on_channel(Channel::Binary);

        for profile in [FrameProfile::Standard, FrameProfile::Routed] {
            let frame = codec::encode(&call, profile).unwrap();
            assert!(matches!(frame, Frame::Binary(_)));
            let decoded = codec::decode(&frame).unwrap();
            assert_eq!(decoded.message, call.message);
            assert_eq!(decoded.channel, Channel::Binary);
        }

        let reply = call.reply(Message::CallResult(CallResult::new(
            RequestId::from("b-3"),
            Payload::raw_json(r#"{"status":"Accepted"}"#).unwrap(),
        )));
        let decoded = codec::decode(&codec::encode(&reply, FrameProfile::Standard).unwrap()).unwrap();
        let Message::CallResult(result) = decoded.message else {
            panic!("Expected CallResult");
        };
        assert_eq!(result.payload.as_json_str(), Some(r#"{"status":"Accepted"}"#));
    }

    #[test]
    fn test_invalid_json_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::CallResult as u8);
        buf.put_u8(FLAG_JSON_BODY);
        put_str16(&mut buf, "b-4", "request id").unwrap();
        put_bytes32(&mut buf, b"{not json", "payload").unwrap();

        let err = codec::decode(&Frame::Binary(buf.freeze())).unwrap_err();
        assert_eq!(err.request_id, Some(RequestId::from("b-4")));
    }

    #[test]
    fn test_truncated_frame_keeps_request_id() {
        let frame = codec::encode(&binary_call(), FrameProfile::Standard).unwrap();
        let Frame::Binary(bytes) = frame else {
            panic!("Expected binary frame");
        };
        let cut = Frame::Binary(bytes.slice(..bytes.len() - 2));

        let err = codec::decode(&cut).unwrap_err();
        assert!(matches!(err.source, CodecError::Truncated));
        assert_eq!(err.request_id, Some(RequestId::from("b-1")));
        assert_eq!(err.reply_error().unwrap().error_code, ErrorCode::FormationViolation);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let Frame::Binary(bytes) = codec::encode(&binary_call(), FrameProfile::Routed).unwrap() else {
            panic!("Expected binary frame");
        };
        let mut extended = BytesMut::from(&bytes[..]);
        extended.put_u8(0);
        assert!(codec::decode(&Frame::Binary(extended.freeze())).is_err());
    }
}
