//! Action registry
//!
//! Maps an action name to the parse/serialize pairs for its request and
//! response types. Built once at startup and shared by the adapters; the core
//! never looks at business fields, it only resolves these functions by name.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::codec::CodecError;
use crate::messages::{Channel, Payload};

/// A decoded request of whatever type its action declares
pub type ParsedRequest = Arc<dyn Any + Send + Sync>;

type AnyValue = Box<dyn Any + Send + Sync>;
type ParseFn = Box<dyn Fn(&Payload) -> Result<AnyValue, CodecError> + Send + Sync>;
type SerializeFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Option<Result<Payload, CodecError>> + Send + Sync>;

/// Errors resolving or applying an action's codec
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid {action} payload: {source}")]
    Parse {
        action: String,
        #[source]
        source: CodecError,
    },

    #[error("Failed to serialize {action} payload: {source}")]
    Serialize {
        action: String,
        #[source]
        source: CodecError,
    },

    #[error("Value type does not match action {0}")]
    TypeMismatch(String),
}

/// Payload types carried on the binary channel
pub trait BinaryPayload: Sized + Send + Sync + 'static {
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError>;
    fn to_bytes(&self) -> Bytes;
}

impl BinaryPayload for Bytes {
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn to_bytes(&self) -> Bytes {
        self.clone()
    }
}

struct ActionCodec {
    channel: Channel,
    parse_request: ParseFn,
    parse_response: ParseFn,
    serialize_request: SerializeFn,
    serialize_response: SerializeFn,
}

fn json_parser<T: DeserializeOwned + Send + Sync + 'static>() -> ParseFn {
    Box::new(|payload| payload.parse::<T>().map(|value| Box::new(value) as AnyValue))
}

fn json_serializer<T: Serialize + 'static>() -> SerializeFn {
    Box::new(|value| value.downcast_ref::<T>().map(Payload::json))
}

fn binary_parser<T: BinaryPayload>() -> ParseFn {
    Box::new(|payload| T::from_bytes(payload.as_bytes()).map(|value| Box::new(value) as AnyValue))
}

fn binary_serializer<T: BinaryPayload>() -> SerializeFn {
    Box::new(|value| {
        value
            .downcast_ref::<T>()
            .map(|v| Ok(Payload::Binary(v.to_bytes())))
    })
}

/// Action name -> codec table
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionCodec>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a JSON action with its request and response types
    pub fn register_json<Req, Resp>(&mut self, action: impl Into<String>) -> &mut Self
    where
        Req: Serialize + DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.actions.insert(
            action.into(),
            ActionCodec {
                channel: Channel::Json,
                parse_request: json_parser::<Req>(),
                parse_response: json_parser::<Resp>(),
                serialize_request: json_serializer::<Req>(),
                serialize_response: json_serializer::<Resp>(),
            },
        );
        self
    }

    /// Register an action whose request travels on the binary channel.
    /// Responses stay JSON.
    pub fn register_binary<Req, Resp>(&mut self, action: impl Into<String>) -> &mut Self
    where
        Req: BinaryPayload,
        Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.actions.insert(
            action.into(),
            ActionCodec {
                channel: Channel::Binary,
                parse_request: binary_parser::<Req>(),
                parse_response: json_parser::<Resp>(),
                serialize_request: binary_serializer::<Req>(),
                serialize_response: json_serializer::<Resp>(),
            },
        );
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    /// Channel an action's requests travel on
    pub fn channel_of(&self, action: &str) -> Option<Channel> {
        self.actions.get(action).map(|codec| codec.channel)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn codec(&self, action: &str) -> Result<&ActionCodec, RegistryError> {
        self.actions
            .get(action)
            .ok_or_else(|| RegistryError::UnknownAction(action.to_string()))
    }

    /// Parse a request payload into the action's request type
    pub fn parse_request(&self, action: &str, payload: &Payload) -> Result<ParsedRequest, RegistryError> {
        let codec = self.codec(action)?;
        (codec.parse_request)(payload)
            .map(ParsedRequest::from)
            .map_err(|source| RegistryError::Parse {
                action: action.to_string(),
                source,
            })
    }

    /// Parse a response payload into the action's response type
    pub fn parse_response<T: Any>(&self, action: &str, payload: &Payload) -> Result<T, RegistryError> {
        let codec = self.codec(action)?;
        let value = (codec.parse_response)(payload).map_err(|source| RegistryError::Parse {
            action: action.to_string(),
            source,
        })?;
        value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| RegistryError::TypeMismatch(action.to_string()))
    }

    /// Serialize a typed request for the wire
    pub fn serialize_request(
        &self,
        action: &str,
        request: &(dyn Any + Send + Sync),
    ) -> Result<Payload, RegistryError> {
        let codec = self.codec(action)?;
        Self::apply(action, &codec.serialize_request, request)
    }

    /// Serialize a typed response for the wire
    pub fn serialize_response(
        &self,
        action: &str,
        response: &(dyn Any + Send + Sync),
    ) -> Result<Payload, RegistryError> {
        let codec = self.codec(action)?;
        Self::apply(action, &codec.serialize_response, response)
    }

    fn apply(
        action: &str,
        serialize: &SerializeFn,
        value: &(dyn Any + Send + Sync),
    ) -> Result<Payload, RegistryError> {
        match serialize(value) {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(source)) => Err(RegistryError::Serialize {
                action: action.to_string(),
                source,
            }),
            None => Err(RegistryError::TypeMismatch(action.to_string())),
        }
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&str> = self.actions().collect();
        actions.sort_unstable();
        f.debug_struct("ActionRegistry").field("actions", &actions).finish()
    }
}
