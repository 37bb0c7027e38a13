//! Uniform outcome attached to every completed exchange
//!
//! Every operation that crosses a component boundary (transport, codec,
//! correlation, forwarding, handler invocation) reports its outcome as an
//! [`ExchangeResult`] instead of raising an error across the boundary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::addressing::NetworkPath;
use crate::codec::CodecError;
use crate::messages::{CallError, ErrorCode, Payload};
use crate::types::RequestId;

/// Details key marking a CallError synthesized by a forwarding rejection
pub const FILTERED_MARKER: &str = "filtered";

/// Outcome codes of the result taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    #[serde(rename = "OK")]
    Ok,
    GenericError,
    FormationViolation,
    NetworkError,
    Filtered,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    SecurityError,
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
}

impl ResultCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}

impl From<ErrorCode> for ResultCode {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NotImplemented => ResultCode::NotImplemented,
            ErrorCode::NotSupported => ResultCode::NotSupported,
            ErrorCode::InternalError => ResultCode::InternalError,
            ErrorCode::ProtocolError => ResultCode::ProtocolError,
            ErrorCode::SecurityError => ResultCode::SecurityError,
            ErrorCode::FormationViolation => ResultCode::FormationViolation,
            ErrorCode::PropertyConstraintViolation => ResultCode::PropertyConstraintViolation,
            ErrorCode::OccurenceConstraintViolation => ResultCode::OccurenceConstraintViolation,
            ErrorCode::TypeConstraintViolation => ResultCode::TypeConstraintViolation,
            ErrorCode::GenericError => ResultCode::GenericError,
        }
    }
}

/// Result of one exchange: code, optional human description, optional details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResult {
    pub code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ExchangeResult {
    pub fn new(code: ResultCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
            details: None,
        }
    }

    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            description: None,
            details: None,
        }
    }

    pub fn generic_error(description: impl Into<String>) -> Self {
        Self::new(ResultCode::GenericError, description)
    }

    pub fn network_error(description: impl Into<String>) -> Self {
        Self::new(ResultCode::NetworkError, description)
    }

    pub fn timeout() -> Self {
        Self::new(ResultCode::NetworkError, "Timeout waiting for response")
    }

    /// Local cancellation of the wait; the request itself may still be on the wire
    pub fn cancelled() -> Self {
        Self::new(ResultCode::GenericError, "Request cancelled by caller")
    }

    pub fn filtered(description: impl Into<String>) -> Self {
        Self::new(ResultCode::Filtered, description)
    }

    pub fn formation_violation(description: impl Into<String>) -> Self {
        Self::new(ResultCode::FormationViolation, description)
    }

    pub fn internal_error(description: impl Into<String>) -> Self {
        Self::new(ResultCode::InternalError, description)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Map a CallError received from a peer onto the taxonomy.
    ///
    /// Rejections synthesized by a relay travel as `GenericError` with a
    /// `filtered` marker in the details and map back to [`ResultCode::Filtered`].
    pub fn from_call_error(error: &CallError) -> Self {
        let filtered = error
            .error_details
            .get(FILTERED_MARKER)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let code = if filtered {
            ResultCode::Filtered
        } else {
            ResultCode::from(error.error_code)
        };

        let details = match &error.error_details {
            Value::Object(map) if map.is_empty() => None,
            Value::Null => None,
            other => Some(other.clone()),
        };

        Self {
            code,
            description: Some(error.error_description.clone()),
            details,
        }
    }
}

impl Default for ExchangeResult {
    fn default() -> Self {
        Self::ok()
    }
}

impl std::fmt::Display for ExchangeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{:?}: {}", self.code, description),
            None => write!(f, "{:?}", self.code),
        }
    }
}

/// What a caller of `send` gets back: always a result, a payload when OK
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: RequestId,
    pub result: ExchangeResult,
    pub payload: Option<Payload>,
    /// Path the reply travelled, as received
    pub network_path: NetworkPath,
    pub runtime: Duration,
}

impl Response {
    pub fn ok(request_id: RequestId, payload: Payload) -> Self {
        Self {
            request_id,
            result: ExchangeResult::ok(),
            payload: Some(payload),
            network_path: NetworkPath::empty(),
            runtime: Duration::ZERO,
        }
    }

    pub fn failed(request_id: RequestId, result: ExchangeResult) -> Self {
        Self {
            request_id,
            result,
            payload: None,
            network_path: NetworkPath::empty(),
            runtime: Duration::ZERO,
        }
    }

    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_path(mut self, network_path: NetworkPath) -> Self {
        self.network_path = network_path;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match &self.payload {
            Some(payload) => payload.parse(),
            None => Err(CodecError::InvalidFormat("response carries no payload")),
        }
    }
}
