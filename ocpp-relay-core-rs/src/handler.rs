//! Local dispatch table
//!
//! Action name -> async handler, built once before the node starts.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

use crate::addressing::NetworkPath;
use crate::codec::CodecError;
use crate::messages::{CallError, ErrorCode, Payload};
use crate::registry::{ActionRegistry, RegistryError};
use crate::telemetry::panic_message;
use crate::types::{ConnectionId, NodeId, RequestId};

/// What a handler answers instead of a payload
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {description}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn into_call_error(self, request_id: RequestId) -> CallError {
        CallError::new(request_id, self.code, self.description).with_details(self.details)
    }
}

impl From<CodecError> for HandlerError {
    fn from(e: CodecError) -> Self {
        HandlerError::new(ErrorCode::FormationViolation, e.to_string())
    }
}

impl From<RegistryError> for HandlerError {
    fn from(e: RegistryError) -> Self {
        let code = match &e {
            RegistryError::UnknownAction(_) => ErrorCode::NotImplemented,
            RegistryError::Parse { .. } => ErrorCode::FormationViolation,
            RegistryError::Serialize { .. } | RegistryError::TypeMismatch(_) => ErrorCode::InternalError,
        };
        HandlerError::new(code, e.to_string())
    }
}

/// Who sent a request and how it got here
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub action: String,
    pub connection: ConnectionId,
    /// Peer on the connection the request arrived on
    pub sender: NodeId,
    pub network_path: NetworkPath,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    /// Node that originated the request
    pub fn origin(&self) -> &NodeId {
        self.network_path.origin().unwrap_or(&self.sender)
    }
}

/// Outcome of running a local handler
#[derive(Debug)]
pub enum Dispatch {
    /// The handler returned, with a payload or an error of its choosing
    Answered(Result<Payload, HandlerError>),
    /// The handler panicked; the error is a `GenericError` describing it
    Panicked(HandlerError),
}

impl Dispatch {
    /// What goes back to the requester
    pub fn into_result(self) -> Result<Payload, HandlerError> {
        match self {
            Dispatch::Answered(result) => result,
            Dispatch::Panicked(error) => Err(error),
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<Payload, HandlerError>>;

type HandlerFn = Arc<dyn Fn(RequestContext, Payload) -> HandlerFuture + Send + Sync>;

/// Action -> handler table
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler working on raw payloads
    pub fn register<F, Fut>(&mut self, action: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(RequestContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx, payload| handler(ctx, payload).boxed());
        self.handlers.insert(action.into(), handler);
        self
    }

    /// Register a handler on typed values, using the registry's codec for `action`
    pub fn register_typed<Req, Resp, F, Fut>(
        &mut self,
        registry: Arc<ActionRegistry>,
        action: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
        F: Fn(RequestContext, Arc<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let action = action.into();
        let name = action.clone();
        let handler = Arc::new(handler);

        self.register(action, move |ctx: RequestContext, payload: Payload| {
            let registry = registry.clone();
            let handler = handler.clone();
            let name = name.clone();
            async move {
                let request = registry
                    .parse_request(&name, &payload)?
                    .downcast::<Req>()
                    .map_err(|_| HandlerError::from(RegistryError::TypeMismatch(name.clone())))?;
                let response = handler(ctx, request).await?;
                Ok::<_, HandlerError>(registry.serialize_response(&name, &response)?)
            }
        })
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run the handler for `ctx.action`. `None` when no handler is registered.
    pub async fn dispatch(&self, ctx: RequestContext, payload: Payload) -> Option<Dispatch> {
        let handler = self.handlers.get(&ctx.action)?.clone();
        let action = ctx.action.clone();

        let future = match catch_unwind(AssertUnwindSafe(|| handler(ctx, payload))) {
            Ok(future) => future,
            Err(panic) => return Some(Dispatch::Panicked(handler_panicked(&action, panic.as_ref()))),
        };

        Some(match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => Dispatch::Answered(result),
            Err(panic) => Dispatch::Panicked(handler_panicked(&action, panic.as_ref())),
        })
    }
}

fn handler_panicked(action: &str, panic: &(dyn std::any::Any + Send)) -> HandlerError {
    HandlerError::new(
        ErrorCode::GenericError,
        format!("Handler for {} panicked: {}", action, panic_message(panic)),
    )
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&str> = self.actions().collect();
        actions.sort_unstable();
        f.debug_struct("HandlerTable").field("actions", &actions).finish()
    }
}
