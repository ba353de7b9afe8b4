//! Inbound-call handlers: trait, invocation context, and the registry with
//! named and wildcard entries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use wirecall_protocol::ErrorCode;

/// Context provided to every handler invocation.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Method name from the CALL frame.
    pub method: String,
    /// Params payload from the CALL frame.
    pub params: Value,
    /// Correlation id — the reply frame echoes it.
    pub correlation_id: String,
    /// Fired when the connection drops or a forced close begins.
    /// Long-running handlers should observe it cooperatively.
    pub cancel: CancellationToken,
}

/// What a handler produced on success.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Send a RESULT frame carrying this payload.
    Reply(Value),
    /// Suppress the reply frame entirely (fire-and-forget semantics from
    /// the receiver's side).
    NoReply,
}

/// An application failure raised by a handler, mapped to an ERROR frame.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
    /// Echoed to the peer only when supplied here or when the connection
    /// runs with detailed errors enabled.
    pub details: Option<Value>,
}

impl HandlerError {
    /// A failure with the default `GenericError` code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::GenericError,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub type HandlerResult = Result<Outcome, HandlerError>;

/// Implement this trait to answer inbound CALL frames.
///
/// Handlers run on the Tokio runtime and may perform async I/O.  The
/// returned future is the single-shot settlement: resolving it with
/// [`Outcome::Reply`] sends a RESULT frame, [`Outcome::NoReply`] suppresses
/// the reply, and an error sends an ERROR frame.  The engine guarantees
/// exactly one frame (or none for `NoReply`) per inbound call regardless of
/// what the handler does, including panicking.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext) -> HandlerResult;
}

/// Adapter so plain async closures can be registered as handlers.
pub(crate) struct FnHandler<F>(pub(crate) F);

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: CallContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// Named handlers plus an optional wildcard fallback.
#[derive(Default)]
pub(crate) struct HandlerTable {
    named: HashMap<String, Arc<dyn Handler>>,
    wildcard: Option<Arc<dyn Handler>>,
}

impl HandlerTable {
    /// Register a named handler, replacing any prior registration.
    pub(crate) fn insert(&mut self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.named.insert(method.into(), handler);
    }

    /// Register the wildcard fallback, replacing any prior one.
    pub(crate) fn set_wildcard(&mut self, handler: Arc<dyn Handler>) {
        self.wildcard = Some(handler);
    }

    /// Resolve a handler for `method`: exact name first, wildcard only when
    /// no name matches.
    pub(crate) fn resolve(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.named
            .get(method)
            .cloned()
            .or_else(|| self.wildcard.clone())
    }
}
