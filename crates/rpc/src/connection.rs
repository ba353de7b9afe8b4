//! The public connection handle, shared by both roles.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::{AttachOptions, CallOptions, CloseOptions};
use crate::error::RpcError;
use crate::events::{CloseEvent, ConnectionState, RpcEvent};
use crate::handler::{FnHandler, Handler, HandlerResult};
use crate::session::Shared;
use crate::transport::Transport;

/// A logical peer-to-peer RPC connection.
///
/// Cheap to clone; all clones drive the same underlying connection.  Both
/// roles use the same engine: the client role builds one through
/// [`Client`](crate::Client), the server role attaches one to an accepted
/// transport with [`Connection::attach`].
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl Connection {
    /// Server role: adopt an already-accepted transport.
    ///
    /// The acceptor has done the handshake; it supplies the negotiated
    /// sub-protocol and an opaque session value.  The connection starts
    /// `Open` and never reconnects — when the transport drops it is closed
    /// for good.
    pub fn attach(
        transport: Box<dyn Transport>,
        options: AttachOptions,
    ) -> Result<Connection, RpcError> {
        options.engine.validate()?;

        let shared = Shared::new(
            options.engine,
            ConnectionState::Open,
            options.subprotocol,
            options.session,
        );
        if shared.missing_strict_validator(shared.subprotocol().as_deref()) {
            return Err(RpcError::Config(format!(
                "strict mode requires a validator for sub-protocol '{}'",
                shared.subprotocol().as_deref().unwrap_or("-")
            )));
        }

        let runner = shared.clone();
        tokio::spawn(async move {
            let runtime = runner.open_link(transport).await;
            let end = runner.drive_link(runtime).await;
            runner.finalize_closed(end);
        });

        Ok(Connection { shared })
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Issue a call and wait for the peer's RESULT payload.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_with(method, params, CallOptions::default()).await
    }

    /// Issue a call with per-call overrides (timeout, cancellation,
    /// fire-and-forget).
    pub async fn call_with(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        self.shared.call_with(method, params, options).await
    }

    // ── Handlers ─────────────────────────────────────────────────────

    /// Register a handler for a method name, replacing any prior one.
    pub fn handle(&self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.shared.handlers_mut().insert(method, handler);
    }

    /// Register an async closure for a method name.
    pub fn handle_fn<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(crate::handler::CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handle(method, Arc::new(FnHandler(handler)));
    }

    /// Register the wildcard fallback, used only when no named handler
    /// matches.
    pub fn handle_wildcard(&self, handler: Arc<dyn Handler>) {
        self.shared.handlers_mut().set_wildcard(handler);
    }

    /// Register an async closure as the wildcard fallback.
    pub fn handle_wildcard_fn<F, Fut>(&self, handler: F)
    where
        F: Fn(crate::handler::CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handle_wildcard(Arc::new(FnHandler(handler)));
    }

    // ── Raw frames ───────────────────────────────────────────────────

    /// Send a pre-encoded frame.
    ///
    /// Escape hatch for traffic the call machinery does not cover.
    /// Transmits immediately while `Open` or `Closing`, buffers for the
    /// flush-on-open while `Connecting`, and fails while `Closed`.
    pub async fn send_raw(&self, frame: impl Into<String>) -> Result<(), RpcError> {
        self.shared.send_text(frame.into()).await
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Close the connection.  Idempotent: every caller gets the same
    /// terminal close event.
    pub async fn close(&self, options: CloseOptions) -> CloseEvent {
        self.shared.close(options).await
    }

    /// Subscribe to lifecycle and observability events.
    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.shared.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn identity(&self) -> &str {
        &self.shared.engine.identity
    }

    /// Sub-protocol negotiated at the first successful open; fixed for the
    /// life of the connection.
    pub fn subprotocol(&self) -> Option<String> {
        self.shared.subprotocol()
    }

    /// Opaque session value supplied at attach time (server role).
    pub fn session(&self) -> &Value {
        self.shared.session_value()
    }

    // ── Runtime reconfiguration ──────────────────────────────────────

    /// Change the keepalive interval; the monitor restarts immediately.
    /// Zero disables it.
    pub fn set_ping_interval(&self, interval: std::time::Duration) {
        self.shared.set_ping_interval(interval);
    }

    /// Change the outbound call concurrency limit.  Raising it immediately
    /// admits queued calls.
    pub fn set_call_concurrency(&self, concurrency: usize) {
        self.shared.queue.set_concurrency(concurrency);
    }

    pub fn call_concurrency(&self) -> usize {
        self.shared.queue.concurrency()
    }
}
