//! The connection engine: state machine, message loop, and inbound dispatch.
//!
//! One [`Shared`] instance backs a logical connection for its whole life,
//! across reconnects.  Each physical transport attachment is a "link":
//! `open_link` wires up the writer task and keepalive monitor, `drive_link`
//! runs the reader loop until the transport drops, and the role supervisor
//! (client reconnect loop or server attach task) decides what happens next.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wirecall_protocol::{
    decode, DecodeError, ErrorCode, Frame, WireError, INDETERMINATE_ID,
};

use crate::config::{CallOptions, CloseOptions, EngineConfig};
use crate::error::RpcError;
use crate::events::{close_code, CloseEvent, ConnectionState, MessageDirection, RpcEvent};
use crate::handler::{CallContext, HandlerTable, Outcome};
use crate::keepalive::{self, KeepaliveHandle, KeepaliveParams, Signal};
use crate::pending::{PendingOps, ResponseGuard};
use crate::queue::CallQueue;
use crate::transport::{Transport, TransportSink, TransportStream, WireMessage};
use crate::validator::{request_key, response_key, violation_to_wire, SchemaValidator};

/// Sink state of the logical connection.
enum Link {
    /// No transport and none expected (terminal, or before first connect).
    Down,
    /// A transport is being established; outbound frames queue up for the
    /// flush-on-open.
    Buffering(Vec<String>),
    /// A transport is attached; frames go through the writer task.
    Up(LinkHandle),
}

struct LinkHandle {
    out_tx: mpsc::Sender<WireMessage>,
    cancel: CancellationToken,
    keepalive: Option<KeepaliveHandle>,
}

/// Everything a physical link needs to run; produced by [`Shared::open_link`].
pub(crate) struct LinkRuntime {
    sink: Box<dyn TransportSink>,
    stream: Box<dyn TransportStream>,
    out_rx: mpsc::Receiver<WireMessage>,
    cancel: CancellationToken,
}

pub(crate) struct Shared {
    pub(crate) engine: EngineConfig,
    state: Mutex<ConnectionState>,
    link: Mutex<Link>,
    pub(crate) pending: Arc<PendingOps>,
    handlers: RwLock<HandlerTable>,
    pub(crate) queue: CallQueue,
    events: broadcast::Sender<RpcEvent>,
    close_result: watch::Sender<Option<CloseEvent>>,
    close_requested: AtomicBool,
    subprotocol: Mutex<Option<String>>,
    session_value: Value,
    bad_messages: AtomicUsize,
    ping_interval: Mutex<std::time::Duration>,
    /// Close we initiated ourselves; used as the disconnect code when the
    /// peer never echoes a close frame.
    local_close: Mutex<Option<CloseEvent>>,
    /// Whole-connection teardown: interrupts dials and backoff waits.
    abort: Mutex<CancellationToken>,
}

impl Shared {
    pub(crate) fn new(
        engine: EngineConfig,
        initial_state: ConnectionState,
        subprotocol: Option<String>,
        session_value: Value,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (close_result, _) = watch::channel(None);
        let ping_interval = engine.ping_interval;
        let call_concurrency = engine.call_concurrency;
        Arc::new(Self {
            engine,
            state: Mutex::new(initial_state),
            link: Mutex::new(Link::Buffering(Vec::new())),
            pending: PendingOps::new(),
            handlers: RwLock::new(HandlerTable::default()),
            queue: CallQueue::new(call_concurrency),
            events,
            close_result,
            close_requested: AtomicBool::new(false),
            subprotocol: Mutex::new(subprotocol),
            session_value,
            bad_messages: AtomicUsize::new(0),
            ping_interval: Mutex::new(ping_interval),
            local_close: Mutex::new(None),
            abort: Mutex::new(CancellationToken::new()),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn subprotocol(&self) -> Option<String> {
        self.subprotocol.lock().clone()
    }

    pub(crate) fn set_subprotocol(&self, subprotocol: Option<String>) {
        *self.subprotocol.lock() = subprotocol;
    }

    pub(crate) fn session_value(&self) -> &Value {
        &self.session_value
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: RpcEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn abort_token(&self) -> CancellationToken {
        self.abort.lock().clone()
    }

    pub(crate) fn take_local_close(&self) -> Option<CloseEvent> {
        self.local_close.lock().take()
    }

    pub(crate) fn handlers_mut(&self) -> parking_lot::RwLockWriteGuard<'_, HandlerTable> {
        self.handlers.write()
    }

    /// Atomically claim a `Closed -> Connecting` transition.  Exactly one
    /// of several concurrent connect() callers wins and starts the
    /// supervisor.
    pub(crate) fn try_begin_connect(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            *state = ConnectionState::Connecting;
            true
        } else {
            false
        }
    }

    /// Reset per-lifecycle state so a closed connection can connect again.
    pub(crate) fn reset_for_connect(&self) {
        self.close_requested.store(false, Ordering::SeqCst);
        self.bad_messages.store(0, Ordering::SeqCst);
        *self.local_close.lock() = None;
        *self.abort.lock() = CancellationToken::new();
        let _ = self.close_result.send(None);
    }

    /// Enter `Connecting`: outbound frames start buffering for the
    /// flush-on-open.
    pub(crate) fn mark_connecting(&self, attempt: u32) {
        {
            let mut state = self.state.lock();
            *state = ConnectionState::Connecting;
        }
        {
            let mut link = self.link.lock();
            if let Link::Down = *link {
                *link = Link::Buffering(Vec::new());
            }
        }
        tracing::info!(
            identity = %self.engine.identity,
            attempt,
            "connecting"
        );
        self.emit(RpcEvent::Connecting { attempt });
    }

    /// Reconfigure the keepalive interval.  The monitor is restarted, never
    /// adjusted in place.
    pub(crate) fn set_ping_interval(&self, interval: std::time::Duration) {
        *self.ping_interval.lock() = interval;
        let mut link = self.link.lock();
        if let Link::Up(handle) = &mut *link {
            if let Some(keepalive) = handle.keepalive.take() {
                keepalive.stop();
            }
            if !interval.is_zero() {
                handle.keepalive = Some(keepalive::spawn(KeepaliveParams {
                    interval,
                    defer_on_activity: self.engine.defer_pings_on_activity,
                    out: handle.out_tx.clone(),
                    events: self.events.clone(),
                    fatal: handle.cancel.clone(),
                }));
            }
        }
    }

    // ── Outbound path ────────────────────────────────────────────────

    /// Send a raw frame: transmit while up, buffer while connecting, fail
    /// while closed.
    pub(crate) async fn send_text(&self, text: String) -> Result<(), RpcError> {
        if self.state() == ConnectionState::Closed {
            return Err(RpcError::NotOpen);
        }
        self.emit(RpcEvent::Message {
            direction: MessageDirection::Outbound,
            payload: text.clone(),
        });
        let tx = {
            let mut link = self.link.lock();
            match &mut *link {
                Link::Up(handle) => handle.out_tx.clone(),
                Link::Buffering(buffer) => {
                    buffer.push(text);
                    return Ok(());
                }
                Link::Down => return Err(RpcError::NotOpen),
            }
        };
        tx.send(WireMessage::Text(text))
            .await
            .map_err(|_| RpcError::Transport("writer task gone".into()))
    }

    async fn send_wire(&self, message: WireMessage) -> Result<(), RpcError> {
        let tx = {
            let link = self.link.lock();
            match &*link {
                Link::Up(handle) => handle.out_tx.clone(),
                _ => return Err(RpcError::NotOpen),
            }
        };
        tx.send(message)
            .await
            .map_err(|_| RpcError::Transport("writer task gone".into()))
    }

    fn terminate_link(&self) {
        if let Link::Up(handle) = &*self.link.lock() {
            handle.cancel.cancel();
        }
    }

    fn keepalive_signal(&self, signal: Signal) {
        if let Link::Up(handle) = &*self.link.lock() {
            if let Some(keepalive) = &handle.keepalive {
                keepalive.signal(signal);
            }
        }
    }

    // ── Link lifecycle ───────────────────────────────────────────────

    /// Attach a transport: spawn the keepalive monitor, switch the link to
    /// `Up`, flush frames buffered while connecting, and emit `Open`.
    pub(crate) async fn open_link(self: &Arc<Self>, transport: Box<dyn Transport>) -> LinkRuntime {
        let (sink, stream) = transport.split();
        let (out_tx, out_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let interval = *self.ping_interval.lock();
        let keepalive = (!interval.is_zero()).then(|| {
            keepalive::spawn(KeepaliveParams {
                interval,
                defer_on_activity: self.engine.defer_pings_on_activity,
                out: out_tx.clone(),
                events: self.events.clone(),
                fatal: cancel.clone(),
            })
        });

        let buffered = {
            let mut link = self.link.lock();
            match std::mem::replace(
                &mut *link,
                Link::Up(LinkHandle {
                    out_tx: out_tx.clone(),
                    cancel: cancel.clone(),
                    keepalive,
                }),
            ) {
                Link::Buffering(buffer) => buffer,
                _ => Vec::new(),
            }
        };
        *self.state.lock() = ConnectionState::Open;

        let subprotocol = self.subprotocol();
        tracing::info!(
            identity = %self.engine.identity,
            subprotocol = subprotocol.as_deref().unwrap_or("-"),
            buffered = buffered.len(),
            "connection open"
        );
        self.emit(RpcEvent::Open { subprotocol });

        for text in buffered {
            if out_tx.send(WireMessage::Text(text)).await.is_err() {
                break;
            }
        }

        LinkRuntime {
            sink,
            stream,
            out_rx,
            cancel,
        }
    }

    /// Run one physical link to completion.  Returns the close code/reason
    /// the link ended with; pending work has been rejected and `Disconnect`
    /// emitted by the time this returns.
    pub(crate) async fn drive_link(self: &Arc<Self>, runtime: LinkRuntime) -> CloseEvent {
        let LinkRuntime {
            mut sink,
            mut stream,
            mut out_rx,
            cancel,
        } = runtime;

        // Writer task: the only place that touches the sink.  Nothing may
        // follow a close frame.
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                // Biased towards draining: frames already queued (including
                // a final close frame) still go out when the session is
                // being torn down.
                tokio::select! {
                    biased;
                    message = out_rx.recv() => match message {
                        None => break,
                        Some(close @ WireMessage::Close { .. }) => {
                            let _ = sink.send(close).await;
                            break;
                        }
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                    },
                    _ = writer_cancel.cancelled() => break,
                }
            }
        });

        // Reader loop: frames are decoded and routed strictly in receipt
        // order; handler execution happens on spawned tasks.
        let mut peer_close: Option<CloseEvent> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(WireMessage::Text(text))) => {
                        self.handle_inbound_text(text, &cancel).await;
                    }
                    Some(Ok(WireMessage::Ping(_))) => {
                        // The transport layer answers the ping itself.
                        self.keepalive_signal(Signal::Activity);
                    }
                    Some(Ok(WireMessage::Pong(payload))) => {
                        self.keepalive_signal(Signal::Pong(payload));
                    }
                    Some(Ok(WireMessage::Close { code, reason })) => {
                        tracing::debug!(code, reason = %reason, "peer close frame");
                        peer_close = Some(CloseEvent { code, reason });
                        // Keep reading: the stream ends once the close
                        // handshake completes.
                    }
                    Some(Err(e)) => {
                        tracing::warn!(identity = %self.engine.identity, error = %e, "socket error");
                        self.emit(RpcEvent::SocketError {
                            message: e.to_string(),
                        });
                        break;
                    }
                    None => break,
                }
            }
        }

        // Teardown: stop writer, keepalive, and in-flight handler tasks.
        cancel.cancel();
        {
            let mut link = self.link.lock();
            if let Link::Up(handle) = &*link {
                if let Some(keepalive) = &handle.keepalive {
                    keepalive.stop();
                }
            }
            *link = Link::Down;
        }
        let _ = writer.await;

        let end = peer_close
            .or_else(|| self.take_local_close())
            .unwrap_or(CloseEvent {
                code: close_code::ABNORMAL,
                reason: String::new(),
            });

        self.pending.reject_all(RpcError::Disconnected {
            code: end.code,
            reason: end.reason.clone(),
        });
        tracing::info!(
            identity = %self.engine.identity,
            code = end.code,
            reason = %end.reason,
            "disconnected"
        );
        self.emit(RpcEvent::Disconnect {
            code: end.code,
            reason: end.reason.clone(),
        });
        end
    }

    /// Mark the connection terminal.  Safe to call once per lifecycle.
    pub(crate) fn finalize_closed(&self, end: CloseEvent) {
        *self.state.lock() = ConnectionState::Closed;
        *self.link.lock() = Link::Down;
        self.pending.reject_all(RpcError::Disconnected {
            code: end.code,
            reason: end.reason.clone(),
        });
        tracing::info!(
            identity = %self.engine.identity,
            code = end.code,
            reason = %end.reason,
            "closed"
        );
        self.emit(RpcEvent::Close(end.clone()));
        let _ = self.close_result.send(Some(end));
    }

    // ── Public operations ────────────────────────────────────────────

    pub(crate) async fn call_with(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        match self.state() {
            ConnectionState::Closed => return Err(RpcError::NotOpen),
            ConnectionState::Closing => return Err(RpcError::Closing),
            _ => {}
        }

        // Checkpoint: outbound call params, before anything is queued or
        // sent.
        if let Some(validator) = self.active_validator() {
            if let Err(violation) = validator.validate(&request_key(method), &params) {
                return Err(RpcError::Validation(violation_to_wire(violation)));
            }
        }

        let shared = self.clone();
        let method = method.to_string();
        self.queue
            .run(async move { shared.dispatch_call(method, params, options).await })
            .await
    }

    async fn dispatch_call(
        self: Arc<Self>,
        method: String,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        // The state may have moved while this call sat in the queue.
        match self.state() {
            ConnectionState::Closed => return Err(RpcError::NotOpen),
            ConnectionState::Closing => return Err(RpcError::Closing),
            _ => {}
        }

        let id = Uuid::new_v4().to_string();
        let frame = Frame::Call {
            id: id.clone(),
            method: method.clone(),
            params,
        };

        if options.no_reply {
            self.send_text(frame.encode()).await?;
            return Ok(Value::Null);
        }

        let (settle_tx, settle_rx) = oneshot::channel();
        self.pending.register_call(&id, &method, settle_tx);
        if let Err(e) = self.send_text(frame.encode()).await {
            self.pending.remove_call(&id);
            return Err(e);
        }
        tracing::debug!(id = %id, method = %method, "call sent");

        let timeout = options.call_timeout.unwrap_or(self.engine.call_timeout);
        let cancel = options.cancel.unwrap_or_default();

        tokio::select! {
            settled = settle_rx => settled.unwrap_or_else(|_| {
                Err(RpcError::Disconnected {
                    code: close_code::ABNORMAL,
                    reason: "connection lost".into(),
                })
            }),
            _ = cancel.cancelled() => {
                self.pending.remove_call(&id);
                tracing::debug!(id = %id, method = %method, "call aborted");
                Err(RpcError::Aborted)
            }
            _ = tokio::time::sleep(timeout), if !timeout.is_zero() => {
                self.pending.remove_call(&id);
                tracing::debug!(id = %id, method = %method, "call timed out");
                Err(RpcError::TimedOut)
            }
        }
    }

    pub(crate) async fn close(self: &Arc<Self>, options: CloseOptions) -> CloseEvent {
        if let Some(done) = self.close_result.borrow().clone() {
            return done;
        }

        let initiate = {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Closed => {
                    // Never connected: settle the close watch so repeated
                    // calls stay idempotent.
                    drop(state);
                    let done = CloseEvent {
                        code: close_code::ABNORMAL,
                        reason: String::new(),
                    };
                    let _ = self.close_result.send(Some(done.clone()));
                    return done;
                }
                ConnectionState::Closing => false,
                _ => {
                    *state = ConnectionState::Closing;
                    true
                }
            }
        };

        if initiate {
            self.close_requested.store(true, Ordering::SeqCst);
            tracing::info!(identity = %self.engine.identity, code = options.code, "closing");
            self.emit(RpcEvent::Closing);
            *self.local_close.lock() = Some(CloseEvent {
                code: options.code,
                reason: options.reason.clone(),
            });

            if options.force {
                self.pending.reject_all(RpcError::Closing);
                self.terminate_link();
                self.abort_token().cancel();
            } else {
                if options.await_pending {
                    // New calls are rejected once Closing, so the join set
                    // is bounded.
                    self.pending.drain().await;
                } else {
                    self.pending.reject_all(RpcError::Closing);
                }
                let close_frame = WireMessage::Close {
                    code: options.code,
                    reason: options.reason.clone(),
                };
                if self.send_wire(close_frame).await.is_err() {
                    // No live link (still connecting, or already gone):
                    // interrupt the dial/backoff instead.
                    self.abort_token().cancel();
                }
            }
        }

        let mut watch_rx = self.close_result.subscribe();
        loop {
            if let Some(done) = watch_rx.borrow_and_update().clone() {
                return done;
            }
            if watch_rx.changed().await.is_err() {
                return CloseEvent {
                    code: close_code::ABNORMAL,
                    reason: String::new(),
                };
            }
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    async fn handle_inbound_text(self: &Arc<Self>, text: String, link_cancel: &CancellationToken) {
        self.emit(RpcEvent::Message {
            direction: MessageDirection::Inbound,
            payload: text.clone(),
        });
        match decode(&text) {
            Ok(frame) => match self.route_frame(frame, link_cancel).await {
                Ok(()) => {
                    self.bad_messages.store(0, Ordering::SeqCst);
                }
                Err(description) => self.note_bad_message(description).await,
            },
            Err(decode_error) => {
                if decode_error.may_reply() {
                    self.reply_decode_error(&decode_error).await;
                }
                self.note_bad_message(decode_error.to_string()).await;
            }
        }
    }

    async fn reply_decode_error(&self, decode_error: &DecodeError) {
        let id = decode_error
            .id
            .clone()
            .unwrap_or_else(|| INDETERMINATE_ID.to_string());
        let frame = self.error_frame(
            id,
            WireError::with_description(decode_error.code, decode_error.description.clone()),
        );
        let _ = self.send_text(frame.encode()).await;
    }

    /// Route one well-formed frame.  `Err` carries the description of a
    /// framework-level failure that counts against the bad-message budget.
    async fn route_frame(
        self: &Arc<Self>,
        frame: Frame,
        link_cancel: &CancellationToken,
    ) -> Result<(), String> {
        match frame {
            Frame::Call { id, method, params } => {
                let cancel = link_cancel.child_token();
                match self.pending.try_register_response(&id, cancel.clone()) {
                    None => {
                        // Duplicate in-flight id: refuse, never overwrite.
                        let frame = self.error_frame(
                            id.clone(),
                            WireError::with_description(
                                ErrorCode::RpcFrameworkError,
                                "A request with this ID is already in progress",
                            ),
                        );
                        let _ = self.send_text(frame.encode()).await;
                        Err(format!("duplicate in-flight call id {id}"))
                    }
                    Some(guard) => {
                        tracing::debug!(id = %id, method = %method, "call received");
                        let shared = self.clone();
                        tokio::spawn(async move {
                            shared
                                .run_inbound_call(guard, id, method, params, cancel)
                                .await;
                        });
                        Ok(())
                    }
                }
            }
            Frame::Result { id, payload } => match self.pending.take_call(&id) {
                None => Err(format!("result for unknown call id {id}")),
                Some((method, settle)) => {
                    // Checkpoint: inbound call result.
                    let outcome = match self.validate_inbound_result(&method, &payload) {
                        Ok(()) => Ok(payload),
                        Err(wire_error) => Err(RpcError::Validation(wire_error)),
                    };
                    let _ = settle.send(outcome);
                    Ok(())
                }
            },
            Frame::Error { id, error } => match self.pending.take_call(&id) {
                None => Err(format!("error for unknown call id {id}")),
                Some((_, settle)) => {
                    let _ = settle.send(Err(RpcError::Remote(error)));
                    Ok(())
                }
            },
        }
    }

    fn validate_inbound_result(&self, method: &str, payload: &Value) -> Result<(), WireError> {
        if let Some(validator) = self.active_validator() {
            if let Err(violation) = validator.validate(&response_key(method), payload) {
                return Err(violation_to_wire(violation));
            }
        }
        Ok(())
    }

    /// Handle one inbound call.  Failures never escape this task: every
    /// path produces exactly one reply frame, or none for NOREPLY, and the
    /// pending-response slot is released by the guard on all of them.
    async fn run_inbound_call(
        self: Arc<Self>,
        guard: ResponseGuard,
        id: String,
        method: String,
        params: Value,
        cancel: CancellationToken,
    ) {
        let reply = self.execute_inbound_call(&id, &method, params, cancel).await;
        match reply {
            None => {
                tracing::debug!(id = %id, method = %method, "handler chose no reply");
            }
            Some(body) => {
                let frame = match body {
                    Ok(payload) => Frame::Result { id, payload },
                    Err(error) => self.error_frame(id, error),
                };
                if let Err(e) = self.send_text(frame.encode()).await {
                    tracing::warn!(error = %e, "failed to send reply frame");
                }
            }
        }
        drop(guard);
    }

    /// Resolve, validate, and invoke the handler.  `None` means NOREPLY.
    async fn execute_inbound_call(
        &self,
        id: &str,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Option<Result<Value, WireError>> {
        let handler = match self.handlers.read().resolve(method) {
            Some(handler) => handler,
            None => return Some(Err(WireError::new(ErrorCode::NotImplemented))),
        };

        // Checkpoint: inbound call params.  Failure short-circuits to an
        // ERROR reply without invoking the handler.
        if let Some(validator) = self.active_validator() {
            if let Err(violation) = validator.validate(&request_key(method), &params) {
                return Some(Err(violation_to_wire(violation)));
            }
        }

        let context = CallContext {
            method: method.to_string(),
            params,
            correlation_id: id.to_string(),
            cancel,
        };

        // A panicking handler still produces a reply frame.
        let invoked = AssertUnwindSafe(handler.call(context)).catch_unwind().await;

        match invoked {
            Err(_panic) => {
                tracing::error!(id = %id, method = %method, "handler panicked");
                Some(Err(self.internal_error("handler panicked")))
            }
            Ok(Ok(Outcome::NoReply)) => None,
            Ok(Ok(Outcome::Reply(payload))) => {
                // Checkpoint: outbound call result.  A failure here is an
                // internal error, not re-validated.
                if let Some(validator) = self.active_validator() {
                    if let Err(violation) = validator.validate(&response_key(method), &payload) {
                        tracing::warn!(
                            id = %id,
                            method = %method,
                            reason = %violation.message,
                            "handler response failed schema validation"
                        );
                        return Some(Err(
                            self.internal_error("response failed schema validation")
                        ));
                    }
                }
                Some(Ok(payload))
            }
            Ok(Err(handler_error)) => {
                tracing::debug!(
                    id = %id,
                    method = %method,
                    code = %handler_error.code,
                    "handler returned error"
                );
                let mut wire =
                    WireError::with_description(handler_error.code, handler_error.message);
                if let Some(details) = handler_error.details {
                    wire = wire.details(details);
                }
                Some(Err(wire))
            }
        }
    }

    /// Internal failures echo their cause only in detailed-errors mode.
    fn internal_error(&self, cause: &str) -> WireError {
        let error = WireError::new(ErrorCode::InternalError);
        if self.engine.detailed_errors {
            error.details(serde_json::json!({ "cause": cause }))
        } else {
            error
        }
    }

    /// Build an outbound ERROR frame, applying the legacy sub-protocol
    /// respelling.
    fn error_frame(&self, id: String, mut error: WireError) -> Frame {
        error.code = error.code.respelled_for(self.subprotocol.lock().as_deref());
        Frame::Error { id, error }
    }

    async fn note_bad_message(&self, description: String) {
        tracing::warn!(
            identity = %self.engine.identity,
            description = %description,
            "bad inbound message"
        );
        self.emit(RpcEvent::BadMessage {
            description: description.clone(),
        });

        let count = self.bad_messages.fetch_add(1, Ordering::SeqCst) + 1;
        let budget = self.engine.max_bad_messages;
        if budget > 0 && count > budget {
            tracing::error!(
                identity = %self.engine.identity,
                count,
                budget,
                "bad message budget exhausted, closing connection"
            );
            *self.local_close.lock() = Some(CloseEvent {
                code: close_code::PROTOCOL_ERROR,
                reason: "too many malformed messages".into(),
            });
            let _ = self
                .send_wire(WireMessage::Close {
                    code: close_code::PROTOCOL_ERROR,
                    reason: "too many malformed messages".into(),
                })
                .await;
            self.terminate_link();
        }
    }

    fn active_validator(&self) -> Option<Arc<dyn SchemaValidator>> {
        let subprotocol = self.subprotocol();
        if !self.engine.strict_mode.applies_to(subprotocol.as_deref()) {
            return None;
        }
        subprotocol.and_then(|p| self.engine.validators.get(&p).cloned())
    }

    /// Whether strict mode demands a validator that is not registered for
    /// the negotiated sub-protocol.
    pub(crate) fn missing_strict_validator(&self, subprotocol: Option<&str>) -> bool {
        self.engine.strict_mode.applies_to(subprotocol)
            && !subprotocol.is_some_and(|p| self.engine.validators.contains_key(p))
    }
}
