//! Engine-to-engine tests: two connections attached to the ends of an
//! in-memory duplex, exercising the full call/reply path, close semantics,
//! strict mode, and the legacy sub-protocol quirk.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wirecall_rpc::{
    close_code, memory_pair, AttachOptions, CallOptions, CloseOptions, Connection,
    ConnectionState, EngineConfig, ErrorCode, HandlerError, Outcome, RpcError, RpcEvent,
    SchemaValidator, SchemaViolation, StrictMode,
};

fn engine(identity: &str) -> EngineConfig {
    let mut engine = EngineConfig::new(identity);
    // Keepalive has its own tests; keep these quiet.
    engine.ping_interval = Duration::ZERO;
    engine.call_timeout = Duration::from_secs(5);
    engine
}

fn attach(identity: &str, transport: wirecall_rpc::MemoryTransport) -> Connection {
    Connection::attach(
        Box::new(transport),
        AttachOptions::new(identity).engine(engine(identity)),
    )
    .unwrap()
}

fn pair() -> (Connection, Connection) {
    let (left, right) = memory_pair();
    (attach("left", left), attach("right", right))
}

fn echo(connection: &Connection, method: &str) {
    connection.handle_fn(method, |ctx| async move { Ok(Outcome::Reply(ctx.params)) });
}

// ── Calls ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn call_round_trips_params() {
    let (left, right) = pair();
    echo(&right, "Echo");

    let params = json!({"nested": {"list": [1, 2, 3]}, "text": "héllo"});
    let result = left.call("Echo", params.clone()).await.unwrap();
    assert_eq!(result, params);
}

#[tokio::test]
async fn calls_flow_in_both_directions() {
    let (left, right) = pair();
    echo(&right, "FromLeft");
    echo(&left, "FromRight");

    let (a, b) = tokio::join!(
        left.call("FromLeft", json!({"dir": "l2r"})),
        right.call("FromRight", json!({"dir": "r2l"})),
    );
    assert_eq!(a.unwrap(), json!({"dir": "l2r"}));
    assert_eq!(b.unwrap(), json!({"dir": "r2l"}));
}

#[tokio::test]
async fn unknown_method_is_not_implemented() {
    let (left, _right) = pair();

    match left.call("Missing", json!({})).await {
        Err(RpcError::Remote(error)) => assert_eq!(error.code, ErrorCode::NotImplemented),
        other => panic!("expected NotImplemented, got {other:?}"),
    }
}

#[tokio::test]
async fn wildcard_answers_only_unnamed_methods() {
    let (left, right) = pair();
    right.handle_fn("Known", |_ctx| async move {
        Ok(Outcome::Reply(json!({"handler": "named"})))
    });
    right.handle_wildcard_fn(|ctx| async move {
        Ok(Outcome::Reply(json!({"handler": "wildcard", "method": ctx.method})))
    });

    assert_eq!(
        left.call("Known", json!({})).await.unwrap(),
        json!({"handler": "named"})
    );
    assert_eq!(
        left.call("Anything", json!({})).await.unwrap(),
        json!({"handler": "wildcard", "method": "Anything"})
    );
}

#[tokio::test]
async fn handler_error_maps_to_error_frame() {
    let (left, right) = pair();
    right.handle_fn("Guarded", |_ctx| async move {
        Err(HandlerError::with_code(ErrorCode::SecurityError, "not allowed")
            .details(json!({"requires": "authorization"})))
    });

    match left.call("Guarded", json!({})).await {
        Err(RpcError::Remote(error)) => {
            assert_eq!(error.code, ErrorCode::SecurityError);
            assert_eq!(error.description, "not allowed");
            assert_eq!(error.details, json!({"requires": "authorization"}));
        }
        other => panic!("expected Remote error, got {other:?}"),
    }
}

struct PanicHandler;

#[async_trait::async_trait]
impl wirecall_rpc::Handler for PanicHandler {
    async fn call(&self, _ctx: wirecall_rpc::CallContext) -> wirecall_rpc::HandlerResult {
        panic!("intentional panic for testing");
    }
}

#[tokio::test]
async fn handler_panic_becomes_internal_error() {
    let (left, right) = pair();
    right.handle("Explodes", Arc::new(PanicHandler));

    match left.call("Explodes", json!({})).await {
        Err(RpcError::Remote(error)) => assert_eq!(error.code, ErrorCode::InternalError),
        other => panic!("expected InternalError, got {other:?}"),
    }
}

#[tokio::test]
async fn noreply_suppresses_the_reply_frame() {
    let (left, right) = pair();
    right.handle_fn("Notify", |_ctx| async move { Ok(Outcome::NoReply) });

    let options = CallOptions {
        call_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    match left.call_with("Notify", json!({}), options).await {
        Err(RpcError::TimedOut) => {}
        other => panic!("expected TimedOut, got {other:?}"),
    }
}

#[tokio::test]
async fn fire_and_forget_returns_immediately() {
    let (left, right) = pair();
    let seen = Arc::new(AtomicBool::new(false));
    let seen_by_handler = seen.clone();
    right.handle_fn("Event", move |_ctx| {
        let seen = seen_by_handler.clone();
        async move {
            seen.store(true, Ordering::SeqCst);
            Ok(Outcome::Reply(json!({})))
        }
    });

    let options = CallOptions {
        no_reply: true,
        ..Default::default()
    };
    let result = left.call_with("Event", json!({}), options).await.unwrap();
    assert_eq!(result, Value::Null);

    // The frame still reached the peer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen.load(Ordering::SeqCst));
}

// ── Timeouts & cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn call_times_out_against_silent_handler() {
    let (left, right) = pair();
    right.handle_fn("Silent", |_ctx| async move {
        std::future::pending::<()>().await;
        Ok(Outcome::NoReply)
    });

    let started = tokio::time::Instant::now();
    let options = CallOptions {
        call_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    match left.call_with("Silent", json!({}), options).await {
        Err(RpcError::TimedOut) => {}
        other => panic!("expected TimedOut, got {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn cancellation_aborts_before_timeout() {
    let (left, right) = pair();
    right.handle_fn("Slow", |_ctx| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Outcome::Reply(json!({})))
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let options = CallOptions {
        call_timeout: Some(Duration::from_secs(5)),
        cancel: Some(cancel),
        ..Default::default()
    };
    match left.call_with("Slow", json!({}), options).await {
        Err(RpcError::Aborted) => {}
        other => panic!("expected Aborted, got {other:?}"),
    }
}

// ── Concurrency ─────────────────────────────────────────────────────────

#[tokio::test]
async fn outbound_calls_respect_the_concurrency_bound() {
    let (left_transport, right_transport) = memory_pair();
    let mut left_engine = engine("left");
    left_engine.call_concurrency = 2;
    let left = Connection::attach(
        Box::new(left_transport),
        AttachOptions::new("left").engine(left_engine),
    )
    .unwrap();
    let right = attach("right", right_transport);

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (active_h, peak_h) = (active.clone(), peak.clone());
    right.handle_fn("Slow", move |_ctx| {
        let active = active_h.clone();
        let peak = peak_h.clone();
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(Outcome::Reply(json!({})))
        }
    });

    let mut calls = Vec::new();
    for _ in 0..6 {
        let left = left.clone();
        calls.push(tokio::spawn(async move {
            left.call("Slow", json!({})).await
        }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak {:?}", peak);
}

// ── Close semantics ─────────────────────────────────────────────────────

#[tokio::test]
async fn close_is_idempotent() {
    let (left, _right) = pair();

    let first = left.close(CloseOptions::default()).await;
    let second = left.close(CloseOptions::default()).await;
    assert_eq!(first, second);
    assert_eq!(first.code, close_code::NORMAL);
    assert_eq!(left.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn calls_are_rejected_after_close() {
    let (left, _right) = pair();
    left.close(CloseOptions::default()).await;

    match left.call("Anything", json!({})).await {
        Err(RpcError::NotOpen) => {}
        other => panic!("expected NotOpen, got {other:?}"),
    }
}

#[tokio::test]
async fn default_close_rejects_pending_calls() {
    let (left, right) = pair();
    right.handle_fn("Slow", |_ctx| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Outcome::Reply(json!({})))
    });

    let caller = left.clone();
    let call = tokio::spawn(async move { caller.call("Slow", json!({})).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let close = left.close(CloseOptions::default()).await;
    assert_eq!(close.code, close_code::NORMAL);
    match call.await.unwrap() {
        Err(RpcError::Closing) => {}
        other => panic!("expected Closing, got {other:?}"),
    }
}

#[tokio::test]
async fn close_await_pending_lets_calls_settle() {
    let (left, right) = pair();
    right.handle_fn("Slow", |ctx| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(Outcome::Reply(ctx.params))
    });

    let caller = left.clone();
    let call = tokio::spawn(async move { caller.call("Slow", json!({"kept": true})).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let close = left
        .close(CloseOptions {
            await_pending: true,
            ..Default::default()
        })
        .await;
    assert_eq!(close.code, close_code::NORMAL);
    assert_eq!(call.await.unwrap().unwrap(), json!({"kept": true}));
}

#[tokio::test]
async fn new_calls_are_rejected_while_draining() {
    let (left, right) = pair();
    right.handle_fn("Slow", |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(Outcome::Reply(json!({})))
    });

    let caller = left.clone();
    let inflight = tokio::spawn(async move { caller.call("Slow", json!({})).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closer = left.clone();
    let closing = tokio::spawn(async move {
        closer
            .close(CloseOptions {
                await_pending: true,
                ..Default::default()
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    match left.call("Slow", json!({})).await {
        Err(RpcError::Closing) => {}
        other => panic!("expected Closing, got {other:?}"),
    }
    inflight.await.unwrap().unwrap();
    closing.await.unwrap();
}

#[tokio::test]
async fn close_emits_closing_disconnect_close_in_order() {
    let (left, _right) = pair();
    let mut events = left.subscribe();

    let observed = tokio::spawn(async move {
        let mut order = Vec::new();
        loop {
            match events.recv().await {
                Ok(RpcEvent::Closing) => order.push("closing"),
                Ok(RpcEvent::Disconnect { .. }) => order.push("disconnect"),
                Ok(RpcEvent::Close(_)) => {
                    order.push("close");
                    return order;
                }
                Ok(_) => {}
                Err(_) => return order,
            }
        }
    });

    left.close(CloseOptions::default()).await;
    assert_eq!(
        observed.await.unwrap(),
        vec!["closing", "disconnect", "close"]
    );
}

#[tokio::test]
async fn peer_disconnect_rejects_pending_calls() {
    let (left, right) = pair();
    right.handle_fn("Slow", |_ctx| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Outcome::Reply(json!({})))
    });

    let caller = left.clone();
    let call = tokio::spawn(async move { caller.call("Slow", json!({})).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Hard-drop the peer.
    right
        .close(CloseOptions {
            force: true,
            ..Default::default()
        })
        .await;

    match call.await.unwrap() {
        Err(RpcError::Disconnected { .. }) => {}
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

// ── Strict mode ─────────────────────────────────────────────────────────

/// Requires every `.req` payload to carry `"ok": true`; reports the schema
/// keyword that failed.
struct RequireOkField;

impl SchemaValidator for RequireOkField {
    fn validate(&self, key: &str, payload: &Value) -> Result<(), SchemaViolation> {
        if !key.ends_with(".req") {
            return Ok(());
        }
        match payload.get("ok") {
            None => Err(SchemaViolation::new("required", "missing required field: ok")),
            Some(Value::Bool(_)) => Ok(()),
            Some(_) => Err(SchemaViolation::new("type", "field 'ok' must be a boolean")),
        }
    }
}

fn strict_engine(identity: &str, subprotocol: &str) -> EngineConfig {
    let mut config = engine(identity);
    config.strict_mode = StrictMode::All;
    config
        .validators
        .insert(subprotocol.to_string(), Arc::new(RequireOkField));
    config
}

fn strict_pair(subprotocol: &str) -> (Connection, Connection) {
    let (left_transport, right_transport) = memory_pair();
    let left = Connection::attach(
        Box::new(left_transport),
        AttachOptions::new("left")
            .engine(strict_engine("left", subprotocol))
            .subprotocol(subprotocol),
    )
    .unwrap();
    let right = Connection::attach(
        Box::new(right_transport),
        AttachOptions::new("right")
            .engine(engine("right"))
            .subprotocol(subprotocol),
    )
    .unwrap();
    (left, right)
}

#[tokio::test]
async fn strict_mode_rejects_outbound_params_locally() {
    let (left, right) = strict_pair("ocpp2.0.1");
    echo(&right, "Report");

    match left.call("Report", json!({"wrong": 1})).await {
        Err(RpcError::Validation(error)) => {
            assert_eq!(error.code, ErrorCode::OccurenceConstraintViolation);
        }
        other => panic!("expected local Validation error, got {other:?}"),
    }

    // Valid payloads still go through.
    let result = left.call("Report", json!({"ok": true})).await.unwrap();
    assert_eq!(result, json!({"ok": true}));
}

#[tokio::test]
async fn strict_mode_rejects_inbound_params_without_invoking_handler() {
    // The strict peer receives the call this time.
    let (strict_side, loose_side) = strict_pair("ocpp2.0.1");
    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_h = invoked.clone();
    strict_side.handle_fn("Report", move |_ctx| {
        let invoked = invoked_h.clone();
        async move {
            invoked.store(true, Ordering::SeqCst);
            Ok(Outcome::Reply(json!({})))
        }
    });

    match loose_side.call("Report", json!({"ok": 17})).await {
        Err(RpcError::Remote(error)) => {
            assert_eq!(error.code, ErrorCode::TypeConstraintViolation);
        }
        other => panic!("expected Remote validation error, got {other:?}"),
    }
    assert!(!invoked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn legacy_subprotocol_respells_validation_codes() {
    // Under ocpp1.6 a FormatViolation must leave the engine spelled
    // "FormationViolation".
    struct AlwaysFormatViolation;
    impl SchemaValidator for AlwaysFormatViolation {
        fn validate(&self, key: &str, _payload: &Value) -> Result<(), SchemaViolation> {
            if key.ends_with(".req") {
                Err(SchemaViolation::new("additionalProperties", "unexpected property"))
            } else {
                Ok(())
            }
        }
    }

    let (left_transport, right_transport) = memory_pair();
    let mut strict = engine("strict");
    strict.strict_mode = StrictMode::All;
    strict
        .validators
        .insert("ocpp1.6".to_string(), Arc::new(AlwaysFormatViolation));
    let strict_side = Connection::attach(
        Box::new(left_transport),
        AttachOptions::new("strict")
            .engine(strict)
            .subprotocol("ocpp1.6"),
    )
    .unwrap();
    echo(&strict_side, "Anything");
    let loose_side = Connection::attach(
        Box::new(right_transport),
        AttachOptions::new("loose")
            .engine(engine("loose"))
            .subprotocol("ocpp1.6"),
    )
    .unwrap();

    match loose_side.call("Anything", json!({})).await {
        Err(RpcError::Remote(error)) => {
            assert_eq!(error.code, ErrorCode::FormationViolation);
        }
        other => panic!("expected FormationViolation, got {other:?}"),
    }
}

#[tokio::test]
async fn attach_refuses_strict_mode_without_validator() {
    let (left_transport, _right_transport) = memory_pair();
    let mut config = engine("strict");
    config.strict_mode = StrictMode::All;

    let result = Connection::attach(
        Box::new(left_transport),
        AttachOptions::new("strict")
            .engine(config)
            .subprotocol("ocpp2.0.1"),
    );
    assert!(matches!(result, Err(RpcError::Config(_))));
}

// ── Accessors ───────────────────────────────────────────────────────────

#[tokio::test]
async fn attach_exposes_subprotocol_and_session() {
    let (left_transport, _right) = memory_pair();
    let connection = Connection::attach(
        Box::new(left_transport),
        AttachOptions::new("station-42")
            .engine(engine("station-42"))
            .subprotocol("ocpp1.6")
            .session(json!({"tenant": "acme"})),
    )
    .unwrap();

    assert_eq!(connection.identity(), "station-42");
    assert_eq!(connection.subprotocol().as_deref(), Some("ocpp1.6"));
    assert_eq!(connection.session(), &json!({"tenant": "acme"}));
    assert_eq!(connection.state(), ConnectionState::Open);
}
