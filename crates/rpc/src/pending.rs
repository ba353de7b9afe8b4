//! Registry of in-flight operations: outbound calls awaiting a reply and
//! inbound calls whose handler is still running.
//!
//! The registry is the single source of truth for the at-most-one-per-id
//! invariants.  Settlement of an outbound call goes through a `oneshot`
//! sender, which enforces exactly-once delivery; inbound handler slots are
//! released by a drop-guard so every exit path cleans up.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

pub(crate) type CallSettlement = oneshot::Sender<Result<Value, RpcError>>;

struct PendingCall {
    method: String,
    settle: CallSettlement,
}

struct PendingResponse {
    cancel: CancellationToken,
}

#[derive(Default)]
struct Maps {
    calls: HashMap<String, PendingCall>,
    responses: HashMap<String, PendingResponse>,
}

impl Maps {
    fn total(&self) -> usize {
        self.calls.len() + self.responses.len()
    }
}

pub(crate) struct PendingOps {
    maps: Mutex<Maps>,
    count: watch::Sender<usize>,
}

impl PendingOps {
    pub(crate) fn new() -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self {
            maps: Mutex::new(Maps::default()),
            count,
        })
    }

    /// Track an outbound call awaiting its RESULT/ERROR.
    pub(crate) fn register_call(&self, id: &str, method: &str, settle: CallSettlement) {
        let mut maps = self.maps.lock();
        let prev = maps.calls.insert(
            id.to_string(),
            PendingCall {
                method: method.to_string(),
                settle,
            },
        );
        // Fresh UUID v4 per call guarantees this, but assert defensively.
        debug_assert!(prev.is_none(), "correlation id collision: {id}");
        let _ = self.count.send(maps.total());
    }

    /// Take the settlement slot for an inbound RESULT/ERROR.  `None` when
    /// the id is unknown (already settled, timed out, or never ours).
    pub(crate) fn take_call(&self, id: &str) -> Option<(String, CallSettlement)> {
        let mut maps = self.maps.lock();
        let entry = maps.calls.remove(id);
        let _ = self.count.send(maps.total());
        entry.map(|c| (c.method, c.settle))
    }

    /// Drop a call slot without settling it (timeout/abort cleanup — the
    /// caller settles through its own path).
    pub(crate) fn remove_call(&self, id: &str) {
        let mut maps = self.maps.lock();
        maps.calls.remove(id);
        let _ = self.count.send(maps.total());
    }

    /// Track an inbound call being handled.  Fails on a duplicate in-flight
    /// id — the existing slot is never overwritten.
    pub(crate) fn try_register_response(
        self: &Arc<Self>,
        id: &str,
        cancel: CancellationToken,
    ) -> Option<ResponseGuard> {
        let mut maps = self.maps.lock();
        if maps.responses.contains_key(id) {
            return None;
        }
        maps.responses
            .insert(id.to_string(), PendingResponse { cancel });
        let _ = self.count.send(maps.total());
        Some(ResponseGuard {
            ops: self.clone(),
            id: id.to_string(),
        })
    }

    /// Reject every in-flight operation with the same reason: pending calls
    /// settle with `Err(reason)`, pending response handlers get their
    /// cancellation tokens fired.
    pub(crate) fn reject_all(&self, reason: RpcError) {
        let (calls, responses) = {
            let mut maps = self.maps.lock();
            let calls: Vec<_> = maps.calls.drain().collect();
            let responses: Vec<_> = maps.responses.drain().collect();
            let _ = self.count.send(0);
            (calls, responses)
        };
        for (_, call) in calls {
            let _ = call.settle.send(Err(reason.clone()));
        }
        for (_, response) in responses {
            response.cancel.cancel();
        }
    }

    /// Wait until every in-flight operation has settled, whatever its
    /// individual outcome.  Never short-circuits on failures.
    pub(crate) async fn drain(&self) {
        let mut rx = self.count.subscribe();
        // wait_for checks the current value first, so an already-empty
        // registry returns immediately.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    #[cfg(test)]
    pub(crate) fn call_count(&self) -> usize {
        self.maps.lock().calls.len()
    }

    #[cfg(test)]
    pub(crate) fn response_count(&self) -> usize {
        self.maps.lock().responses.len()
    }
}

/// Releases an inbound-call slot when dropped, on every exit path of the
/// handler task.
pub(crate) struct ResponseGuard {
    ops: Arc<PendingOps>,
    id: String,
}

impl Drop for ResponseGuard {
    fn drop(&mut self) {
        let mut maps = self.ops.maps.lock();
        // reject_all may already have drained the slot.
        if maps.responses.remove(&self.id).is_some() {
            let total = maps.total();
            let _ = self.ops.count.send(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn settle_wakes_waiter_and_clears_slot() {
        let ops = PendingOps::new();
        let (tx, rx) = oneshot::channel();
        ops.register_call("id-1", "Echo", tx);
        assert_eq!(ops.call_count(), 1);

        let (method, settle) = ops.take_call("id-1").unwrap();
        assert_eq!(method, "Echo");
        settle.send(Ok(json!({"ok": true}))).unwrap();

        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert_eq!(ops.call_count(), 0);
        assert!(ops.take_call("id-1").is_none());
    }

    #[tokio::test]
    async fn duplicate_response_id_is_refused() {
        let ops = PendingOps::new();
        let guard = ops
            .try_register_response("id-1", CancellationToken::new())
            .unwrap();
        assert!(ops
            .try_register_response("id-1", CancellationToken::new())
            .is_none());

        drop(guard);
        // Slot is free again once the first handler finished.
        assert!(ops
            .try_register_response("id-1", CancellationToken::new())
            .is_some());
    }

    #[tokio::test]
    async fn reject_all_settles_calls_and_cancels_handlers() {
        let ops = PendingOps::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        ops.register_call("c1", "A", tx1);
        ops.register_call("c2", "B", tx2);
        let cancel = CancellationToken::new();
        let _guard = ops.try_register_response("r1", cancel.clone()).unwrap();

        ops.reject_all(RpcError::Disconnected {
            code: 1006,
            reason: "gone".into(),
        });

        for rx in [rx1, rx2] {
            match rx.await.unwrap() {
                Err(RpcError::Disconnected { code, .. }) => assert_eq!(code, 1006),
                other => panic!("expected Disconnected, got {other:?}"),
            }
        }
        assert!(cancel.is_cancelled());
        assert_eq!(ops.call_count(), 0);
        assert_eq!(ops.response_count(), 0);
    }

    #[tokio::test]
    async fn drain_returns_when_everything_settles() {
        let ops = PendingOps::new();
        let (tx, _rx) = oneshot::channel();
        ops.register_call("c1", "A", tx);
        let guard = ops
            .try_register_response("r1", CancellationToken::new())
            .unwrap();

        let ops2 = ops.clone();
        let drained = tokio::spawn(async move { ops2.drain().await });
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());

        ops.take_call("c1");
        drop(guard);
        drained.await.unwrap();
    }

    #[tokio::test]
    async fn drain_on_empty_registry_is_immediate() {
        let ops = PendingOps::new();
        ops.drain().await;
    }

    #[tokio::test]
    async fn guard_drop_after_reject_all_is_harmless() {
        let ops = PendingOps::new();
        let guard = ops
            .try_register_response("r1", CancellationToken::new())
            .unwrap();
        ops.reject_all(RpcError::NotOpen);
        drop(guard);
        assert_eq!(ops.response_count(), 0);
    }
}
