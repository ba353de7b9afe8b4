//! Keepalive monitor: periodic pings with a liveness deadline.
//!
//! Runs as its own task while the connection is open.  Every interval it
//! checks whether the previous ping was answered; a missing pong is a fatal
//! liveness failure and hard-terminates the session.  Restarted fresh on
//! every open and whenever the interval is reconfigured.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::RpcEvent;
use crate::transport::WireMessage;

/// Liveness observations forwarded from the session's reader loop.
pub(crate) enum Signal {
    /// Ping or pong traffic was seen; only meaningful in defer mode.
    Activity,
    /// A pong frame arrived with this payload.
    Pong(Vec<u8>),
}

pub(crate) struct KeepaliveParams {
    pub(crate) interval: Duration,
    pub(crate) defer_on_activity: bool,
    pub(crate) out: mpsc::Sender<WireMessage>,
    pub(crate) events: broadcast::Sender<RpcEvent>,
    /// Session token cancelled on liveness failure (hard termination).
    pub(crate) fatal: CancellationToken,
}

pub(crate) struct KeepaliveHandle {
    signals: mpsc::UnboundedSender<Signal>,
    cancel: CancellationToken,
}

impl KeepaliveHandle {
    pub(crate) fn signal(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn(params: KeepaliveParams) -> KeepaliveHandle {
    let (signals, mut signal_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let stop = cancel.clone();

    tokio::spawn(async move {
        let KeepaliveParams {
            interval,
            defer_on_activity,
            out,
            events,
            fatal,
        } = params;

        let mut deadline = Instant::now() + interval;
        // Payload and send instant of the ping still awaiting its pong.
        let mut outstanding: Option<(Vec<u8>, Instant)> = None;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    if outstanding.is_some() {
                        tracing::error!("keepalive pong not received within interval, terminating");
                        let _ = events.send(RpcEvent::SocketError {
                            message: "keepalive timeout: pong not received".into(),
                        });
                        fatal.cancel();
                        return;
                    }
                    let payload = Utc::now().timestamp_millis().to_string().into_bytes();
                    if out.send(WireMessage::Ping(payload.clone())).await.is_err() {
                        return;
                    }
                    outstanding = Some((payload, Instant::now()));
                    deadline = Instant::now() + interval;
                }
                signal = signal_rx.recv() => match signal {
                    None => return,
                    Some(Signal::Pong(payload)) => {
                        if let Some((expected, sent_at)) = &outstanding {
                            if *expected == payload {
                                let rtt = sent_at.elapsed();
                                tracing::trace!(rtt_ms = rtt.as_millis() as u64, "pong received");
                                let _ = events.send(RpcEvent::PingRtt { rtt });
                                outstanding = None;
                            }
                        }
                        if defer_on_activity {
                            deadline = Instant::now() + interval;
                        }
                    }
                    Some(Signal::Activity) => {
                        if defer_on_activity {
                            deadline = Instant::now() + interval;
                        }
                    }
                }
            }
        }
    });

    KeepaliveHandle { signals, cancel }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(
        interval_ms: u64,
        defer: bool,
    ) -> (
        KeepaliveHandle,
        mpsc::Receiver<WireMessage>,
        broadcast::Receiver<RpcEvent>,
        CancellationToken,
    ) {
        let (out, out_rx) = mpsc::channel(16);
        let (events, events_rx) = broadcast::channel(16);
        let fatal = CancellationToken::new();
        let handle = spawn(KeepaliveParams {
            interval: Duration::from_millis(interval_ms),
            defer_on_activity: defer,
            out,
            events,
            fatal: fatal.clone(),
        });
        (handle, out_rx, events_rx, fatal)
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_report_rtt_and_keep_the_session_alive() {
        let (handle, mut out_rx, mut events_rx, fatal) = start(1_000, false);

        for _ in 0..3 {
            let ping = out_rx.recv().await.unwrap();
            let payload = match ping {
                WireMessage::Ping(p) => p,
                other => panic!("expected ping, got {other:?}"),
            };
            handle.signal(Signal::Pong(payload));
            match events_rx.recv().await.unwrap() {
                RpcEvent::PingRtt { .. } => {}
                other => panic!("expected PingRtt, got {other:?}"),
            }
        }
        assert!(!fatal.is_cancelled());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_terminates_session() {
        let (_handle, mut out_rx, _events_rx, fatal) = start(1_000, false);

        // First ping goes out; we never answer it.
        assert!(matches!(
            out_rx.recv().await.unwrap(),
            WireMessage::Ping(_)
        ));
        // At the next interval the monitor notices the missing pong.
        fatal.cancelled().await;
        assert!(fatal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pong_payload_is_ignored() {
        let (handle, mut out_rx, _events_rx, fatal) = start(1_000, false);

        assert!(matches!(
            out_rx.recv().await.unwrap(),
            WireMessage::Ping(_)
        ));
        handle.signal(Signal::Pong(b"not-the-payload".to_vec()));
        // The real pong never arrives, so the session still dies.
        fatal.cancelled().await;
        assert!(fatal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_defers_the_next_ping() {
        let (handle, mut out_rx, _events_rx, _fatal) = start(1_000, true);

        // Keep signalling activity; no ping should be emitted while the
        // deadline keeps moving.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            handle.signal(Signal::Activity);
            tokio::task::yield_now().await;
            assert!(out_rx.try_recv().is_err());
        }

        // Once activity stops, the ping fires after a full interval.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(matches!(
            out_rx.try_recv(),
            Ok(WireMessage::Ping(_))
        ));
        handle.stop();
    }
}
