//! Message transport abstraction and the WebSocket implementation.
//!
//! The engine only needs a full-duplex message channel: text frames carry
//! protocol traffic, ping/pong carry liveness, and a close frame ends the
//! session.  Anything below the message boundary (WebSocket framing, TLS,
//! the upgrade handshake) stays on this side of the seam.
//!
//! Contract notes:
//! - The transport layer answers inbound pings itself (tungstenite already
//!   does; [`memory_pair`] mirrors that).  The engine only observes them.
//! - Hard termination is modeled by dropping both halves, which tears down
//!   the underlying stream without a close handshake.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::events::close_code;

/// One message crossing the transport boundary, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Outbound half of a split transport.
#[async_trait]
pub trait TransportSink: Send + 'static {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;
}

/// Inbound half of a split transport.  `None` means the peer is gone.
#[async_trait]
pub trait TransportStream: Send + 'static {
    async fn next(&mut self) -> Option<Result<WireMessage, TransportError>>;
}

/// A connected full-duplex message transport, ready to be driven by the
/// engine.
pub trait Transport: Send + 'static {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebSocket transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// WebSocket-backed transport over any byte stream (plain TCP, TLS, or an
/// in-process duplex in tests).
pub struct WsTransport<S> {
    ws: WebSocketStream<S>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a completed client-side WebSocket.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }

    /// Wrap a server-accepted WebSocket.  The acceptor has already run the
    /// upgrade handshake and negotiated the sub-protocol.
    pub fn from_accepted(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        let (sink, stream) = self.ws.split();
        (
            Box::new(WsSink { sink }),
            Box::new(WsStream { stream }),
        )
    }
}

struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> TransportSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let ws_message = match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Ping(payload) => Message::Ping(payload),
            WireMessage::Pong(payload) => Message::Pong(payload),
            WireMessage::Close { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        };
        self.sink
            .send(ws_message)
            .await
            .map_err(|e| TransportError(e.to_string()))
    }
}

struct WsStream<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> TransportStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next(&mut self) -> Option<Result<WireMessage, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(m) => m,
                Err(e) => return Some(Err(TransportError(e.to_string()))),
            };
            return Some(Ok(match message {
                Message::Text(text) => WireMessage::Text(text),
                // The protocol is text-only; binary payloads flow through
                // to the codec, which reports them as bad messages unless
                // they happen to be valid frames.
                Message::Binary(bytes) => {
                    WireMessage::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                Message::Ping(payload) => WireMessage::Ping(payload),
                Message::Pong(payload) => WireMessage::Pong(payload),
                Message::Close(frame) => match frame {
                    Some(f) => WireMessage::Close {
                        code: f.code.into(),
                        reason: f.reason.into_owned(),
                    },
                    None => WireMessage::Close {
                        code: close_code::NO_STATUS,
                        reason: String::new(),
                    },
                },
                // Raw frames are not surfaced by tokio-tungstenite reads.
                Message::Frame(_) => continue,
            }));
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-process duplex transport: two connected ends exchanging
/// [`WireMessage`]s over channels.  Used by the test suites; also handy for
/// wiring two engines together inside one process.
pub struct MemoryTransport {
    tx: mpsc::Sender<WireMessage>,
    rx: mpsc::Receiver<WireMessage>,
}

/// Create a connected pair of memory transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    (
        MemoryTransport { tx: a_tx, rx: b_rx },
        MemoryTransport { tx: b_tx, rx: a_rx },
    )
}

impl Transport for MemoryTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        (
            Box::new(MemorySink { tx: self.tx.clone() }),
            Box::new(MemoryStream {
                rx: self.rx,
                reply_tx: self.tx,
                closed: false,
            }),
        )
    }
}

struct MemorySink {
    tx: mpsc::Sender<WireMessage>,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError("peer endpoint dropped".into()))
    }
}

struct MemoryStream {
    rx: mpsc::Receiver<WireMessage>,
    reply_tx: mpsc::Sender<WireMessage>,
    closed: bool,
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<WireMessage, TransportError>> {
        if self.closed {
            return None;
        }
        let message = self.rx.recv().await?;
        // Mirror the WebSocket layer: the transport answers pings itself
        // and completes the close handshake by echoing the close frame,
        // after which the stream ends.
        match &message {
            WireMessage::Ping(payload) => {
                let _ = self
                    .reply_tx
                    .send(WireMessage::Pong(payload.clone()))
                    .await;
            }
            WireMessage::Close { code, reason } => {
                let _ = self
                    .reply_tx
                    .send(WireMessage::Close {
                        code: *code,
                        reason: reason.clone(),
                    })
                    .await;
                self.closed = true;
            }
            _ => {}
        }
        Some(Ok(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_round_trips() {
        let (a, b) = memory_pair();
        let (mut a_sink, _a_stream) = Box::new(a).split();
        let (_b_sink, mut b_stream) = Box::new(b).split();

        a_sink
            .send(WireMessage::Text("hello".into()))
            .await
            .unwrap();
        assert_eq!(
            b_stream.next().await.unwrap().unwrap(),
            WireMessage::Text("hello".into())
        );
    }

    #[tokio::test]
    async fn memory_stream_answers_pings() {
        let (a, b) = memory_pair();
        let (mut a_sink, mut a_stream) = Box::new(a).split();
        let (_b_sink, mut b_stream) = Box::new(b).split();

        a_sink.send(WireMessage::Ping(b"42".to_vec())).await.unwrap();
        // Peer's stream observes the ping...
        assert_eq!(
            b_stream.next().await.unwrap().unwrap(),
            WireMessage::Ping(b"42".to_vec())
        );
        // ...and our stream gets the auto-pong.
        assert_eq!(
            a_stream.next().await.unwrap().unwrap(),
            WireMessage::Pong(b"42".to_vec())
        );
    }

    #[tokio::test]
    async fn dropped_peer_ends_stream() {
        let (a, b) = memory_pair();
        let (_a_sink, mut a_stream) = Box::new(a).split();
        drop(b);
        assert!(a_stream.next().await.is_none());
    }
}
