//! Typed lifecycle and observability events.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// WebSocket-style close codes used by the engine itself.
pub mod close_code {
    /// Clean shutdown requested by either peer.
    pub const NORMAL: u16 = 1000;
    /// Protocol violation (bad-message budget exceeded).
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close handshake.
    pub const ABNORMAL: u16 = 1006;
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// The terminal close result of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

/// Which way a frame crossed the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

/// Events broadcast to subscribers of [`Connection::subscribe`].
///
/// Delivery uses a `tokio::sync::broadcast` channel: slow subscribers may
/// observe lag, but the engine never blocks on them.
///
/// [`Connection::subscribe`]: crate::Connection::subscribe
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// A connection attempt is starting (client role).
    Connecting { attempt: u32 },
    /// The transport is open and the sub-protocol is fixed.
    Open { subprotocol: Option<String> },
    /// A close was requested locally; new calls are rejected.
    Closing,
    /// The transport dropped.  Followed by `Close` unless a reconnect is
    /// scheduled.
    Disconnect { code: u16, reason: String },
    /// The connection reached its terminal state.
    Close(CloseEvent),
    /// A raw text frame crossed the connection, in either direction.
    Message {
        direction: MessageDirection,
        payload: String,
    },
    /// An inbound message failed decoding or referenced an unknown
    /// correlation id.
    BadMessage { description: String },
    /// A keepalive pong arrived; round-trip time from ping transmission.
    PingRtt { rtt: Duration },
    /// A transport-level failure.
    SocketError { message: String },
}
