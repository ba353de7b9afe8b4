//! Engine-level error surface.

use wirecall_protocol::WireError;

/// Errors surfaced by the public connection API.
///
/// Calls settle with exactly one of these when they do not resolve; the
/// engine clones the same error into every pending call on a bulk rejection
/// (disconnect, forced close).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The call's deadline elapsed before a RESULT or ERROR arrived.
    #[error("call timed out")]
    TimedOut,

    /// The caller's cancellation token fired before settlement.
    #[error("call aborted")]
    Aborted,

    /// The transport dropped while the operation was in flight.
    #[error("disconnected: {code} {reason}")]
    Disconnected { code: u16, reason: String },

    /// The connection is closed; nothing can be sent.
    #[error("connection is not open")]
    NotOpen,

    /// The connection is shutting down; new calls are rejected.
    #[error("connection is closing")]
    Closing,

    /// Strict-mode validation rejected a payload locally, before any frame
    /// was sent.
    #[error("validation failed: {0}")]
    Validation(WireError),

    /// The remote peer answered with an ERROR frame.  Framework-level
    /// violations we commit against the peer come back this way too,
    /// carrying the `RpcFrameworkError` code.
    #[error("remote error: {0}")]
    Remote(WireError),

    /// The connection handshake failed.
    #[error("handshake failed: {message}")]
    Handshake { message: String, retryable: bool },

    /// Reconnection gave up after the configured number of attempts.
    #[error("reconnect attempts exhausted after {0}")]
    ReconnectExhausted(u32),

    /// Invalid configuration detected at build time.
    #[error("config: {0}")]
    Config(String),

    /// A transport-level send failure.
    #[error("transport: {0}")]
    Transport(String),
}
