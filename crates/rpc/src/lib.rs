//! `wirecall-rpc` — a bidirectional RPC engine over persistent message
//! transports.
//!
//! Both peers of a connection can issue calls and answer them on the same
//! ordered message stream.  Frames are JSON arrays (see
//! [`wirecall-protocol`](wirecall_protocol)); the engine supplies
//! everything above the codec: the connection state machine, call
//! correlation with timeouts and cancellation, the concurrency-limited
//! outbound dispatcher, keepalive monitoring, and client-side reconnection
//! with jittered back-off.
//!
//! # Roles
//!
//! The same engine serves both ends:
//!
//! - **Client role** — [`Client`] dials an endpoint, offers sub-protocols,
//!   and keeps the connection alive through reconnects:
//!
//! ```rust,no_run
//! # use wirecall_rpc::{ClientBuilder, Client};
//! # async fn example() -> Result<(), wirecall_rpc::RpcError> {
//! let client = Client::new(
//!     ClientBuilder::new("CP001", "ws://gateway.example/ws")
//!         .protocols(["ocpp1.6"])
//!         .build()?,
//! )?;
//! client.connect().await?;
//! let result = client.call("Heartbeat", serde_json::json!({})).await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```
//!
//! - **Server role** — the acceptor runs its own upgrade handshake, then
//!   hands the accepted transport to [`Connection::attach`] together with
//!   the negotiated sub-protocol and an opaque session value.
//!
//! # Handlers
//!
//! Inbound calls dispatch to registered [`Handler`]s (named, with an
//! optional wildcard fallback).  The engine guarantees exactly one reply
//! frame per inbound call — handler errors and panics become ERROR frames,
//! and [`Outcome::NoReply`] suppresses the reply entirely.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handler;
pub mod reconnect;
pub mod transport;
pub mod validator;

mod keepalive;
mod pending;
mod queue;
mod session;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use client::Client;
pub use config::{
    AttachOptions, CallOptions, ClientBuilder, ClientConfig, CloseOptions, EngineConfig,
    StrictMode,
};
pub use connection::Connection;
pub use error::RpcError;
pub use events::{close_code, CloseEvent, ConnectionState, MessageDirection, RpcEvent};
pub use handler::{CallContext, Handler, HandlerError, HandlerResult, Outcome};
pub use reconnect::ReconnectBackoff;
pub use transport::{memory_pair, MemoryTransport, Transport, WireMessage, WsTransport};
pub use validator::{SchemaValidator, SchemaViolation};

// Re-export the protocol crate so integrators never need to depend on it
// directly.
pub use wirecall_protocol as protocol;
pub use wirecall_protocol::{ErrorCode, Frame, WireError};
