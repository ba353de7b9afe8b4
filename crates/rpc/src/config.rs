//! Connection configuration: explicit structs with documented defaults and
//! a fluent builder for the client role.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::RpcError;
use crate::reconnect::ReconnectBackoff;
use crate::validator::SchemaValidator;

/// Which negotiated sub-protocols get schema validation.
#[derive(Clone, Default, Debug)]
pub enum StrictMode {
    /// No validation anywhere.
    #[default]
    Off,
    /// Validate every sub-protocol; each one needs a registered validator.
    All,
    /// Validate only the listed sub-protocols.
    Protocols(Vec<String>),
}

impl StrictMode {
    pub(crate) fn applies_to(&self, subprotocol: Option<&str>) -> bool {
        match self {
            StrictMode::Off => false,
            StrictMode::All => subprotocol.is_some(),
            StrictMode::Protocols(list) => {
                subprotocol.is_some_and(|p| list.iter().any(|s| s == p))
            }
        }
    }
}

/// Engine knobs shared by both roles.
#[derive(Clone)]
pub struct EngineConfig {
    /// Identity of this peer.  Required, non-empty.
    pub identity: String,
    /// Default deadline for outbound calls.  Zero disables timeouts.
    pub call_timeout: Duration,
    /// Keepalive ping interval.  Zero disables the monitor.
    pub ping_interval: Duration,
    /// Reset the keepalive timer on any observed ping/pong traffic.
    pub defer_pings_on_activity: bool,
    /// Maximum concurrent outbound calls in flight.
    pub call_concurrency: usize,
    /// Consecutive undecodable/unroutable inbound messages tolerated before
    /// the connection is force-closed with a protocol error.  Zero means
    /// unbounded.
    pub max_bad_messages: usize,
    /// Which sub-protocols get schema validation.
    pub strict_mode: StrictMode,
    /// Validators keyed by sub-protocol name.  Immutable once the
    /// connection is configured.
    pub validators: HashMap<String, Arc<dyn SchemaValidator>>,
    /// Echo internal error details to the remote peer.
    pub detailed_errors: bool,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("identity", &self.identity)
            .field("call_timeout", &self.call_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("defer_pings_on_activity", &self.defer_pings_on_activity)
            .field("call_concurrency", &self.call_concurrency)
            .field("max_bad_messages", &self.max_bad_messages)
            .field("strict_mode", &self.strict_mode)
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .field("detailed_errors", &self.detailed_errors)
            .finish()
    }
}

impl EngineConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            call_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            defer_pings_on_activity: false,
            call_concurrency: 1,
            max_bad_messages: 0,
            strict_mode: StrictMode::Off,
            validators: HashMap::new(),
            detailed_errors: false,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), RpcError> {
        if self.identity.is_empty() {
            return Err(RpcError::Config("identity is required".into()));
        }
        if self.call_concurrency == 0 {
            return Err(RpcError::Config("call_concurrency must be >= 1".into()));
        }
        if let StrictMode::Protocols(list) = &self.strict_mode {
            for protocol in list {
                if !self.validators.contains_key(protocol) {
                    return Err(RpcError::Config(format!(
                        "strict mode enabled for '{protocol}' but no validator is registered"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Full configuration for the client role.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub engine: EngineConfig,
    /// WebSocket endpoint; the identity is appended as the final path
    /// segment.
    pub endpoint: String,
    /// Sub-protocols offered during the handshake, in preference order.
    pub protocols: Vec<String>,
    /// Optional auth token appended to the dial URL query.
    pub token: Option<String>,
    /// Reconnect automatically when the connection drops without a local
    /// close.
    pub reconnect: bool,
    /// Give up after this many consecutive failed attempts.  Zero means
    /// unlimited.
    pub max_reconnects: u32,
    pub backoff: ReconnectBackoff,
    /// HTTP redirects followed during the handshake before giving up.
    pub max_redirects: u32,
}

/// Fluent builder for [`ClientConfig`].
///
/// # Example
///
/// ```rust,no_run
/// # use wirecall_rpc::ClientBuilder;
/// let config = ClientBuilder::new("CP001", "ws://localhost:9000/ws")
///     .protocols(["ocpp1.6"])
///     .call_timeout(std::time::Duration::from_secs(30))
///     .ping_interval(std::time::Duration::from_secs(15))
///     .build()
///     .unwrap();
/// ```
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new(identity: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                engine: EngineConfig::new(identity),
                endpoint: endpoint.into(),
                protocols: Vec::new(),
                token: None,
                reconnect: true,
                max_reconnects: 0,
                backoff: ReconnectBackoff::default(),
                max_redirects: 2,
            },
        }
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// Sub-protocols to offer, in preference order.
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Auth token carried in the dial URL query.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Redirects followed during the handshake (default 2).
    pub fn max_redirects(mut self, n: u32) -> Self {
        self.config.max_redirects = n;
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Default outbound call deadline (default 60 s; zero disables).
    pub fn call_timeout(mut self, d: Duration) -> Self {
        self.config.engine.call_timeout = d;
        self
    }

    /// Keepalive interval (default 30 s; zero disables).
    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.config.engine.ping_interval = d;
        self
    }

    /// Reset the keepalive timer on observed ping/pong traffic.
    pub fn defer_pings_on_activity(mut self, defer: bool) -> Self {
        self.config.engine.defer_pings_on_activity = defer;
        self
    }

    /// Maximum concurrent outbound calls (default 1).
    pub fn call_concurrency(mut self, n: usize) -> Self {
        self.config.engine.call_concurrency = n;
        self
    }

    /// Bad-message budget before a forced protocol-error close (default
    /// unbounded).
    pub fn max_bad_messages(mut self, n: usize) -> Self {
        self.config.engine.max_bad_messages = n;
        self
    }

    /// Echo internal error details to the peer (default off).
    pub fn detailed_errors(mut self, enabled: bool) -> Self {
        self.config.engine.detailed_errors = enabled;
        self
    }

    // ── Strict mode ──────────────────────────────────────────────────

    pub fn strict_mode(mut self, mode: StrictMode) -> Self {
        self.config.engine.strict_mode = mode;
        self
    }

    /// Register the schema validator for a sub-protocol.
    pub fn validator(
        mut self,
        subprotocol: impl Into<String>,
        validator: Arc<dyn SchemaValidator>,
    ) -> Self {
        self.config
            .engine
            .validators
            .insert(subprotocol.into(), validator);
        self
    }

    // ── Reconnection ─────────────────────────────────────────────────

    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect = enabled;
        self
    }

    /// Consecutive failed attempts before giving up (default unlimited).
    pub fn max_reconnects(mut self, n: u32) -> Self {
        self.config.max_reconnects = n;
        self
    }

    pub fn backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn build(self) -> Result<ClientConfig, RpcError> {
        self.config.engine.validate()?;
        if self.config.endpoint.is_empty() {
            return Err(RpcError::Config("endpoint is required".into()));
        }
        if !self.config.endpoint.starts_with("ws://")
            && !self.config.endpoint.starts_with("wss://")
        {
            return Err(RpcError::Config(
                "endpoint must be a ws:// or wss:// URL".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Options for attaching the server role to an already-accepted transport.
///
/// The engine performs no handshake in this role: the acceptor supplies the
/// negotiated sub-protocol and an opaque session value.
pub struct AttachOptions {
    pub engine: EngineConfig,
    /// Sub-protocol negotiated during the accept handshake.
    pub subprotocol: Option<String>,
    /// Opaque per-session value chosen by the acceptor (auth outcome,
    /// routing info, ...).
    pub session: Value,
}

impl AttachOptions {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            engine: EngineConfig::new(identity),
            subprotocol: None,
            session: Value::Null,
        }
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = Some(subprotocol.into());
        self
    }

    pub fn session(mut self, session: Value) -> Self {
        self.session = session;
        self
    }
}

/// Per-call overrides for [`Connection::call_with`].
///
/// [`Connection::call_with`]: crate::Connection::call_with
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Skip registering a pending call and return immediately after
    /// transmission (fire-and-forget).
    pub no_reply: bool,
    /// Override the connection's default deadline.  `Some(Duration::ZERO)`
    /// disables the timeout entirely.
    pub call_timeout: Option<Duration>,
    /// Cancels the call without waiting for a reply.
    pub cancel: Option<tokio_util::sync::CancellationToken>,
}

/// Options for [`Connection::close`].
///
/// [`Connection::close`]: crate::Connection::close
#[derive(Clone)]
pub struct CloseOptions {
    /// Close code sent in the close handshake.
    pub code: u16,
    pub reason: String,
    /// Wait for every pending call and response to settle before closing
    /// the transport.  Without it, pending calls are rejected immediately.
    pub await_pending: bool,
    /// Terminate the transport at once: no drain, no close handshake.
    pub force: bool,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            code: crate::events::close_code::NORMAL,
            reason: String::new(),
            await_pending: false,
            force: false,
        }
    }
}
