//! Client role: dials the endpoint and supervises the connection, retrying
//! dropped links with jittered exponential back-off.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::MaybeTlsStream;

use crate::config::{CallOptions, ClientConfig, CloseOptions};
use crate::connection::Connection;
use crate::error::RpcError;
use crate::events::{close_code, CloseEvent, ConnectionState, RpcEvent};
use crate::session::Shared;
use crate::transport::WsTransport;

/// The initiating peer of a connection.
///
/// Owns a [`Connection`] plus the dial/reconnect machinery.  `connect()`
/// drives the connection to `Open`; afterwards the client keeps it alive
/// according to the reconnect policy until `close()` is called or the
/// policy gives up.
pub struct Client {
    connection: Connection,
    config: Arc<ClientConfig>,
    connect_error: Arc<Mutex<Option<RpcError>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Client, RpcError> {
        config.engine.validate()?;
        let shared = Shared::new(
            config.engine.clone(),
            ConnectionState::Closed,
            None,
            Value::Null,
        );
        Ok(Client {
            connection: Connection { shared },
            config: Arc::new(config),
            connect_error: Arc::new(Mutex::new(None)),
        })
    }

    /// The underlying connection handle (clonable, shareable with tasks).
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Drive the connection to `Open`.
    ///
    /// No-op while already open; joins the in-flight attempt while
    /// connecting; fails while closing.  A closed connection starts a fresh
    /// lifecycle.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let shared = &self.connection.shared;
        // Subscribe before inspecting state so no transition is missed.
        let mut events = shared.subscribe();

        match shared.state() {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Closing => return Err(RpcError::Closing),
            ConnectionState::Connecting => {}
            ConnectionState::Closed => {
                // Only one concurrent connect() starts the supervisor; the
                // rest join the in-flight attempt below.
                if shared.try_begin_connect() {
                    shared.reset_for_connect();
                    shared.mark_connecting(0);
                    let supervisor_shared = shared.clone();
                    let config = self.config.clone();
                    let connect_error = self.connect_error.clone();
                    tokio::spawn(async move {
                        supervise(supervisor_shared, config, connect_error).await;
                    });
                }
            }
        }

        loop {
            match events.recv().await {
                Ok(RpcEvent::Open { .. }) => return Ok(()),
                Ok(RpcEvent::Close(close)) => {
                    let stored = self.connect_error.lock().take();
                    return Err(stored.unwrap_or(RpcError::Disconnected {
                        code: close.code,
                        reason: close.reason,
                    }));
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Catch up against the current state instead.
                    match shared.state() {
                        ConnectionState::Open => return Ok(()),
                        ConnectionState::Closed => return Err(RpcError::NotOpen),
                        _ => {}
                    }
                }
                Err(_) => return Err(RpcError::NotOpen),
            }
        }
    }

    // ── Convenience forwards ─────────────────────────────────────────

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.connection.call(method, params).await
    }

    pub async fn call_with(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        self.connection.call_with(method, params, options).await
    }

    pub async fn close(&self, options: CloseOptions) -> CloseEvent {
        self.connection.close(options).await
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RpcEvent> {
        self.connection.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One lifecycle: dial, run the link, and either reconnect or finalize.
async fn supervise(
    shared: Arc<Shared>,
    config: Arc<ClientConfig>,
    connect_error: Arc<Mutex<Option<RpcError>>>,
) {
    // Consecutive failed attempts since the last successful open.
    let mut attempt: u32 = 0;

    loop {
        let abort = shared.abort_token();
        let outcome = tokio::select! {
            result = dial(&config) => result,
            _ = abort.cancelled() => {
                let end = shared
                    .take_local_close()
                    .unwrap_or(CloseEvent {
                        code: close_code::ABNORMAL,
                        reason: "connection aborted".into(),
                    });
                shared.finalize_closed(end);
                return;
            }
        };

        match outcome {
            Ok((transport, negotiated)) => {
                // The sub-protocol is fixed at the first successful open
                // and must survive reconnects unchanged.
                match shared.subprotocol() {
                    None => shared.set_subprotocol(negotiated.clone()),
                    Some(pinned) if negotiated.as_deref() == Some(pinned.as_str()) => {}
                    Some(pinned) => {
                        let message = format!(
                            "server switched sub-protocol from '{pinned}' to '{}'",
                            negotiated.as_deref().unwrap_or("-")
                        );
                        *connect_error.lock() = Some(RpcError::Handshake {
                            message: message.clone(),
                            retryable: false,
                        });
                        shared.finalize_closed(CloseEvent {
                            code: close_code::ABNORMAL,
                            reason: message,
                        });
                        return;
                    }
                }
                if shared.missing_strict_validator(shared.subprotocol().as_deref()) {
                    let message = format!(
                        "strict mode requires a validator for sub-protocol '{}'",
                        shared.subprotocol().as_deref().unwrap_or("-")
                    );
                    *connect_error.lock() = Some(RpcError::Config(message.clone()));
                    shared.finalize_closed(CloseEvent {
                        code: close_code::ABNORMAL,
                        reason: message,
                    });
                    return;
                }

                attempt = 0;
                let runtime = shared.open_link(Box::new(transport)).await;
                let end = shared.drive_link(runtime).await;

                if shared.close_requested() || !config.reconnect {
                    shared.finalize_closed(end);
                    return;
                }
                tracing::warn!(
                    identity = %config.engine.identity,
                    code = end.code,
                    "connection lost, scheduling reconnect"
                );
            }
            Err(RpcError::Handshake { message, retryable }) => {
                tracing::warn!(
                    identity = %config.engine.identity,
                    attempt,
                    error = %message,
                    retryable,
                    "connection attempt failed"
                );
                if shared.close_requested() || !retryable || !config.reconnect {
                    *connect_error.lock() = Some(RpcError::Handshake {
                        message: message.clone(),
                        retryable,
                    });
                    shared.finalize_closed(CloseEvent {
                        code: close_code::ABNORMAL,
                        reason: message,
                    });
                    return;
                }
            }
            Err(other) => {
                *connect_error.lock() = Some(other.clone());
                shared.finalize_closed(CloseEvent {
                    code: close_code::ABNORMAL,
                    reason: other.to_string(),
                });
                return;
            }
        }

        // Schedule the next attempt.
        attempt += 1;
        if config.max_reconnects > 0 && attempt > config.max_reconnects {
            let exhausted = attempt - 1;
            tracing::error!(
                identity = %config.engine.identity,
                attempts = exhausted,
                "max reconnect attempts exhausted"
            );
            *connect_error.lock() = Some(RpcError::ReconnectExhausted(exhausted));
            shared.finalize_closed(CloseEvent {
                code: close_code::ABNORMAL,
                reason: format!("reconnect attempts exhausted after {exhausted}"),
            });
            return;
        }

        // Back to Connecting right away: new outbound frames buffer for
        // the flush-on-open while the backoff delay runs.
        shared.mark_connecting(attempt);
        let delay = config.backoff.delay_for_attempt(attempt - 1);
        tracing::info!(
            identity = %config.engine.identity,
            delay_ms = delay.as_millis() as u64,
            attempt,
            "reconnecting"
        );
        let abort_token = shared.abort_token();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = abort_token.cancelled() => {
                let end = shared.take_local_close().unwrap_or(CloseEvent {
                    code: close_code::ABNORMAL,
                    reason: "connection aborted".into(),
                });
                shared.finalize_closed(end);
                return;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dialing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type DialedTransport = WsTransport<MaybeTlsStream<TcpStream>>;

/// Dial the endpoint, following redirects up to the configured budget, and
/// verify the negotiated sub-protocol against the offer.
async fn dial(config: &ClientConfig) -> Result<(DialedTransport, Option<String>), RpcError> {
    let mut target = build_url(config);
    let mut redirects: u32 = 0;

    loop {
        let mut request = target
            .clone()
            .into_client_request()
            .map_err(|e| RpcError::Handshake {
                message: format!("invalid endpoint url: {e}"),
                retryable: false,
            })?;
        if !config.protocols.is_empty() {
            let offer = HeaderValue::from_str(&config.protocols.join(", ")).map_err(|e| {
                RpcError::Handshake {
                    message: format!("invalid sub-protocol offer: {e}"),
                    retryable: false,
                }
            })?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", offer);
        }

        match tokio_tungstenite::connect_async(request).await {
            Ok((ws, response)) => {
                let negotiated = response
                    .headers()
                    .get("Sec-WebSocket-Protocol")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                verify_subprotocol(&config.protocols, negotiated.as_deref())?;
                return Ok((WsTransport::new(ws), negotiated));
            }
            Err(WsError::Http(response)) if response.status().is_redirection() => {
                redirects += 1;
                if redirects > config.max_redirects {
                    return Err(RpcError::Handshake {
                        message: format!("redirect limit exceeded ({})", config.max_redirects),
                        retryable: false,
                    });
                }
                let location = response
                    .headers()
                    .get("Location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| RpcError::Handshake {
                        message: "redirect response without Location header".into(),
                        retryable: false,
                    })?;
                target = normalize_redirect(location);
                tracing::debug!(target = %target, redirects, "following redirect");
            }
            Err(e) => return Err(classify_dial_error(e)),
        }
    }
}

fn build_url(config: &ClientConfig) -> String {
    let mut url = format!(
        "{}/{}",
        config.endpoint.trim_end_matches('/'),
        config.engine.identity
    );
    if let Some(token) = &config.token {
        let separator = if url.contains('?') { '&' } else { '?' };
        url.push(separator);
        url.push_str("token=");
        url.push_str(token);
    }
    url
}

/// The peer must pick exactly one of the offered sub-protocols; accepting
/// none (when we offered some) or inventing one is a non-retryable failure.
fn verify_subprotocol(offered: &[String], negotiated: Option<&str>) -> Result<(), RpcError> {
    let message = match negotiated {
        None if offered.is_empty() => return Ok(()),
        None => "server accepted none of the offered sub-protocols".to_string(),
        Some(p) if offered.iter().any(|o| o == p) => return Ok(()),
        Some(p) => format!("server negotiated unrequested sub-protocol '{p}'"),
    };
    Err(RpcError::Handshake {
        message,
        retryable: false,
    })
}

/// Redirect targets occasionally arrive with http(s) schemes.
fn normalize_redirect(location: &str) -> String {
    if let Some(rest) = location.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = location.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        location.to_string()
    }
}

/// Transient network failures retry; a malformed handshake from the server
/// (bad accept key) or a bad URL never will.
fn classify_dial_error(error: WsError) -> RpcError {
    let retryable = !matches!(
        &error,
        WsError::Protocol(ProtocolError::SecWebSocketAcceptKeyMismatch) | WsError::Url(_)
    );
    RpcError::Handshake {
        message: error.to_string(),
        retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientBuilder;

    fn config(identity: &str, endpoint: &str) -> ClientConfig {
        ClientBuilder::new(identity, endpoint).build().unwrap()
    }

    #[test]
    fn url_appends_identity() {
        let c = config("CP001", "ws://localhost:9000/ws");
        assert_eq!(build_url(&c), "ws://localhost:9000/ws/CP001");
    }

    #[test]
    fn url_trims_trailing_slash() {
        let c = config("CP001", "ws://localhost:9000/ws/");
        assert_eq!(build_url(&c), "ws://localhost:9000/ws/CP001");
    }

    #[test]
    fn url_carries_token() {
        let c = ClientBuilder::new("CP001", "ws://localhost:9000/ws")
            .token("secret")
            .build()
            .unwrap();
        assert_eq!(build_url(&c), "ws://localhost:9000/ws/CP001?token=secret");
    }

    #[test]
    fn subprotocol_verification() {
        let offered = vec!["ocpp1.6".to_string(), "ocpp2.0.1".to_string()];
        assert!(verify_subprotocol(&offered, Some("ocpp1.6")).is_ok());
        assert!(verify_subprotocol(&[], None).is_ok());

        let missing = verify_subprotocol(&offered, None).unwrap_err();
        assert!(matches!(
            missing,
            RpcError::Handshake { retryable: false, .. }
        ));
        let invented = verify_subprotocol(&offered, Some("made-up")).unwrap_err();
        assert!(matches!(
            invented,
            RpcError::Handshake { retryable: false, .. }
        ));
    }

    #[test]
    fn redirect_normalization() {
        assert_eq!(
            normalize_redirect("http://host/path"),
            "ws://host/path"
        );
        assert_eq!(
            normalize_redirect("https://host/path"),
            "wss://host/path"
        );
        assert_eq!(
            normalize_redirect("ws://host/path"),
            "ws://host/path"
        );
    }
}
