//! SignalR JSON hub client over WebSocket.
//!
//! [`WsConnector`] opens the WebSocket, performs the `{"protocol":"json"}`
//! handshake and spawns two background tasks: a reader that dispatches
//! inbound invocations to the [`HandlerRegistry`] and resolves completions,
//! and a keep-alive task that pings the hub periodically.
//!
//! Every outbound invocation carries an `invocationId` so that
//! [`HubTransport::invoke`] can wait for the hub's completion and surface
//! server-side failures to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use ticketchat_proto::hub::{self, HandshakeRequest, HandshakeResponse, HubMessage};

use super::{ConnectionError, HandlerRegistry, HubConnector, HubTransport};

type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Outcome reported by the hub for one invocation.
type Completion = Result<(), String>;

/// Invocations waiting for their completion record, keyed by invocation ID.
type PendingInvocations = Arc<parking_lot::Mutex<HashMap<String, oneshot::Sender<Completion>>>>;

/// Timeouts used by [`WsConnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubOptions {
    /// Time allowed for the WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Time allowed for the hub's handshake response.
    pub handshake_timeout: Duration,
    /// Time allowed for an invocation's completion.
    pub invoke_timeout: Duration,
    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            invoke_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

/// Connector producing [`WsHubTransport`] connections to one hub endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    options: HubOptions,
}

impl WsConnector {
    /// Create a connector for `hub_url`.
    ///
    /// `http://` and `https://` URLs are rewritten to `ws://` and `wss://`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Unreachable`] if the URL does not parse or
    /// uses an unsupported scheme.
    pub fn new(hub_url: &str, options: HubOptions) -> Result<Self, ConnectionError> {
        Ok(Self {
            url: websocket_url(hub_url)?,
            options,
        })
    }

    /// The WebSocket URL this connector dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl HubConnector for WsConnector {
    type Transport = WsHubTransport;

    async fn connect(&self, handlers: HandlerRegistry) -> Result<WsHubTransport, ConnectionError> {
        WsHubTransport::connect(&self.url, self.options, handlers).await
    }
}

/// A live hub connection.
pub struct WsHubTransport {
    url: String,
    ws_sender: Arc<Mutex<WsSender>>,
    pending: PendingInvocations,
    next_invocation_id: AtomicU64,
    connected: Arc<AtomicBool>,
    invoke_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
    keepalive_handle: tokio::task::JoinHandle<()>,
}

impl WsHubTransport {
    /// Open a WebSocket to `url`, run the hub handshake and start the
    /// background reader and keep-alive tasks.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Timeout`] if the upgrade or handshake times out.
    /// - [`ConnectionError::Unreachable`] if the endpoint refuses the connection.
    /// - [`ConnectionError::Handshake`] if the hub rejects the protocol.
    /// - [`ConnectionError::ConnectionClosed`] if the socket closes mid-handshake.
    pub async fn connect(
        url: &str,
        options: HubOptions,
        handlers: HandlerRegistry,
    ) -> Result<Self, ConnectionError> {
        let (ws_stream, _response) = tokio::time::timeout(options.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "hub WebSocket connect timed out");
                ConnectionError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "hub WebSocket connect failed");
                map_ws_connect_error(url, e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let handshake = hub::encode_record(&HandshakeRequest::default())?;
        ws_sender.send(Message::text(handshake)).await.map_err(|e| {
            tracing::warn!(err = %e, "failed to send hub handshake");
            ConnectionError::ConnectionClosed
        })?;

        let pending: PendingInvocations = Arc::default();
        let reply = tokio::time::timeout(options.handshake_timeout, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url, "hub handshake response timed out");
                ConnectionError::Timeout
            })?;

        match reply {
            Some(Ok(Message::Text(text))) => {
                let response: HandshakeResponse = hub::decode_record(text.as_str())?;
                if let Some(error) = response.error {
                    tracing::warn!(url, error = %error, "hub rejected handshake");
                    return Err(ConnectionError::Handshake(error));
                }
                if let Some(rest) = hub::trailing_records(text.as_str()) {
                    dispatch_frame(rest, &handlers, &pending);
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::warn!(url, "hub closed connection during handshake");
                return Err(ConnectionError::ConnectionClosed);
            }
            Some(Ok(other)) => {
                tracing::warn!(?other, "unexpected frame during hub handshake");
                return Err(ConnectionError::Handshake(
                    "unexpected non-text handshake response".to_string(),
                ));
            }
            Some(Err(e)) => {
                tracing::warn!(err = %e, "WebSocket error during hub handshake");
                return Err(ConnectionError::Io(std::io::Error::other(e)));
            }
        }
        tracing::info!(url, "hub handshake complete");

        let connected = Arc::new(AtomicBool::new(true));
        let ws_sender = Arc::new(Mutex::new(ws_sender));

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            handlers,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));
        let keepalive_handle = tokio::spawn(keepalive_loop(
            Arc::clone(&ws_sender),
            Arc::clone(&connected),
            options.keepalive_interval,
        ));

        Ok(Self {
            url: url.to_string(),
            ws_sender,
            pending,
            next_invocation_id: AtomicU64::new(0),
            connected,
            invoke_timeout: options.invoke_timeout,
            reader_handle,
            keepalive_handle,
        })
    }

    /// The hub URL this transport is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn fail_pending(&self) {
        self.pending.lock().clear();
    }
}

impl HubTransport for WsHubTransport {
    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<(), ConnectionError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(ConnectionError::NotConnected);
        }

        let id = self
            .next_invocation_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let frame = hub::encode(&HubMessage::Invocation {
            invocation_id: Some(id.clone()),
            target: target.to_string(),
            arguments,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let sent = self.ws_sender.lock().await.send(Message::text(frame)).await;
        if let Err(e) = sent {
            tracing::warn!(target, err = %e, "hub send failed");
            self.pending.lock().remove(&id);
            self.connected.store(false, Ordering::Relaxed);
            return Err(ConnectionError::ConnectionClosed);
        }
        tracing::debug!(target, invocation_id = %id, "invocation sent");

        match tokio::time::timeout(self.invoke_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => {
                tracing::warn!(target, reason = %reason, "hub reported invocation error");
                Err(ConnectionError::Invoke {
                    target: target.to_string(),
                    reason,
                })
            }
            Ok(Err(_)) => Err(ConnectionError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                tracing::warn!(target, invocation_id = %id, "invocation timed out");
                Err(ConnectionError::Timeout)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn stop(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.keepalive_handle.abort();
        {
            let mut sender = self.ws_sender.lock().await;
            if let Err(e) = sender.send(Message::Close(None)).await {
                tracing::debug!(err = %e, "close frame not sent");
            }
            let _ = sender.close().await;
        }
        self.fail_pending();
        tracing::info!(url = %self.url, "hub connection stopped");
    }
}

impl Drop for WsHubTransport {
    fn drop(&mut self) {
        self.keepalive_handle.abort();
        self.reader_handle.abort();
    }
}

/// Whether the reader should keep going after a frame.
#[derive(Debug, PartialEq, Eq)]
enum FrameOutcome {
    Continue,
    Closed,
}

/// Dispatch every record of one text frame.
///
/// Handlers run inline, so events reach them strictly in arrival order.
/// Malformed records are logged and skipped.
fn dispatch_frame(
    frame: &str,
    handlers: &HandlerRegistry,
    pending: &PendingInvocations,
) -> FrameOutcome {
    for record in hub::decode(frame) {
        match record {
            Ok(HubMessage::Invocation {
                target, arguments, ..
            }) => {
                handlers.dispatch(&target, &arguments);
            }
            Ok(HubMessage::Completion {
                invocation_id,
                error,
                ..
            }) => {
                let waiter = pending.lock().remove(&invocation_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(error.map_or(Ok(()), Err));
                    }
                    None => {
                        tracing::debug!(invocation_id = %invocation_id, "completion for unknown invocation");
                    }
                }
            }
            Ok(HubMessage::Ping) => {}
            Ok(HubMessage::Close { error }) => {
                match error {
                    Some(error) => tracing::warn!(error = %error, "hub closed the connection"),
                    None => tracing::info!("hub closed the connection"),
                }
                return FrameOutcome::Closed;
            }
            Ok(HubMessage::Unsupported(kind)) => {
                tracing::debug!(kind, "ignoring unsupported hub frame");
            }
            Err(e) => {
                tracing::warn!(err = %e, "malformed hub record, skipping");
            }
        }
    }
    FrameOutcome::Continue
}

async fn reader_loop(
    mut ws_reader: WsReader,
    handlers: HandlerRegistry,
    pending: PendingInvocations,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if dispatch_frame(text.as_str(), &handlers, &pending) == FrameOutcome::Closed {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("hub WebSocket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "hub WebSocket read error");
                break;
            }
        }
    }
    let dropped = connected.swap(false, Ordering::Relaxed);
    pending.lock().clear();
    tracing::info!("hub reader task exiting");
    if dropped {
        handlers.notify_closed();
    }
}

async fn keepalive_loop(sender: Arc<Mutex<WsSender>>, connected: Arc<AtomicBool>, every: Duration) {
    let Ok(ping) = hub::encode(&HubMessage::Ping) else {
        return;
    };
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        if !connected.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = sender.lock().await.send(Message::text(ping.clone())).await {
            tracing::warn!(err = %e, "hub keep-alive failed");
            connected.store(false, Ordering::Relaxed);
            break;
        }
    }
}

fn websocket_url(hub_url: &str) -> Result<String, ConnectionError> {
    let mut url = url::Url::parse(hub_url)
        .map_err(|e| ConnectionError::Unreachable(format!("{hub_url}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectionError::Unreachable(format!(
                "{hub_url}: unsupported scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ConnectionError::Unreachable(hub_url.to_string()))?;
    Ok(url.to_string())
}

fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> ConnectionError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) =>
        {
            ConnectionError::Unreachable(url.to_string())
        }
        WsError::Io(io_err) => ConnectionError::Io(io_err),
        WsError::Http(response) => ConnectionError::Unreachable(format!(
            "{url}: HTTP status {}",
            response.status()
        )),
        other => ConnectionError::Io(std::io::Error::other(format!(
            "hub connection error: {other}"
        ))),
    }
}
