//! Hub core: shared state, WebSocket handler, ticket groups and method
//! dispatch.
//!
//! Clients speak the JSON hub protocol: after a handshake record in each
//! direction, they invoke hub methods (`EntrarNoTicket`, `EnviarMensagem`,
//! ...) and receive broadcasts for the tickets they joined. A connection
//! joins the group of a ticket explicitly; broadcasts go to every member of
//! the group, the sender included.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};

use ticketchat_proto::api::{ChatClosed, methods, roles};
use ticketchat_proto::hub::{self, HandshakeRequest, HandshakeResponse, HubMessage};

use crate::store::{StoredMessage, TicketStore};

/// Default maximum upload size in bytes (10 MiB).
pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Path of the hub WebSocket endpoint.
pub const HUB_PATH: &str = "/chatHub";

/// Status given to a ticket once the customer confirmed closing it.
pub const FINALIZED_STATUS: &str = "Finalizado";

const CLOSURE_PROPOSED_NOTICE: &str = "O técnico encerrou o chat. Confirme o encerramento do chamado.";
const CLOSURE_DECLINED_NOTICE: &str = "O cliente optou por manter o chamado aberto.";
const SYSTEM_AUTHOR: &str = "Sistema";

/// Name of the broadcast group of a ticket.
#[must_use]
pub fn group_name(ticket_id: i64) -> String {
    format!("ticket_{ticket_id}")
}

/// Shared hub state: live connections, ticket groups and the ticket store.
pub struct HubState {
    connections: RwLock<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    groups: RwLock<HashMap<String, HashSet<u64>>>,
    next_connection: AtomicU64,
    /// Ticket logs and uploads.
    pub store: TicketStore,
    max_upload_size: usize,
    public_base_url: RwLock<Option<String>>,
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    /// Creates a hub with default limits. The public URL is derived from
    /// the bound address when the server starts.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_UPLOAD_SIZE, None)
    }

    /// Creates a hub with a custom upload limit and public base URL.
    #[must_use]
    pub fn with_config(max_upload_size: usize, public_base_url: Option<String>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            store: TicketStore::new(),
            max_upload_size,
            public_base_url: RwLock::new(
                public_base_url.map(|url| url.trim_end_matches('/').to_string()),
            ),
        }
    }

    /// Maximum accepted upload size in bytes.
    #[must_use]
    pub const fn max_upload_size(&self) -> usize {
        self.max_upload_size
    }

    /// Base URL under which uploads are published, without trailing slash.
    pub async fn public_base_url(&self) -> String {
        self.public_base_url.read().await.clone().unwrap_or_default()
    }

    /// Fill in the public URL from the bound address unless configured.
    async fn bind_public_url(&self, addr: std::net::SocketAddr) {
        let mut url = self.public_base_url.write().await;
        if url.is_none() {
            *url = Some(format!("http://{addr}"));
        }
    }

    async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(id, sender);
        id
    }

    async fn unregister(&self, connection: u64) {
        self.connections.write().await.remove(&connection);
        let mut groups = self.groups.write().await;
        for members in groups.values_mut() {
            members.remove(&connection);
        }
        groups.retain(|_, members| !members.is_empty());
    }

    /// Add a connection to the group of `ticket_id`.
    pub async fn join(&self, connection: u64, ticket_id: i64) {
        self.groups
            .write()
            .await
            .entry(group_name(ticket_id))
            .or_default()
            .insert(connection);
        tracing::info!(connection, ticket_id, "connection joined ticket");
    }

    /// Number of connections in the group of `ticket_id`.
    pub async fn group_size(&self, ticket_id: i64) -> usize {
        self.groups
            .read()
            .await
            .get(&group_name(ticket_id))
            .map_or(0, HashSet::len)
    }

    /// Invoke `target` on every member of the ticket's group.
    pub async fn broadcast(&self, ticket_id: i64, target: &str, arguments: Vec<Value>) {
        let frame = match hub::encode(&HubMessage::invocation(target, arguments)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(target, error = %e, "failed to encode broadcast");
                return;
            }
        };
        let members: Vec<u64> = self
            .groups
            .read()
            .await
            .get(&group_name(ticket_id))
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        let connections = self.connections.read().await;
        for member in members {
            if let Some(sender) = connections.get(&member) {
                let _ = sender.send(Message::Text(frame.clone().into()));
            }
        }
        tracing::debug!(ticket_id, target, "broadcast sent");
    }

    /// Append a message to the ticket and broadcast it. Blank content is
    /// ignored and returns `false`.
    pub async fn post_message(&self, ticket_id: i64, author: &str, content: &str, role: &str) -> bool {
        if content.trim().is_empty() {
            tracing::debug!(ticket_id, author, "ignoring blank message");
            return false;
        }
        let message = StoredMessage {
            author: author.to_string(),
            content: content.to_string(),
            role: role.to_string(),
            sent_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        let payload = json!({
            "autor": message.author,
            "mensagem": message.content,
            "papel": message.role,
            "data": message.sent_at,
        });
        self.store.append(ticket_id, message).await;
        self.broadcast(ticket_id, methods::RECEIVE_MESSAGE, vec![payload])
            .await;
        true
    }

    /// The technician proposes closing the ticket.
    pub async fn notify_closure(&self, ticket_id: i64) {
        tracing::info!(ticket_id, "closure proposed");
        self.post_message(ticket_id, SYSTEM_AUTHOR, CLOSURE_PROPOSED_NOTICE, roles::SYSTEM)
            .await;
        self.broadcast(ticket_id, methods::CLOSURE_PROPOSED, vec![Value::from(ticket_id)])
            .await;
    }

    /// The customer confirmed closing the ticket.
    pub async fn confirm_closure(&self, ticket_id: i64) {
        if !self.store.finalize(ticket_id).await {
            tracing::debug!(ticket_id, "ticket already finalized");
        }
        tracing::info!(ticket_id, "ticket finalized");
        let closed = ChatClosed {
            ticket_id,
            status: FINALIZED_STATUS.to_string(),
        };
        match serde_json::to_value(closed) {
            Ok(payload) => {
                self.broadcast(ticket_id, methods::CHAT_CLOSED, vec![payload])
                    .await;
            }
            Err(e) => tracing::error!(ticket_id, error = %e, "failed to encode closure"),
        }
    }

    /// The customer kept the ticket open.
    pub async fn decline_closure(&self, ticket_id: i64) {
        tracing::info!(ticket_id, "closure declined");
        self.post_message(ticket_id, SYSTEM_AUTHOR, CLOSURE_DECLINED_NOTICE, roles::SYSTEM)
            .await;
    }

    /// Send a Close frame to all connected clients.
    pub async fn close_all_connections(&self) {
        let Ok(frame) = hub::encode(&HubMessage::Close { error: None }) else {
            return;
        };
        let connections = self.connections.read().await;
        for (connection, sender) in connections.iter() {
            tracing::info!(connection, "closing hub connection");
            let _ = sender.send(Message::Text(frame.clone().into()));
            let _ = sender.send(Message::Close(None));
        }
    }

    /// Run one hub method on behalf of `connection`.
    async fn dispatch(&self, connection: u64, target: &str, arguments: &[Value]) -> Result<(), String> {
        match target {
            methods::JOIN_TICKET => {
                self.join(connection, ticket_arg(arguments)?).await;
            }
            methods::SEND_MESSAGE => {
                let ticket_id = ticket_arg(arguments)?;
                let author = string_arg(arguments, 1)?;
                let content = string_arg(arguments, 2)?;
                let role = string_arg(arguments, 3).unwrap_or(roles::CLIENT);
                self.post_message(ticket_id, author, content, role).await;
            }
            methods::NOTIFY_CLOSURE => self.notify_closure(ticket_arg(arguments)?).await,
            methods::CONFIRM_CLOSURE => self.confirm_closure(ticket_arg(arguments)?).await,
            methods::DECLINE_CLOSURE => self.decline_closure(ticket_arg(arguments)?).await,
            other => return Err(format!("Unknown hub method '{other}'")),
        }
        Ok(())
    }
}

/// First argument as a ticket id. Accepts numbers and numeric strings.
fn ticket_arg(arguments: &[Value]) -> Result<i64, String> {
    let ticket_id = match arguments.first() {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    ticket_id.ok_or_else(|| "ticket id argument missing or invalid".to_string())
}

fn string_arg(arguments: &[Value], index: usize) -> Result<&str, String> {
    arguments
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("argument {index} must be a string"))
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Wait for the handshake request and answer it.
/// 2. Register the connection.
/// 3. Run invocations until the client closes.
/// 4. On disconnect, remove the connection from every group.
pub async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(first_frame) = wait_for_handshake(&mut ws_receiver).await else {
        tracing::warn!("connection closed before handshake");
        return;
    };

    let rejection = match hub::decode_record::<HandshakeRequest>(&first_frame) {
        Ok(request) if request.protocol == "json" => None,
        Ok(request) => Some(format!(
            "The protocol '{}' is not supported.",
            request.protocol
        )),
        Err(e) => Some(format!("invalid handshake: {e}")),
    };
    let response = HandshakeResponse {
        error: rejection.clone(),
    };
    let Ok(record) = hub::encode_record(&response) else {
        return;
    };
    if ws_sender.send(Message::Text(record.into())).await.is_err() {
        return;
    }
    if let Some(reason) = rejection {
        tracing::warn!(%reason, "handshake rejected");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.register(tx.clone()).await;
    tracing::info!(connection, "hub connection established");

    if let Some(rest) = hub::trailing_records(&first_frame) {
        handle_frame(connection, rest, &state, &tx).await;
    }

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if !handle_frame(connection, text.as_str(), &reader_state, &tx).await {
                        break;
                    }
                }
                Message::Close(_) => {
                    tracing::info!(connection, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(connection).await;
    tracing::info!(connection, "hub connection closed");
}

async fn wait_for_handshake(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => return Some(text.as_str().to_string()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Process every record in a text frame. Returns `false` once the client
/// sent a Close record.
async fn handle_frame(
    connection: u64,
    frame: &str,
    state: &Arc<HubState>,
    tx: &mpsc::UnboundedSender<Message>,
) -> bool {
    for record in hub::decode(frame) {
        let msg = match record {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(connection, error = %e, "failed to decode hub record");
                continue;
            }
        };
        match msg {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let result = state.dispatch(connection, &target, &arguments).await;
                if let Err(reason) = &result {
                    tracing::warn!(connection, %target, %reason, "invocation failed");
                }
                if let Some(invocation_id) = invocation_id {
                    let completion = HubMessage::Completion {
                        invocation_id,
                        result: None,
                        error: result.err(),
                    };
                    if let Ok(frame) = hub::encode(&completion) {
                        let _ = tx.send(Message::Text(frame.into()));
                    }
                }
            }
            HubMessage::Ping => {}
            HubMessage::Close { error } => {
                tracing::info!(connection, ?error, "client closed hub connection");
                return false;
            }
            other => tracing::debug!(connection, msg = ?other, "ignoring hub record"),
        }
    }
    true
}

/// Starts the hub server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(HubState::new())).await
}

/// Starts the hub server with a pre-configured [`HubState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<HubState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    state.bind_public_url(bound_addr).await;

    let body_limit = state.max_upload_size().saturating_add(64 * 1024);
    let app = axum::Router::new()
        .route(HUB_PATH, axum::routing::get(ws_handler))
        .merge(crate::api::routes())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .with_state(state);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "hub server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a hub connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<HubState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
