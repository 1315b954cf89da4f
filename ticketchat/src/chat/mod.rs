//! Live chat session for one support ticket.
//!
//! A [`ChatSession`] owns everything that changes while a ticket's chat is
//! open: the render list, the deduplication sets and the closure
//! negotiation. It runs as a single task. Network work (history fetch,
//! hub connect and invoke, uploads, inline media) runs in spawned tasks
//! that report back through the session's input channel, so all of that
//! state is only ever touched from the session task itself.
//!
//! The operator drives the session through a [`SessionHandle`]; the
//! session reports what to display as [`SessionEvent`]s.

pub mod attachment;
pub mod closure;
pub mod dedup;
pub mod history;
pub mod params;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ticketchat_proto::api::{LiveMessage, methods, roles};
use ticketchat_proto::message::{AttachmentReference, ChatMessage, MediaKind, Origin, RenderKey};

use crate::transport::{ConnectionError, ConnectionManager, ConnectionState, HubConnector};

use attachment::{AttachmentService, LocalFile, UploadError};
use closure::{ClosureNegotiation, ClosureOutcome, Countdown, TickOutcome};
use dedup::DedupEngine;
use history::{FetchError, HistorySource};
use params::SessionParams;

/// Commands rejected before reaching the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session was opened read-only.
    #[error("this chat is read-only")]
    ReadOnly,
    /// The message is empty after trimming.
    #[error("message is empty")]
    EmptyMessage,
    /// The session has already ended.
    #[error("chat session is closed")]
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The operator confirmed the technician's closure proposal.
    ConfirmedByUser,
    /// The closure countdown ran out.
    CountdownExpired,
    /// The operator left the chat.
    UserLeft,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfirmedByUser => write!(f, "ticket closed"),
            Self::CountdownExpired => write!(f, "ticket closed (no answer)"),
            Self::UserLeft => write!(f, "left the chat"),
        }
    }
}

/// Transient, non-fatal conditions worth telling the operator about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The history fetch failed; only new messages will show.
    HistoryUnavailable(String),
    /// The hub connection could not be established.
    ConnectionFailed(String),
    /// A send was attempted while not connected; nothing was sent.
    NotConnected,
    /// The hub did not accept a message.
    SendFailed(String),
    /// An attachment upload failed.
    UploadFailed(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HistoryUnavailable(reason) => write!(f, "could not load earlier messages: {reason}"),
            Self::ConnectionFailed(reason) => write!(f, "chat connection failed: {reason}"),
            Self::NotConnected => write!(f, "not connected, message not sent"),
            Self::SendFailed(reason) => write!(f, "message not sent: {reason}"),
            Self::UploadFailed(reason) => write!(f, "file not sent: {reason}"),
        }
    }
}

/// Events emitted by a [`ChatSession`] for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A message was appended to the render list.
    Rendered(ChatMessage),
    /// Bytes of an image attachment that was rendered earlier.
    InlineMedia {
        /// Render key of the message the image belongs to.
        render_key: RenderKey,
        /// Raw image bytes.
        bytes: Vec<u8>,
    },
    /// A transient notice.
    Notice(Notice),
    /// The push channel changed state.
    ConnectionChanged(ConnectionState),
    /// The technician proposed closing; a countdown started.
    ClosureProposed {
        /// Seconds until the closure confirms itself.
        remaining_secs: u32,
    },
    /// The closure countdown advanced.
    ClosureCountdown {
        /// Seconds left.
        remaining_secs: u32,
    },
    /// The operator kept the ticket open.
    ClosureDeclined,
    /// The session ended. No further events follow.
    Closed(CloseReason),
}

/// Tunables for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Role tag sent with every message.
    pub role_tag: String,
    /// Countdown length in ticks.
    pub countdown_ticks: u32,
    /// Duration of one countdown tick.
    pub tick_period: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role_tag: roles::CLIENT.to_string(),
            countdown_ticks: closure::DEFAULT_COUNTDOWN_TICKS,
            tick_period: Duration::from_secs(1),
            event_buffer: 256,
            command_buffer: 64,
        }
    }
}

/// What the session ended with.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Final render list in display order.
    pub messages: Vec<ChatMessage>,
    /// Outcome of the last closure negotiation, if one happened.
    pub closure: Option<ClosureOutcome>,
    /// Why the session ended.
    pub reason: CloseReason,
}

#[derive(Debug)]
enum SessionCommand {
    SendText(String),
    Attach(PathBuf),
    ConfirmClosure,
    DeclineClosure,
    Close,
}

enum SessionInput {
    History(Result<Vec<ChatMessage>, FetchError>),
    Connected(Result<(), ConnectionError>),
    ConnectionLost,
    Live(LiveMessage),
    ClosureProposed,
    CountdownTick(u64),
    Uploaded(Result<AttachmentReference, UploadError>),
    SendFailed(ConnectionError),
    InlineMedia(RenderKey, Vec<u8>),
}

/// Operator-side handle to a running session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    params: SessionParams,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// The session's entry parameters.
    #[must_use]
    pub const fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Send a text message. Rendered locally right away when connected.
    ///
    /// # Errors
    ///
    /// [`SessionError::ReadOnly`], [`SessionError::EmptyMessage`] or
    /// [`SessionError::Closed`].
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.ensure_writable()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        self.submit(SessionCommand::SendText(text.to_string())).await
    }

    /// Upload and announce the file at `path`.
    ///
    /// # Errors
    ///
    /// [`SessionError::ReadOnly`] or [`SessionError::Closed`].
    pub async fn attach(&self, path: impl Into<PathBuf>) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.submit(SessionCommand::Attach(path.into())).await
    }

    /// Confirm a pending closure proposal.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] if the session already ended.
    pub async fn confirm_closure(&self) -> Result<(), SessionError> {
        self.submit(SessionCommand::ConfirmClosure).await
    }

    /// Decline a pending closure proposal.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] if the session already ended.
    pub async fn decline_closure(&self) -> Result<(), SessionError> {
        self.submit(SessionCommand::DeclineClosure).await
    }

    /// Leave the chat.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] if the session already ended.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.submit(SessionCommand::Close).await
    }

    fn ensure_writable(&self) -> Result<(), SessionError> {
        if self.params.is_read_only() {
            return Err(SessionError::ReadOnly);
        }
        Ok(())
    }

    async fn submit(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// State owned by one running chat session.
pub struct ChatSession<C: HubConnector, H: HistorySource, A: AttachmentService> {
    params: SessionParams,
    config: SessionConfig,
    connection: Arc<ConnectionManager<C>>,
    history: Arc<H>,
    attachments: Arc<A>,
    dedup: DedupEngine,
    messages: Vec<ChatMessage>,
    negotiation: ClosureNegotiation,
    countdown: Countdown,
    inputs: mpsc::UnboundedSender<SessionInput>,
    events: mpsc::Sender<SessionEvent>,
    reported_state: ConnectionState,
    closed: Option<CloseReason>,
}

impl<C, H, A> ChatSession<C, H, A>
where
    C: HubConnector,
    H: HistorySource,
    A: AttachmentService,
{
    /// Start a session task.
    ///
    /// History fetch and hub connect begin immediately and concurrently.
    /// Returns the operator handle, the event stream, and the task handle
    /// which resolves to a [`SessionReport`] once the session ends.
    pub fn spawn(
        params: SessionParams,
        config: SessionConfig,
        connector: C,
        history: H,
        attachments: A,
    ) -> (
        SessionHandle,
        mpsc::Receiver<SessionEvent>,
        JoinHandle<SessionReport>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let session = Self {
            dedup: DedupEngine::new(params.local_user()),
            negotiation: ClosureNegotiation::new(config.countdown_ticks),
            params: params.clone(),
            config,
            connection: Arc::new(ConnectionManager::new(connector)),
            history: Arc::new(history),
            attachments: Arc::new(attachments),
            messages: Vec::new(),
            countdown: Countdown::default(),
            inputs: input_tx,
            events: event_tx,
            reported_state: ConnectionState::Disconnected,
            closed: None,
        };
        let task = tokio::spawn(session.run(command_rx, input_rx));
        let handle = SessionHandle {
            params,
            commands: command_tx,
        };
        (handle, event_rx, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
    ) -> SessionReport {
        tracing::info!(session = %self.params, "chat session starting");
        self.register_handlers();
        self.start_history();
        self.start_connect().await;

        while self.closed.is_none() {
            tokio::select! {
                Some(input) = inputs.recv() => self.handle_input(input).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.close(CloseReason::UserLeft).await,
                },
            }
            if self.closed.is_none() {
                self.refresh_connection_state().await;
            }
        }

        self.teardown().await;
        let reason = self.closed.unwrap_or(CloseReason::UserLeft);
        tracing::info!(ticket_id = self.params.ticket_id(), ?reason, "chat session ended");
        SessionReport {
            messages: self.messages,
            closure: self.negotiation.outcome(),
            reason,
        }
    }

    /// Subscribe the live-channel handlers. Handlers only forward into the
    /// input channel; all filtering happens on the session task.
    fn register_handlers(&self) {
        let tx = self.inputs.clone();
        self.connection
            .subscribe(methods::RECEIVE_MESSAGE, move |args: &[Value]| {
                let Some(payload) = args.first() else {
                    tracing::warn!("live message without payload");
                    return;
                };
                match serde_json::from_value::<LiveMessage>(payload.clone()) {
                    Ok(message) => {
                        let _ = tx.send(SessionInput::Live(message));
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed live message"),
                }
            });

        let tx = self.inputs.clone();
        self.connection
            .subscribe(methods::CLOSURE_PROPOSED, move |args: &[Value]| {
                tracing::info!(ticket = ?args.first(), "technician proposed closure");
                let _ = tx.send(SessionInput::ClosureProposed);
            });

        let tx = self.inputs.clone();
        self.connection.on_connection_lost(move || {
            let _ = tx.send(SessionInput::ConnectionLost);
        });
    }

    fn start_history(&self) {
        let history = Arc::clone(&self.history);
        let tx = self.inputs.clone();
        let ticket_id = self.params.ticket_id();
        let local_user = self.params.local_user().to_string();
        tokio::spawn(async move {
            let result = history::load_history(history.as_ref(), ticket_id, &local_user).await;
            let _ = tx.send(SessionInput::History(result));
        });
    }

    async fn start_connect(&mut self) {
        self.report_state(ConnectionState::Connecting).await;
        let connection = Arc::clone(&self.connection);
        let tx = self.inputs.clone();
        let ticket_id = self.params.ticket_id();
        tokio::spawn(async move {
            let result = connection.connect(ticket_id).await;
            let _ = tx.send(SessionInput::Connected(result));
        });
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::History(Ok(messages)) => {
                for message in messages {
                    self.render(message).await;
                }
            }
            SessionInput::History(Err(e)) => {
                tracing::warn!(ticket_id = self.params.ticket_id(), error = %e, "history load failed");
                self.notify(Notice::HistoryUnavailable(e.to_string())).await;
            }
            SessionInput::Connected(Ok(())) => {
                // The connection may already have dropped again.
                let state = self.connection.state();
                self.report_state(state).await;
            }
            SessionInput::Connected(Err(e)) => {
                self.notify(Notice::ConnectionFailed(e.to_string())).await;
                self.report_state(ConnectionState::Disconnected).await;
            }
            SessionInput::ConnectionLost => self.refresh_connection_state().await,
            SessionInput::Live(message) => {
                if self.dedup.should_accept(&message) {
                    self.render(ChatMessage::from_wire(Origin::Remote, &message.body))
                        .await;
                }
            }
            SessionInput::ClosureProposed => self.on_closure_proposed().await,
            SessionInput::CountdownTick(generation) => match self.negotiation.tick(generation) {
                TickOutcome::Ignored => {}
                TickOutcome::Remaining(remaining_secs) => {
                    self.emit(SessionEvent::ClosureCountdown { remaining_secs })
                        .await;
                }
                TickOutcome::Expired => self.finish_closure(CloseReason::CountdownExpired).await,
            },
            SessionInput::Uploaded(Ok(reference)) => {
                let body = reference.encode();
                self.render(ChatMessage::local_attachment(reference)).await;
                self.announce(body).await;
            }
            SessionInput::Uploaded(Err(e)) => {
                tracing::warn!(error = %e, "attachment upload failed");
                self.notify(Notice::UploadFailed(e.to_string())).await;
            }
            SessionInput::SendFailed(e) => {
                self.notify(Notice::SendFailed(e.to_string())).await;
            }
            SessionInput::InlineMedia(render_key, bytes) => {
                self.emit(SessionEvent::InlineMedia { render_key, bytes })
                    .await;
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendText(text) => {
                if self.connection.state() != ConnectionState::Connected {
                    self.notify(Notice::NotConnected).await;
                    return;
                }
                self.render(ChatMessage::from_wire(Origin::Local, &text)).await;
                self.announce(text).await;
            }
            SessionCommand::Attach(path) => self.start_upload(path),
            SessionCommand::ConfirmClosure => {
                if self.negotiation.confirm() {
                    self.finish_closure(CloseReason::ConfirmedByUser).await;
                } else {
                    tracing::debug!("no closure pending, confirm ignored");
                }
            }
            SessionCommand::DeclineClosure => {
                if self.negotiation.decline() {
                    self.countdown.cancel();
                    tracing::info!(ticket_id = self.params.ticket_id(), "closure declined");
                    self.emit(SessionEvent::ClosureDeclined).await;
                }
            }
            SessionCommand::Close => self.close(CloseReason::UserLeft).await,
        }
    }

    async fn on_closure_proposed(&mut self) {
        let Some(generation) = self.negotiation.propose() else {
            tracing::debug!(phase = ?self.negotiation.phase(), "closure already negotiating, proposal ignored");
            return;
        };
        let tx = self.inputs.clone();
        self.countdown.start(self.config.tick_period, move || {
            tx.send(SessionInput::CountdownTick(generation)).is_ok()
        });
        self.emit(SessionEvent::ClosureProposed {
            remaining_secs: self.negotiation.remaining(),
        })
        .await;
    }

    /// Send the confirmation if still connected, then end the session.
    async fn finish_closure(&mut self, reason: CloseReason) {
        self.countdown.cancel();
        if self.connection.state() == ConnectionState::Connected {
            let ticket_id = self.params.ticket_id();
            if let Err(e) = self
                .connection
                .invoke(methods::CONFIRM_CLOSURE, vec![Value::from(ticket_id)])
                .await
            {
                tracing::warn!(ticket_id, error = %e, "closure confirmation not delivered");
            }
        } else {
            tracing::info!("not connected, closing without confirmation");
        }
        self.close(reason).await;
    }

    async fn close(&mut self, reason: CloseReason) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(reason);
        self.emit(SessionEvent::Closed(reason)).await;
    }

    async fn teardown(&mut self) {
        self.countdown.cancel();
        self.connection.shutdown().await;
    }

    /// Invoke the send method in the background.
    async fn announce(&mut self, body: String) {
        if self.connection.state() != ConnectionState::Connected {
            self.notify(Notice::NotConnected).await;
            return;
        }
        let connection = Arc::clone(&self.connection);
        let tx = self.inputs.clone();
        let arguments = vec![
            Value::from(self.params.ticket_id()),
            Value::from(self.params.local_user()),
            Value::from(body),
            Value::from(self.config.role_tag.as_str()),
        ];
        tokio::spawn(async move {
            if let Err(e) = connection.invoke(methods::SEND_MESSAGE, arguments).await {
                tracing::warn!(error = %e, "send failed");
                let _ = tx.send(SessionInput::SendFailed(e));
            }
        });
    }

    fn start_upload(&self, path: PathBuf) {
        let attachments = Arc::clone(&self.attachments);
        let params = self.params.clone();
        let tx = self.inputs.clone();
        tokio::spawn(async move {
            let result = match LocalFile::read(&path).await {
                Ok(file) => attachments.upload(file, &params).await,
                Err(e) => Err(e),
            };
            let _ = tx.send(SessionInput::Uploaded(result));
        });
    }

    /// Append `message` unless its render key was seen before.
    async fn render(&mut self, message: ChatMessage) {
        if !self.dedup.should_render(&message.render_key) {
            return;
        }
        if let Some(reference) = message.body.attachment()
            && reference.media_kind == MediaKind::Image
        {
            self.fetch_inline(message.render_key.clone(), reference.remote_url.clone());
        }
        self.messages.push(message.clone());
        self.emit(SessionEvent::Rendered(message)).await;
    }

    fn fetch_inline(&self, render_key: RenderKey, url: String) {
        let attachments = Arc::clone(&self.attachments);
        let tx = self.inputs.clone();
        tokio::spawn(async move {
            match attachments.fetch_inline(&url).await {
                Ok(bytes) => {
                    let _ = tx.send(SessionInput::InlineMedia(render_key, bytes));
                }
                Err(e) => tracing::warn!(%url, error = %e, "inline image fetch failed"),
            }
        });
    }

    async fn refresh_connection_state(&mut self) {
        let state = self.connection.state();
        if state == ConnectionState::Disconnected && self.reported_state == ConnectionState::Connected {
            tracing::warn!(ticket_id = self.params.ticket_id(), "hub connection lost");
            self.report_state(state).await;
        }
    }

    async fn report_state(&mut self, state: ConnectionState) {
        if self.reported_state == state {
            return;
        }
        self.reported_state = state;
        self.emit(SessionEvent::ConnectionChanged(state)).await;
    }

    async fn notify(&self, notice: Notice) {
        self.emit(SessionEvent::Notice(notice)).await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("session event receiver dropped");
        }
    }
}
