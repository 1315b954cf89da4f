//! Console front-end state: command parsing and event presentation.
//!
//! Everything here is synchronous and free of I/O so the binary only has
//! to shuttle lines between stdin, [`App`] and stdout.

use std::path::PathBuf;

use ticketchat_proto::message::{ChatMessage, MediaKind, MessageBody, Origin};

use crate::chat::params::SessionParams;
use crate::chat::{CloseReason, SessionEvent};
use crate::transport::ConnectionState;

/// Text printed when the operator keeps the ticket open.
pub const KEPT_OPEN_NOTICE: &str = "Chamado mantido aberto.";

/// One line of operator input, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send the text as a chat message.
    Say(String),
    /// Upload and send a file.
    Attach(PathBuf),
    /// Confirm a pending closure proposal.
    ConfirmClosure,
    /// Keep the ticket open.
    DeclineClosure,
    /// Leave the chat.
    Quit,
    /// Print the command summary.
    Help,
    /// A slash command that does not exist.
    Unknown(String),
    /// Blank line.
    Empty,
}

/// Parse a line typed by the operator.
///
/// Lines starting with `/` are commands; `//` escapes a leading slash.
#[must_use]
pub fn parse_command(line: &str) -> Command {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Command::Empty;
    }
    if let Some(escaped) = trimmed.strip_prefix("//") {
        return Command::Say(format!("/{escaped}"));
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Command::Say(trimmed.to_string());
    };

    let (name, argument) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, arg)| (name, arg.trim()));
    match name {
        "file" | "anexo" if !argument.is_empty() => Command::Attach(PathBuf::from(argument)),
        "yes" | "sim" => Command::ConfirmClosure,
        "no" | "nao" | "não" => Command::DeclineClosure,
        "quit" | "exit" | "sair" => Command::Quit,
        "help" => Command::Help,
        _ => Command::Unknown(trimmed.to_string()),
    }
}

/// Help text for the console.
pub const HELP: &str = "\
commands:
  <text>         send a message
  /file <path>   send a file
  /yes           confirm closing the ticket
  /no            keep the ticket open
  /quit          leave the chat";

/// Presentation state of the console.
#[derive(Debug)]
pub struct App {
    local_user: String,
    remote_party: String,
    timestamp_format: String,
    read_only: bool,
    closure_pending: bool,
    connection: ConnectionState,
    /// Whether the main loop should stop.
    pub should_quit: bool,
}

impl App {
    /// Create the console state for a session.
    #[must_use]
    pub fn new(params: &SessionParams, timestamp_format: &str) -> Self {
        Self {
            local_user: params.local_user().to_string(),
            remote_party: params.remote_party().to_string(),
            timestamp_format: timestamp_format.to_string(),
            read_only: params.is_read_only(),
            closure_pending: false,
            connection: ConnectionState::Disconnected,
            should_quit: false,
        }
    }

    /// Lines to print when the console opens.
    #[must_use]
    pub fn banner(&self, params: &SessionParams) -> Vec<String> {
        let mut lines = vec![format!("chat for {params}")];
        if self.read_only {
            lines.push("read-only: this chat cannot be written to".to_string());
        } else {
            lines.push("type /help for commands".to_string());
        }
        lines
    }

    /// Whether a closure proposal is waiting for an answer.
    #[must_use]
    pub const fn closure_pending(&self) -> bool {
        self.closure_pending
    }

    /// Last reported connection state.
    #[must_use]
    pub const fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Turn a session event into console lines, updating local state.
    pub fn apply_event(&mut self, event: &SessionEvent) -> Vec<String> {
        match event {
            SessionEvent::Rendered(message) => vec![self.format_message(message)],
            SessionEvent::InlineMedia { render_key, bytes } => {
                vec![format!("  [image {render_key} loaded, {} bytes]", bytes.len())]
            }
            SessionEvent::Notice(notice) => vec![format!("! {notice}")],
            SessionEvent::ConnectionChanged(state) => {
                self.connection = *state;
                vec![format!("* {state}")]
            }
            SessionEvent::ClosureProposed { remaining_secs } => {
                self.closure_pending = true;
                vec![
                    format!("* {} wants to close this ticket.", self.remote_party),
                    format!("* /yes to confirm, /no to keep it open ({remaining_secs}s)"),
                ]
            }
            SessionEvent::ClosureCountdown { remaining_secs } => {
                vec![format!("* closing in {remaining_secs}s")]
            }
            SessionEvent::ClosureDeclined => {
                self.closure_pending = false;
                vec![format!("* {KEPT_OPEN_NOTICE}")]
            }
            SessionEvent::Closed(reason) => {
                self.closure_pending = false;
                self.should_quit = true;
                vec![format!("* {}", closed_line(*reason))]
            }
        }
    }

    /// Format one rendered message as `[HH:MM] author: body`.
    #[must_use]
    pub fn format_message(&self, message: &ChatMessage) -> String {
        let author = match message.origin {
            Origin::Local => &self.local_user,
            Origin::Remote => &self.remote_party,
        };
        let time = message.timestamp.format(&self.timestamp_format);
        let body = match &message.body {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Attachment(reference) => match reference.media_kind {
                MediaKind::Image => format!("[image] {}", reference.display_name),
                MediaKind::GenericFile => {
                    format!("[file] {} <{}>", reference.display_name, reference.remote_url)
                }
            },
        };
        format!("[{time}] {author}: {body}")
    }
}

const fn closed_line(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::ConfirmedByUser => "ticket closed",
        CloseReason::CountdownExpired => "no answer, ticket closed",
        CloseReason::UserLeft => "chat closed",
    }
}
