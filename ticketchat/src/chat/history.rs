//! History backfill for a ticket's chat.
//!
//! The backend returns the full message log in one response; there is no
//! pagination and no message ID. [`load_history`] turns that log into
//! render-ready [`ChatMessage`]s, tagging each one Local or Remote by
//! comparing its sender to the local user.
//!
//! A malformed element is logged and skipped; a malformed response as a
//! whole is a [`FetchError`]. Either way the session keeps running.

use std::sync::Arc;

use tokio::sync::Notify;

use ticketchat_proto::api::{HistoryEntry, HistoryResponse, history_path};
use ticketchat_proto::message::{ChatMessage, Origin, same_identity};

use crate::backend::Backend;

/// Errors that can occur while fetching data from the backend.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The request could not be sent or the body could not be read.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("endpoint returned HTTP {0}")]
    Status(u16),

    /// The response is not the expected JSON object.
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The endpoint URL could not be built.
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A test source was told to fail.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Something that can fetch a ticket's raw message log.
pub trait HistorySource: Send + Sync + 'static {
    /// Fetch the log for `ticket_id` in server order.
    fn fetch(
        &self,
        ticket_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryEntry>, FetchError>> + Send;
}

/// Fetch and convert a ticket's history.
///
/// # Errors
///
/// Propagates the source's [`FetchError`].
pub async fn load_history<H: HistorySource>(
    source: &H,
    ticket_id: i64,
    local_user: &str,
) -> Result<Vec<ChatMessage>, FetchError> {
    let entries = source.fetch(ticket_id).await?;
    tracing::info!(ticket_id, count = entries.len(), "history fetched");
    Ok(to_messages(&entries, local_user))
}

/// Convert raw entries into messages, preserving order.
#[must_use]
pub fn to_messages(entries: &[HistoryEntry], local_user: &str) -> Vec<ChatMessage> {
    entries
        .iter()
        .map(|entry| {
            let origin = if same_identity(&entry.sender, local_user) {
                Origin::Local
            } else {
                Origin::Remote
            };
            ChatMessage::from_wire(origin, &entry.content)
        })
        .collect()
}

/// Parse a history response body, skipping elements that do not decode.
///
/// # Errors
///
/// Returns [`FetchError::Malformed`] if the body is not an object with a
/// `mensagens` array.
pub fn parse_history(body: &str) -> Result<Vec<HistoryEntry>, FetchError> {
    let response: HistoryResponse = serde_json::from_str(body)?;
    let mut entries = Vec::with_capacity(response.messages.len());
    for (index, value) in response.messages.into_iter().enumerate() {
        match serde_json::from_value::<HistoryEntry>(value) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(index, error = %e, "skipping malformed history entry"),
        }
    }
    Ok(entries)
}

/// History fetched from the backend's HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpHistory {
    backend: Backend,
}

impl HttpHistory {
    /// Create a source using `backend`.
    #[must_use]
    pub const fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

impl HistorySource for HttpHistory {
    async fn fetch(&self, ticket_id: i64) -> Result<Vec<HistoryEntry>, FetchError> {
        let url = self.backend.endpoint(&history_path(ticket_id))?;
        tracing::debug!(ticket_id, %url, "fetching history");
        let response = self.backend.http().get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        parse_history(&body)
    }
}

/// In-memory history, optionally held back until released.
#[derive(Clone, Default)]
pub struct InMemoryHistory {
    entries: Vec<HistoryEntry>,
    failure: Option<String>,
    gate: Option<Arc<Notify>>,
}

/// Releases a gated [`InMemoryHistory`].
#[derive(Clone)]
pub struct HistoryGate(Arc<Notify>);

impl HistoryGate {
    /// Let the pending fetch complete.
    pub fn open(&self) {
        self.0.notify_one();
    }
}

impl InMemoryHistory {
    /// A source returning `entries` immediately.
    #[must_use]
    pub const fn new(entries: Vec<HistoryEntry>) -> Self {
        Self {
            entries,
            failure: None,
            gate: None,
        }
    }

    /// A source returning `entries` once the gate is opened.
    #[must_use]
    pub fn gated(entries: Vec<HistoryEntry>) -> (Self, HistoryGate) {
        let gate = Arc::new(Notify::new());
        let source = Self {
            entries,
            failure: None,
            gate: Some(Arc::clone(&gate)),
        };
        (source, HistoryGate(gate))
    }

    /// A source that always fails.
    #[must_use]
    pub fn failing(reason: &str) -> Self {
        Self {
            entries: Vec::new(),
            failure: Some(reason.to_string()),
            gate: None,
        }
    }
}

impl HistorySource for InMemoryHistory {
    async fn fetch(&self, _ticket_id: i64) -> Result<Vec<HistoryEntry>, FetchError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.failure {
            Some(reason) => Err(FetchError::Unavailable(reason.clone())),
            None => Ok(self.entries.clone()),
        }
    }
}
