//! In-memory ticket storage: per-ticket message logs, finalized tickets and
//! uploaded files.
//!
//! Nothing is persisted; the hub is a development and test server.

use std::collections::{HashMap, HashSet};

use ticketchat_proto::api::HistoryEntry;
use tokio::sync::RwLock;

/// A message appended to a ticket's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Who wrote it.
    pub author: String,
    /// Raw body (may carry the attachment prefix).
    pub content: String,
    /// Role tag of the author.
    pub role: String,
    /// Server time, `YYYY-MM-DD HH:MM:SS`.
    pub sent_at: String,
}

/// Stored upload bytes.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Name the uploader gave the file.
    pub original_name: String,
    /// Contents.
    pub bytes: Vec<u8>,
}

/// Thread-safe store behind the hub and the REST endpoints.
#[derive(Default)]
pub struct TicketStore {
    logs: RwLock<HashMap<i64, Vec<StoredMessage>>>,
    finalized: RwLock<HashSet<i64>>,
    files: RwLock<HashMap<String, StoredFile>>,
}

impl TicketStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to a ticket's log, returning the new log length.
    pub async fn append(&self, ticket_id: i64, message: StoredMessage) -> usize {
        let mut logs = self.logs.write().await;
        let log = logs.entry(ticket_id).or_default();
        log.push(message);
        log.len()
    }

    /// The full log of a ticket in append order.
    pub async fn messages(&self, ticket_id: i64) -> Vec<StoredMessage> {
        let logs = self.logs.read().await;
        logs.get(&ticket_id).cloned().unwrap_or_default()
    }

    /// The log as history endpoint entries.
    pub async fn history(&self, ticket_id: i64) -> Vec<HistoryEntry> {
        self.messages(ticket_id)
            .await
            .into_iter()
            .map(|m| HistoryEntry {
                sender: m.author,
                content: m.content,
            })
            .collect()
    }

    /// Mark a ticket finalized. Returns `false` if it already was.
    pub async fn finalize(&self, ticket_id: i64) -> bool {
        self.finalized.write().await.insert(ticket_id)
    }

    /// Whether the ticket was finalized.
    pub async fn is_finalized(&self, ticket_id: i64) -> bool {
        self.finalized.read().await.contains(&ticket_id)
    }

    /// Keep an uploaded file under `name`.
    pub async fn put_file(&self, name: &str, file: StoredFile) {
        self.files.write().await.insert(name.to_string(), file);
    }

    /// Look up an uploaded file.
    pub async fn file(&self, name: &str) -> Option<StoredFile> {
        self.files.read().await.get(name).cloned()
    }
}
