//! Names and payload shapes of the ticketing backend's chat surface.
//!
//! Field names follow the backend's JSON exactly (`autor`, `mensagem`,
//! `remetente`, ...) and are mapped onto English Rust names with serde.

use serde::{Deserialize, Serialize};

/// Hub method and event names.
pub mod methods {
    /// Client → hub: join the group of a ticket.
    pub const JOIN_TICKET: &str = "EntrarNoTicket";
    /// Client → hub: post a message to a ticket.
    pub const SEND_MESSAGE: &str = "EnviarMensagem";
    /// Hub → client: a message was posted to the ticket.
    pub const RECEIVE_MESSAGE: &str = "ReceberMensagem";
    /// Technician → hub: propose closing the ticket.
    pub const NOTIFY_CLOSURE: &str = "NotificarFechamentoChat";
    /// Hub → client: the technician proposed closing the ticket.
    pub const CLOSURE_PROPOSED: &str = "ChatEncerradoPeloTecnico";
    /// Client → hub: the customer confirmed closure.
    pub const CONFIRM_CLOSURE: &str = "ClienteConfirmouEncerrar";
    /// Client → hub: the customer chose to keep the ticket open.
    pub const DECLINE_CLOSURE: &str = "ClienteRecusouEncerrar";
    /// Hub → clients: the ticket was finalized.
    pub const CHAT_CLOSED: &str = "ChatEncerrado";
}

/// Role tags carried with each live message.
pub mod roles {
    /// The customer side.
    pub const CLIENT: &str = "cliente";
    /// The support technician.
    pub const TECHNICIAN: &str = "tecnico";
    /// Messages generated by the hub itself.
    pub const SYSTEM: &str = "sistema";
}

/// Multipart field names of the upload endpoint.
pub mod upload_fields {
    /// The file part.
    pub const FILE: &str = "file";
    /// The ticket identifier part.
    pub const TICKET_ID: &str = "ticketId";
    /// The uploading user's identity part.
    pub const USER: &str = "usuario";
}

/// Path of the history endpoint for a ticket, relative to the API base.
#[must_use]
pub fn history_path(ticket_id: i64) -> String {
    format!("Tickets/VisualizarChatMobile/{ticket_id}")
}

/// Path of the upload endpoint, relative to the API base.
pub const UPLOAD_PATH: &str = "Upload/Create";

/// Payload of a `ReceberMensagem` event.
///
/// Missing fields decode as empty strings; the backend adds extra fields
/// (`data`, `nomeOriginal`) that are ignored here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LiveMessage {
    /// Who wrote the message.
    #[serde(rename = "autor", default)]
    pub author: String,
    /// Raw body (may carry the attachment prefix).
    #[serde(rename = "mensagem", default)]
    pub body: String,
    /// Role tag of the author.
    #[serde(rename = "papel", default)]
    pub role: String,
}

impl LiveMessage {
    /// Convenience constructor.
    #[must_use]
    pub fn new(author: impl Into<String>, body: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            body: body.into(),
            role: role.into(),
        }
    }
}

/// One element of the history response's `mensagens` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Sender identity.
    #[serde(rename = "remetente")]
    pub sender: String,
    /// Raw body.
    #[serde(rename = "conteudo")]
    pub content: String,
}

/// History endpoint response.
///
/// Elements are kept as raw JSON so that one malformed entry can be skipped
/// without discarding the whole log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// The ticket's message log in server order.
    #[serde(rename = "mensagens")]
    pub messages: Vec<serde_json::Value>,
}

/// Upload endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// Whether the upload was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Public URL of the stored file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of the `ChatEncerrado` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatClosed {
    /// The finalized ticket.
    pub ticket_id: i64,
    /// New ticket status.
    pub status: String,
}
