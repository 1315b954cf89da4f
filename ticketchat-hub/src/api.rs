//! REST endpoints: ticket history, attachment upload and download.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};

use ticketchat_proto::api::{HistoryResponse, UploadResponse, roles, upload_fields};
use ticketchat_proto::message::ATTACHMENT_PREFIX;

use crate::hub::HubState;
use crate::store::StoredFile;

/// File extensions the upload endpoint accepts.
pub const ALLOWED_EXTENSIONS: [&str; 8] = [
    ".jpg", ".jpeg", ".png", ".gif", ".pdf", ".doc", ".docx", ".txt",
];

/// Reasons an upload is refused. The messages are shown to end users.
#[derive(Debug, thiserror::Error)]
pub enum UploadRejection {
    /// No `file` part, or an empty one.
    #[error("Nenhum arquivo enviado.")]
    NoFile,
    /// The extension is not in [`ALLOWED_EXTENSIONS`].
    #[error("Tipo de arquivo não permitido.")]
    Extension,
    /// The file exceeds the configured maximum.
    #[error("Arquivo excede o tamanho máximo de {max} bytes.")]
    TooLarge {
        /// Configured limit.
        max: usize,
    },
    /// The `ticketId` part is missing or not a number.
    #[error("Chamado inválido.")]
    InvalidTicket,
    /// The multipart body could not be read.
    #[error("Falha ao ler o formulário: {0}")]
    Multipart(String),
}

/// Routes served next to the hub endpoint.
pub fn routes() -> Router<Arc<HubState>> {
    Router::new()
        .route("/Tickets/VisualizarChatMobile/{ticket_id}", get(history))
        .route("/Upload/Create", post(upload))
        .route("/uploads/{name}", get(download))
}

async fn history(
    State(state): State<Arc<HubState>>,
    Path(ticket_id): Path<i64>,
) -> Json<HistoryResponse> {
    let messages = state
        .store
        .history(ticket_id)
        .await
        .into_iter()
        .filter_map(|entry| serde_json::to_value(entry).ok())
        .collect();
    Json(HistoryResponse { messages })
}

async fn upload(
    State(state): State<Arc<HubState>>,
    multipart: Multipart,
) -> (StatusCode, Json<UploadResponse>) {
    match receive_upload(&state, multipart).await {
        Ok(file_url) => (
            StatusCode::OK,
            Json(UploadResponse {
                success: Some(true),
                file_url: Some(file_url),
                error: None,
            }),
        ),
        Err(rejection) => {
            tracing::warn!(reason = %rejection, "upload rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(UploadResponse {
                    success: Some(false),
                    file_url: None,
                    error: Some(rejection.to_string()),
                }),
            )
        }
    }
}

/// Read the form, store the file and announce it to the ticket.
async fn receive_upload(state: &HubState, mut multipart: Multipart) -> Result<String, UploadRejection> {
    let mut file: Option<StoredFile> = None;
    let mut ticket_id: Option<i64> = None;
    let mut user = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadRejection::Multipart(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            upload_fields::FILE => {
                let original_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| UploadRejection::Multipart(e.to_string()))?;
                file = Some(StoredFile {
                    original_name,
                    bytes: bytes.to_vec(),
                });
            }
            upload_fields::TICKET_ID => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| UploadRejection::Multipart(e.to_string()))?;
                ticket_id = text.trim().parse().ok();
            }
            upload_fields::USER => {
                user = field
                    .text()
                    .await
                    .map_err(|e| UploadRejection::Multipart(e.to_string()))?;
            }
            _ => {}
        }
    }

    let file = file
        .filter(|f| !f.bytes.is_empty())
        .ok_or(UploadRejection::NoFile)?;
    let ticket_id = ticket_id
        .filter(|id| *id != 0)
        .ok_or(UploadRejection::InvalidTicket)?;
    let extension = allowed_extension(&file.original_name).ok_or(UploadRejection::Extension)?;
    if file.bytes.len() > state.max_upload_size() {
        return Err(UploadRejection::TooLarge {
            max: state.max_upload_size(),
        });
    }

    let stored_name = format!("{}{extension}", uuid::Uuid::now_v7());
    let file_url = format!("{}/uploads/{stored_name}", state.public_base_url().await);
    tracing::info!(
        ticket_id,
        user = %user,
        original = %file.original_name,
        size = file.bytes.len(),
        %file_url,
        "file uploaded"
    );
    state.store.put_file(&stored_name, file).await;
    state
        .post_message(
            ticket_id,
            &user,
            &format!("{ATTACHMENT_PREFIX}{file_url}"),
            roles::CLIENT,
        )
        .await;
    Ok(file_url)
}

/// The lowercased extension (with dot) of `file_name`, if allowed.
fn allowed_extension(file_name: &str) -> Option<String> {
    let (_, extension) = file_name.rsplit_once('.')?;
    let extension = format!(".{}", extension.to_lowercase());
    ALLOWED_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}

fn content_type(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain; charset=utf-8",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}

async fn download(State(state): State<Arc<HubState>>, Path(name): Path<String>) -> impl IntoResponse {
    match state.store.file(&name).await {
        Some(file) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type(&name))],
            file.bytes,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
