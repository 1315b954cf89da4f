//! Attachment upload and inline media fetch.
//!
//! A local file is read fully into memory, posted to the backend as a
//! multipart form together with the ticket id and the uploader's identity,
//! and turned into an [`AttachmentReference`] from the returned `fileUrl`.
//! The session renders and announces the reference only after the upload
//! succeeded.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use ticketchat_proto::api::{UPLOAD_PATH, UploadResponse, upload_fields};
use ticketchat_proto::message::AttachmentReference;

use super::history::FetchError;
use super::params::SessionParams;
use crate::backend::Backend;

/// Display name used when the file's own name cannot be determined.
pub const FALLBACK_FILE_NAME: &str = "arquivo.dat";

/// Errors that can occur while uploading an attachment.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The local file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The request could not be sent or the response could not be read.
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend refused the file.
    #[error("upload rejected ({status}): {reason}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Reason given by the backend, if any.
        reason: String,
    },

    /// The backend accepted the request but returned no `fileUrl`.
    #[error("upload response carried no file URL")]
    MissingUrl,

    /// The endpoint URL could not be built.
    #[error("invalid upload URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// File contents ready for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Name shown to both parties.
    pub name: String,
    /// Full contents.
    pub bytes: Vec<u8>,
}

impl LocalFile {
    /// Wrap in-memory contents.
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Read a file from disk. The name is the path's file name, or
    /// [`FALLBACK_FILE_NAME`] when it has none.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Read`] if the file cannot be read.
    pub async fn read(path: &Path) -> Result<Self, UploadError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| UploadError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(FALLBACK_FILE_NAME)
            .to_string();
        Ok(Self { name, bytes })
    }
}

/// Upload and download of attachment bytes.
pub trait AttachmentService: Send + Sync + 'static {
    /// Upload `file` for the session's ticket.
    fn upload(
        &self,
        file: LocalFile,
        params: &SessionParams,
    ) -> impl std::future::Future<Output = Result<AttachmentReference, UploadError>> + Send;

    /// Download the bytes of an image attachment for inline display.
    fn fetch_inline(
        &self,
        url: &str,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// Uploads through the backend's multipart endpoint.
#[derive(Debug, Clone)]
pub struct HttpAttachments {
    backend: Backend,
}

impl HttpAttachments {
    /// Create a service using `backend`.
    #[must_use]
    pub const fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

impl AttachmentService for HttpAttachments {
    async fn upload(
        &self,
        file: LocalFile,
        params: &SessionParams,
    ) -> Result<AttachmentReference, UploadError> {
        let url = self.backend.endpoint(UPLOAD_PATH)?;
        let size = file.bytes.len();
        let part = reqwest::multipart::Part::bytes(file.bytes)
            .file_name(file.name.clone())
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .part(upload_fields::FILE, part)
            .text(upload_fields::TICKET_ID, params.ticket_id().to_string())
            .text(upload_fields::USER, params.local_user().to_string());

        tracing::info!(ticket_id = params.ticket_id(), name = %file.name, size, "uploading attachment");
        let response = self.backend.http().post(url).multipart(form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let reference = interpret_upload_response(status.as_u16(), &body, &file.name)?;
        tracing::info!(url = %reference.remote_url, kind = ?reference.media_kind, "attachment uploaded");
        Ok(reference)
    }

    async fn fetch_inline(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.backend.http().get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Turn an upload response into a reference named `display_name`.
///
/// A `fileUrl` in a successful response is all that is required; the
/// `success` flag is advisory.
///
/// # Errors
///
/// - [`UploadError::Rejected`] for a non-success status or an explicit
///   `success: false`.
/// - [`UploadError::MissingUrl`] when no URL can be found.
pub fn interpret_upload_response(
    status: u16,
    body: &str,
    display_name: &str,
) -> Result<AttachmentReference, UploadError> {
    let parsed: Option<UploadResponse> = serde_json::from_str(body)
        .map_err(|e| tracing::warn!(error = %e, "upload response is not JSON"))
        .ok();

    if !(200..300).contains(&status) || parsed.as_ref().and_then(|r| r.success) == Some(false) {
        let reason = parsed
            .and_then(|r| r.error)
            .unwrap_or_else(|| body.trim().to_string());
        return Err(UploadError::Rejected { status, reason });
    }

    parsed
        .and_then(|r| r.file_url)
        .filter(|url| !url.trim().is_empty())
        .map(|url| AttachmentReference::new(url.trim(), display_name))
        .ok_or(UploadError::MissingUrl)
}

/// In-memory attachment service for tests.
///
/// Stores uploads under `{base_url}/{name}` and serves them back from
/// [`fetch_inline`](AttachmentService::fetch_inline).
#[derive(Clone, Default)]
pub struct InMemoryAttachments {
    base_url: String,
    failure: Option<String>,
    stored: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    uploads: Arc<Mutex<Vec<(i64, String, String)>>>,
}

impl InMemoryAttachments {
    /// Accept every upload, publishing it below `base_url`.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Reject every upload with `reason`.
    #[must_use]
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Uploads received so far as `(ticket_id, user, file name)`.
    #[must_use]
    pub fn uploads(&self) -> Vec<(i64, String, String)> {
        self.uploads.lock().clone()
    }
}

impl AttachmentService for InMemoryAttachments {
    async fn upload(
        &self,
        file: LocalFile,
        params: &SessionParams,
    ) -> Result<AttachmentReference, UploadError> {
        self.uploads.lock().push((
            params.ticket_id(),
            params.local_user().to_string(),
            file.name.clone(),
        ));
        if let Some(reason) = &self.failure {
            return Err(UploadError::Rejected {
                status: 400,
                reason: reason.clone(),
            });
        }
        let url = format!("{}/{}", self.base_url, file.name);
        self.stored.lock().insert(url.clone(), file.bytes);
        Ok(AttachmentReference::new(url, file.name))
    }

    async fn fetch_inline(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.stored
            .lock()
            .get(url)
            .cloned()
            .ok_or(FetchError::Status(404))
    }
}
