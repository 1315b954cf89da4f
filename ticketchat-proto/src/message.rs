//! Chat message model shared by the client and the hub.
//!
//! A message body travels over every channel (history, live push, upload
//! announcement) as a plain string. Attachments are encoded inside that
//! string with the reserved [`ATTACHMENT_PREFIX`], so the same body can be
//! parsed back into a [`MessageBody`] regardless of where it came from.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Reserved prefix marking a body as a file reference rather than literal text.
pub const ATTACHMENT_PREFIX: &str = "file:";

/// File extensions (lowercase, without the dot) rendered inline as images.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// Which side of the conversation produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Sent by the operator of this client.
    Local,
    /// Sent by the counterpart (or the system on their behalf).
    Remote,
}

/// How an attachment should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Rendered inline as an image.
    Image,
    /// Rendered as a downloadable link.
    GenericFile,
}

impl MediaKind {
    /// Classify a URL or file name by its extension.
    ///
    /// Only the last path segment is inspected; query strings and fragments
    /// are ignored. Matching is case-insensitive.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let segment = last_path_segment(url);
        let Some((_, ext)) = segment.rsplit_once('.') else {
            return Self::GenericFile;
        };
        let ext = ext.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Image
        } else {
            Self::GenericFile
        }
    }
}

/// A file that has been uploaded and can be fetched from `remote_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentReference {
    /// Where the file can be downloaded.
    pub remote_url: String,
    /// Human-readable name shown next to the link.
    pub display_name: String,
    /// Image or generic file, derived from the extension.
    pub media_kind: MediaKind,
}

impl AttachmentReference {
    /// Build a reference for `remote_url` with an explicit display name.
    #[must_use]
    pub fn new(remote_url: impl Into<String>, display_name: impl Into<String>) -> Self {
        let remote_url = remote_url.into();
        let media_kind = MediaKind::from_url(&remote_url);
        Self {
            remote_url,
            display_name: display_name.into(),
            media_kind,
        }
    }

    /// Build a reference whose display name is the URL's last path segment.
    #[must_use]
    pub fn from_url(remote_url: impl Into<String>) -> Self {
        let remote_url = remote_url.into();
        let display_name = last_path_segment(&remote_url).to_string();
        Self::new(remote_url, display_name)
    }

    /// Encode this reference as a message body string (`file:<url>`).
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{ATTACHMENT_PREFIX}{}", self.remote_url)
    }
}

/// Content of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Literal text.
    Text(String),
    /// A reference to an uploaded file.
    Attachment(AttachmentReference),
}

impl MessageBody {
    /// Parse a raw wire body, recognizing the attachment prefix.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(ATTACHMENT_PREFIX) {
            Some(url) => Self::Attachment(AttachmentReference::from_url(url.trim())),
            None => Self::Text(raw.to_string()),
        }
    }

    /// Encode this body back into its wire string.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Attachment(reference) => reference.encode(),
        }
    }

    /// Returns the attachment, if this body is one.
    #[must_use]
    pub const fn attachment(&self) -> Option<&AttachmentReference> {
        match self {
            Self::Attachment(reference) => Some(reference),
            Self::Text(_) => None,
        }
    }
}

/// Normalized content identity used to suppress duplicate rendering.
///
/// Derived from the wire body with the attachment prefix removed, surrounding
/// whitespace trimmed, and the remainder lowercased. Two different messages
/// with the same text therefore share a key; see [`RenderKey::from_body`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderKey(String);

impl RenderKey {
    /// Compute the render key of a raw wire body.
    ///
    /// Identity is reconstructed from content because history, live push and
    /// local echo share no message IDs. Identical texts collide: a second
    /// "ok" from either party within one session is treated as a repeat.
    /// A server-assigned message ID would remove the collision.
    #[must_use]
    pub fn from_body(raw: &str) -> Self {
        Self(raw.replace(ATTACHMENT_PREFIX, "").trim().to_lowercase())
    }

    /// Returns the normalized key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A displayable unit in the session's render list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Local or remote author.
    pub origin: Origin,
    /// Text or attachment.
    pub body: MessageBody,
    /// When the client displayed the message (not server time).
    pub timestamp: DateTime<Local>,
    /// Deduplication key derived from the body.
    pub render_key: RenderKey,
}

impl ChatMessage {
    /// Build a message from a raw wire body, stamped with the current time.
    #[must_use]
    pub fn from_wire(origin: Origin, raw: &str) -> Self {
        Self {
            origin,
            body: MessageBody::parse(raw),
            timestamp: Local::now(),
            render_key: RenderKey::from_body(raw),
        }
    }

    /// Build an outgoing attachment message.
    ///
    /// Keeps the uploader-supplied display name, unlike [`Self::from_wire`]
    /// which derives it from the URL.
    #[must_use]
    pub fn local_attachment(reference: AttachmentReference) -> Self {
        let render_key = RenderKey::from_body(&reference.encode());
        Self {
            origin: Origin::Local,
            body: MessageBody::Attachment(reference),
            timestamp: Local::now(),
            render_key,
        }
    }
}

/// Case-insensitive comparison of two user identities, ignoring surrounding
/// whitespace.
#[must_use]
pub fn same_identity(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn last_path_segment(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}
