//! SignalR JSON hub protocol frames.
//!
//! Every record on the WebSocket is a JSON object terminated by the ASCII
//! record separator (`0x1E`). A single text frame may carry several records.
//! The connection opens with a handshake record in each direction, after
//! which [`HubMessage`] records flow freely.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminator appended to every JSON record.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Numeric frame types defined by the hub protocol.
mod frame_type {
    pub const INVOCATION: u8 = 1;
    pub const COMPLETION: u8 = 3;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;
}

/// Error type for hub frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The record is not valid JSON or has the wrong shape.
    #[error("malformed hub record: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A required field is missing for the declared frame type.
    #[error("hub record of type {kind} is missing `{field}`")]
    MissingField {
        /// The frame type number.
        kind: u8,
        /// Name of the missing field.
        field: &'static str,
    },
    /// The input contained no record at all.
    #[error("no hub record in frame")]
    Empty,
}

/// First record sent by the client after the WebSocket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol name; always `json` here.
    pub protocol: String,
    /// Protocol version.
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: "json".to_string(),
            version: 1,
        }
    }
}

/// Server reply to the handshake. An empty object means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Present when the server rejected the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A decoded hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Call a named method on the other side.
    Invocation {
        /// Set when the caller expects a [`HubMessage::Completion`].
        invocation_id: Option<String>,
        /// Method name.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// Result of an invocation that carried an ID.
    Completion {
        /// ID of the invocation being completed.
        invocation_id: String,
        /// Return value, if any.
        result: Option<Value>,
        /// Error text when the invocation failed.
        error: Option<String>,
    },
    /// Keep-alive.
    Ping,
    /// The sender is closing the connection.
    Close {
        /// Reason for closing, if abnormal.
        error: Option<String>,
    },
    /// A frame type this implementation does not handle (streaming etc.).
    Unsupported(u8),
}

impl HubMessage {
    /// Build a non-blocking invocation (no completion expected).
    #[must_use]
    pub fn invocation(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }

    /// Build a successful completion for `invocation_id`.
    #[must_use]
    pub fn completion(invocation_id: impl Into<String>) -> Self {
        Self::Completion {
            invocation_id: invocation_id.into(),
            result: None,
            error: None,
        }
    }
}

/// JSON shape shared by all frame types.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&HubMessage> for RawRecord {
    fn from(msg: &HubMessage) -> Self {
        match msg {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => Self {
                kind: frame_type::INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..Self::default()
            },
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => Self {
                kind: frame_type::COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..Self::default()
            },
            HubMessage::Ping => Self {
                kind: frame_type::PING,
                ..Self::default()
            },
            HubMessage::Close { error } => Self {
                kind: frame_type::CLOSE,
                error: error.clone(),
                ..Self::default()
            },
            HubMessage::Unsupported(kind) => Self {
                kind: *kind,
                ..Self::default()
            },
        }
    }
}

impl TryFrom<RawRecord> for HubMessage {
    type Error = CodecError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        match raw.kind {
            frame_type::INVOCATION => Ok(Self::Invocation {
                invocation_id: raw.invocation_id,
                target: raw.target.ok_or(CodecError::MissingField {
                    kind: raw.kind,
                    field: "target",
                })?,
                arguments: raw.arguments.unwrap_or_default(),
            }),
            frame_type::COMPLETION => Ok(Self::Completion {
                invocation_id: raw.invocation_id.ok_or(CodecError::MissingField {
                    kind: raw.kind,
                    field: "invocationId",
                })?,
                result: raw.result,
                error: raw.error,
            }),
            frame_type::PING => Ok(Self::Ping),
            frame_type::CLOSE => Ok(Self::Close { error: raw.error }),
            other => Ok(Self::Unsupported(other)),
        }
    }
}

/// Encodes a [`HubMessage`] as a terminated JSON record.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if an argument cannot be serialized.
pub fn encode(msg: &HubMessage) -> Result<String, CodecError> {
    encode_record(&RawRecord::from(msg))
}

/// Encodes any serializable value (handshake records) as a terminated record.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the value cannot be serialized.
pub fn encode_record<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let mut text = serde_json::to_string(value)?;
    text.push(RECORD_SEPARATOR);
    Ok(text)
}

/// Splits a text frame into its records and decodes each one.
///
/// Empty segments (such as the one after the final separator) are skipped.
/// A bad record does not prevent the remaining records from decoding.
pub fn decode(frame: &str) -> impl Iterator<Item = Result<HubMessage, CodecError>> + '_ {
    records(frame).map(|record| -> Result<HubMessage, CodecError> {
        let raw: RawRecord = serde_json::from_str(record)?;
        HubMessage::try_from(raw)
    })
}

/// Decodes the first record of a frame as a typed value (handshake records).
///
/// # Errors
///
/// Returns [`CodecError::Empty`] if the frame holds no record, or
/// [`CodecError::Malformed`] if it does not match `T`.
pub fn decode_record<T: serde::de::DeserializeOwned>(frame: &str) -> Result<T, CodecError> {
    let record = records(frame).next().ok_or(CodecError::Empty)?;
    Ok(serde_json::from_str(record)?)
}

/// Returns the records following the first one in `frame`.
///
/// The server may pack the handshake response and the first messages into
/// one frame; callers use this to avoid dropping them.
#[must_use]
pub fn trailing_records(frame: &str) -> Option<&str> {
    frame
        .split_once(RECORD_SEPARATOR)
        .map(|(_, rest)| rest)
        .filter(|rest| !rest.trim().is_empty())
}

fn records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}
