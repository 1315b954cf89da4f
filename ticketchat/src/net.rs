//! Wiring of a chat session to the real backend.
//!
//! Builds the concrete hub connector and HTTP services from a resolved
//! [`ClientConfig`] and starts a [`ChatSession`] with them. The front-end
//! talks to the running session only through the returned handle and
//! event stream:
//!
//! ```text
//! console  ── SessionHandle ──▶  ChatSession task ──▶ hub / REST
//!          ◀── SessionEvent ───
//! ```

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{Backend, BackendError};
use crate::chat::attachment::HttpAttachments;
use crate::chat::history::HttpHistory;
use crate::chat::params::SessionParams;
use crate::chat::{ChatSession, SessionEvent, SessionHandle, SessionReport};
use crate::config::ClientConfig;
use crate::transport::ConnectionError;
use crate::transport::hub::WsConnector;

/// Errors raised while wiring a session.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The REST client could not be built.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The hub URL is unusable.
    #[error(transparent)]
    Hub(#[from] ConnectionError),
}

/// A running session as seen from the front-end.
pub struct LiveSession {
    /// Operator handle.
    pub handle: SessionHandle,
    /// Events to present.
    pub events: mpsc::Receiver<SessionEvent>,
    /// Resolves once the session ended.
    pub task: JoinHandle<SessionReport>,
}

/// Start a session against the backend named in `config`.
///
/// Only local setup can fail here; connection and history problems are
/// reported later as [`SessionEvent::Notice`]s.
///
/// # Errors
///
/// Returns [`NetError`] if the API base URL or the hub URL is invalid.
pub fn spawn_session(config: &ClientConfig, params: SessionParams) -> Result<LiveSession, NetError> {
    let backend = Backend::new(&config.api_base_url, config.http_timeout)?;
    let connector = WsConnector::new(&config.hub_url, config.hub_options())?;
    tracing::info!(
        hub = %connector.url(),
        api = %backend.base_url(),
        session = %params,
        "starting chat session"
    );

    let (handle, events, task) = ChatSession::spawn(
        params,
        config.session_config(),
        connector,
        HttpHistory::new(backend.clone()),
        HttpAttachments::new(backend),
    );
    Ok(LiveSession {
        handle,
        events,
        task,
    })
}
