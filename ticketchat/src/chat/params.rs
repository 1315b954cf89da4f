//! Session entry parameters.

use std::fmt;

/// Whether the operator may write into the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    /// Sends and uploads are allowed.
    #[default]
    Interactive,
    /// History and live messages are shown; nothing can be sent.
    ReadOnly,
}

/// A required session parameter was missing at screen entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    /// No ticket identifier (or the placeholder `0`) was supplied.
    #[error("ticket id is required")]
    MissingTicketId,
    /// No local user identity was supplied.
    #[error("local user identity is required")]
    MissingLocalUser,
    /// No remote party identity was supplied.
    #[error("remote party identity is required")]
    MissingRemoteParty,
}

/// Immutable identity of one ticket's chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    ticket_id: i64,
    local_user: String,
    remote_party: String,
    view_mode: ViewMode,
}

impl SessionParams {
    /// Validate the entry parameters.
    ///
    /// Blank identities count as absent, as does ticket id `0`.
    ///
    /// # Errors
    ///
    /// Returns the first [`PreconditionError`] found.
    pub fn new(
        ticket_id: Option<i64>,
        local_user: Option<String>,
        remote_party: Option<String>,
        view_mode: ViewMode,
    ) -> Result<Self, PreconditionError> {
        let ticket_id = ticket_id
            .filter(|id| *id != 0)
            .ok_or(PreconditionError::MissingTicketId)?;
        let local_user = local_user
            .filter(|user| !user.trim().is_empty())
            .ok_or(PreconditionError::MissingLocalUser)?;
        let remote_party = remote_party
            .filter(|party| !party.trim().is_empty())
            .ok_or(PreconditionError::MissingRemoteParty)?;
        Ok(Self {
            ticket_id,
            local_user,
            remote_party,
            view_mode,
        })
    }

    /// The ticket this session chats about.
    #[must_use]
    pub const fn ticket_id(&self) -> i64 {
        self.ticket_id
    }

    /// Identity of the operator of this client.
    #[must_use]
    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Identity of the counterpart.
    #[must_use]
    pub fn remote_party(&self) -> &str {
        &self.remote_party
    }

    /// Interactive or read-only.
    #[must_use]
    pub const fn view_mode(&self) -> ViewMode {
        self.view_mode
    }

    /// Whether sends are rejected.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.view_mode == ViewMode::ReadOnly
    }
}

impl fmt::Display for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ticket #{} ({} with {})",
            self.ticket_id, self.local_user, self.remote_party
        )
    }
}
