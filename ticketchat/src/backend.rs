//! HTTP client for the ticketing backend's REST endpoints.

use std::time::Duration;

use url::Url;

/// Errors raised while building a [`Backend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The base URL could not be parsed.
    #[error("invalid API base URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Parser message.
        reason: String,
    },
    /// The HTTP client could not be constructed.
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// Shared HTTP client bound to the backend's base URL.
#[derive(Debug, Clone)]
pub struct Backend {
    http: reqwest::Client,
    base_url: Url,
}

impl Backend {
    /// Create a client for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the URL is invalid or the client cannot
    /// be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized).map_err(|e| BackendError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    /// Resolve `path` against the base URL.
    ///
    /// # Errors
    ///
    /// Returns the parser error if `path` cannot be joined.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path.trim_start_matches('/'))
    }

    /// The underlying HTTP client.
    #[must_use]
    pub const fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// The base URL all endpoints are resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }
}
