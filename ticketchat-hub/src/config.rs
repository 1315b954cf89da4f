//! Hub server settings, taken from CLI flags or their environment variables.
//!
//! The hub is a development backend, so there is no config file. What it
//! does check is the address clients will be handed for uploads: an explicit
//! `--public-base-url` must be an absolute http(s) URL, and a URL derived
//! from a wildcard bind is flagged because clients cannot reach it.

use std::net::SocketAddr;

use url::Url;

use crate::hub::DEFAULT_MAX_UPLOAD_SIZE;

/// Errors in the hub's command line.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid bind address {addr:?}: {reason}")]
    BindAddr { addr: String, reason: String },

    #[error("invalid public base url {url:?}: {reason}")]
    PublicUrl { url: String, reason: String },

    #[error("max upload size must be greater than zero")]
    ZeroUploadLimit,
}

/// CLI arguments for the hub server.
#[derive(clap::Parser, Debug)]
#[command(version, about = "TicketChat development hub")]
pub struct HubCliArgs {
    /// Address to bind the hub server to.
    #[arg(short, long, default_value = "0.0.0.0:5290", env = "TICKETCHAT_HUB_ADDR")]
    pub bind: String,

    /// Maximum upload size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_SIZE, env = "TICKETCHAT_HUB_MAX_UPLOAD")]
    pub max_upload_size: usize,

    /// Base URL under which uploads are published (default: bound address).
    #[arg(long, env = "TICKETCHAT_HUB_PUBLIC_URL")]
    pub public_base_url: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TICKETCHAT_HUB_LOG")]
    pub log_level: String,
}

/// Validated hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: SocketAddr,
    pub max_upload_size: usize,
    /// Normalized without a trailing slash. `None` means derive it from the
    /// bound address.
    pub public_base_url: Option<String>,
    pub log_level: String,
}

impl HubConfig {
    /// Check the parsed arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the bind address is not a socket address,
    /// the public URL is not an absolute http(s) URL, or the upload limit is
    /// zero.
    pub fn from_cli(cli: &HubCliArgs) -> Result<Self, ConfigError> {
        let bind_addr = cli
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::BindAddr {
                addr: cli.bind.clone(),
                reason: e.to_string(),
            })?;

        if cli.max_upload_size == 0 {
            return Err(ConfigError::ZeroUploadLimit);
        }

        let public_base_url = cli
            .public_base_url
            .as_deref()
            .map(parse_public_url)
            .transpose()?;

        Ok(Self {
            bind_addr,
            max_upload_size: cli.max_upload_size,
            public_base_url,
            log_level: cli.log_level.clone(),
        })
    }

    /// Whether upload links will be built from a wildcard bind address
    /// such as `0.0.0.0`, which clients cannot connect to.
    #[must_use]
    pub fn derives_unreachable_public_url(&self) -> bool {
        self.public_base_url.is_none() && self.bind_addr.ip().is_unspecified()
    }
}

fn parse_public_url(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::PublicUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("query and fragment are not allowed"));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}
