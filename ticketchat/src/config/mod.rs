//! Configuration system for the `TicketChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/ticketchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::chat::SessionConfig;
use crate::chat::params::{PreconditionError, SessionParams, ViewMode};
use crate::transport::hub::HubOptions;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    chat: ChatFileConfig,
    ui: UiFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    hub_url: Option<String>,
    api_base_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    invoke_timeout_secs: Option<u64>,
    keepalive_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    role_tag: Option<String>,
    closure_countdown_secs: Option<u32>,
    countdown_tick_ms: Option<u64>,
    event_buffer: Option<usize>,
    input_buffer: Option<usize>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Hub endpoint (`http(s)://` or `ws(s)://`).
    pub hub_url: String,
    /// Base URL of the REST endpoints (history, upload).
    pub api_base_url: String,
    /// Timeout for the WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Timeout for the hub handshake response.
    pub handshake_timeout: Duration,
    /// Timeout for an invocation's completion.
    pub invoke_timeout: Duration,
    /// Keep-alive ping interval.
    pub keepalive: Duration,
    /// Per-request timeout for REST calls.
    pub http_timeout: Duration,

    // -- Chat --
    /// Role tag sent with each message.
    pub role_tag: String,
    /// Ticks in the closure countdown.
    pub closure_countdown_secs: u32,
    /// Duration of one countdown tick.
    pub countdown_tick: Duration,
    /// Session event channel capacity.
    pub event_buffer: usize,
    /// Session command channel capacity.
    pub input_buffer: usize,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,

    // -- Session entry --
    /// Ticket to open.
    pub ticket_id: Option<i64>,
    /// Local user identity.
    pub user: Option<String>,
    /// Counterpart identity.
    pub remote_party: Option<String>,
    /// Open without the ability to send.
    pub read_only: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_url: "http://localhost:5290/chatHub".to_string(),
            api_base_url: "http://localhost:5290/".to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            invoke_timeout: Duration::from_secs(15),
            keepalive: Duration::from_secs(15),
            http_timeout: Duration::from_secs(30),
            role_tag: ticketchat_proto::api::roles::CLIENT.to_string(),
            closure_countdown_secs: 6,
            countdown_tick: Duration::from_millis(1000),
            event_buffer: 256,
            input_buffer: 64,
            timestamp_format: "%H:%M".to_string(),
            ticket_id: None,
            user: None,
            remote_party: None,
            read_only: false,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file cannot be read,
    /// or if any config file cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            hub_url: cli
                .hub_url
                .clone()
                .or_else(|| file.network.hub_url.clone())
                .unwrap_or(defaults.hub_url),
            api_base_url: cli
                .api_url
                .clone()
                .or_else(|| file.network.api_base_url.clone())
                .unwrap_or(defaults.api_base_url),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            handshake_timeout: file
                .network
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            invoke_timeout: file
                .network
                .invoke_timeout_secs
                .map_or(defaults.invoke_timeout, Duration::from_secs),
            keepalive: file
                .network
                .keepalive_secs
                .map_or(defaults.keepalive, Duration::from_secs),
            http_timeout: file
                .network
                .http_timeout_secs
                .map_or(defaults.http_timeout, Duration::from_secs),
            role_tag: file.chat.role_tag.clone().unwrap_or(defaults.role_tag),
            closure_countdown_secs: file
                .chat
                .closure_countdown_secs
                .unwrap_or(defaults.closure_countdown_secs),
            countdown_tick: file
                .chat
                .countdown_tick_ms
                .map_or(defaults.countdown_tick, Duration::from_millis),
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
            input_buffer: file.chat.input_buffer.unwrap_or(defaults.input_buffer),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
            ticket_id: cli.ticket_id,
            user: cli.user.clone(),
            remote_party: cli.remote_party.clone(),
            read_only: cli.read_only,
        }
    }

    /// Validate the session entry parameters.
    ///
    /// # Errors
    ///
    /// Returns [`PreconditionError`] when the ticket, the user or the
    /// remote party is missing.
    pub fn session_params(&self) -> Result<SessionParams, PreconditionError> {
        let mode = if self.read_only {
            ViewMode::ReadOnly
        } else {
            ViewMode::Interactive
        };
        SessionParams::new(
            self.ticket_id,
            self.user.clone(),
            self.remote_party.clone(),
            mode,
        )
    }

    /// Hub connection timeouts.
    #[must_use]
    pub const fn hub_options(&self) -> HubOptions {
        HubOptions {
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            invoke_timeout: self.invoke_timeout,
            keepalive_interval: self.keepalive,
        }
    }

    /// Session tunables.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            role_tag: self.role_tag.clone(),
            countdown_ticks: self.closure_countdown_secs,
            tick_period: self.countdown_tick,
            event_buffer: self.event_buffer,
            command_buffer: self.input_buffer,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Live chat for a support ticket")]
pub struct CliArgs {
    /// Ticket whose chat to open.
    #[arg(long, env = "TICKETCHAT_TICKET_ID")]
    pub ticket_id: Option<i64>,

    /// Your user identity.
    #[arg(long, env = "TICKETCHAT_USER")]
    pub user: Option<String>,

    /// The technician you are talking to.
    #[arg(long, env = "TICKETCHAT_REMOTE_PARTY")]
    pub remote_party: Option<String>,

    /// Open the chat without the ability to send.
    #[arg(long)]
    pub read_only: bool,

    /// Hub endpoint URL.
    #[arg(long, env = "TICKETCHAT_HUB_URL")]
    pub hub_url: Option<String>,

    /// Base URL of the ticketing REST API.
    #[arg(long, env = "TICKETCHAT_API_URL")]
    pub api_url: Option<String>,

    /// Path to config file (default: `~/.config/ticketchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TICKETCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/ticketchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist. Otherwise the default
/// path is tried and a missing file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("ticketchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
