//! `TicketChat` hub: in-memory ticketing backend for local development.
//!
//! ```bash
//! cargo run --bin ticketchat-hub -- --bind 127.0.0.1:5290
//!
//! # Reachable from other machines, with upload links they can open
//! TICKETCHAT_HUB_PUBLIC_URL=http://devbox:5290 cargo run --bin ticketchat-hub
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use ticketchat_hub::config::{HubCliArgs, HubConfig};
use ticketchat_hub::hub::{self, HubState};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = HubCliArgs::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match HubConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid hub configuration");
            return ExitCode::from(2);
        }
    };

    if config.derives_unreachable_public_url() {
        tracing::warn!(
            bind = %config.bind_addr,
            "upload links will use the wildcard bind address; set --public-base-url"
        );
    }

    let state = Arc::new(HubState::with_config(
        config.max_upload_size,
        config.public_base_url.clone(),
    ));

    let (bound_addr, server) =
        match hub::start_server_with_state(&config.bind_addr.to_string(), Arc::clone(&state)).await
        {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(addr = %config.bind_addr, error = %e, "failed to start hub server");
                return ExitCode::FAILURE;
            }
        };
    tracing::info!(
        addr = %bound_addr,
        uploads = %state.public_base_url().await,
        "hub listening"
    );

    match server.await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "hub server task failed");
            ExitCode::FAILURE
        }
    }
}
