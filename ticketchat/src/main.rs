//! `TicketChat`: live chat console for a support ticket.
//!
//! Opens the chat of one ticket, backfills its history and follows the
//! technician's messages live. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/ticketchat/config.toml`).
//!
//! ```bash
//! cargo run --bin ticketchat -- --ticket-id 42 --user ana --remote-party carlos \
//!     --hub-url http://localhost:5290/chatHub --api-url http://localhost:5290/
//!
//! # Or via environment variables
//! TICKETCHAT_TICKET_ID=42 TICKETCHAT_USER=ana TICKETCHAT_REMOTE_PARTY=carlos cargo run
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use ticketchat::app::{self, App, Command};
use ticketchat::chat::{SessionError, SessionHandle};
use ticketchat::config::{CliArgs, ClientConfig};
use ticketchat::net;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so they never interleave with the chat on stdout.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    // Settings that only come from the command line survive a bad file.
    let config = ClientConfig {
        ticket_id: cli.ticket_id,
        user: cli.user.clone(),
        remote_party: cli.remote_party.clone(),
        read_only: cli.read_only,
        ..config
    };

    let params = match config.session_params() {
        Ok(params) => params,
        Err(e) => {
            tracing::error!(error = %e, "cannot open chat");
            eprintln!("cannot open chat: {e}");
            return ExitCode::from(2);
        }
    };

    tracing::info!("ticketchat starting");
    let mut live = match net::spawn_session(&config, params.clone()) {
        Ok(live) => live,
        Err(e) => {
            tracing::error!(error = %e, "session setup failed");
            eprintln!("cannot open chat: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut app = App::new(&params, &config.timestamp_format);
    for line in app.banner(&params) {
        println!("{line}");
    }

    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = live.events.recv() => {
                let Some(event) = event else { break };
                for line in app.apply_event(&event) {
                    println!("{line}");
                }
            }
            line = lines.recv(), if stdin_open => match line {
                Some(line) => run_command(&mut app, &live.handle, app::parse_command(&line)).await,
                None => {
                    stdin_open = false;
                    let _ = live.handle.close().await;
                }
            },
        }
        if app.should_quit {
            break;
        }
    }

    match live.task.await {
        Ok(report) => {
            tracing::info!(
                messages = report.messages.len(),
                closure = ?report.closure,
                reason = ?report.reason,
                "ticketchat exiting"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "session task failed");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("ticketchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Forward stdin lines to the main loop. The channel closes on EOF.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

async fn run_command(app: &mut App, handle: &SessionHandle, command: Command) {
    let result = match command {
        Command::Say(text) => handle.send_text(&text).await,
        Command::Attach(path) => {
            println!("* uploading {}", path.display());
            handle.attach(path).await
        }
        Command::ConfirmClosure if app.closure_pending() => handle.confirm_closure().await,
        Command::DeclineClosure if app.closure_pending() => handle.decline_closure().await,
        Command::ConfirmClosure | Command::DeclineClosure => {
            println!("! nothing to answer");
            Ok(())
        }
        Command::Quit => handle.close().await,
        Command::Help => {
            println!("{}", app::HELP);
            Ok(())
        }
        Command::Unknown(line) => {
            println!("! unknown command: {line}");
            Ok(())
        }
        Command::Empty => Ok(()),
    };

    match result {
        Ok(()) => {}
        Err(SessionError::Closed) => app.should_quit = true,
        Err(e) => println!("! {e}"),
    }
}
