#![deny(clippy::all)]

mod api;
mod display;
mod error;
mod protocol;
mod session;
mod settings;
mod transcript;
mod transport;

use crate::api::ApiClient;
use crate::protocol::MeetingRef;
use crate::session::{SessionController, SessionEvent, SessionState};
use crate::transport::TransportClient;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

// Re-export error types (used by other modules)
#[allow(unused_imports)]
pub use error::*;

/// Application configuration
#[derive(serde::Deserialize)]
struct Config {
    server: ServerConfig,
}

#[derive(serde::Deserialize)]
struct ServerConfig {
    api_base_url: String,
    websocket_url: String,
}

/// Load configuration from embedded config.toml
fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    const CONFIG_TOML: &str = include_str!("../config.toml");
    let config: Config = toml::from_str(CONFIG_TOML)?;
    Ok(config)
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  meetscribe <meeting-ref>              follow a live meeting");
    eprintln!("  meetscribe <meeting-ref> --history    load a finished meeting once");
    eprintln!("  meetscribe set-key <api-key>          store the API key");
    eprintln!("  meetscribe clear-settings             remove stored settings");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing for structured logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    // Settings subcommands first; they need no network
    match args.first().map(String::as_str) {
        Some("set-key") => {
            let key = args
                .get(1)
                .ok_or_else(|| AppError::Config("set-key requires a value".to_string()))?;
            settings::set_api_key(key).map_err(AppError::from)?;
            println!("API key saved");
            return Ok(());
        }
        Some("clear-settings") => {
            settings::clear_settings().map_err(AppError::from)?;
            println!("Settings cleared");
            return Ok(());
        }
        _ => {}
    }

    let mut history = false;
    let mut meeting: Option<String> = None;
    for arg in args {
        if arg == "--history" {
            history = true;
        } else if meeting.is_none() && !arg.starts_with('-') {
            meeting = Some(arg);
        } else {
            print_usage();
            return Err(AppError::Config(format!("Unexpected argument: {}", arg)).into());
        }
    }
    let Some(meeting) = meeting else {
        print_usage();
        std::process::exit(2);
    };
    let meeting = MeetingRef::new(meeting);

    let config = load_config().map_err(|e| AppError::Config(e.to_string()))?;

    let api_key = settings::get_api_key().ok_or_else(|| {
        AppError::Config(format!(
            "No API key configured; set {} or run `meetscribe set-key`",
            settings::API_KEY_ENV
        ))
    })?;
    let api_base_url = settings::get_api_base_url().unwrap_or(config.server.api_base_url);
    let websocket_url = settings::get_websocket_url().unwrap_or(config.server.websocket_url);

    let api = Arc::new(ApiClient::new(&api_base_url, &api_key)?);
    let (transport, frame_rx) = TransportClient::new(&websocket_url, &api_key)?;
    let transport = Arc::new(transport);
    let controller = SessionController::new(transport.clone(), frame_rx, api);

    let mut events = controller.subscribe_events();

    if history {
        controller.open_history(&meeting).await?;
        display::render(&controller.snapshot());
        return Ok(());
    }

    controller.open_live(&meeting).await?;
    display::render(&controller.snapshot());
    println!("commands: lang <code> | stop | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                controller.close().await;
                transport.disconnect();
                break;
            }
            line = lines.next_line(), if stdin_open => {
                let Ok(Some(line)) = line else {
                    stdin_open = false;
                    continue;
                };
                let line = line.trim();
                if let Some(code) = line.strip_prefix("lang ") {
                    // Upstream first; local state clears only on success
                    if let Err(e) = controller.change_language(code.trim()).await {
                        eprintln!("error: {:#}", e);
                    }
                } else if line == "stop" {
                    match controller.stop_meeting().await {
                        Ok(()) => break,
                        Err(e) => eprintln!("error: {:#}", e),
                    }
                } else if line == "quit" {
                    controller.close().await;
                    transport.disconnect();
                    break;
                } else if !line.is_empty() {
                    println!("commands: lang <code> | stop | quit");
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::TranscriptUpdated { .. }) => {
                        display::render(&controller.snapshot());
                    }
                    Ok(SessionEvent::StatusChanged { state, status }) => {
                        match &status {
                            Some(status) => info!("Session {} ({})", state, status),
                            None => info!("Session {}", state),
                        }
                        if state == SessionState::Closed {
                            display::render(&controller.snapshot());
                            break;
                        }
                    }
                    Ok(SessionEvent::Warning { message }) => {
                        eprintln!("warning: {}", message);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} session events", skipped);
                        display::render(&controller.snapshot());
                    }
                    Err(_) => break,
                }
            }
        }
    }

    transport.disconnect();
    Ok(())
}
