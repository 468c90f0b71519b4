//! # marblebar
//!
//! Command-line client for applications that expose a MarbleBar UI over
//! WebSocket. `watch` mirrors the application's views as text; `send`
//! issues a single request and prints the reply.

#![deny(unsafe_code)]

use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use marblebar_client::{ConnectionManager, ConnectionState, ReplyTimeout};
use marblebar_settings::MarbleSettings;
use marblebar_telemetry::{TelemetryConfig, init_telemetry};
use marblebar_ui::MarbleGui;
use serde_json::Value;

/// MarbleBar command-line client.
#[derive(Parser, Debug)]
#[command(name = "marblebar", about = "Drive a MarbleBar application UI")]
struct Cli {
    /// WebSocket endpoint (overrides settings).
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Log level (overrides settings).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print the application's views whenever they change.
    Watch,
    /// Send one event and print its result.
    Send {
        /// Event name, e.g. `ui/init`.
        name: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        data: String,
        /// Reply window in milliseconds; `0` waits forever.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

impl Cli {
    fn apply(&self, settings: &mut MarbleSettings) {
        if let Some(endpoint) = &self.endpoint {
            settings.client.endpoint.clone_from(endpoint);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }

    /// Layer the flags over `loaded` and validate the result once.
    fn settle(&self, mut loaded: MarbleSettings) -> Result<MarbleSettings> {
        self.apply(&mut loaded);
        marblebar_settings::validate(&loaded).context("invalid settings")?;
        Ok(loaded)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let loaded = marblebar_settings::load_settings().context("failed to load settings")?;
    let settings = cli.settle(loaded)?;

    init_telemetry(&TelemetryConfig::from_settings(&settings.logging));
    tracing::debug!(endpoint = %settings.client.endpoint, "settings loaded");

    let manager = ConnectionManager::new(settings.client.clone());
    match cli.command {
        Command::Watch => watch(&manager).await,
        Command::Send {
            name,
            data,
            timeout_ms,
        } => {
            let data: Value = serde_json::from_str(&data).context("--data is not valid JSON")?;
            let timeout = timeout_ms.map_or(ReplyTimeout::Default, ReplyTimeout::from_millis);
            send(&manager, &name, data, timeout).await
        }
    }
}

async fn open(manager: &ConnectionManager) -> Result<()> {
    let state = manager.connect().await.context("connect task failed")?;
    if state != ConnectionState::Connected {
        bail!("could not connect to {}", manager.endpoint());
    }
    Ok(())
}

async fn watch(manager: &ConnectionManager) -> Result<()> {
    let gui = MarbleGui::attach(manager);
    let mut changes = gui.subscribe();
    let mut states = manager.watch_state();
    open(manager).await?;

    print!("{}", gui.render());
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print!("{}", gui.render());
            }
            changed = states.changed() => {
                if changed.is_err() || *states.borrow_and_update() == ConnectionState::Disconnected {
                    print!("{}", gui.render());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = manager.disconnect();
                break;
            }
        }
    }
    Ok(())
}

async fn send(manager: &ConnectionManager, name: &str, data: Value, timeout: ReplyTimeout) -> Result<()> {
    open(manager).await?;
    let reply = manager.request(name, data, timeout).await;
    let _ = manager.disconnect();

    let value = reply.with_context(|| format!("{name} failed"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
