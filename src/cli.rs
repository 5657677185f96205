//! Command-line front end over [`ResetService`].

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;

use crate::batch::events::sse_frame;
use crate::batch::{BatchSummary, EventKind, EventStream};
use crate::config::{AppConfig, FileDirectory};
use crate::error::ConfigError;
use crate::probe::SystemPinger;
use crate::service::{ApiResponse, ApiStatus, PingEvent, ResetService};
use crate::ssh::SshClient;

#[derive(Debug, Parser)]
#[command(
    name = "poe-reset",
    version,
    about = "Reset PoE ports on network switches over SSH"
)]
pub struct Cli {
    /// Config file (default: <config dir>/config.toml)
    #[arg(long, global = true, env = "POE_RESET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Device directory file, overriding the configured one
    #[arg(long, global = true)]
    pub directory: Option<PathBuf>,

    /// Print streams as SSE frames instead of JSON lines
    #[arg(long, global = true)]
    pub sse: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List directory locations and addresses
    List,
    /// Reset the port serving one location
    Reset {
        location: String,
        /// Session setup timeout in seconds (1-300)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Reset every location in the directory
    ResetAll {
        /// Per-device timeout in seconds (1-300)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Reset only locations that fail a reachability screen
    ResetDown {
        /// Per-device timeout in seconds (1-300)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stream ping output for one location
    Ping {
        location: String,
        #[arg(long)]
        count: Option<u32>,
    },
    /// One-shot reachability of an address
    Status { ip: String, location: String },
    /// Service version, uptime and directory size
    Info,
}

impl Command {
    pub fn needs_credentials(&self) -> bool {
        matches!(
            self,
            Command::Reset { .. } | Command::ResetAll { .. } | Command::ResetDown { .. }
        )
    }
}

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
pub const EXIT_PARTIAL: u8 = 2;

/// Exit code for a finished batch.
pub fn summary_exit_code(summary: &BatchSummary) -> u8 {
    if !summary.success {
        EXIT_FAILED
    } else if summary.failed > 0 || summary.cancelled > 0 {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    }
}

fn response_exit_code(response: &ApiResponse) -> u8 {
    match (response.success, response.status) {
        (true, _) => EXIT_OK,
        (false, ApiStatus::DeviceFailed) => EXIT_PARTIAL,
        (false, _) => EXIT_FAILED,
    }
}

type Service = ResetService<SshClient, SystemPinger, FileDirectory>;

/// Load configuration and the directory, then run `cli.command`.
pub async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = Arc::new(
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?,
    );

    let directory_path = cli
        .directory
        .clone()
        .or_else(|| config.directory_path())
        .ok_or_else(|| anyhow!("No device directory configured"))?;
    let directory = Arc::new(FileDirectory::load(&directory_path).with_context(|| {
        format!("Failed to load device directory {}", directory_path.display())
    })?);

    let prober = Arc::new(SystemPinger::from_settings(&config.probe));
    let mut service: Service = ResetService::new(config.clone(), directory, prober);
    match config.require_credentials() {
        Ok(credentials) => {
            service = service.with_connector(Arc::new(SshClient::new(&config.ssh, credentials)));
        }
        Err(ConfigError::MissingCredentials) if !cli.command.needs_credentials() => {}
        Err(e) => return Err(e).context("SSH credentials unavailable"),
    }

    dispatch(&service, cli.command, cli.sse).await
}

async fn dispatch(service: &Service, command: Command, sse: bool) -> anyhow::Result<u8> {
    match command {
        Command::List => {
            print_value(&service.get_ip_and_location(), false)?;
            Ok(EXIT_OK)
        }
        Command::Reset { location, timeout } => {
            let response = service.reset_port(&location, timeout).await;
            print_value(&response, false)?;
            Ok(response_exit_code(&response))
        }
        Command::ResetAll { timeout } => match service.reset_all_locations_sse(timeout) {
            Ok(stream) => drain_batch(stream, sse).await,
            Err(response) => {
                print_value(&response, false)?;
                Ok(EXIT_FAILED)
            }
        },
        Command::ResetDown { timeout } => match service.reset_down_port_only_sse(timeout) {
            Ok(stream) => drain_batch(stream, sse).await,
            Err(response) => {
                print_value(&response, false)?;
                Ok(EXIT_FAILED)
            }
        },
        Command::Ping { location, count } => {
            let mut events = service.ping_sse_location(&location, count);
            let mut code = EXIT_FAILED;
            while let Some(event) = events.next().await {
                if matches!(event, PingEvent::Complete { .. }) {
                    code = EXIT_OK;
                }
                print_value(&event, sse)?;
            }
            Ok(code)
        }
        Command::Status { ip, location } => {
            let response = service.ping_single_status(&ip, &location).await;
            print_value(&response, false)?;
            Ok(response_exit_code(&response))
        }
        Command::Info => {
            print_value(&service.status(), false)?;
            Ok(EXIT_OK)
        }
    }
}

/// Print every batch event. Ctrl-C cancels the batch but keeps draining so
/// ports already disabled are re-enabled and the summary still prints.
async fn drain_batch(mut stream: EventStream, sse: bool) -> anyhow::Result<u8> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut summary = None;

    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                tracing::warn!(run_id = %stream.run_id(), "Interrupted; cancelling batch");
                stream.cancel();
            }
            event = stream.next() => match event {
                Some(event) => {
                    print_value(&event, sse)?;
                    if let EventKind::Summary(s) = event.kind {
                        summary = Some(s);
                    }
                }
                None => break,
            },
        }
    }

    match summary {
        Some(summary) => Ok(summary_exit_code(&summary)),
        None => Err(anyhow!("Batch ended without a summary")),
    }
}

fn print_value<T: Serialize>(value: &T, sse: bool) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    if sse {
        out.write_all(sse_frame(value).as_bytes())?;
    } else {
        serde_json::to_writer(&mut out, value)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
