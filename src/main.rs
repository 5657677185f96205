use std::process::ExitCode;

use clap::Parser;

use poe_reset::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging with file output.
    let log_dir = poe_reset::config::paths::ensure_log_dir().ok();
    let _guard = poe_reset::logging::init_logging(log_dir);

    tracing::info!("Starting poe-reset");
    if let Some(dir) = poe_reset::config::paths::log_dir() {
        tracing::debug!("Logging to {}", dir.display());
    }

    match cli::run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(cli::EXIT_FAILED)
        }
    }
}
