//! edubot - session bootstrap of a Matrix chat bot.
//!
//! Turns a YAML configuration into an authenticated, persistent and encryption
//! capable Matrix session, then keeps it synced until the process is stopped.
//!
//! # Usage
//!
//! ```bash
//! edubot --config config.yaml
//! ```
//!
//! Any configuration value can be overridden with an `EDUBOT_` environment
//! variable, see [`config`]:
//!
//! ```bash
//! export EDUBOT_MATRIX__USER_TOKEN="syt_..."
//! edubot --config config.yaml
//! ```
//!
//! # Startup
//!
//! 1. Load the configuration and install the logger
//! 2. Resolve the credential: access token if set, password otherwise
//! 3. Open the store directory and the bot database
//! 4. Authenticate and check the device against the store, then attach the
//!    encryption store to the Matrix client
//! 5. Sync until Ctrl-C
//!
//! Startup stops at the first error, which is logged. Ctrl-C at any point
//! cancels what is in flight and releases the store.
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Overrides `logging.level` (e.g. `debug`, `edubot=trace`)

use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};

use crate::{bootstrap::Bootstrapper, config::Config, matrix::BotIdentity};

mod bootstrap;
mod config;
mod error;
mod logging;
mod matrix;
mod storage;

/// Command-line arguments for the edubot.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // The logger is configured by the file, so failures here go to stderr
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config file: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to set up logging: {e:#}");
        return ExitCode::FAILURE;
    }

    info!("Starting edubot {}...", env!("CARGO_PKG_VERSION"));

    // Validated by Config::load
    let identity = match BotIdentity::from_config(&config.matrix) {
        Ok(identity) => identity,
        Err(e) => {
            error!("Invalid matrix configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let mut bootstrapper = match Bootstrapper::from_config(&config, &identity) {
        Ok(bootstrapper) => bootstrapper,
        Err(e) => {
            error!("Failed to create the homeserver client: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let session = tokio::select! {
        result = bootstrapper.run(&config, &identity) => match result {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to start the session: {e}");
                return ExitCode::FAILURE;
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted during startup");
            return ExitCode::FAILURE;
        }
    };

    let exit_code = tokio::select! {
        result = session.sync() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Sync stopped: {e:#}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            ExitCode::SUCCESS
        }
    };

    session.close().await;
    exit_code
}
