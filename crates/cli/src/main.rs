//! Comanda CLI - Simulate customer sessions against an in-memory store.
//!
//! # Usage
//!
//! ```bash
//! # Replay a fixture: sign in, backfill, cart script, checkout, history
//! comanda simulate crates/cli/fixtures/demo.yaml
//!
//! # Only link the fixture's guest orders to the account
//! comanda link crates/cli/fixtures/demo.yaml
//! ```
//!
//! # Commands
//!
//! - `simulate` - Run a full session from a YAML fixture
//! - `link` - Run the backfill on its own and show it is idempotent
//!
//! Configuration comes from the environment (see `comanda_sync::config`).
//! Set `RUST_LOG` to change verbosity.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comanda_sync::SyncConfig;

mod commands;
mod fixture;

#[derive(Parser)]
#[command(name = "comanda")]
#[command(author, version, about = "Comanda order and cart sync tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a customer session from a fixture
    Simulate {
        /// Path to the YAML fixture
        fixture: PathBuf,
    },
    /// Link guest orders to the fixture's account
    Link {
        /// Path to the YAML fixture
        fixture: PathBuf,
    },
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &SyncConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        tracing::Level::TRACE => sentry_tracing::EventFilter::Ignore,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Sentry must be initialized before the tracing subscriber
    let config = SyncConfig::from_env();
    let _sentry_guard = config.as_ref().ok().and_then(init_sentry);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "comanda_sync=info,comanda_cli=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(cli, &config).await {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: &SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Simulate { fixture } => commands::simulate::run(&fixture, config).await?,
        Commands::Link { fixture } => commands::link::run(&fixture, config).await?,
    }
    Ok(())
}
