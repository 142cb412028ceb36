//! `engined`, the container engine daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────┐
//!                 │                       ORCHESTRATOR                        │
//!   flags + file  │  ┌────────┐   ┌───────────┐   ┌────────────┐             │
//!   ──────────────┼─▶│ config │──▶│ listeners │──▶│ supervisor │             │
//!                 │  └────────┘   │ + policy  │   │ (runtime)  │             │
//!                 │               └───────────┘   └─────┬──────┘             │
//!                 │                                     ▼                    │
//!                 │  ┌────────────┐ ┌──────┐ ┌───────┐ ┌─────────┐ ┌───────┐ │
//!                 │  │ middleware │▶│ core │▶│ authz │▶│ cluster │▶│ build │ │
//!                 │  └────────────┘ └──────┘ └───────┘ └─────────┘ └───┬───┘ │
//!                 │                                                    ▼     │
//!   API clients   │  ┌──────────────────────────────────────────────────┐   │
//!   ◀─────────────┼──│ listener pool: one serve task per listener       │   │
//!                 │  └──────────────────────────────────────────────────┘   │
//!                 │                                                          │
//!   SIGINT/TERM ──┼─▶ shutdown signal ─▶ drain ─▶ teardown stack (LIFO)      │
//!   SIGHUP ───────┼─▶ reload gate ─▶ reload controller ─▶ live config swap   │
//!                 └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use engine_daemon::config::LogFormat;
use engine_daemon::lifecycle::Notifier;
use engine_daemon::observability::init_logging;
use engine_daemon::{ConfigSource, EmbeddedPlatform, FlagOverrides, Orchestrator, OrchestratorOptions};

#[derive(Parser)]
#[command(name = "engined")]
#[command(about = "Container engine daemon", long_about = None, version)]
struct Cli {
    /// Daemon configuration file
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Daemon socket(s) to connect to
    #[arg(short = 'H', long = "host")]
    hosts: Vec<String>,

    /// Use TLS; implied by --tlsverify
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    tls: Option<bool>,

    /// Use TLS and verify the remote
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    tlsverify: Option<bool>,

    /// Trust certs signed only by this CA
    #[arg(long)]
    tlscacert: Option<PathBuf>,

    /// Path to TLS certificate file
    #[arg(long)]
    tlscert: Option<PathBuf>,

    /// Path to TLS key file
    #[arg(long)]
    tlskey: Option<PathBuf>,

    /// Set the logging level
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Set the logging format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Enable debug mode
    #[arg(short = 'D', long, num_args = 0..=1, default_missing_value = "true")]
    debug: Option<bool>,

    /// Enable experimental features
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    experimental: Option<bool>,

    /// Validate daemon configuration and exit
    #[arg(long)]
    validate: bool,

    /// Reload when the configuration file changes
    #[arg(long)]
    watch_config: bool,
}

impl Cli {
    fn overrides(&self) -> FlagOverrides {
        FlagOverrides {
            hosts: self.hosts.clone(),
            tls: self.tls,
            tls_verify: self.tlsverify,
            ca_file: self.tlscacert.clone(),
            cert_file: self.tlscert.clone(),
            key_file: self.tlskey.clone(),
            debug: self.debug,
            log_level: self.log_level.clone(),
            log_format: self.log_format,
            experimental: self.experimental,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let source = ConfigSource::new(cli.config_file.clone(), cli.overrides());

    let config = match source.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if cli.validate {
        eprintln!("configuration OK");
        return ExitCode::SUCCESS;
    }

    let log = match init_logging(&config) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("failed to initialise logging: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "engined starting");

    let options = OrchestratorOptions {
        notifier: Notifier::from_env(),
        signal_handlers: true,
        watch_config: cli.watch_config,
        ..OrchestratorOptions::default()
    };
    let orchestrator =
        Orchestrator::new(Arc::new(EmbeddedPlatform::new()), source, config, log).with_options(options);

    match orchestrator.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Daemon exited with error");
            ExitCode::FAILURE
        }
    }
}
