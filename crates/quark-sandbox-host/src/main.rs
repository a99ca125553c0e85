//! Quark Sandbox Host
//!
//! Runs an application's scripts on behalf of a `quark` process. Started by
//! the process launcher with the control socket as stdin; never run by hand.
//! Logs go to stderr, which the launcher shares with its own.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use quark_runtime::config::{LogFormat, LoggingConfig, QuarkConfig, SandboxSettings};
use quark_runtime::launcher::{accept_handshake, exit_process};
use quark_runtime::sandbox::SandboxRuntime;

/// Quark sandboxed script host
#[derive(Parser, Debug)]
#[command(name = "quark-sandbox-host")]
#[command(about = "Quark sandboxed script host", long_about = None)]
struct Args {
    /// Configuration file (defaults to quark.toml in the working directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Engine, channel and logging settings from the app, as JSON
    #[arg(long)]
    settings: Option<String>,

    /// Override the engine memory limit
    #[arg(long)]
    memory_limit_mb: Option<usize>,
}

/// File and environment first, then the app's settings, then flags.
fn resolve_config(args: &Args) -> Result<QuarkConfig> {
    let mut config = match &args.config {
        Some(path) => QuarkConfig::load_from(path)?,
        None => QuarkConfig::load()?,
    };
    if let Some(settings) = &args.settings {
        SandboxSettings::decode(settings)
            .context("unreadable --settings")?
            .apply_to(&mut config);
    }
    if let Some(limit) = args.memory_limit_mb {
        config.engine.memory_limit_mb = limit;
    }
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = resolve_config(&args)?;

    init_tracing(&config.logging);
    info!("Starting quark-sandbox-host v{} (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());

    let binding = accept_handshake(exit_process()).context("handshake with app failed")?;
    let runtime = SandboxRuntime::serve(
        binding.passive,
        binding.positive,
        config.engine,
        &config.channel,
    )
    .context("failed to start sandbox runtime")?;

    runtime.wait()?;
    // The app closing its end from here on is expected.
    binding.watch.disarm();
    info!("quark-sandbox-host stopped");
    Ok(())
}
