//! Quark
//!
//! Runs script-driven applications on a confined JavaScript engine, either
//! in this process or in a sandbox process.

mod console;
mod navigator;
mod package;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use quark_runtime::config::{LogFormat, LoggingConfig};
use quark_runtime::types::Locale;
use quark_runtime::{AppRuntime, Backend, QuarkConfig, RuntimeError};

use console::ConsoleHost;
use navigator::Navigator;
use package::AppPackage;

/// Quark application runtime
#[derive(Parser, Debug)]
#[command(name = "quark")]
#[command(about = "Quark application runtime", long_about = None)]
struct Cli {
    /// Configuration file (defaults to quark.toml in the working directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an application until Ctrl-C
    Run {
        /// Path to the application directory
        app: PathBuf,

        /// Run scripts in a sandbox process
        #[arg(long)]
        sandbox: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Validate an application directory without running it
    Check {
        /// Path to the application directory
        app: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<QuarkConfig> {
    let config = match path {
        Some(path) => QuarkConfig::load_from(path)?,
        None => QuarkConfig::load()?,
    };
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run {
            app,
            sandbox,
            duration,
        } => {
            if sandbox {
                config.engine.backend = Backend::Sandbox;
            }
            init_tracing(&config.logging);
            run(&config, &app, duration.map(Duration::from_secs))
        }
        Command::Check { app } => {
            init_tracing(&config.logging);
            check(&app)
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn check(path: &Path) -> Result<()> {
    let package = AppPackage::load(path)
        .with_context(|| format!("{} is not a valid app", path.display()))?;
    println!(
        "{} {} ({}): {} pages, entry '{}'",
        package.manifest.package,
        package.manifest.version_name,
        package.manifest.name,
        package.pages.len(),
        package.manifest.router.entry
    );
    Ok(())
}

fn run(config: &QuarkConfig, path: &Path, duration: Option<Duration>) -> Result<()> {
    info!("Starting quark v{}", env!("CARGO_PKG_VERSION"));
    let package = AppPackage::load(path)?;
    let Some(entry) = package.entry_page() else {
        bail!("entry page '{}' missing", package.manifest.router.entry);
    };

    let (navigation_tx, mut navigation_rx) = mpsc::unbounded_channel();
    let host = Arc::new(ConsoleHost::new(navigation_tx));
    let app = AppRuntime::start(config, host).context("failed to start runtime")?;
    info!(
        "App {} running on {:?} backend",
        package.manifest.package, config.engine.backend
    );

    app.attach("", &package.manifest.package);
    app.update_locale(
        Locale {
            language: config.app.language.clone(),
            country: config.app.country.clone(),
        },
        package.manifest.resources.clone(),
    );
    app.create_application(
        &package.app_script,
        &package.app_style,
        package.raw_manifest.clone(),
    );
    app.show_application();

    let mut navigator =
        Navigator::new(&app, &package).with_ready_timeout(config.app.page_ready_timeout());
    navigator.open(entry, Value::Null)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let deadline = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down");
                    break;
                }
                _ = &mut deadline => {
                    info!("Run duration elapsed, shutting down");
                    break;
                }
                request = navigation_rx.recv() => {
                    let Some(request) = request else { break };
                    match navigator.handle(request) {
                        Ok(true) => {}
                        Ok(false) => {
                            info!("Last page closed, shutting down");
                            break;
                        }
                        Err(e @ RuntimeError::PageNotReady(_)) => {
                            warn!("Navigation skipped: {}", e);
                        }
                        Err(e) => {
                            error!("Navigation failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    });

    app.hide_application();
    app.shutdown(config.app.shutdown_delay());
    if let Err(e) = app.join() {
        warn!("Runtime did not stop cleanly: {}", e);
    }
    info!("quark stopped");
    Ok(())
}
