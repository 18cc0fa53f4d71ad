//! RateMesh node binary
//!
//! `ratemesh run` starts the node with its background loops. The other
//! subcommands answer a single request and exit.

use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratemesh_node::{NodeConfig, RateNode};

#[derive(Parser)]
#[command(name = "ratemesh", version, about = "Exchange-rate resolution node")]
struct Cli {
    /// Providers file, overriding RATEMESH_PROVIDERS_FILE.
    #[arg(long, global = true)]
    providers: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until interrupted.
    Run,
    /// Resolve the best rate between two currencies.
    Resolve {
        from: String,
        to: String,
        /// As-of date (YYYY-MM-DD).
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Skip the cache and ask providers directly.
        #[arg(long)]
        no_cache: bool,
    },
    /// Convert an amount.
    Convert {
        amount: f64,
        from: String,
        to: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List alternative conversion paths, best first.
    Paths {
        from: String,
        to: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Enter a manual rate, then resolve it.
    SetManual { base: String, target: String, rate: f64 },
    /// Check every configured provider.
    Providers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = NodeConfig::from_env();
    if let Some(path) = cli.providers.clone() {
        config.providers_file = Some(path);
    }

    init_tracing(&config.log_level, matches!(cli.command, Command::Run));

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let node = RateNode::build(config).await?;
    let orchestrator = node.orchestrator().clone();

    match cli.command {
        Command::Run => return run(node).await,
        Command::Resolve {
            from,
            to,
            date,
            no_cache,
        } => {
            let quote = if no_cache {
                orchestrator.resolve_rate_uncached(&from, &to, date).await?
            } else {
                orchestrator.resolve_rate(&from, &to, date).await?
            };
            print_json(&quote)?;
        }
        Command::Convert { amount, from, to, date } => {
            print_json(&orchestrator.convert(amount, &from, &to, date).await?)?;
        }
        Command::Paths { from, to, date } => {
            print_json(&orchestrator.find_paths(&from, &to, date).await?)?;
        }
        Command::SetManual { base, target, rate } => {
            orchestrator.set_manual_rate(&base, &target, rate).await?;
            print_json(&orchestrator.resolve_rate(&base, &target, None).await?)?;
        }
        Command::Providers => {
            print_json(&orchestrator.check_providers().await)?;
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

async fn run(node: RateNode) -> anyhow::Result<()> {
    info!("Starting RateMesh node");
    node.start();

    wait_for_shutdown(&node).await?;

    info!("Shutdown signal received");
    node.stop().await;
    info!("RateMesh node shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C, reloading plugin providers on SIGHUP.
#[cfg(unix)]
async fn wait_for_shutdown(node: &RateNode) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("listening for Ctrl+C")?;
                return Ok(());
            }
            _ = hangup.recv() => match node.reload_plugins().await {
                Ok(count) => info!(reloaded = count, "Plugin providers reloaded"),
                Err(e) => error!(error = %e, "Plugin reload failed"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_node: &RateNode) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("listening for Ctrl+C")?;
    Ok(())
}
