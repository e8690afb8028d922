#![warn(missing_docs)]

//! `qg-engine`: replays accounting records through the engine against a static catalog.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quotagate_enforce::Dispatcher;
use quotagate_engine::{AccountingEvent, Catalog, Engine, EngineConfig, LoggingNasClient};
use quotagate_policy::SystemClock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "qg-engine")]
#[command(about = "QuotaGate quota and bandwidth enforcement engine", long_about = None)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true, env = "QG_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Feeds JSON-lines accounting records through the engine.
    Run {
        /// Engine settings (TOML or JSON). Defaults apply when the file is absent.
        #[arg(short, long, default_value = "/etc/quotagate/engine.toml")]
        config: PathBuf,
        /// Plans, CDNs, devices, subscribers and rules.
        #[arg(long)]
        catalog: PathBuf,
        /// Records to replay; stdin when omitted.
        #[arg(short, long)]
        events: Option<PathBuf>,
    },
    /// Validates settings and catalog, then exits.
    Check {
        #[arg(short, long, default_value = "/etc/quotagate/engine.toml")]
        config: PathBuf,
        #[arg(long)]
        catalog: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn load(config_path: &Path, catalog_path: &Path) -> Result<(EngineConfig, Catalog)> {
    let config = if config_path.exists() {
        EngineConfig::from_file(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
        EngineConfig::default()
    };
    config.validate()?;

    let catalog = Catalog::from_file(catalog_path)
        .with_context(|| format!("loading {}", catalog_path.display()))?;
    catalog.validate()?;
    Ok((config, catalog))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Check { config, catalog } => {
            let (_, catalog) = load(&config, &catalog)?;
            println!(
                "ok: {} plans, {} cdns, {} devices, {} subscribers, {} overrides, {} global rules",
                catalog.plans.len(),
                catalog.cdns.len(),
                catalog.devices.len(),
                catalog.subscribers.len(),
                catalog.overrides.len(),
                catalog.globals.len()
            );
            Ok(())
        }
        Command::Run {
            config,
            catalog,
            events,
        } => {
            let (config, catalog) = load(&config, &catalog)?;
            match events {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("opening {}", path.display()))?;
                    run(config, catalog, BufReader::new(file)).await
                }
                None => run(config, catalog, BufReader::new(tokio::io::stdin())).await,
            }
        }
    }
}

async fn run<R>(config: EngineConfig, catalog: Catalog, input: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let client = Arc::new(LoggingNasClient::new());
    let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone(), client.clone()));
    for device in &catalog.devices {
        dispatcher.add_device(device.clone());
    }
    let rules = Arc::new(catalog.rule_repository(config.utc_offset()?)?);
    let store = Arc::new(catalog.memory_store());

    let engine = Engine::start(
        &config,
        store,
        &catalog,
        rules,
        Arc::clone(&dispatcher),
        Arc::new(SystemClock),
    )?;

    let mut malformed = 0u64;
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match AccountingEvent::from_json_line(&line) {
            Ok(event) => engine.submit(event).await?,
            Err(e) => {
                malformed += 1;
                tracing::warn!(error = %e, "skipping malformed record");
            }
        }
    }

    let engine_stats = engine.shutdown().await;
    dispatcher.shutdown().await;

    let report = serde_json::json!({
        "engine": engine_stats,
        "dispatcher": dispatcher.stats(),
        "devices": dispatcher.devices(),
        "malformed_lines": malformed,
        "commands_logged": client.commands(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
