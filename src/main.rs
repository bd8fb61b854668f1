//! Transpass - Caching Translation Pass-Through Engine
//!
//! Command line front end: translates strings through the configured
//! providers and manages quotas, caches and settings in the state directory.

use std::cell::RefCell;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracing_appender::{non_blocking, rolling};

use transpass::batch::{self, PendingItem};
use transpass::cache::CacheEntry;
use transpass::cli::{Args, CacheAction, Commands, QuotaAction, SettingsAction};
use transpass::config::Config;
use transpass::engine::{Engine, EngineOptions, TranslateRequest};
use transpass::provider::HttpProviderFactory;
use transpass::settings::Settings;
use transpass::store::{self, FileStore, SettingsStore};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new("transpass.toml").exists() {
                Config::from_file("transpass.toml")?
            } else {
                Config::default()
            }
        }
    };

    setup_logging(&config, args.verbose)?;

    let store: Arc<dyn SettingsStore> = Arc::new(FileStore::open(config.settings_path()).await?);
    let factory = Arc::new(HttpProviderFactory::new(&config)?);
    let engine = Engine::open(
        Arc::clone(&store),
        factory,
        EngineOptions {
            persist_delay: config.persist_delay(),
        },
    )
    .await?;

    let result = run_command(&engine, &store, args.command).await;
    finish(&engine, result).await
}

/// Flush pending cache writes whether or not the command succeeded
///
/// A command error wins over a flush error; the flush error is still logged.
async fn finish(engine: &Engine, result: Result<()>) -> Result<()> {
    let flushed = engine.shutdown().await;
    match (result, flushed) {
        (Err(e), Err(flush_error)) => {
            error!("Flushing caches after a failed command also failed: {}", flush_error);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), flushed) => Ok(flushed?),
    }
}

async fn run_command(engine: &Engine, store: &Arc<dyn SettingsStore>, command: Commands) -> Result<()> {
    match command {
        Commands::Translate { target, url, manual, json, texts } => {
            let texts = if texts.is_empty() { read_stdin_lines()? } else { texts };
            let (outputs, response) = translate_texts(engine, texts, target, url, manual).await?;
            if let Some(used) = &response.used_provider {
                info!("Served by {}", used);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                for output in &outputs {
                    println!("{}", output);
                }
                if let Some(error) = &response.error {
                    eprintln!("warning: {}", error);
                }
            }
        }

        Commands::Quota { action } => match action {
            QuotaAction::List => {
                let reports = engine.quota_report();
                if reports.is_empty() {
                    println!("No providers configured.");
                } else {
                    println!("\nProvider Quotas:");
                    println!("{:<48} {:<8} {:<8} {:>12} {:>12} {:>12} {:<8}",
                        "Quota Key", "Service", "Enabled", "Used", "Warn After", "Stop After", "Status");
                    println!("{}", "-".repeat(116));
                    for report in reports {
                        println!("{:<48} {:<8} {:<8} {:>12} {:>12} {:>12} {:<8}",
                            report.id,
                            report.service.to_string(),
                            if report.enabled { "yes" } else { "no" },
                            report.characters,
                            report.warn_after,
                            report.stop_after,
                            format!("{:?}", report.status));
                    }
                }
            }
            QuotaAction::Set { quota_key, characters } => {
                let record = engine.set_quota(&quota_key, characters).await?;
                println!("Set {} to {} characters (month {})", quota_key, record.characters, record.month + 1);
            }
        },

        Commands::Cache { action } => match action {
            CacheAction::Flush { name } => {
                engine.flush_cache(name.as_deref()).await?;
                println!("Flushed {}", name.as_deref().unwrap_or("default cache"));
            }
            CacheAction::Info => {
                let names = engine.caches().stored_names().await?;
                if names.is_empty() {
                    println!("No caches stored.");
                } else {
                    println!("\nStored Caches:");
                    println!("{:<40} {:>10}", "Name", "Entries");
                    println!("{}", "-".repeat(51));
                    for name in names {
                        let entries: Vec<CacheEntry> = store::get_as(store.as_ref(), &name).await?.unwrap_or_default();
                        println!("{:<40} {:>10}", name, entries.len());
                    }
                }
            }
        },

        Commands::Settings { action } => match action {
            SettingsAction::Show => {
                println!("{}", serde_json::to_string_pretty(&engine.settings())?);
            }
            SettingsAction::Import { file } => {
                let content = std::fs::read_to_string(&file)?;
                let settings: Settings = serde_json::from_str(&content)?;
                engine.save_settings(settings).await?;
                println!("Imported settings from {}", file.display());
            }
        },
    }

    Ok(())
}

/// Translate `texts`, sending each distinct string once
async fn translate_texts(
    engine: &Engine,
    texts: Vec<String>,
    target: Option<String>,
    url: Option<String>,
    manual: bool,
) -> Result<(Vec<String>, transpass::TranslateResponse)> {
    let outputs = RefCell::new(texts.clone());
    let pending: Vec<PendingItem<'_>> = texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let outputs = &outputs;
            PendingItem::new(text, move |output: &str| outputs.borrow_mut()[index] = output.to_string())
        })
        .collect();

    let mut unique = batch::deduplicate(pending);
    let inputs: Vec<String> = unique.iter().map(|item| item.input.clone()).collect();
    info!("Translating {} distinct strings", inputs.len());

    let response = engine
        .translate(TranslateRequest { target, inputs, url, manual })
        .await?;
    batch::apply_outputs(&mut unique, &response.outputs);
    drop(unique);

    Ok((outputs.into_inner(), response))
}

fn read_stdin_lines() -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Setup logging to both console and file
fn setup_logging(config: &Config, verbose: bool) -> Result<()> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "transpass.log");
    let (non_blocking_file, _guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(_guard);

    let log_level = if verbose { Level::DEBUG } else { Level::WARN };

    // Console output stays quiet unless asked for; stdout carries translations
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized - level: {}, file: {}",
          log_level, log_dir.join("transpass.log").display());

    Ok(())
}
