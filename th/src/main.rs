//! TaskHistory - persistent status store for background jobs
//!
//! CLI entry point for creating, updating, and inspecting tasks.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::{debug, info};

use taskhistory::cli::{Cli, Command, OutputFormat, build_update};
use taskhistory::config::Config;
use taskhistory::{StateError, StateManager, TaskRecord, TaskStatus};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskhistory")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(|s| s.to_uppercase()) {
        None => tracing::Level::INFO,
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("taskhistory.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let store = StateManager::spawn(&config.store)?;

    debug!(command = ?cli.command, "main: dispatching command");
    let result = run(&store, &config, cli.command, cli.format).await;

    store.shutdown().await?;
    result
}

async fn run(store: &StateManager, config: &Config, command: Command, format: OutputFormat) -> Result<()> {
    match command {
        Command::Create {
            message,
            progress,
            extra,
        } => {
            let update = build_update(None, message, None, progress, extra);
            let id = store.create_task(update).await?;
            match format {
                OutputFormat::Json => print_record(&store.get_task(&id).await?, format)?,
                OutputFormat::Text => println!("{} Created task: {}", "✓".green(), id.cyan()),
            }
        }
        Command::Update {
            id,
            status,
            message,
            error,
            progress,
            extra,
        } => {
            let update = build_update(status, message, error, progress, extra);
            match store.update_task(&id, update).await? {
                Some(record) => print_record(&record, format)?,
                None => {
                    // Unknown ids are ignored by the store; surface that here
                    eyre::bail!(StateError::NotFound(id));
                }
            }
        }
        Command::Get { id } => {
            let record = store.get_task(&id).await?;
            print_record(&record, format)?;
        }
        Command::List { status, limit } => {
            let records = store.list(status, limit).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&json_records(&records))?),
                OutputFormat::Text if records.is_empty() => println!("No tasks found"),
                OutputFormat::Text => {
                    for record in &records {
                        println!(
                            "{} {:<10} {}",
                            record.id.cyan(),
                            colored_status(record.status),
                            record.message.as_deref().unwrap_or("").dimmed()
                        );
                    }
                }
            }
        }
        Command::Wait { id, timeout } => {
            let secs = timeout.unwrap_or(config.wait.timeout_secs);
            let record = store.wait_for_task(&id, secs).await?;
            print_record(&record, format)?;
        }
        Command::Prune => {
            let removed = store.prune().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
                OutputFormat::Text => println!("{} Pruned {} task(s)", "✓".green(), removed),
            }
        }
    }
    Ok(())
}

fn colored_status(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Processing => status.to_string().yellow(),
        TaskStatus::Completed => status.to_string().green(),
        TaskStatus::Error => status.to_string().red(),
    }
}

/// The record as stored, with its id inlined
fn json_record(record: &TaskRecord) -> serde_json::Value {
    let mut value = serde_json::to_value(record).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.insert("id".to_string(), serde_json::Value::String(record.id.clone()));
    }
    value
}

fn json_records(records: &[TaskRecord]) -> Vec<serde_json::Value> {
    records.iter().map(json_record).collect()
}

fn print_record(record: &TaskRecord, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&json_record(record))?);
        return Ok(());
    }

    println!("Task: {}", record.id.cyan());
    println!("  Status: {}", colored_status(record.status));
    if let Some(message) = &record.message {
        println!("  Message: {}", message);
    }
    if let Some(error) = &record.error {
        println!("  Error: {}", error.red());
    }
    if let Some(progress) = record.progress {
        println!("  Progress: {}%", progress);
    }
    println!("  Created: {}", record.created_at.dimmed());
    println!("  Updated: {}", record.updated_at.dimmed());
    if let Some(at) = record.completed_at.as_ref().or(record.error_at.as_ref()) {
        println!("  Finished: {}", at.dimmed());
    }
    for (key, value) in &record.extra {
        println!("  {}: {}", key, value);
    }
    Ok(())
}
