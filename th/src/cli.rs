//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::{TaskStatus, TaskUpdate};

/// TaskHistory - persistent status store for background jobs
#[derive(Parser, Debug)]
#[command(name = "th")]
#[command(author, version, about = "Persistent status store for background jobs", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a new processing task and print its id
    Create {
        /// Initial status message
        #[arg(short, long)]
        message: Option<String>,

        /// Initial progress (0-100)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
        progress: Option<u8>,

        /// Extra field as key=value (value parsed as JSON when possible)
        #[arg(short = 'x', long = "extra", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        extra: Vec<(String, Value)>,
    },

    /// Update an existing task
    Update {
        /// Task ID
        #[arg(required = true)]
        id: String,

        /// New status (processing, completed, error)
        status: Option<TaskStatus>,

        /// Status message
        #[arg(short, long)]
        message: Option<String>,

        /// Error description
        #[arg(short, long)]
        error: Option<String>,

        /// Progress (0-100)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
        progress: Option<u8>,

        /// Extra field as key=value (value parsed as JSON when possible)
        #[arg(short = 'x', long = "extra", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        extra: Vec<(String, Value)>,
    },

    /// Show a task
    Get {
        /// Task ID
        #[arg(required = true)]
        id: String,
    },

    /// List tasks, newest first
    List {
        /// Only tasks with this status
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Maximum tasks to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Wait for a task to reach completed or error
    Wait {
        /// Task ID
        #[arg(required = true)]
        id: String,

        /// Timeout in seconds (default from config)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Remove tasks older than the retention window
    Prune,
}

/// Build a TaskUpdate from CLI fields
pub fn build_update(
    status: Option<TaskStatus>,
    message: Option<String>,
    error: Option<String>,
    progress: Option<u8>,
    extra: Vec<(String, Value)>,
) -> TaskUpdate {
    TaskUpdate {
        status,
        message,
        error,
        progress,
        extra: extra.into_iter().collect(),
    }
}

/// Parse `key=value`; the value is JSON if it parses as JSON, else a string
pub fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    debug!(%s, "parse_key_value: called");
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Empty key in '{}'", s));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Output format for task records
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
