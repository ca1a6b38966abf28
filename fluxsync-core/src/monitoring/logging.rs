//! Logging initialisation with tracing
//!
//! Compact text or JSON output, to stdout or to `<log_dir>/fluxsync.log`.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Log file name inside the log directory
pub const LOG_FILE_NAME: &str = "fluxsync.log";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub level: String,

    /// Enable JSON format output
    pub json_format: bool,

    /// Directory for the log file (logs to stdout if None)
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            json_format: false,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    /// Parse log level from string
    pub fn parse_level(&self) -> Level {
        match self.level.to_uppercase().as_str() {
            "ERROR" => Level::ERROR,
            "WARN" | "WARNING" => Level::WARN,
            "INFO" => Level::INFO,
            "DEBUG" => Level::DEBUG,
            "TRACE" => Level::TRACE,
            _ => Level::INFO,
        }
    }

    /// Level for `-v` repetitions in one-shot modes
    pub fn level_for_verbosity(verbosity: u8) -> &'static str {
        match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|d| d.join(LOG_FILE_NAME))
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

/// Initialize the logging system
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.parse_level().as_str().to_lowercase()));

    let subscriber = Registry::default().with(env_filter);

    let result = match (config.log_file(), config.json_format) {
        (Some(path), true) => {
            let file = open_log_file(&path)?;
            subscriber
                .with(fmt::layer().json().with_target(true).with_writer(Mutex::new(file)))
                .try_init()
        }
        (Some(path), false) => {
            let file = open_log_file(&path)?;
            subscriber
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .compact()
                        .with_writer(Mutex::new(file)),
                )
                .try_init()
        }
        (None, true) => subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init(),
        (None, false) => subscriber
            .with(fmt::layer().with_target(true).compact())
            .try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(
        "Logging initialized: level={}, json={}, file={:?}",
        config.level,
        config.json_format,
        config.log_file()
    );

    Ok(())
}
