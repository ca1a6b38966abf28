//! Replication between a master and a slave node
//!
//! This module implements:
//! - Chunked, concurrent, retrying data synchronization with a finer-grained
//!   replay pass over failed chunks
//! - The HA cluster supervisor that detects slave outages and replays the
//!   missed window on recovery
//! - Fixed-delay retry of node reads and writes

pub mod manager;
pub mod retry;
pub mod sync;

pub use manager::*;
pub use retry::RetryPolicy;
pub use sync::*;

use crate::client::ClientError;
use crate::config::GeneralSettings;
use crate::schema::SchemaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Chunk traversal order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyOrder {
    /// Most recent chunk first
    #[default]
    Reverse,
    /// Oldest chunk first
    Forward,
}

impl FromStr for CopyOrder {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reverse" | "backward" => Ok(CopyOrder::Reverse),
            "forward" => Ok(CopyOrder::Forward),
            other => Err(ReplicationError::InvalidOrder(other.to_string())),
        }
    }
}

impl fmt::Display for CopyOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyOrder::Reverse => f.write_str("reverse"),
            CopyOrder::Forward => f.write_str("forward"),
        }
    }
}

/// Sync engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Time span of one chunk
    pub chunk_duration: Duration,
    /// Upper bound on the window processed by one sync call
    pub max_retention: Duration,
    /// Concurrent measurement workers per chunk
    pub workers: usize,
    /// Maximum points per write call
    pub max_points_per_write: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&GeneralSettings::default())
    }
}

impl From<&GeneralSettings> for SyncSettings {
    fn from(general: &GeneralSettings) -> Self {
        Self {
            chunk_duration: general.data_chunk_duration(),
            max_retention: general.max_retention_interval(),
            workers: general.num_workers.max(1),
            max_points_per_write: general.max_points_on_single_write.max(1),
            retry: RetryPolicy::new(general.rw_max_retries(), general.rw_retry_delay()),
        }
    }
}

impl SyncSettings {
    pub fn with_chunk_duration(mut self, chunk: Duration) -> Self {
        self.chunk_duration = chunk;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Replication errors
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Invalid time window: start {start} is not before end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Invalid chunk duration: {0:?}")]
    InvalidChunk(Duration),

    #[error("Invalid copy order: {0}")]
    InvalidOrder(String),

    #[error("Node not configured: {0}")]
    NodeNotConfigured(String),

    #[error("Node {node} unavailable: {source}")]
    NodeUnavailable {
        node: String,
        #[source]
        source: ClientError,
    },

    #[error("No active connection to {0}")]
    NoConnection(String),

    #[error("Rename requires exactly one database, filters selected {0}")]
    InvalidRename(usize),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_order_parse() {
        assert_eq!("reverse".parse::<CopyOrder>().unwrap(), CopyOrder::Reverse);
        assert_eq!("backward".parse::<CopyOrder>().unwrap(), CopyOrder::Reverse);
        assert_eq!("Forward".parse::<CopyOrder>().unwrap(), CopyOrder::Forward);
        assert!("sideways".parse::<CopyOrder>().is_err());
        assert_eq!(CopyOrder::Forward.to_string(), "forward");
    }

    #[test]
    fn test_sync_settings_from_general() {
        let general = GeneralSettings {
            num_workers: 8,
            rw_max_retries: 0,
            ..Default::default()
        };
        let settings = SyncSettings::from(&general);
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.chunk_duration, Duration::from_secs(3600));
        assert_eq!(settings.max_points_per_write, 50_000);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.delay, Duration::from_secs(10));
    }
}
