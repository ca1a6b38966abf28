//! Database transport boundary
//!
//! The replication core talks to time-series nodes only through the traits in
//! this module:
//! - [`Connector`] opens a client for a configured node
//! - [`DbClient`] pings, runs typed statements and writes point batches
//!
//! Two transports ship with the crate: the InfluxDB 1.x HTTP API
//! ([`http::HttpClient`]) and an in-process store ([`memory::MemoryNode`]).

pub mod http;
pub mod influxql;
pub mod line_protocol;
pub mod memory;

pub use influxql::{RetentionPolicySpec, Statement};

use crate::config::NodeConfig;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Statement error: {0}")]
    Statement(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Node unavailable: {0}")]
    Unavailable(String),
}

impl ClientError {
    /// True when the server refused a create because the object is already there
    pub fn is_already_exists(&self) -> bool {
        match self {
            ClientError::Statement(msg) | ClientError::Server { message: msg, .. } => {
                msg.contains("already exists")
            }
            _ => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A statement addressed to an optional database / retention policy
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub statement: Statement,
    pub database: Option<String>,
    pub retention_policy: Option<String>,
}

impl Query {
    pub fn new(statement: Statement) -> Self {
        Self {
            statement,
            database: None,
            retention_policy: None,
        }
    }

    pub fn on_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_retention_policy(mut self, rp: impl Into<String>) -> Self {
        self.retention_policy = Some(rp.into());
        self
    }

    /// Rendered query text
    pub fn command(&self) -> String {
        self.statement.to_influxql()
    }
}

/// Query response as returned by the server, one result per statement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<StatementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatementResult {
    #[serde(default)]
    pub statement_id: usize,
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One tabular result series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

impl Series {
    /// Position of a named column
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

impl QueryResponse {
    pub fn single(series: Vec<Series>) -> Self {
        Self {
            results: vec![StatementResult {
                statement_id: 0,
                series,
                error: None,
            }],
            error: None,
        }
    }

    /// First error reported, either for the whole request or for a statement
    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.results.iter().find_map(|r| r.error.as_deref()))
    }

    /// Convert statement-level errors into [`ClientError::Statement`]
    pub fn into_result(self) -> ClientResult<Self> {
        match self.error_message() {
            Some(msg) => Err(ClientError::Statement(msg.to_string())),
            None => Ok(self),
        }
    }

    /// All series of all statements
    pub fn series(&self) -> impl Iterator<Item = &Series> {
        self.results.iter().flat_map(|r| r.series.iter())
    }

    pub fn first_series(&self) -> Option<&Series> {
        self.series().next()
    }
}

/// Typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

impl FieldValue {
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Integer(v) => Value::from(*v),
            FieldValue::Boolean(v) => Value::Bool(*v),
            FieldValue::String(v) => Value::String(v.clone()),
        }
    }

    /// Declared type name as the server reports it in `SHOW FIELD KEYS`
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Float(_) => "float",
            FieldValue::Integer(_) => "integer",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::String(_) => "string",
        }
    }
}

/// A single time-series point, timestamp in nanoseconds since the epoch
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Points bound for one database / retention policy, nanosecond precision
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPoints {
    pub database: String,
    pub retention_policy: String,
    pub points: Vec<Point>,
}

impl BatchPoints {
    pub fn new(database: impl Into<String>, retention_policy: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            retention_policy: retention_policy.into(),
            points: Vec::new(),
        }
    }

    pub fn with_points(mut self, points: Vec<Point>) -> Self {
        self.points = points;
        self
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Split into batches of at most `max_points` points each
    pub fn split(self, max_points: usize) -> Vec<BatchPoints> {
        let max_points = max_points.max(1);
        if self.points.len() <= max_points {
            return vec![self];
        }

        let BatchPoints {
            database,
            retention_policy,
            points,
        } = self;

        let mut batches = Vec::with_capacity(points.len() / max_points + 1);
        let mut iter = points.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<Point> = iter.by_ref().take(max_points).collect();
            batches.push(BatchPoints {
                database: database.clone(),
                retention_policy: retention_policy.clone(),
                points: chunk,
            });
        }
        batches
    }
}

/// Result of a liveness ping
#[derive(Debug, Clone, PartialEq)]
pub struct PingInfo {
    pub latency: Duration,
    pub version: String,
}

/// Query/write transport to one node
///
/// Statement-level errors reported by the server surface as
/// [`ClientError::Statement`], never as an `Ok` response.
#[async_trait]
pub trait DbClient: Send + Sync {
    async fn ping(&self) -> ClientResult<PingInfo>;

    async fn query(&self, query: &Query) -> ClientResult<QueryResponse>;

    async fn write(&self, batch: &BatchPoints) -> ClientResult<()>;
}

/// Opens clients for configured nodes
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &NodeConfig) -> ClientResult<Arc<dyn DbClient>>;
}

/// Nanoseconds since the epoch, saturating outside the representable range
pub fn epoch_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(if t.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

pub fn from_epoch_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64) -> Point {
        Point::new("cpu", ts).field("value", FieldValue::Float(1.5))
    }

    #[test]
    fn test_batch_split_limits_size() {
        let points: Vec<Point> = (0..125).map(point).collect();
        let batches = BatchPoints::new("db", "rp").with_points(points).split(50);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 50);
        assert_eq!(batches[1].len(), 50);
        assert_eq!(batches[2].len(), 25);
        assert!(batches.iter().all(|b| b.database == "db" && b.retention_policy == "rp"));
        assert_eq!(batches[2].points[0].timestamp, 100);
    }

    #[test]
    fn test_batch_split_small_batch_untouched() {
        let batch = BatchPoints::new("db", "rp").with_points((0..10).map(point).collect());
        let batches = batch.clone().split(50_000);
        assert_eq!(batches, vec![batch]);
    }

    #[test]
    fn test_response_error_surfaces() {
        let json = r#"{"results":[{"statement_id":0,"error":"database not found: foo"}]}"#;
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.error_message(), Some("database not found: foo"));
        assert!(matches!(response.into_result(), Err(ClientError::Statement(_))));
    }

    #[test]
    fn test_response_series_parse() {
        let json = r#"{"results":[{"statement_id":0,"series":[{"name":"cpu","tags":{"host":"a"},"columns":["time","value"],"values":[[1000,0.5]]}]}]}"#;
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        let series = response.first_series().unwrap();
        assert_eq!(series.name, "cpu");
        assert_eq!(series.tags.get("host").map(String::as_str), Some("a"));
        assert_eq!(series.column("value"), Some(1));
    }

    #[test]
    fn test_already_exists_detection() {
        let err = ClientError::Statement("retention policy already exists".to_string());
        assert!(err.is_already_exists());
        assert!(!ClientError::Timeout(Duration::from_secs(1)).is_already_exists());
    }

    #[test]
    fn test_epoch_nanos_roundtrip() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(from_epoch_nanos(epoch_nanos(t)), t);
    }
}
