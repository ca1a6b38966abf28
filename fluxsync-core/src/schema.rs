//! Schema catalog
//!
//! Discovers the replicable structure of a node (databases, retention policies,
//! measurements and field types) and materializes it on another node. Field
//! types discovered here also drive the decoding of query rows into points.

use crate::client::{
    ClientError, DbClient, FieldValue, Point, Query, RetentionPolicySpec, Series, Statement,
};
use crate::client::influxql::parse_duration;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Database never discovered nor created
pub const INTERNAL_DATABASE: &str = "_internal";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Invalid {kind} filter '{pattern}': {source}")]
    InvalidFilter {
        kind: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Schema discovery failed on {node}: {source}")]
    Discovery {
        node: String,
        #[source]
        source: ClientError,
    },
}

/// Data-shape error for a single cell
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("field {field}: expected {expected}, got {value}")]
    FieldType {
        field: String,
        expected: FieldType,
        value: String,
    },

    #[error("unrecognized timestamp {0}")]
    Timestamp(String),

    #[error("series {0} has no time column")]
    MissingTime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Float,
    Integer,
    Boolean,
    String,
}

impl FieldType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "float" => Some(FieldType::Float),
            "integer" | "unsigned" => Some(FieldType::Integer),
            "boolean" => Some(FieldType::Boolean),
            "string" => Some(FieldType::String),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Float => "float",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::String => "string",
        }
    }

    /// Decode one cell according to the declared type
    pub fn decode(self, field: &str, value: &Value) -> Result<FieldValue, DecodeError> {
        let decoded = match (self, value) {
            (FieldType::Float, Value::Number(n)) => n.as_f64().map(FieldValue::Float),
            (FieldType::Float, Value::String(s)) => s.parse().ok().map(FieldValue::Float),
            (FieldType::Integer, Value::Number(n)) => n.as_i64().map(FieldValue::Integer),
            (FieldType::Integer, Value::String(s)) => s.parse().ok().map(FieldValue::Integer),
            (FieldType::Boolean, Value::Bool(b)) => Some(FieldValue::Boolean(*b)),
            (FieldType::Boolean, Value::String(s)) => s.parse().ok().map(FieldValue::Boolean),
            (FieldType::String, Value::String(s)) => Some(FieldValue::String(s.clone())),
            _ => None,
        };
        decoded.ok_or_else(|| DecodeError::FieldType {
            field: field.to_string(),
            expected: self,
            value: value.to_string(),
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSchema {
    pub name: String,
    pub fields: BTreeMap<String, FieldSchema>,
}

/// Points decoded from one result series plus what had to be dropped
#[derive(Debug, Default)]
pub struct DecodedSeries {
    pub points: Vec<Point>,
    pub dropped_fields: usize,
    pub dropped_points: usize,
}

impl MeasurementSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        self.fields.insert(
            name.clone(),
            FieldSchema {
                name,
                field_type,
            },
        );
        self
    }

    /// Decode the rows of a `SELECT *` series into typed points
    ///
    /// Columns that are not declared fields (tags selected as columns, unknown
    /// fields) are ignored. Nulls are skipped. A cell that does not decode to its
    /// declared type drops that field only; a row left without fields, or with an
    /// unrecognized timestamp, is dropped.
    pub fn decode_series(&self, series: &Series) -> Result<DecodedSeries, DecodeError> {
        let time_idx = series
            .column("time")
            .ok_or_else(|| DecodeError::MissingTime(self.name.clone()))?;

        let columns: Vec<(usize, &FieldSchema)> = series
            .columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| self.fields.get(c).map(|f| (i, f)))
            .collect();

        let mut out = DecodedSeries::default();
        for row in &series.values {
            let timestamp = match row.get(time_idx).map(decode_timestamp) {
                Some(Ok(ts)) => ts,
                Some(Err(e)) => {
                    warn!("{}: dropping point: {}", self.name, e);
                    out.dropped_points += 1;
                    continue;
                }
                None => {
                    out.dropped_points += 1;
                    continue;
                }
            };

            let mut point = Point::new(self.name.clone(), timestamp);
            point.tags = series.tags.clone();

            for (idx, field) in &columns {
                let Some(cell) = row.get(*idx) else { continue };
                if cell.is_null() {
                    continue;
                }
                match field.field_type.decode(&field.name, cell) {
                    Ok(value) => {
                        point.fields.insert(field.name.clone(), value);
                    }
                    Err(e) => {
                        warn!("{}: dropping field: {}", self.name, e);
                        out.dropped_fields += 1;
                    }
                }
            }

            if point.fields.is_empty() {
                out.dropped_points += 1;
                continue;
            }
            out.points.push(point);
        }
        Ok(out)
    }
}

/// Timestamps arrive as epoch nanoseconds, or as RFC 3339 strings
fn decode_timestamp(value: &Value) -> Result<i64, DecodeError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| DecodeError::Timestamp(value.to_string())),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .and_then(|t| t.with_timezone(&Utc).timestamp_nanos_opt())
            })
            .ok_or_else(|| DecodeError::Timestamp(value.to_string())),
        _ => Err(DecodeError::Timestamp(value.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,
    /// Zero means infinite
    pub duration: Duration,
    pub shard_group_duration: Duration,
    pub replicas: u32,
    pub is_default: bool,
    pub measurements: BTreeMap<String, MeasurementSchema>,
}

impl RetentionPolicy {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
            shard_group_duration: Duration::ZERO,
            replicas: 1,
            is_default: false,
            measurements: BTreeMap::new(),
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn with_measurement(mut self, measurement: MeasurementSchema) -> Self {
        self.measurements.insert(measurement.name.clone(), measurement);
        self
    }

    pub fn is_infinite(&self) -> bool {
        self.duration.is_zero()
    }

    /// Creation parameters under the given name
    pub fn spec_named(&self, name: &str) -> RetentionPolicySpec {
        RetentionPolicySpec::new(name, self.duration)
            .with_shard_group_duration(self.shard_group_duration)
            .with_replication(self.replicas)
    }

    /// Window holding all data this policy can retain, bounded by `max`
    pub fn first_last_time(&self, max: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        let span = if self.is_infinite() || self.duration > max {
            max
        } else {
            self.duration
        };
        let span = chrono::Duration::from_std(span).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let start = now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        (start, now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub name: String,
    pub target_name: Option<String>,
    pub default_rp: String,
    pub target_default_rp: Option<String>,
    pub retention_policies: Vec<RetentionPolicy>,
}

impl DatabaseSchema {
    pub fn new(name: impl Into<String>, retention_policies: Vec<RetentionPolicy>) -> Self {
        let default_rp = retention_policies
            .iter()
            .find(|rp| rp.is_default)
            .map(|rp| rp.name.clone())
            .unwrap_or_default();
        Self {
            name: name.into(),
            target_name: None,
            default_rp,
            target_default_rp: None,
            retention_policies,
        }
    }

    /// Address the slave under different database / default-RP names
    pub fn with_rename(mut self, database: Option<String>, default_rp: Option<String>) -> Self {
        self.target_name = database.filter(|s| !s.is_empty());
        self.target_default_rp = default_rp.filter(|s| !s.is_empty());
        self
    }

    pub fn target_database(&self) -> &str {
        self.target_name.as_deref().unwrap_or(&self.name)
    }

    pub fn target_default_rp(&self) -> &str {
        self.target_default_rp.as_deref().unwrap_or(&self.default_rp)
    }

    /// Slave-side name for one of this database's policies
    pub fn target_rp_name<'a>(&'a self, rp: &'a RetentionPolicy) -> &'a str {
        if rp.name == self.default_rp {
            self.target_default_rp()
        } else {
            &rp.name
        }
    }

    pub fn default_policy(&self) -> Option<&RetentionPolicy> {
        self.retention_policies
            .iter()
            .find(|rp| rp.is_default && rp.name == self.default_rp)
    }
}

/// Optional regex filters on database, retention-policy and measurement names
#[derive(Debug, Clone, Default)]
pub struct SchemaFilter {
    database: Option<Regex>,
    retention_policy: Option<Regex>,
    measurement: Option<Regex>,
}

impl SchemaFilter {
    /// Compile filters; empty patterns match everything
    pub fn new(database: &str, retention_policy: &str, measurement: &str) -> Result<Self, SchemaError> {
        Ok(Self {
            database: compile("database", database)?,
            retention_policy: compile("retention policy", retention_policy)?,
            measurement: compile("measurement", measurement)?,
        })
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches_database(&self, name: &str) -> bool {
        self.database.as_ref().map_or(true, |r| r.is_match(name))
    }

    pub fn matches_retention_policy(&self, name: &str) -> bool {
        self.retention_policy.as_ref().map_or(true, |r| r.is_match(name))
    }

    pub fn matches_measurement(&self, name: &str) -> bool {
        self.measurement.as_ref().map_or(true, |r| r.is_match(name))
    }
}

fn compile(kind: &'static str, pattern: &str) -> Result<Option<Regex>, SchemaError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|source| SchemaError::InvalidFilter {
            kind,
            pattern: pattern.to_string(),
            source,
        })
}

/// Outcome of a best-effort schema replication
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaReplicationReport {
    pub databases: usize,
    pub retention_policies: usize,
    pub errors: Vec<String>,
}

impl SchemaReplicationReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Schema operations against one node
pub struct SchemaCatalog {
    node: String,
    client: Arc<dyn DbClient>,
}

impl SchemaCatalog {
    pub fn new(node: impl Into<String>, client: Arc<dyn DbClient>) -> Self {
        Self {
            node: node.into(),
            client,
        }
    }

    /// Discover the replicable schema of this node
    ///
    /// Listing databases is the only hard failure. Databases whose policies cannot
    /// be listed, or that lack exactly one default policy, are logged and skipped.
    /// The default policy is always kept, even when the policy filter excludes it,
    /// but measurements are only discovered for policies matching the filter.
    pub async fn discover(&self, filter: &SchemaFilter) -> Result<Vec<DatabaseSchema>, SchemaError> {
        let response = self
            .client
            .query(&Query::new(Statement::ShowDatabases))
            .await
            .map_err(|source| SchemaError::Discovery {
                node: self.node.clone(),
                source,
            })?;

        let databases: Vec<String> = response
            .series()
            .flat_map(|s| s.values.iter())
            .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
            .collect();

        let mut schemas = Vec::new();
        for db in databases {
            if db == INTERNAL_DATABASE {
                continue;
            }
            if !filter.matches_database(&db) {
                debug!("[{}] database {} filtered out", self.node, db);
                continue;
            }

            let mut policies = match self.retention_policies(&db).await {
                Ok(p) => p,
                Err(e) => {
                    error!("[{}] cannot list retention policies on {}: {}", self.node, db, e);
                    continue;
                }
            };

            let defaults = policies.iter().filter(|rp| rp.is_default).count();
            if defaults != 1 {
                error!(
                    "[{}] database {} has {} default retention policies, skipping",
                    self.node, db, defaults
                );
                continue;
            }

            policies.retain(|rp| rp.is_default || filter.matches_retention_policy(&rp.name));

            let measurements = match self.measurements(&db).await {
                Ok(m) => m,
                Err(e) => {
                    error!("[{}] cannot list measurements on {}: {}", self.node, db, e);
                    Vec::new()
                }
            };

            for rp in policies.iter_mut() {
                if !filter.matches_retention_policy(&rp.name) {
                    continue;
                }
                for name in measurements.iter().filter(|m| filter.matches_measurement(m)) {
                    match self.field_keys(&db, &rp.name, name).await {
                        Ok(schema) if !schema.fields.is_empty() => {
                            rp.measurements.insert(name.clone(), schema);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(
                                "[{}] cannot list field keys of {}.{}.{}: {}",
                                self.node, db, rp.name, name, e
                            );
                        }
                    }
                }
            }

            let schema = DatabaseSchema::new(db, policies);
            info!(
                "[{}] discovered database {} (default rp {}, {} retention policies)",
                self.node,
                schema.name,
                schema.default_rp,
                schema.retention_policies.len()
            );
            schemas.push(schema);
        }

        Ok(schemas)
    }

    async fn retention_policies(&self, db: &str) -> Result<Vec<RetentionPolicy>, ClientError> {
        let response = self
            .client
            .query(&Query::new(Statement::ShowRetentionPolicies {
                database: db.to_string(),
            }))
            .await?;

        let mut policies = Vec::new();
        for series in response.series() {
            let col = |name: &str| series.column(name);
            let (Some(name_idx), Some(dur_idx), Some(default_idx)) =
                (col("name"), col("duration"), col("default"))
            else {
                return Err(ClientError::Protocol(format!(
                    "unexpected retention policy columns: {:?}",
                    series.columns
                )));
            };
            let shard_idx = col("shardGroupDuration");
            let replica_idx = col("replicaN");

            for row in &series.values {
                let Some(name) = row.get(name_idx).and_then(Value::as_str) else {
                    continue;
                };
                let parse = |idx: Option<usize>| -> Result<Duration, ClientError> {
                    parse_duration(idx.and_then(|i| row.get(i)).and_then(Value::as_str).unwrap_or(""))
                };
                let (duration, shard) = match (parse(Some(dur_idx)), parse(shard_idx)) {
                    (Ok(d), Ok(s)) => (d, s),
                    (Err(e), _) | (_, Err(e)) => {
                        error!("[{}] skipping retention policy {}.{}: {}", self.node, db, name, e);
                        continue;
                    }
                };
                let replicas = replica_idx
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as u32;
                let is_default = row.get(default_idx).and_then(Value::as_bool).unwrap_or(false);

                policies.push(RetentionPolicy {
                    name: name.to_string(),
                    duration,
                    shard_group_duration: shard,
                    replicas,
                    is_default,
                    measurements: BTreeMap::new(),
                });
            }
        }
        Ok(policies)
    }

    async fn measurements(&self, db: &str) -> Result<Vec<String>, ClientError> {
        let response = self
            .client
            .query(&Query::new(Statement::ShowMeasurements).on_database(db))
            .await?;

        Ok(response
            .series()
            .flat_map(|s| s.values.iter())
            .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn field_keys(&self, db: &str, rp: &str, measurement: &str) -> Result<MeasurementSchema, ClientError> {
        let response = self
            .client
            .query(
                &Query::new(Statement::ShowFieldKeys {
                    retention_policy: rp.to_string(),
                    measurement: measurement.to_string(),
                })
                .on_database(db),
            )
            .await?;

        let mut schema = MeasurementSchema::new(measurement);
        for row in response.series().flat_map(|s| s.values.iter()) {
            let key = row.first().and_then(Value::as_str);
            let kind = row.get(1).and_then(Value::as_str);
            match (key, kind.and_then(FieldType::parse)) {
                (Some(key), Some(field_type)) => {
                    schema = schema.with_field(key, field_type);
                }
                _ => warn!(
                    "[{}] unrecognized field key row {:?} in {}.{}.{}",
                    self.node, row, db, rp, measurement
                ),
            }
        }
        Ok(schema)
    }

    /// Create the given schemas on this node, best effort
    ///
    /// Per database: create it with the (renamed) default policy, create that
    /// policy and mark it default, then create the remaining policies.
    pub async fn replicate(&self, schemas: &[DatabaseSchema]) -> SchemaReplicationReport {
        let mut report = SchemaReplicationReport::default();

        for schema in schemas {
            let target_db = schema.target_database();
            if schema.name == INTERNAL_DATABASE || target_db == INTERNAL_DATABASE {
                continue;
            }

            let Some(default) = schema.default_policy() else {
                let msg = format!("database {} has no default retention policy, skipping", schema.name);
                error!("[{}] {}", self.node, msg);
                report.errors.push(msg);
                continue;
            };

            let default_spec = default.spec_named(schema.target_default_rp());
            info!(
                "[{}] replicating database {} as {} (default rp {})",
                self.node, schema.name, target_db, default_spec.name
            );

            let mut steps = vec![
                Statement::CreateDatabase {
                    database: target_db.to_string(),
                    default_rp: default_spec.clone(),
                },
                Statement::CreateRetentionPolicy {
                    database: target_db.to_string(),
                    policy: default_spec.clone(),
                    make_default: true,
                },
                Statement::SetDefaultRetentionPolicy {
                    database: target_db.to_string(),
                    name: default_spec.name.clone(),
                },
            ];
            steps.extend(
                schema
                    .retention_policies
                    .iter()
                    .filter(|rp| rp.name != schema.default_rp)
                    .map(|rp| Statement::CreateRetentionPolicy {
                        database: target_db.to_string(),
                        policy: rp.spec_named(&rp.name),
                        make_default: false,
                    }),
            );

            report.databases += 1;
            for statement in steps {
                let creates_policy = matches!(statement, Statement::CreateRetentionPolicy { .. });
                match self.execute(statement).await {
                    Ok(()) => {
                        if creates_policy {
                            report.retention_policies += 1;
                        }
                    }
                    Err(msg) => report.errors.push(msg),
                }
            }
        }

        report
    }

    async fn execute(&self, statement: Statement) -> Result<(), String> {
        let text = statement.to_influxql();
        match self.client.query(&Query::new(statement)).await {
            Ok(_) => {
                debug!("[{}] {}", self.node, text);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("[{}] {} (already exists)", self.node, text);
                Ok(())
            }
            Err(e) => {
                error!("[{}] {} failed: {}", self.node, text, e);
                Err(format!("{}: {}", text, e))
            }
        }
    }
}
