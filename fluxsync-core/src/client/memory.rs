//! In-process node used by tests and dry runs
//!
//! A [`MemoryNode`] keeps databases, retention policies and points in memory and
//! answers the same typed statements as a real server. Writes overwrite points
//! with identical measurement, tag set and timestamp, so repeated replication of
//! a window is idempotent. Outages and transient read/write failures can be
//! injected.

use super::influxql::format_duration;
use super::{
    epoch_nanos, BatchPoints, ClientError, ClientResult, Connector, DbClient, FieldValue,
    PingInfo, Query, QueryResponse, RetentionPolicySpec, Series, Statement,
};
use crate::config::NodeConfig;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type TagSet = BTreeMap<String, String>;
type Row = BTreeMap<String, FieldValue>;

#[derive(Debug, Default)]
struct MeasurementData {
    field_types: BTreeMap<String, &'static str>,
    series: BTreeMap<TagSet, BTreeMap<i64, Row>>,
}

impl MeasurementData {
    fn point_count(&self) -> usize {
        self.series.values().map(|rows| rows.len()).sum()
    }
}

#[derive(Debug)]
struct PolicyData {
    spec: RetentionPolicySpec,
    measurements: BTreeMap<String, MeasurementData>,
}

#[derive(Debug, Default)]
struct DatabaseData {
    default_rp: Option<String>,
    policies: BTreeMap<String, PolicyData>,
}

/// In-memory time-series node
pub struct MemoryNode {
    name: String,
    version: String,
    online: AtomicBool,
    read_failures: AtomicU32,
    write_failures: AtomicU32,
    write_calls: AtomicU64,
    databases: RwLock<BTreeMap<String, DatabaseData>>,
    statements: Mutex<Vec<String>>,
}

impl MemoryNode {
    /// Create a new, empty and online node
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            version: "1.8.10-memory".to_string(),
            online: AtomicBool::new(true),
            read_failures: AtomicU32::new(0),
            write_failures: AtomicU32::new(0),
            write_calls: AtomicU64::new(0),
            databases: RwLock::new(BTreeMap::new()),
            statements: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Fail the next `n` window reads
    pub fn fail_next_reads(&self, n: u32) {
        self.read_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` writes
    pub fn fail_next_writes(&self, n: u32) {
        self.write_failures.store(n, Ordering::SeqCst);
    }

    /// Number of write calls that reached the node, failed or not
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Mutating statements executed so far, in order
    pub fn executed_statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    /// Create a database with no retention policies
    pub fn create_database(&self, database: &str) {
        self.databases
            .write()
            .entry(database.to_string())
            .or_default();
    }

    /// Add a retention policy, creating the database when missing
    pub fn add_retention_policy(&self, database: &str, spec: RetentionPolicySpec, make_default: bool) {
        let mut dbs = self.databases.write();
        let db = dbs.entry(database.to_string()).or_default();
        if make_default {
            db.default_rp = Some(spec.name.clone());
        }
        db.policies
            .entry(spec.name.clone())
            .or_insert_with(|| PolicyData {
                spec,
                measurements: BTreeMap::new(),
            });
    }

    pub fn databases(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }

    pub fn default_retention_policy(&self, database: &str) -> Option<String> {
        self.databases
            .read()
            .get(database)
            .and_then(|db| db.default_rp.clone())
    }

    pub fn retention_policy(&self, database: &str, rp: &str) -> Option<RetentionPolicySpec> {
        self.databases
            .read()
            .get(database)
            .and_then(|db| db.policies.get(rp))
            .map(|p| p.spec.clone())
    }

    /// Points stored in one retention policy, optionally for a single measurement
    pub fn point_count(&self, database: &str, rp: &str, measurement: Option<&str>) -> usize {
        let dbs = self.databases.read();
        let Some(policy) = dbs.get(database).and_then(|db| db.policies.get(rp)) else {
            return 0;
        };
        match measurement {
            Some(m) => policy
                .measurements
                .get(m)
                .map(MeasurementData::point_count)
                .unwrap_or(0),
            None => policy.measurements.values().map(MeasurementData::point_count).sum(),
        }
    }

    /// Store points directly, bypassing failure injection
    pub fn insert(&self, batch: &BatchPoints) -> ClientResult<()> {
        self.store(batch)
    }

    fn ensure_online(&self) -> ClientResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(ClientError::Unavailable(format!("{} is down", self.name)))
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn store(&self, batch: &BatchPoints) -> ClientResult<()> {
        let mut dbs = self.databases.write();
        let db = dbs
            .get_mut(&batch.database)
            .ok_or_else(|| ClientError::Statement(format!("database not found: {}", batch.database)))?;

        let rp_name = if batch.retention_policy.is_empty() {
            db.default_rp.clone().unwrap_or_default()
        } else {
            batch.retention_policy.clone()
        };
        let policy = db.policies.get_mut(&rp_name).ok_or_else(|| {
            ClientError::Statement(format!("retention policy not found: {}", rp_name))
        })?;

        for point in &batch.points {
            if point.fields.is_empty() {
                continue;
            }
            let data = policy
                .measurements
                .entry(point.measurement.clone())
                .or_default();

            for (key, value) in &point.fields {
                let declared = data.field_types.entry(key.clone()).or_insert(value.type_name());
                if *declared != value.type_name() {
                    return Err(ClientError::Statement(format!(
                        "field type conflict: input field \"{}\" on measurement \"{}\" is type {}, already exists as type {}",
                        key,
                        point.measurement,
                        value.type_name(),
                        declared
                    )));
                }
            }

            let row = data
                .series
                .entry(point.tags.clone())
                .or_default()
                .entry(point.timestamp)
                .or_default();
            for (key, value) in &point.fields {
                row.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn execute(&self, query: &Query) -> ClientResult<QueryResponse> {
        if query.statement.is_mutation() {
            self.statements.lock().push(query.command());
        }

        match &query.statement {
            Statement::ShowDatabases => {
                let values = self
                    .databases
                    .read()
                    .keys()
                    .map(|name| vec![Value::from(name.as_str())])
                    .collect();
                Ok(QueryResponse::single(vec![Series {
                    name: "databases".to_string(),
                    columns: vec!["name".to_string()],
                    values,
                    ..Default::default()
                }]))
            }
            Statement::ShowRetentionPolicies { database } => {
                let dbs = self.databases.read();
                let db = dbs
                    .get(database)
                    .ok_or_else(|| ClientError::Statement(format!("database not found: {}", database)))?;
                let values = db
                    .policies
                    .values()
                    .map(|p| {
                        vec![
                            Value::from(p.spec.name.as_str()),
                            Value::from(format_duration(p.spec.duration)),
                            Value::from(format_duration(shard_group_or_default(&p.spec))),
                            Value::from(p.spec.replication),
                            Value::Bool(db.default_rp.as_deref() == Some(p.spec.name.as_str())),
                        ]
                    })
                    .collect();
                Ok(QueryResponse::single(vec![Series {
                    columns: ["name", "duration", "shardGroupDuration", "replicaN", "default"]
                        .iter()
                        .map(|c| c.to_string())
                        .collect(),
                    values,
                    ..Default::default()
                }]))
            }
            Statement::ShowMeasurements => {
                let database = query
                    .database
                    .as_deref()
                    .ok_or_else(|| ClientError::Statement("database name required".to_string()))?;
                let dbs = self.databases.read();
                let db = dbs
                    .get(database)
                    .ok_or_else(|| ClientError::Statement(format!("database not found: {}", database)))?;
                let mut names: Vec<&String> = db
                    .policies
                    .values()
                    .flat_map(|p| p.measurements.keys())
                    .collect();
                names.sort();
                names.dedup();
                if names.is_empty() {
                    return Ok(QueryResponse::single(Vec::new()));
                }
                Ok(QueryResponse::single(vec![Series {
                    name: "measurements".to_string(),
                    columns: vec!["name".to_string()],
                    values: names.into_iter().map(|n| vec![Value::from(n.as_str())]).collect(),
                    ..Default::default()
                }]))
            }
            Statement::ShowFieldKeys {
                retention_policy,
                measurement,
            } => {
                let dbs = self.databases.read();
                let data = query
                    .database
                    .as_deref()
                    .and_then(|d| dbs.get(d))
                    .and_then(|db| db.policies.get(retention_policy))
                    .and_then(|p| p.measurements.get(measurement));
                let Some(data) = data else {
                    return Ok(QueryResponse::single(Vec::new()));
                };
                Ok(QueryResponse::single(vec![Series {
                    name: measurement.clone(),
                    columns: vec!["fieldKey".to_string(), "fieldType".to_string()],
                    values: data
                        .field_types
                        .iter()
                        .map(|(k, t)| vec![Value::from(k.as_str()), Value::from(*t)])
                        .collect(),
                    ..Default::default()
                }]))
            }
            Statement::SelectWindow {
                retention_policy,
                measurement,
                start,
                end,
            } => {
                if Self::take_failure(&self.read_failures) {
                    return Err(ClientError::Unavailable(format!(
                        "{}: injected read failure",
                        self.name
                    )));
                }
                let (from, to) = (epoch_nanos(*start), epoch_nanos(*end));
                if from >= to {
                    return Ok(QueryResponse::single(Vec::new()));
                }
                let dbs = self.databases.read();
                let data = query
                    .database
                    .as_deref()
                    .and_then(|d| dbs.get(d))
                    .and_then(|db| db.policies.get(retention_policy))
                    .and_then(|p| p.measurements.get(measurement));
                let Some(data) = data else {
                    return Ok(QueryResponse::single(Vec::new()));
                };

                let fields: Vec<&String> = data.field_types.keys().collect();
                let mut columns = vec!["time".to_string()];
                columns.extend(fields.iter().map(|f| f.to_string()));

                let series = data
                    .series
                    .iter()
                    .filter_map(|(tags, rows)| {
                        let values: Vec<Vec<Value>> = rows
                            .range(from..to)
                            .map(|(ts, row)| {
                                let mut out = vec![Value::from(*ts)];
                                out.extend(fields.iter().map(|f| {
                                    row.get(*f).map(FieldValue::to_json).unwrap_or(Value::Null)
                                }));
                                out
                            })
                            .collect();
                        (!values.is_empty()).then(|| Series {
                            name: measurement.clone(),
                            tags: tags.clone(),
                            columns: columns.clone(),
                            values,
                        })
                    })
                    .collect();
                Ok(QueryResponse::single(series))
            }
            Statement::CreateDatabase {
                database,
                default_rp,
            } => {
                let mut dbs = self.databases.write();
                if let Some(db) = dbs.get(database) {
                    return match db.policies.get(&default_rp.name) {
                        Some(existing) if existing.spec != *default_rp => Err(ClientError::Statement(
                            "retention policy conflicts with an existing policy".to_string(),
                        )),
                        _ => Ok(QueryResponse::single(Vec::new())),
                    };
                }
                let mut db = DatabaseData {
                    default_rp: Some(default_rp.name.clone()),
                    policies: BTreeMap::new(),
                };
                db.policies.insert(
                    default_rp.name.clone(),
                    PolicyData {
                        spec: default_rp.clone(),
                        measurements: BTreeMap::new(),
                    },
                );
                dbs.insert(database.clone(), db);
                Ok(QueryResponse::single(Vec::new()))
            }
            Statement::CreateRetentionPolicy {
                database,
                policy,
                make_default,
            } => {
                let mut dbs = self.databases.write();
                let db = dbs
                    .get_mut(database)
                    .ok_or_else(|| ClientError::Statement(format!("database not found: {}", database)))?;
                match db.policies.get(&policy.name) {
                    Some(existing) if existing.spec != *policy => {
                        return Err(ClientError::Statement(
                            "retention policy already exists".to_string(),
                        ))
                    }
                    Some(_) => {}
                    None => {
                        db.policies.insert(
                            policy.name.clone(),
                            PolicyData {
                                spec: policy.clone(),
                                measurements: BTreeMap::new(),
                            },
                        );
                    }
                }
                if *make_default {
                    db.default_rp = Some(policy.name.clone());
                }
                Ok(QueryResponse::single(Vec::new()))
            }
            Statement::SetDefaultRetentionPolicy { database, name } => {
                let mut dbs = self.databases.write();
                let db = dbs
                    .get_mut(database)
                    .ok_or_else(|| ClientError::Statement(format!("database not found: {}", database)))?;
                if !db.policies.contains_key(name) {
                    return Err(ClientError::Statement(format!(
                        "retention policy not found: {}",
                        name
                    )));
                }
                db.default_rp = Some(name.clone());
                Ok(QueryResponse::single(Vec::new()))
            }
        }
    }
}

fn shard_group_or_default(spec: &RetentionPolicySpec) -> Duration {
    if !spec.shard_group_duration.is_zero() {
        return spec.shard_group_duration;
    }
    // Server-side defaults for an unset shard group duration
    let day = Duration::from_secs(86_400);
    if spec.duration.is_zero() || spec.duration >= 180 * day {
        7 * day
    } else if spec.duration >= 2 * day {
        day
    } else {
        Duration::from_secs(3_600)
    }
}

#[async_trait]
impl DbClient for MemoryNode {
    async fn ping(&self) -> ClientResult<PingInfo> {
        self.ensure_online()?;
        Ok(PingInfo {
            latency: Duration::ZERO,
            version: self.version.clone(),
        })
    }

    async fn query(&self, query: &Query) -> ClientResult<QueryResponse> {
        self.ensure_online()?;
        self.execute(query)
    }

    async fn write(&self, batch: &BatchPoints) -> ClientResult<()> {
        self.ensure_online()?;
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.write_failures) {
            return Err(ClientError::Unavailable(format!(
                "{}: injected write failure",
                self.name
            )));
        }
        self.store(batch)
    }
}

/// Connector resolving node names to registered [`MemoryNode`]s
#[derive(Default)]
pub struct MemoryConnector {
    nodes: RwLock<HashMap<String, Arc<MemoryNode>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(self, node: Arc<MemoryNode>) -> Self {
        self.register(node);
        self
    }

    pub fn register(&self, node: Arc<MemoryNode>) {
        self.nodes.write().insert(node.name().to_string(), node);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, node: &NodeConfig) -> ClientResult<Arc<dyn DbClient>> {
        let found = self.nodes.read().get(&node.name).cloned();
        match found {
            Some(n) if n.is_online() => Ok(n as Arc<dyn DbClient>),
            Some(_) => Err(ClientError::Unavailable(format!("{} is down", node.name))),
            None => Err(ClientError::Unavailable(format!(
                "no such node: {}",
                node.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Point;
    use chrono::{TimeZone, Utc};

    fn batch(ts: &[i64]) -> BatchPoints {
        BatchPoints::new("db", "autogen").with_points(
            ts.iter()
                .map(|t| {
                    Point::new("cpu", *t)
                        .tag("host", "a")
                        .field("value", FieldValue::Float(*t as f64))
                })
                .collect(),
        )
    }

    fn node() -> Arc<MemoryNode> {
        let node = MemoryNode::new("mem");
        node.add_retention_policy("db", RetentionPolicySpec::new("autogen", Duration::ZERO), true);
        node
    }

    #[tokio::test]
    async fn test_write_is_idempotent() {
        let node = node();
        node.write(&batch(&[1, 2, 3])).await.unwrap();
        node.write(&batch(&[2, 3, 4])).await.unwrap();
        assert_eq!(node.point_count("db", "autogen", Some("cpu")), 4);
        assert_eq!(node.write_calls(), 2);
    }

    #[tokio::test]
    async fn test_select_window_half_open() {
        let node = node();
        let base = 1_000_000_000i64;
        node.write(&batch(&[base, 2 * base, 3 * base])).await.unwrap();

        let query = Query::new(Statement::SelectWindow {
            retention_policy: "autogen".to_string(),
            measurement: "cpu".to_string(),
            start: Utc.timestamp_opt(1, 0).unwrap(),
            end: Utc.timestamp_opt(3, 0).unwrap(),
        })
        .on_database("db");

        let response = node.query(&query).await.unwrap();
        let series = response.first_series().unwrap();
        assert_eq!(series.columns, vec!["time", "value"]);
        assert_eq!(series.values.len(), 2);
        assert_eq!(series.tags.get("host").map(String::as_str), Some("a"));
    }

    #[tokio::test]
    async fn test_offline_node_refuses() {
        let node = node();
        node.set_online(false);
        assert!(matches!(node.ping().await, Err(ClientError::Unavailable(_))));
        assert!(node.write(&batch(&[1])).await.is_err());
        node.set_online(true);
        assert!(node.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let node = node();
        node.fail_next_writes(2);
        assert!(node.write(&batch(&[1])).await.is_err());
        assert!(node.write(&batch(&[1])).await.is_err());
        assert!(node.write(&batch(&[1])).await.is_ok());
    }

    #[tokio::test]
    async fn test_field_type_conflict_rejected() {
        let node = node();
        node.write(&batch(&[1])).await.unwrap();
        let conflicting = BatchPoints::new("db", "autogen")
            .with_points(vec![Point::new("cpu", 2).field("value", FieldValue::Integer(1))]);
        assert!(node.write(&conflicting).await.is_err());
    }

    #[tokio::test]
    async fn test_show_retention_policies() {
        let node = node();
        let query = Query::new(Statement::ShowRetentionPolicies {
            database: "db".to_string(),
        });
        let response = node.query(&query).await.unwrap();
        let series = response.first_series().unwrap();
        assert_eq!(series.values.len(), 1);
        assert_eq!(series.values[0][1], Value::from("0h0m0s"));
        assert_eq!(series.values[0][2], Value::from("168h0m0s"));
        assert_eq!(series.values[0][4], Value::Bool(true));
    }

    #[tokio::test]
    async fn test_create_statements_are_recorded() {
        let node = MemoryNode::new("mem");
        let spec = RetentionPolicySpec::new("rp1", Duration::from_secs(3600));
        node.query(&Query::new(Statement::CreateDatabase {
            database: "x".to_string(),
            default_rp: spec.clone(),
        }))
        .await
        .unwrap();

        assert_eq!(node.default_retention_policy("x").as_deref(), Some("rp1"));
        assert_eq!(node.executed_statements().len(), 1);
        assert_eq!(node.retention_policy("x", "rp1"), Some(spec));
    }

    #[tokio::test]
    async fn test_connector_resolves_registered_nodes() {
        let connector = MemoryConnector::new().with_node(node());
        let config = NodeConfig {
            name: "mem".to_string(),
            ..Default::default()
        };
        assert!(connector.connect(&config).await.is_ok());

        let missing = NodeConfig {
            name: "other".to_string(),
            ..Default::default()
        };
        assert!(connector.connect(&missing).await.is_err());
    }
}
