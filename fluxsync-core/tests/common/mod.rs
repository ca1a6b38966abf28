//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use fluxsync_core::client::memory::{MemoryConnector, MemoryNode};
use fluxsync_core::client::{
    epoch_nanos, BatchPoints, DbClient, FieldValue, Point, RetentionPolicySpec,
};
use fluxsync_core::config::{AgentConfig, NodeConfig};
use fluxsync_core::monitoring::NodeMonitor;
use fluxsync_core::replication::{Endpoint, RetryPolicy, SyncSettings};
use std::sync::Arc;
use std::time::Duration;

pub const HOUR: Duration = Duration::from_secs(3600);

/// Master and slave in-memory nodes behind one connector
pub struct TestCluster {
    pub master: Arc<MemoryNode>,
    pub slave: Arc<MemoryNode>,
    pub connector: Arc<MemoryConnector>,
}

impl TestCluster {
    pub fn new() -> Self {
        let master = MemoryNode::new("influxdb01");
        let slave = MemoryNode::new("influxdb02");
        let connector = Arc::new(
            MemoryConnector::new()
                .with_node(master.clone())
                .with_node(slave.clone()),
        );
        Self {
            master,
            slave,
            connector,
        }
    }

    pub fn master_endpoint(&self) -> Endpoint {
        Endpoint::new("influxdb01", self.master.clone() as Arc<dyn DbClient>)
    }

    pub fn slave_endpoint(&self) -> Endpoint {
        Endpoint::new("influxdb02", self.slave.clone() as Arc<dyn DbClient>)
    }

    pub fn monitor(&self, name: &str, check_interval: Duration) -> Arc<NodeMonitor> {
        Arc::new(NodeMonitor::new(
            node_config(name),
            self.connector.clone(),
            check_interval,
        ))
    }

    pub fn config(&self) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.general.check_interval_secs = 1;
        config.general.min_sync_interval_secs = 1;
        config.nodes = vec![node_config("influxdb01"), node_config("influxdb02")];
        config
    }
}

pub fn node_config(name: &str) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        ..Default::default()
    }
}

/// Database `db` with an infinite default policy `autogen`
pub fn with_autogen(node: &MemoryNode, db: &str) {
    node.add_retention_policy(db, RetentionPolicySpec::new("autogen", Duration::ZERO), true);
}

/// `count` float points of measurement `temp`, evenly spread over `[start, end)`
pub fn temp_points(start: DateTime<Utc>, end: DateTime<Utc>, count: usize) -> Vec<Point> {
    let s = epoch_nanos(start);
    let step = (epoch_nanos(end) - s) / count as i64;
    (0..count)
        .map(|i| {
            Point::new("temp", s + i as i64 * step)
                .tag("sensor", format!("s{}", i % 3))
                .field("value", FieldValue::Float(i as f64 * 0.5))
        })
        .collect()
}

pub fn insert(node: &MemoryNode, db: &str, rp: &str, points: Vec<Point>) {
    node.insert(&BatchPoints::new(db, rp).with_points(points))
        .expect("insert test points");
}

/// Fast sync settings: 1h chunks, 24h cap, quick retries
pub fn sync_settings() -> SyncSettings {
    SyncSettings {
        chunk_duration: HOUR,
        max_retention: 24 * HOUR,
        workers: 4,
        max_points_per_write: 50_000,
        retry: RetryPolicy::new(3, Duration::from_millis(1)),
    }
}
