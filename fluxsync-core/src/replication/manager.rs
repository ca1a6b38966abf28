//! HA cluster supervisor coordinating master/slave replication
//!
//! The supervisor owns the monitors of both nodes and, on every tick, drives
//! the cluster state machine:
//!
//! ```text
//! OK --slave down--> SLAVE_SUSPECTED_DOWN --slave up--> RECOVERING --sync done--> OK
//! ```
//!
//! Recovery replays `[last_ok_before_outage - tick_interval, recovery_time]`
//! from master to slave with a freshly discovered schema.

use crate::config::InitialReplication;
use crate::monitoring::node::{NodeMonitor, NodeState};
use crate::replication::{
    ChunkedSyncEngine, CopyOrder, Endpoint, ReplicationError, ReplicationResult, SyncJob,
    SyncReport,
};
use crate::schema::{DatabaseSchema, SchemaCatalog, SchemaFilter, SchemaReplicationReport};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    Ok,
    SlaveSuspectedDown,
    Recovering,
}

/// Transition taken by one supervisor check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Steady,
    SlaveDown,
    StillDown,
    Recovered,
    StillRecovering,
}

#[derive(Debug, Clone, Copy)]
struct TrackedNode {
    is_up: bool,
    last_ok: DateTime<Utc>,
}

impl From<NodeState> for TrackedNode {
    fn from(state: NodeState) -> Self {
        Self {
            is_up: state.is_up,
            last_ok: state.last_ok,
        }
    }
}

#[derive(Debug)]
struct ClusterStats {
    state: ClusterState,
    master: TrackedNode,
    slave: TrackedNode,
    recoveries: u64,
    last_recovery: Duration,
}

/// Cluster status exposed by the status API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatus {
    pub cluster_state: ClusterState,
    pub cluster_num_recovers: u64,
    pub cluster_last_recover_duration_ms: u64,
    pub mid: String,
    pub sid: String,
    pub master_state: bool,
    pub master_last_ok: DateTime<Utc>,
    pub slave_state: bool,
    pub slave_last_ok: DateTime<Utc>,
}

impl ClusterStatus {
    /// Names of the nodes currently up
    pub fn active_nodes(&self) -> Vec<String> {
        let mut nodes = Vec::with_capacity(2);
        if self.master_state {
            nodes.push(self.mid.clone());
        }
        if self.slave_state {
            nodes.push(self.sid.clone());
        }
        nodes
    }
}

/// Supervisor timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Interval between state machine ticks; also the safety margin before an outage window
    pub tick_interval: Duration,
    pub order: CopyOrder,
}

pub struct ClusterSupervisor {
    master: Arc<NodeMonitor>,
    slave: Arc<NodeMonitor>,
    engine: ChunkedSyncEngine,
    settings: SupervisorSettings,
    stats: RwLock<ClusterStats>,
    schema: RwLock<Vec<DatabaseSchema>>,
}

impl ClusterSupervisor {
    /// Create a new supervisor in the `OK` state
    pub fn new(
        master: Arc<NodeMonitor>,
        slave: Arc<NodeMonitor>,
        engine: ChunkedSyncEngine,
        settings: SupervisorSettings,
    ) -> Self {
        let stats = ClusterStats {
            state: ClusterState::Ok,
            master: master.state().into(),
            slave: slave.state().into(),
            recoveries: 0,
            last_recovery: Duration::ZERO,
        };
        Self {
            master,
            slave,
            engine,
            settings,
            stats: RwLock::new(stats),
            schema: RwLock::new(Vec::new()),
        }
    }

    pub fn master(&self) -> &Arc<NodeMonitor> {
        &self.master
    }

    pub fn slave(&self) -> &Arc<NodeMonitor> {
        &self.slave
    }

    pub fn state(&self) -> ClusterState {
        self.stats.read().state
    }

    pub fn status(&self) -> ClusterStatus {
        let stats = self.stats.read();
        ClusterStatus {
            cluster_state: stats.state,
            cluster_num_recovers: stats.recoveries,
            cluster_last_recover_duration_ms: stats.last_recovery.as_millis() as u64,
            mid: self.master.name().to_string(),
            sid: self.slave.name().to_string(),
            master_state: stats.master.is_up,
            master_last_ok: stats.master.last_ok,
            slave_state: stats.slave.is_up,
            slave_last_ok: stats.slave.last_ok,
        }
    }

    pub fn active_nodes(&self) -> Vec<String> {
        self.status().active_nodes()
    }

    /// Last schema discovered from the master
    pub fn schema(&self) -> Vec<DatabaseSchema> {
        self.schema.read().clone()
    }

    /// Run one state machine step
    pub async fn check(&self) -> Transition {
        let master = self.master.state();
        let slave = self.slave.state();

        let recovery_window = {
            let mut stats = self.stats.write();
            match (stats.state, slave.is_up) {
                (ClusterState::Ok, false) => {
                    info!(
                        "Slave {} DOWN (last ok {}), cluster state SLAVE_SUSPECTED_DOWN",
                        self.slave.name(),
                        slave.last_ok
                    );
                    stats.state = ClusterState::SlaveSuspectedDown;
                    stats.master = master.into();
                    stats.slave = slave.into();
                    return Transition::SlaveDown;
                }
                (ClusterState::SlaveSuspectedDown, false) => {
                    debug!(
                        "Slave {} still down for {:?}",
                        self.slave.name(),
                        slave.since
                    );
                    stats.master = master.into();
                    stats.slave = slave.into();
                    return Transition::StillDown;
                }
                (ClusterState::SlaveSuspectedDown, true) => {
                    let margin = chrono::Duration::from_std(self.settings.tick_interval)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    let start = stats.slave.last_ok - margin;
                    let end = slave.last_ok;
                    stats.state = ClusterState::Recovering;
                    stats.master = master.into();
                    stats.slave = slave.into();
                    (start, end)
                }
                (ClusterState::Recovering, _) => {
                    info!("Cluster still recovering");
                    return Transition::StillRecovering;
                }
                (ClusterState::Ok, true) => {
                    if !master.is_up {
                        warn!(
                            "Master {} is down (last ok {}), not handled",
                            self.master.name(),
                            master.last_ok
                        );
                    }
                    stats.master = master.into();
                    stats.slave = slave.into();
                    return Transition::Steady;
                }
            }
        };

        let (start, end) = recovery_window;
        self.recover(start, end).await;
        Transition::Recovered
    }

    async fn recover(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        info!(
            "Slave {} is back, recovering data from {} to {}",
            self.slave.name(),
            start,
            end
        );
        let started = Instant::now();

        if self.slave.refresh_connection().is_none() {
            warn!("No probed connection to {} to refresh", self.slave.name());
        }

        let schema = match self.refresh_schema().await {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Schema refresh failed, using cached schema: {}", e);
                self.schema()
            }
        };

        if start < end {
            match self.replicate_data(&schema, start, end).await {
                Ok(reports) => {
                    let unrecovered: usize = reports.iter().map(|r| r.unrecovered_windows().len()).sum();
                    let points: u64 = reports.iter().map(|r| r.total_points).sum();
                    if unrecovered > 0 {
                        error!(
                            "Recovery finished with {} unrecovered chunks ({} points moved)",
                            unrecovered, points
                        );
                    } else {
                        info!("Recovery moved {} points", points);
                    }
                }
                Err(e) => error!("Recovery sync failed: {}", e),
            }
        } else {
            warn!("Empty recovery window {} - {}, nothing to replay", start, end);
        }

        let elapsed = started.elapsed();
        let mut stats = self.stats.write();
        stats.state = ClusterState::Ok;
        stats.recoveries += 1;
        stats.last_recovery = elapsed;
        info!(
            "Recovery #{} done in {:?}, cluster state OK",
            stats.recoveries, elapsed
        );
    }

    fn endpoint(monitor: &NodeMonitor) -> ReplicationResult<Endpoint> {
        monitor
            .connection()
            .map(|client| Endpoint::new(monitor.name(), client))
            .ok_or_else(|| ReplicationError::NoConnection(monitor.name().to_string()))
    }

    /// Discover the master schema through the given filters
    pub async fn discover(&self, filter: &SchemaFilter) -> ReplicationResult<Vec<DatabaseSchema>> {
        let master = Self::endpoint(&self.master)?;
        let catalog = SchemaCatalog::new(master.name, master.client);
        Ok(catalog.discover(filter).await?)
    }

    /// Rediscover the full master schema and cache it
    pub async fn refresh_schema(&self) -> ReplicationResult<Vec<DatabaseSchema>> {
        let schema = self.discover(&SchemaFilter::all()).await?;
        *self.schema.write() = schema.clone();
        Ok(schema)
    }

    /// Materialize schemas on the slave
    pub async fn replicate_schema(&self, schemas: &[DatabaseSchema]) -> ReplicationResult<SchemaReplicationReport> {
        let slave = Self::endpoint(&self.slave)?;
        let catalog = SchemaCatalog::new(slave.name, slave.client);
        let report = catalog.replicate(schemas).await;
        if !report.is_clean() {
            warn!("Schema replication finished with {} errors", report.errors.len());
        }
        Ok(report)
    }

    /// Sync every (database, retention policy) pair over `[start, end)`
    pub async fn replicate_data(
        &self,
        schemas: &[DatabaseSchema],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ReplicationResult<Vec<SyncReport>> {
        self.replicate_with(schemas, |_| (start, end)).await
    }

    /// Sync every (database, retention policy) pair over its full-history window
    pub async fn replicate_data_full(&self, schemas: &[DatabaseSchema]) -> ReplicationResult<Vec<SyncReport>> {
        let max = self.engine.settings().max_retention;
        self.replicate_with(schemas, |rp| rp.first_last_time(max)).await
    }

    async fn replicate_with<F>(&self, schemas: &[DatabaseSchema], window: F) -> ReplicationResult<Vec<SyncReport>>
    where
        F: Fn(&crate::schema::RetentionPolicy) -> (DateTime<Utc>, DateTime<Utc>),
    {
        let source = Self::endpoint(&self.master)?;
        let destination = Self::endpoint(&self.slave)?;

        let mut reports = Vec::new();
        for schema in schemas {
            for rp in &schema.retention_policies {
                if rp.measurements.is_empty() {
                    debug!("{}.{} has no measurements, skipping", schema.name, rp.name);
                    continue;
                }
                let (start, end) = window(rp);
                let job = SyncJob::for_policy(
                    source.clone(),
                    destination.clone(),
                    schema,
                    rp,
                    start,
                    end,
                    self.settings.order,
                );
                match self.engine.sync(&job).await {
                    Ok(report) => reports.push(report),
                    Err(e) => error!("Sync of {}.{} failed: {}", schema.name, rp.name, e),
                }
            }
        }
        Ok(reports)
    }

    /// Run the configured initial replication
    pub async fn initial_replication(&self, mode: InitialReplication) -> ReplicationResult<()> {
        if mode == InitialReplication::None {
            return Ok(());
        }
        info!("Running initial replication ({:?})", mode);

        let schema = self.refresh_schema().await?;
        if mode.includes_schema() {
            self.replicate_schema(&schema).await?;
        }
        if mode.includes_data() {
            let reports = self.replicate_data_full(&schema).await?;
            let points: u64 = reports.iter().map(|r| r.total_points).sum();
            info!("Initial data replication moved {} points", points);
        }
        Ok(())
    }

    /// Run the state machine until a shutdown signal arrives
    pub fn spawn(self: Arc<Self>, startup_delay: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(startup_delay) => {}
                _ = shutdown.recv() => return,
            }

            info!(
                "Cluster supervisor started ({} -> {}, tick {:?})",
                self.master.name(),
                self.slave.name(),
                self.settings.tick_interval
            );
            let mut interval = tokio::time::interval(self.settings.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.check().await;
                    }
                    _ = shutdown.recv() => {
                        info!("Cluster supervisor stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryConnector, MemoryNode};
    use crate::config::NodeConfig;
    use crate::replication::SyncSettings;

    async fn pair() -> (Arc<MemoryNode>, Arc<MemoryNode>, ClusterSupervisor) {
        let master = MemoryNode::new("m");
        let slave = MemoryNode::new("s");
        let connector = Arc::new(
            MemoryConnector::new()
                .with_node(master.clone())
                .with_node(slave.clone()),
        );
        let monitor = |name: &str| {
            Arc::new(NodeMonitor::new(
                NodeConfig {
                    name: name.to_string(),
                    ..Default::default()
                },
                connector.clone(),
                Duration::from_secs(1),
            ))
        };
        let (mm, sm) = (monitor("m"), monitor("s"));
        mm.connect().await.unwrap();
        sm.connect().await.unwrap();

        let supervisor = ClusterSupervisor::new(
            mm,
            sm,
            ChunkedSyncEngine::new(SyncSettings::default()),
            SupervisorSettings {
                tick_interval: Duration::from_secs(1),
                order: CopyOrder::Reverse,
            },
        );
        (master, slave, supervisor)
    }

    #[tokio::test]
    async fn test_steady_state() {
        let (_m, _s, supervisor) = pair().await;
        assert_eq!(supervisor.check().await, Transition::Steady);
        assert_eq!(supervisor.state(), ClusterState::Ok);
        assert_eq!(supervisor.active_nodes(), vec!["m".to_string(), "s".to_string()]);
    }

    #[tokio::test]
    async fn test_outage_and_recovery_cycle() {
        let (_m, slave, supervisor) = pair().await;

        slave.set_online(false);
        supervisor.slave().probe().await.unwrap_err();
        assert_eq!(supervisor.check().await, Transition::SlaveDown);
        assert_eq!(supervisor.check().await, Transition::StillDown);
        assert_eq!(supervisor.state(), ClusterState::SlaveSuspectedDown);
        assert_eq!(supervisor.active_nodes(), vec!["m".to_string()]);

        slave.set_online(true);
        supervisor.slave().probe().await.unwrap();
        assert_eq!(supervisor.check().await, Transition::Recovered);

        let status = supervisor.status();
        assert_eq!(status.cluster_state, ClusterState::Ok);
        assert_eq!(status.cluster_num_recovers, 1);
    }

    #[tokio::test]
    async fn test_master_down_is_observed_only() {
        let (master, _s, supervisor) = pair().await;
        master.set_online(false);
        supervisor.master().probe().await.unwrap_err();

        assert_eq!(supervisor.check().await, Transition::Steady);
        assert_eq!(supervisor.state(), ClusterState::Ok);
        assert!(!supervisor.status().master_state);
    }

    #[test]
    fn test_status_serialization() {
        let status = ClusterStatus {
            cluster_state: ClusterState::SlaveSuspectedDown,
            cluster_num_recovers: 2,
            cluster_last_recover_duration_ms: 10,
            mid: "m".to_string(),
            sid: "s".to_string(),
            master_state: true,
            master_last_ok: Utc::now(),
            slave_state: false,
            slave_last_ok: Utc::now(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["cluster_state"], "SLAVE_SUSPECTED_DOWN");
        assert_eq!(status.active_nodes(), vec!["m".to_string()]);
    }
}
