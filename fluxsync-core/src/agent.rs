//! Agent control surface
//!
//! Entry points used by the binary: long-running HA monitoring between two
//! configured nodes, and one-shot schema replication and data copies.

use crate::client::Connector;
use crate::config::{AgentConfig, NodeConfig};
use crate::monitoring::node::NodeMonitor;
use crate::replication::{
    ChunkedSyncEngine, ClusterSupervisor, CopyOrder, ReplicationError, ReplicationResult,
    SupervisorSettings, SyncReport, SyncSettings,
};
use crate::schema::{DatabaseSchema, SchemaFilter, SchemaReplicationReport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Which part of the master schema an operation covers, and where it lands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyScope {
    /// Database name regex, empty for all
    pub db: String,
    /// Retention policy name regex, empty for all
    pub rp: String,
    /// Measurement name regex, empty for all
    pub measurement: String,
    /// Target database name on the slave
    pub new_db: Option<String>,
    /// Target default retention policy name on the slave
    pub new_rp: Option<String>,
}

impl CopyScope {
    pub fn filter(&self) -> ReplicationResult<SchemaFilter> {
        Ok(SchemaFilter::new(&self.db, &self.rp, &self.measurement)?)
    }

    fn renames(&self) -> bool {
        self.new_db.as_deref().map_or(false, |s| !s.is_empty())
            || self.new_rp.as_deref().map_or(false, |s| !s.is_empty())
    }

    /// Apply rename targets; a rename needs exactly one selected database
    pub fn apply(&self, schemas: Vec<DatabaseSchema>) -> ReplicationResult<Vec<DatabaseSchema>> {
        if !self.renames() {
            return Ok(schemas);
        }
        if schemas.len() != 1 {
            return Err(ReplicationError::InvalidRename(schemas.len()));
        }
        Ok(schemas
            .into_iter()
            .map(|s| s.with_rename(self.new_db.clone(), self.new_rp.clone()))
            .collect())
    }
}

/// Time range of a data copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyRange {
    Window {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Everything each retention policy can hold, bounded by the max retention interval
    Full,
}

/// Running HA monitor
pub struct HaHandle {
    supervisor: Arc<ClusterSupervisor>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl HaHandle {
    pub fn supervisor(&self) -> &Arc<ClusterSupervisor> {
        &self.supervisor
    }

    /// Stop the monitor and supervisor tasks
    ///
    /// A recovery in progress runs to completion first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("HA task ended abnormally: {}", e);
            }
        }
        info!("HA monitor stopped");
    }
}

pub struct Agent {
    config: AgentConfig,
    connector: Arc<dyn Connector>,
    sync_settings: SyncSettings,
}

impl Agent {
    /// Create a new agent
    pub fn new(config: AgentConfig, connector: Arc<dyn Connector>) -> Self {
        let sync_settings = SyncSettings::from(&config.general);
        Self {
            config,
            connector,
            sync_settings,
        }
    }

    /// Override the configured chunk duration
    pub fn with_chunk_duration(mut self, chunk: Duration) -> Self {
        self.sync_settings = self.sync_settings.with_chunk_duration(chunk);
        self
    }

    pub fn with_sync_settings(mut self, settings: SyncSettings) -> Self {
        self.sync_settings = settings;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn sync_settings(&self) -> &SyncSettings {
        &self.sync_settings
    }

    fn node(&self, name: &str) -> ReplicationResult<NodeConfig> {
        self.config
            .find_node(name)
            .cloned()
            .ok_or_else(|| ReplicationError::NodeNotConfigured(name.to_string()))
    }

    async fn open_node(&self, name: &str) -> ReplicationResult<Arc<NodeMonitor>> {
        let monitor = Arc::new(NodeMonitor::new(
            self.node(name)?,
            self.connector.clone(),
            self.config.general.check_interval(),
        ));
        let report = monitor
            .connect()
            .await
            .map_err(|source| ReplicationError::NodeUnavailable {
                node: name.to_string(),
                source,
            })?;
        info!(
            "Connected to {} (version {}, ping {:?})",
            name, report.version, report.latency
        );
        Ok(monitor)
    }

    async fn supervisor(&self, master: &str, slave: &str, order: CopyOrder) -> ReplicationResult<ClusterSupervisor> {
        let master = self.open_node(master).await?;
        let slave = self.open_node(slave).await?;
        Ok(ClusterSupervisor::new(
            master,
            slave,
            ChunkedSyncEngine::new(self.sync_settings.clone()),
            SupervisorSettings {
                tick_interval: self.config.general.min_sync_interval(),
                order,
            },
        ))
    }

    /// Start HA monitoring between two configured nodes
    ///
    /// Both nodes must answer a first probe. The configured initial replication
    /// runs before the monitor tasks start; the supervisor loop begins one check
    /// interval later.
    pub async fn start_ha_monitor(&self, master: &str, slave: &str, order: CopyOrder) -> ReplicationResult<HaHandle> {
        let supervisor = Arc::new(self.supervisor(master, slave, order).await?);

        supervisor
            .initial_replication(self.config.general.initial_replication)
            .await?;

        let (shutdown, _) = broadcast::channel(4);
        let tasks = vec![
            supervisor.master().clone().spawn(shutdown.subscribe()),
            supervisor.slave().clone().spawn(shutdown.subscribe()),
            supervisor
                .clone()
                .spawn(self.config.general.check_interval(), shutdown.subscribe()),
        ];

        info!("HA monitor running: master {} slave {} ({})", master, slave, order);
        Ok(HaHandle {
            supervisor,
            shutdown,
            tasks,
        })
    }

    /// Replicate the selected schema from master to slave
    pub async fn replicate_schema(&self, master: &str, slave: &str, scope: &CopyScope) -> ReplicationResult<SchemaReplicationReport> {
        let filter = scope.filter()?;
        let supervisor = self.supervisor(master, slave, CopyOrder::default()).await?;
        let schemas = scope.apply(supervisor.discover(&filter).await?)?;
        supervisor.replicate_schema(&schemas).await
    }

    /// Copy the selected data from master to slave
    pub async fn copy(
        &self,
        master: &str,
        slave: &str,
        scope: &CopyScope,
        range: CopyRange,
        order: CopyOrder,
    ) -> ReplicationResult<Vec<SyncReport>> {
        let filter = scope.filter()?;
        let supervisor = self.supervisor(master, slave, order).await?;
        let schemas = scope.apply(supervisor.discover(&filter).await?)?;
        Self::copy_with(&supervisor, &schemas, range).await
    }

    /// Replicate schema, then copy data
    pub async fn full_copy(
        &self,
        master: &str,
        slave: &str,
        scope: &CopyScope,
        range: CopyRange,
        order: CopyOrder,
    ) -> ReplicationResult<(SchemaReplicationReport, Vec<SyncReport>)> {
        let filter = scope.filter()?;
        let supervisor = self.supervisor(master, slave, order).await?;
        let schemas = scope.apply(supervisor.discover(&filter).await?)?;
        let schema_report = supervisor.replicate_schema(&schemas).await?;
        let reports = Self::copy_with(&supervisor, &schemas, range).await?;
        Ok((schema_report, reports))
    }

    async fn copy_with(
        supervisor: &ClusterSupervisor,
        schemas: &[DatabaseSchema],
        range: CopyRange,
    ) -> ReplicationResult<Vec<SyncReport>> {
        match range {
            CopyRange::Window { start, end } => {
                if start >= end {
                    return Err(ReplicationError::InvalidWindow { start, end });
                }
                supervisor.replicate_data(schemas, start, end).await
            }
            CopyRange::Full => supervisor.replicate_data_full(schemas).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryConnector;
    use crate::schema::RetentionPolicy;

    fn schema(name: &str) -> DatabaseSchema {
        DatabaseSchema::new(
            name,
            vec![RetentionPolicy::new("autogen", Duration::ZERO).as_default()],
        )
    }

    #[test]
    fn test_scope_without_rename_passes_through() {
        let scope = CopyScope::default();
        let schemas = scope.apply(vec![schema("a"), schema("b")]).unwrap();
        assert_eq!(schemas.len(), 2);
        assert!(schemas[0].target_name.is_none());
    }

    #[test]
    fn test_scope_rename_requires_single_database() {
        let scope = CopyScope {
            new_db: Some("copy".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            scope.apply(vec![schema("a"), schema("b")]),
            Err(ReplicationError::InvalidRename(2))
        ));

        let renamed = scope.apply(vec![schema("a")]).unwrap();
        assert_eq!(renamed[0].target_database(), "copy");
        assert_eq!(renamed[0].target_default_rp(), "autogen");
    }

    #[test]
    fn test_scope_invalid_filter() {
        let scope = CopyScope {
            measurement: "[".to_string(),
            ..Default::default()
        };
        assert!(matches!(scope.filter(), Err(ReplicationError::Schema(_))));
    }

    #[tokio::test]
    async fn test_unknown_node_rejected() {
        let agent = Agent::new(AgentConfig::default(), Arc::new(MemoryConnector::new()));
        let result = agent
            .replicate_schema("nope", "other", &CopyScope::default())
            .await;
        assert!(matches!(result, Err(ReplicationError::NodeNotConfigured(_))));
    }
}
