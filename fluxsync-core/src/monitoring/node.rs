//! Node health monitor
//!
//! A [`NodeMonitor`] wraps one database node. Its probe task periodically
//! connects, pings and lists databases; the outcome flips the up flag and, on
//! success, advances the last-contact time. The client obtained by the last
//! successful probe is kept apart from the client used for data transfer until
//! [`NodeMonitor::refresh_connection`] promotes it.

use crate::client::{ClientError, ClientResult, Connector, DbClient, Query, Statement};
use crate::config::NodeConfig;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runtime status of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub is_up: bool,
    pub last_ok: DateTime<Utc>,
    pub version: Option<String>,
    pub ping_latency: Duration,
    pub last_error: Option<String>,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeState {
    pub is_up: bool,
    pub last_ok: DateTime<Utc>,
    /// Time since the last successful contact
    pub since: Duration,
}

/// Outcome of a successful probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub latency: Duration,
    pub version: String,
}

pub struct NodeMonitor {
    config: NodeConfig,
    connector: Arc<dyn Connector>,
    check_interval: Duration,
    status: RwLock<NodeStatus>,
    active: RwLock<Option<Arc<dyn DbClient>>>,
    probed: RwLock<Option<Arc<dyn DbClient>>>,
}

impl NodeMonitor {
    /// Create a new monitor; the node starts as down, last seen now
    pub fn new(config: NodeConfig, connector: Arc<dyn Connector>, check_interval: Duration) -> Self {
        Self {
            config,
            connector,
            check_interval,
            status: RwLock::new(NodeStatus {
                is_up: false,
                last_ok: Utc::now(),
                version: None,
                ping_latency: Duration::ZERO,
                last_error: None,
            }),
            active: RwLock::new(None),
            probed: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Connect, ping and list databases within the node timeout
    ///
    /// Failures clear the up flag and keep the previous last-contact time.
    pub async fn probe(&self) -> ClientResult<ProbeReport> {
        let timeout = self.config.timeout();
        let result = match tokio::time::timeout(timeout, self.probe_once()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        };

        match result {
            Ok((client, report)) => {
                *self.probed.write() = Some(client);
                let mut status = self.status.write();
                status.is_up = true;
                status.last_ok = Utc::now();
                status.version = Some(report.version.clone());
                status.ping_latency = report.latency;
                status.last_error = None;
                Ok(report)
            }
            Err(e) => {
                let mut status = self.status.write();
                status.is_up = false;
                status.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn probe_once(&self) -> ClientResult<(Arc<dyn DbClient>, ProbeReport)> {
        let client = self.connector.connect(&self.config).await?;
        let ping = client.ping().await?;
        client.query(&Query::new(Statement::ShowDatabases)).await?;
        Ok((
            client,
            ProbeReport {
                latency: ping.latency,
                version: ping.version,
            },
        ))
    }

    /// Probe and promote the probed client into active use
    pub async fn connect(&self) -> ClientResult<ProbeReport> {
        let report = self.probe().await?;
        self.refresh_connection();
        Ok(report)
    }

    /// Probe and log the outcome
    pub async fn check(&self) -> bool {
        match self.probe().await {
            Ok(report) => {
                debug!(
                    "[{}] OK (version {}, ping {:?})",
                    self.config.name, report.version, report.latency
                );
                true
            }
            Err(e) => {
                let state = self.state();
                warn!(
                    "[{}] NOT OK for {:?} (last ok {}): {}",
                    self.config.name, state.since, state.last_ok, e
                );
                false
            }
        }
    }

    pub fn state(&self) -> NodeState {
        let status = self.status.read();
        NodeState {
            is_up: status.is_up,
            last_ok: status.last_ok,
            since: (Utc::now() - status.last_ok).to_std().unwrap_or_default(),
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.status.read().clone()
    }

    /// Client used for data transfer
    pub fn connection(&self) -> Option<Arc<dyn DbClient>> {
        self.active.read().clone()
    }

    /// Promote the last probed client into active use
    pub fn refresh_connection(&self) -> Option<Arc<dyn DbClient>> {
        let probed = self.probed.read().clone();
        if let Some(ref client) = probed {
            *self.active.write() = Some(client.clone());
        }
        probed
    }

    /// Run the probe loop until a shutdown signal arrives
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "[{}] health monitor started (interval {:?})",
                self.config.name, self.check_interval
            );
            let mut interval = tokio::time::interval(self.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.check().await;
                    }
                    _ = shutdown.recv() => {
                        info!("[{}] health monitor stopped", self.config.name);
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

    fn monitor(node: &Arc<MemoryNode>) -> NodeMonitor {
        let connector = Arc::new(MemoryConnector::new().with_node(node.clone()));
        let config = NodeConfig {
            name: node.name().to_string(),
            ..Default::default()
        };
        NodeMonitor::new(config, connector, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_probe_success_marks_up() {
        let node = MemoryNode::new("influx01");
        let monitor = monitor(&node);
        assert!(!monitor.state().is_up);

        let report = monitor.probe().await.unwrap();
        assert_eq!(report.version, "1.8.10-memory");
        assert!(monitor.state().is_up);
        assert_eq!(monitor.status().version.as_deref(), Some("1.8.10-memory"));
    }

    #[tokio::test]
    async fn test_probe_failure_keeps_last_ok() {
        let node = MemoryNode::new("influx01");
        let monitor = monitor(&node);
        monitor.probe().await.unwrap();
        let last_ok = monitor.state().last_ok;

        node.set_online(false);
        assert!(monitor.probe().await.is_err());
        let state = monitor.state();
        assert!(!state.is_up);
        assert_eq!(state.last_ok, last_ok);
        assert!(monitor.status().last_error.is_some());
    }

    #[tokio::test]
    async fn test_probed_client_promoted_on_refresh() {
        let node = MemoryNode::new("influx01");
        let monitor = monitor(&node);
        assert!(monitor.connection().is_none());

        monitor.probe().await.unwrap();
        assert!(monitor.connection().is_none());

        assert!(monitor.refresh_connection().is_some());
        assert!(monitor.connection().is_some());
    }

    #[tokio::test]
    async fn test_spawned_loop_tracks_outage() {
        let node = MemoryNode::new("influx01");
        let monitor = Arc::new(monitor(&node));
        let (tx, rx) = broadcast::channel(1);
        let handle = monitor.clone().spawn(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.state().is_up);

        node.set_online(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!monitor.state().is_up);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
