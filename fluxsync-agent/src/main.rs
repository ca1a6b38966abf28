//! FluxSync agent - InfluxDB master/slave replication
//!
//! Runs either as a long-lived HA monitor that replays slave outages, or as a
//! one-shot schema replication / data copy between two configured nodes.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use fluxsync_core::client::http::HttpConnector;
use fluxsync_core::{
    init_logging, parse_input_time, start_status_server, Agent, AgentConfig, CopyOrder,
    CopyRange, CopyScope, LoggingConfig, SchemaReplicationReport, StatusSource, SyncReport,
    DEFAULT_CONFIG_PATH,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    /// Monitor master and slave, replay slave outages
    Hamonitor,
    /// Copy data in a time range
    Copy,
    /// Replicate schema, then copy data
    Fullcopy,
    /// Replicate schema only
    Replicaschema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogMode {
    Console,
    File,
}

#[derive(Parser, Debug)]
#[command(name = "fluxsync")]
#[command(about = "InfluxDB master/slave replication agent")]
#[command(version)]
struct Args {
    /// Action to run
    #[arg(long, value_enum, default_value = "hamonitor")]
    action: Action,

    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Master node name (defaults to general.master_db)
    #[arg(long)]
    master: Option<String>,

    /// Slave node name (defaults to general.slave_db)
    #[arg(long)]
    slave: Option<String>,

    /// Database name regex
    #[arg(long, default_value = "")]
    db: String,

    /// Retention policy name regex
    #[arg(long, default_value = "")]
    rp: String,

    /// Measurement name regex
    #[arg(long, default_value = "")]
    meas: String,

    /// Target database name on the slave (single database only)
    #[arg(long)]
    newdb: Option<String>,

    /// Target default retention policy name on the slave (single database only)
    #[arg(long)]
    newrp: Option<String>,

    /// Chunk duration, e.g. "1h" or "30m"
    #[arg(long)]
    chunk: Option<humantime::Duration>,

    /// Copy start: unix seconds, -<duration> or RFC 3339
    #[arg(long, default_value = "-24h", allow_hyphen_values = true)]
    start: String,

    /// Copy end: unix seconds, -<duration> or RFC 3339 (defaults to now)
    #[arg(long, allow_hyphen_values = true)]
    end: Option<String>,

    /// Chunk traversal order: reverse|backward|forward
    #[arg(long, default_value = "reverse")]
    copyorder: CopyOrder,

    /// Copy everything each retention policy holds instead of --start/--end
    #[arg(long)]
    full: bool,

    /// Verbosity for one-shot actions (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log destination
    #[arg(long, value_enum, default_value = "console")]
    logmode: LogMode,

    /// Log directory for --logmode file (defaults to general.log_dir)
    #[arg(long)]
    logs: Option<PathBuf>,

    /// Write the process id to this file
    #[arg(long)]
    pidfile: Option<PathBuf>,
}

impl Args {
    fn logging(&self, config: &AgentConfig) -> LoggingConfig {
        let level = match self.action {
            Action::Hamonitor => config.general.log_level.clone(),
            _ => LoggingConfig::level_for_verbosity(self.verbose).to_string(),
        };
        let log_dir = match self.logmode {
            LogMode::Console => None,
            LogMode::File => Some(
                self.logs
                    .clone()
                    .unwrap_or_else(|| config.general.log_dir.clone()),
            ),
        };
        LoggingConfig {
            level,
            json_format: false,
            log_dir,
        }
    }

    fn scope(&self) -> CopyScope {
        CopyScope {
            db: self.db.clone(),
            rp: self.rp.clone(),
            measurement: self.meas.clone(),
            new_db: self.newdb.clone(),
            new_rp: self.newrp.clone(),
        }
    }

    fn range(&self) -> Result<CopyRange> {
        if self.full {
            return Ok(CopyRange::Full);
        }
        let now = Utc::now();
        let start = parse_input_time(&self.start, now)
            .with_context(|| format!("Invalid --start: {}", self.start))?;
        let end = match &self.end {
            Some(end) => parse_input_time(end, now).with_context(|| format!("Invalid --end: {}", end))?,
            None => now,
        };
        Ok(CopyRange::Window { start, end })
    }
}

fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create pid file directory: {}", parent.display()))?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("Failed to write pid file: {}", path.display()))
}

fn print_schema_report(report: &SchemaReplicationReport) {
    println!(
        "Schema: {} databases, {} retention policies, {} errors",
        report.databases,
        report.retention_policies,
        report.errors.len()
    );
    for e in &report.errors {
        println!("  error: {}", e);
    }
}

fn print_sync_reports(reports: &[SyncReport]) {
    for r in reports {
        let (read, write, _) = r.rw_errors();
        let unrecovered = r.unrecovered_windows();
        println!(
            "{}.{} -> {}.{}: {} points in {:?}, {} chunks, {} bad (R:{}|W:{})",
            r.src_db,
            r.src_rp,
            r.dst_db,
            r.dst_rp,
            r.total_points,
            r.elapsed,
            r.chunks.len(),
            unrecovered.len(),
            read,
            write
        );
        for w in unrecovered {
            println!("  unrecovered: {} - {}", w.start, w.end);
        }
    }
    let total: u64 = reports.iter().map(|r| r.total_points).sum();
    println!("Total: {} points", total);
}

async fn run_ha_monitor(agent: &Agent, master: &str, slave: &str, order: CopyOrder) -> Result<()> {
    let handle = agent.start_ha_monitor(master, slave, order).await?;

    let bind_addr = agent.config().http.bind_addr.clone();
    let source: Arc<dyn StatusSource> = handle.supervisor().clone();
    let status_server = tokio::spawn(async move { start_status_server(source, &bind_addr).await });

    info!("FluxSync is monitoring {} -> {}", master, slave);
    info!("Press Ctrl+C to shutdown");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping...");
        }
        result = status_server => {
            match result {
                Ok(Ok(())) => warn!("Status server stopped"),
                Ok(Err(e)) => error!("Status server error: {:?}", e),
                Err(e) => error!("Status server task error: {}", e),
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

async fn run_action(args: &Args, agent: &Agent, master: &str, slave: &str) -> Result<()> {
    match args.action {
        Action::Hamonitor => run_ha_monitor(agent, master, slave, args.copyorder).await?,
        Action::Replicaschema => {
            let report = agent.replicate_schema(master, slave, &args.scope()).await?;
            print_schema_report(&report);
        }
        Action::Copy => {
            let reports = agent
                .copy(master, slave, &args.scope(), args.range()?, args.copyorder)
                .await?;
            print_sync_reports(&reports);
        }
        Action::Fullcopy => {
            let (schema, reports) = agent
                .full_copy(master, slave, &args.scope(), args.range()?, args.copyorder)
                .await?;
            print_schema_report(&schema);
            print_sync_reports(&reports);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AgentConfig::load(&args.config)?;
    init_logging(args.logging(&config))?;

    if let Some(path) = &args.pidfile {
        write_pid_file(path)?;
    }

    let master = args
        .master
        .clone()
        .unwrap_or_else(|| config.general.master_db.clone());
    let slave = args
        .slave
        .clone()
        .unwrap_or_else(|| config.general.slave_db.clone());

    info!(
        "FluxSync {} starting: instance {}, action {:?}, config {}",
        env!("CARGO_PKG_VERSION"),
        config.general.instance_id,
        args.action,
        args.config.display()
    );

    let mut agent = Agent::new(config, Arc::new(HttpConnector));
    if let Some(chunk) = args.chunk {
        agent = agent.with_chunk_duration(chunk.into());
    }

    let result = run_action(&args, &agent, &master, &slave).await;

    if let Some(path) = &args.pidfile {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove pid file {}: {}", path.display(), e);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_times_as_separate_arguments() {
        let args = Args::try_parse_from([
            "fluxsync", "--action", "copy", "--start", "-24h", "--end", "-1h",
        ])
        .unwrap();

        assert_eq!(args.action, Action::Copy);
        assert_eq!(args.start, "-24h");
        assert_eq!(args.end.as_deref(), Some("-1h"));
        match args.range().unwrap() {
            CopyRange::Window { start, end } => {
                assert_eq!(end - start, chrono::Duration::hours(23));
            }
            CopyRange::Full => panic!("expected a window"),
        }
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["fluxsync"]).unwrap();

        assert_eq!(args.action, Action::Hamonitor);
        assert_eq!(args.start, "-24h");
        assert!(args.end.is_none());
        assert_eq!(args.copyorder, CopyOrder::Reverse);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }
}
