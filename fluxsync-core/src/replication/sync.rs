//! Chunked data synchronization
//!
//! A sync call moves every point of one (database, retention policy) pair
//! within a time window from a source node to a destination node:
//!
//! 1. The window is split into fixed-size chunks, walked in reverse (most recent
//!    first) or forward order. Chunks are processed one after another.
//! 2. Within a chunk, measurements are transferred concurrently by a bounded pool
//!    of workers. Each read and write is retried with a fixed delay.
//! 3. Chunks that recorded any read or write error are replayed once, split into
//!    sub-chunks of a tenth of the chunk duration.
//!
//! The call never fails because of an individual measurement or chunk; failures
//! are reported in the returned [`SyncReport`].

use super::{CopyOrder, ReplicationError, ReplicationResult, RetryPolicy, SyncSettings};
use crate::client::{
    epoch_nanos, from_epoch_nanos, BatchPoints, DbClient, Point, Query, Statement,
};
use crate::schema::{DatabaseSchema, MeasurementSchema, RetentionPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Time window of one chunk, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkWindow {
    /// 1-based position in traversal order
    pub index: usize,
    pub total: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ChunkWindow {
    pub fn contains(&self, other: &ChunkWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Split `[start, end)` into chunks of `chunk` length
///
/// The number of chunks is capped at `ceil(max_window / chunk)`; when the cap
/// applies, only the most recent part of the window is planned. A zero
/// `max_window` disables the cap. The chunk touching the far boundary is
/// shortened so the chunks partition the planned window exactly.
pub fn plan_chunks(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    chunk: Duration,
    max_window: Duration,
    order: CopyOrder,
) -> ReplicationResult<Vec<ChunkWindow>> {
    if chunk.is_zero() {
        return Err(ReplicationError::InvalidChunk(chunk));
    }
    if start >= end {
        return Err(ReplicationError::InvalidWindow { start, end });
    }

    let s = epoch_nanos(start) as i128;
    let e = epoch_nanos(end) as i128;
    let c = chunk.as_nanos() as i128;

    let mut count = ceil_div(e - s, c);
    let mut window_start = s;
    if !max_window.is_zero() {
        let cap = ceil_div(max_window.as_nanos() as i128, c).max(1);
        if count > cap {
            warn!(
                "Window {} - {} needs {} chunks, capped at {} by max retention {:?}",
                start, end, count, cap, max_window
            );
            count = cap;
            window_start = e - count * c;
        }
    }

    let total = count as usize;
    let windows = (0..count)
        .map(|i| {
            let (ws, we) = match order {
                CopyOrder::Reverse => ((e - (i + 1) * c).max(window_start), e - i * c),
                CopyOrder::Forward => (window_start + i * c, (window_start + (i + 1) * c).min(e)),
            };
            ChunkWindow {
                index: i as usize + 1,
                total,
                start: from_epoch_nanos(ws as i64),
                end: from_epoch_nanos(we as i64),
            }
        })
        .collect();
    Ok(windows)
}

fn ceil_div(a: i128, b: i128) -> i128 {
    (a + b - 1) / b
}

/// Chunk duration used by the replay pass
pub fn replay_chunk_duration(chunk: Duration) -> Duration {
    let fine = chunk / 10;
    if fine.is_zero() {
        chunk
    } else {
        fine
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPass {
    Initial,
    Replay,
}

/// Result of syncing one chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkReport {
    pub pass: SyncPass,
    pub window: ChunkWindow,
    pub measurements: usize,
    pub points: u64,
    /// Points written by a failed initial chunk before its replay; not counted in `points`
    pub superseded_points: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub elapsed: Duration,
}

impl ChunkReport {
    pub fn is_bad(&self) -> bool {
        self.read_errors > 0 || self.write_errors > 0
    }

    /// Progress through the pass, in percent
    pub fn percent(&self) -> usize {
        if self.window.total == 0 {
            return 100;
        }
        self.window.index * 100 / self.window.total
    }

    fn log(&self) {
        let line = format!(
            "Processed Chunk [{}/{}]({}%) from [{}] to [{}] ({}) Points Took [{:?}] ERRORS[R:{}|W:{}]",
            self.window.index,
            self.window.total,
            self.percent(),
            self.window.start.timestamp(),
            self.window.end.timestamp(),
            self.points,
            self.elapsed,
            self.read_errors,
            self.write_errors
        );
        match (self.pass, self.is_bad()) {
            (_, true) => warn!("{}", line),
            (SyncPass::Replay, false) => info!("[replay] {}", line),
            (SyncPass::Initial, false) => info!("{}", line),
        }
    }
}

/// Aggregate result of one sync call
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub destination: String,
    pub src_db: String,
    pub dst_db: String,
    pub src_rp: String,
    pub dst_rp: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_points: u64,
    pub elapsed: Duration,
    /// Reports of both passes, initial chunks first
    pub chunks: Vec<ChunkReport>,
    /// Chunks that failed in the initial pass
    pub initial_bad_chunks: Vec<ChunkReport>,
    /// Replay sub-chunks that still failed
    pub bad_chunks: Vec<ChunkReport>,
}

impl SyncReport {
    /// Initial-pass chunks that the replay did not fully recover
    fn unrecovered_chunks(&self) -> impl Iterator<Item = &ChunkReport> {
        self.initial_bad_chunks
            .iter()
            .filter(|parent| self.bad_chunks.iter().any(|b| parent.window.contains(&b.window)))
    }

    /// Remaining `(read, write, total)` error counts of the unrecovered initial chunks
    pub fn rw_errors(&self) -> (u64, u64, u64) {
        let (read, write) = self
            .unrecovered_chunks()
            .fold((0, 0), |(r, w), c| (r + c.read_errors, w + c.write_errors));
        (read, write, read + write)
    }

    /// Initial-pass chunk windows that the replay did not fully recover
    pub fn unrecovered_windows(&self) -> Vec<ChunkWindow> {
        self.unrecovered_chunks().map(|c| c.window).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.bad_chunks.is_empty()
    }

    fn log(&self) {
        let (read, write, _) = self.rw_errors();
        let line = format!(
            "Sync {}:{}.{} -> {}:{}.{} [{} - {}]: {} points in {:?}, {} bad chunks (R:{}|W:{})",
            self.source,
            self.src_db,
            self.src_rp,
            self.destination,
            self.dst_db,
            self.dst_rp,
            self.start,
            self.end,
            self.total_points,
            self.elapsed,
            self.unrecovered_chunks().count(),
            read,
            write
        );
        if self.is_clean() {
            info!("{}", line);
        } else {
            error!("{}", line);
        }
    }
}

/// A named node client
#[derive(Clone)]
pub struct Endpoint {
    pub name: String,
    pub client: Arc<dyn DbClient>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, client: Arc<dyn DbClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

/// One (database, retention policy) transfer over a window
#[derive(Clone)]
pub struct SyncJob {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub src_db: String,
    pub dst_db: String,
    pub src_rp: RetentionPolicy,
    pub dst_rp: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub order: CopyOrder,
}

impl SyncJob {
    /// Job for one policy of a discovered database, honoring its rename targets
    pub fn for_policy(
        source: Endpoint,
        destination: Endpoint,
        schema: &DatabaseSchema,
        rp: &RetentionPolicy,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        order: CopyOrder,
    ) -> Self {
        Self {
            source,
            destination,
            src_db: schema.name.clone(),
            dst_db: schema.target_database().to_string(),
            src_rp: rp.clone(),
            dst_rp: schema.target_rp_name(rp).to_string(),
            start,
            end,
            order,
        }
    }
}

struct TransferContext {
    source: Arc<dyn DbClient>,
    destination: Arc<dyn DbClient>,
    src_db: String,
    src_rp: String,
    dst_db: String,
    dst_rp: String,
    retry: RetryPolicy,
    max_points: usize,
}

#[derive(Debug, Default)]
struct MeasurementOutcome {
    points: u64,
    read_failed: bool,
    write_failed: bool,
}

/// Chunked, concurrent, retrying sync engine
pub struct ChunkedSyncEngine {
    settings: SyncSettings,
}

impl ChunkedSyncEngine {
    /// Create a new sync engine
    pub fn new(settings: SyncSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Sync one (database, retention policy) pair over the job's window
    ///
    /// Only an invalid window or chunk duration is an error.
    pub async fn sync(&self, job: &SyncJob) -> ReplicationResult<SyncReport> {
        let windows = plan_chunks(
            job.start,
            job.end,
            self.settings.chunk_duration,
            self.settings.max_retention,
            job.order,
        )?;

        let started = Instant::now();
        let ctx = Arc::new(TransferContext {
            source: job.source.client.clone(),
            destination: job.destination.client.clone(),
            src_db: job.src_db.clone(),
            src_rp: job.src_rp.name.clone(),
            dst_db: job.dst_db.clone(),
            dst_rp: job.dst_rp.clone(),
            retry: self.settings.retry,
            max_points: self.settings.max_points_per_write,
        });
        let measurements: Vec<Arc<MeasurementSchema>> = job
            .src_rp
            .measurements
            .values()
            .cloned()
            .map(Arc::new)
            .collect();

        info!(
            "Syncing {}:{}.{} -> {}:{}.{} from {} to {} ({} chunks, {} measurements, {})",
            job.source.name,
            job.src_db,
            job.src_rp.name,
            job.destination.name,
            job.dst_db,
            job.dst_rp,
            job.start,
            job.end,
            windows.len(),
            measurements.len(),
            job.order
        );

        let mut chunks = Vec::with_capacity(windows.len());
        let mut initial_bad_chunks = Vec::new();
        for window in &windows {
            let mut report = self
                .sync_chunk(&ctx, &measurements, window, SyncPass::Initial)
                .await;
            report.log();
            if report.is_bad() {
                initial_bad_chunks.push(report.clone());
                // the replay rewrites this whole window and counts its points
                report.superseded_points = report.points;
                report.points = 0;
            }
            chunks.push(report);
        }

        let mut bad_chunks = Vec::new();
        if !initial_bad_chunks.is_empty() {
            let fine = replay_chunk_duration(self.settings.chunk_duration);
            warn!(
                "Replaying {} bad chunks at {:?} granularity",
                initial_bad_chunks.len(),
                fine
            );
            for parent in &initial_bad_chunks {
                let sub_windows = plan_chunks(
                    parent.window.start,
                    parent.window.end,
                    fine,
                    Duration::ZERO,
                    job.order,
                )?;
                for window in &sub_windows {
                    let report = self
                        .sync_chunk(&ctx, &measurements, window, SyncPass::Replay)
                        .await;
                    report.log();
                    if report.is_bad() {
                        bad_chunks.push(report.clone());
                    }
                    chunks.push(report);
                }
            }
        }

        let report = SyncReport {
            source: job.source.name.clone(),
            destination: job.destination.name.clone(),
            src_db: job.src_db.clone(),
            dst_db: job.dst_db.clone(),
            src_rp: job.src_rp.name.clone(),
            dst_rp: job.dst_rp.clone(),
            start: job.start,
            end: job.end,
            total_points: chunks.iter().map(|c| c.points).sum(),
            elapsed: started.elapsed(),
            chunks,
            initial_bad_chunks,
            bad_chunks,
        };
        report.log();
        Ok(report)
    }

    async fn sync_chunk(
        &self,
        ctx: &Arc<TransferContext>,
        measurements: &[Arc<MeasurementSchema>],
        window: &ChunkWindow,
        pass: SyncPass,
    ) -> ChunkReport {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut tasks = JoinSet::new();

        for measurement in measurements {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Worker pool closed: {}", e);
                    break;
                }
            };
            let ctx = ctx.clone();
            let measurement = measurement.clone();
            let window = *window;
            tasks.spawn(async move {
                let _permit = permit;
                transfer_measurement(&ctx, &measurement, &window).await
            });
        }

        let mut report = ChunkReport {
            pass,
            window: *window,
            measurements: measurements.len(),
            points: 0,
            superseded_points: 0,
            read_errors: 0,
            write_errors: 0,
            elapsed: Duration::ZERO,
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    report.points += outcome.points;
                    if outcome.read_failed {
                        report.read_errors += 1;
                    }
                    if outcome.write_failed {
                        report.write_errors += 1;
                    }
                }
                Err(e) => {
                    error!("Measurement worker failed: {}", e);
                    report.read_errors += 1;
                }
            }
        }

        report.elapsed = started.elapsed();
        report
    }
}

async fn transfer_measurement(
    ctx: &TransferContext,
    measurement: &MeasurementSchema,
    window: &ChunkWindow,
) -> MeasurementOutcome {
    let query = Query::new(Statement::SelectWindow {
        retention_policy: ctx.src_rp.clone(),
        measurement: measurement.name.clone(),
        start: window.start,
        end: window.end,
    })
    .on_database(ctx.src_db.as_str())
    .with_retention_policy(ctx.src_rp.as_str());

    let read_what = format!("read {}.{}.{}", ctx.src_db, ctx.src_rp, measurement.name);
    let response = match ctx.retry.run(&read_what, || ctx.source.query(&query)).await {
        Ok(response) => response,
        Err(e) => {
            error!("{} [{} - {}] gave up: {}", read_what, window.start, window.end, e);
            return MeasurementOutcome {
                read_failed: true,
                ..Default::default()
            };
        }
    };

    let mut points: Vec<Point> = Vec::new();
    for series in response.series() {
        match measurement.decode_series(series) {
            Ok(decoded) => {
                if decoded.dropped_fields > 0 || decoded.dropped_points > 0 {
                    debug!(
                        "{}: dropped {} fields and {} points while decoding",
                        measurement.name, decoded.dropped_fields, decoded.dropped_points
                    );
                }
                points.extend(decoded.points);
            }
            Err(e) => warn!("{}: skipping series: {}", measurement.name, e),
        }
    }

    if points.is_empty() {
        return MeasurementOutcome::default();
    }

    let write_what = format!("write {}.{}.{}", ctx.dst_db, ctx.dst_rp, measurement.name);
    let mut outcome = MeasurementOutcome::default();
    let batches = BatchPoints::new(ctx.dst_db.as_str(), ctx.dst_rp.as_str())
        .with_points(points)
        .split(ctx.max_points);

    for batch in &batches {
        match ctx.retry.run(&write_what, || ctx.destination.write(batch)).await {
            Ok(()) => outcome.points += batch.len() as u64,
            Err(e) => {
                error!("{} [{} - {}] gave up: {}", write_what, window.start, window.end, e);
                outcome.write_failed = true;
                break;
            }
        }
    }
    outcome
}
