//! Batched loader
//!
//! Consumes the mapped-record stream in fixed-size batches and commits each
//! batch as a single all-or-nothing unit, in source order. The bulk path is
//! the store's streaming copy; when a batch fails outright the loader
//! retries it at single-record granularity so only genuinely invalid
//! records are lost while everything else lands.
//!
//! Transient failures (timeouts, connectivity loss) get a bounded number of
//! retries before they become fatal. Cancellation is honored between
//! batches, never mid-batch, so the last committed batch boundary is always
//! well defined and a rerun can resume from it.

use std::time::Duration;

use nodelink_common::{EtlError, Result};
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::LoadMode;
use crate::mapper::{MappedRecord, Rejection};
use crate::report::REJECTION_SAMPLE_LIMIT;
use crate::store::{bounded, SpatialStore, TableSchema};

/// Default per-operation timeout
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default retry budget for transient failures
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Records read before the rejection-rate threshold is enforced mid-run
const THRESHOLD_MIN_READ: u64 = 1_000;

/// Bounded sample of conflicting keys reported in append mode
const CONFLICT_SAMPLE_LIMIT: usize = 20;

/// Loader tuning
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Retry budget for transient failures per batch/row
    pub max_retries: u32,
    /// Independent timeout for each store call
    pub op_timeout: Duration,
    /// Delay between transient retries
    pub retry_backoff: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            op_timeout: DEFAULT_OP_TIMEOUT,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// One item out of the mapping stage
#[derive(Debug)]
pub enum MapperItem {
    Mapped(MappedRecord),
    Rejected(Rejection),
}

/// Running counts for one dataset load
#[derive(Debug, Default, Clone)]
pub struct LoadStats {
    /// Records read from the source (mapped plus rejected)
    pub read: u64,
    pub inserted: u64,
    pub rejected: u64,
    /// First rejections, bounded
    pub rejection_sample: Vec<Rejection>,
    pub batches_committed: u64,
    /// The run was cancelled between batches
    pub cancelled: bool,
}

impl LoadStats {
    fn record_rejection(&mut self, rejection: Rejection) {
        self.rejected += 1;
        if self.rejection_sample.len() < REJECTION_SAMPLE_LIMIT {
            self.rejection_sample.push(rejection);
        }
    }

    fn rejection_rate(&self) -> f64 {
        if self.read == 0 {
            0.0
        } else {
            self.rejected as f64 / self.read as f64
        }
    }
}

/// Drives batched insertion for one dataset
pub struct Loader<'a> {
    store: &'a dyn SpatialStore,
    schema: &'a TableSchema,
    mode: LoadMode,
    config: LoaderConfig,
    cancel: CancellationToken,
    progress: Option<indicatif::ProgressBar>,
    rejection_threshold: f64,
}

impl<'a> Loader<'a> {
    pub fn new(
        store: &'a dyn SpatialStore,
        schema: &'a TableSchema,
        mode: LoadMode,
        config: LoaderConfig,
        cancel: CancellationToken,
        progress: Option<indicatif::ProgressBar>,
        rejection_threshold: f64,
    ) -> Self {
        Self {
            store,
            schema,
            mode,
            config,
            cancel,
            progress,
            rejection_threshold,
        }
    }

    /// Consume the mapping stage's output until the channel closes, the
    /// rejection-rate threshold trips, or the run is cancelled.
    pub async fn load(&self, mut rx: Receiver<MapperItem>, batch_size: usize) -> Result<LoadStats> {
        let mut stats = LoadStats::default();
        let mut batch: Vec<MappedRecord> = Vec::with_capacity(batch_size);

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => {
                    stats.cancelled = true;
                    break;
                }
                item = rx.recv() => item,
            };

            let item = match item {
                Some(item) => item,
                None => break,
            };

            stats.read += 1;
            match item {
                MapperItem::Rejected(rejection) => {
                    debug!(rejection = %rejection, "Record rejected by mapper");
                    stats.record_rejection(rejection);
                }
                MapperItem::Mapped(record) => batch.push(record),
            }

            if batch.len() >= batch_size {
                if self.cancel.is_cancelled() {
                    stats.cancelled = true;
                    break;
                }
                let rows = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                self.commit_batch(&mut stats, rows).await?;

                if stats.read >= THRESHOLD_MIN_READ
                    && stats.rejection_rate() > self.rejection_threshold
                {
                    return Err(self.threshold_error(&stats));
                }
            }
        }

        if !stats.cancelled && self.cancel.is_cancelled() {
            stats.cancelled = true;
        }
        if !stats.cancelled && !batch.is_empty() {
            self.commit_batch(&mut stats, batch).await?;
        }

        if !stats.cancelled && stats.rejection_rate() > self.rejection_threshold {
            return Err(self.threshold_error(&stats));
        }

        info!(
            table = %self.schema.table,
            read = stats.read,
            inserted = stats.inserted,
            rejected = stats.rejected,
            batches = stats.batches_committed,
            cancelled = stats.cancelled,
            "Load finished"
        );
        Ok(stats)
    }

    fn threshold_error(&self, stats: &LoadStats) -> EtlError {
        EtlError::RejectionRateExceeded {
            rate: stats.rejection_rate(),
            threshold: self.rejection_threshold,
            rejected: stats.rejected,
            read: stats.read,
        }
    }

    async fn commit_batch(&self, stats: &mut LoadStats, rows: Vec<MappedRecord>) -> Result<()> {
        let batch_number = stats.batches_committed as usize + 1;

        if self.mode == LoadMode::Append {
            let keys: Vec<String> = rows.iter().map(|r| r.key.clone()).collect();
            let existing = bounded(
                self.config.op_timeout,
                self.store.existing_keys(self.schema, &keys),
            )
            .await?;
            if !existing.is_empty() {
                return Err(EtlError::AppendConflict {
                    table: self.schema.table.clone(),
                    count: existing.len(),
                    sample: existing.into_iter().take(CONFLICT_SAMPLE_LIMIT).collect(),
                });
            }
        }

        // Bulk path first, with a bounded retry budget for transient errors
        let mut attempt = 0;
        let batch_error = loop {
            attempt += 1;
            match bounded(self.config.op_timeout, self.store.copy_rows(self.schema, &rows)).await {
                Ok(n) => {
                    stats.inserted += n;
                    stats.batches_committed += 1;
                    if let Some(bar) = &self.progress {
                        bar.inc(n);
                    }
                    debug!(table = %self.schema.table, batch = batch_number, rows = n, "Batch committed");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    warn!(
                        table = %self.schema.table,
                        batch = batch_number,
                        attempt,
                        error = %e,
                        "Transient batch failure, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(EtlError::RetriesExhausted(attempt));
                }
                Err(e) => break e,
            }
        };

        warn!(
            table = %self.schema.table,
            batch = batch_number,
            error = %batch_error,
            "Batch failed, isolating offenders at single-record granularity"
        );
        self.commit_row_by_row(stats, rows).await?;
        stats.batches_committed += 1;
        Ok(())
    }

    /// Single-record isolation pass: each row either lands or becomes a
    /// rejection, so data loss is bounded to genuinely invalid records.
    async fn commit_row_by_row(&self, stats: &mut LoadStats, rows: Vec<MappedRecord>) -> Result<()> {
        for row in rows {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match bounded(self.config.op_timeout, self.store.insert_row(self.schema, &row))
                    .await
                {
                    Ok(()) => {
                        stats.inserted += 1;
                        if let Some(bar) = &self.progress {
                            bar.inc(1);
                        }
                        break;
                    }
                    Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                    Err(e) if e.is_transient() => {
                        return Err(EtlError::RetriesExhausted(attempt));
                    }
                    Err(e) => {
                        // A store-level rejection has no offending input
                        // value; attribute it to the key column
                        stats.record_rejection(Rejection {
                            record_index: row.index,
                            key: Some(row.key.clone()),
                            field: self.schema.key_column.clone(),
                            input: String::new(),
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
