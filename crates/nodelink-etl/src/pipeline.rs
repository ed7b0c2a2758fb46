//! Pipeline orchestration
//!
//! One run processes an ordered list of dataset descriptors. Each dataset
//! walks the state machine
//! `PENDING -> READING -> MAPPING -> LOADING -> INDEXING -> VERIFYING`
//! and ends in `SUCCEEDED`, `FAILED`, or `CANCELLED`. The first dataset
//! that does not succeed stops the run; later datasets stay `PENDING` so
//! the report shows exactly where a rerun has to pick up.
//!
//! Reading and mapping are blocking file work and run on a dedicated
//! blocking task; mapped records flow to the async loader over a bounded
//! channel, so the reader can never race ahead of the database by more
//! than the channel depth.

use std::sync::Arc;

use chrono::Utc;
use nodelink_common::{EtlError, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::descriptor::{DatasetDescriptor, LoadMode};
use crate::index;
use crate::loader::{Loader, LoaderConfig, MapperItem};
use crate::mapper::SchemaMapper;
use crate::report::{DatasetReport, RunReport, RunState};
use crate::source;
use crate::store::{SpatialStore, TableSchema};
use crate::verify;

/// Depth of the reader-to-loader channel, in records
const CHANNEL_DEPTH: usize = 4_096;

/// Run-wide options
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub mode: LoadMode,
    /// Checked between batches; a cancelled token ends the run at the next
    /// batch boundary
    pub cancel: CancellationToken,
    pub loader: LoaderConfig,
    /// Show a progress bar on stderr
    pub progress: bool,
}

impl PipelineOptions {
    pub fn new(mode: LoadMode) -> Self {
        Self {
            mode,
            cancel: CancellationToken::new(),
            loader: LoaderConfig::default(),
            progress: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}

/// Drives full dataset loads against one spatial store
pub struct Pipeline<S: SpatialStore + 'static> {
    store: Arc<S>,
}

impl<S: SpatialStore + 'static> Pipeline<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Process the datasets in order, stopping at the first one that does
    /// not succeed. Always returns a report; per-dataset errors are
    /// recorded there rather than propagated.
    pub async fn run(
        &self,
        descriptors: &[DatasetDescriptor],
        options: &PipelineOptions,
    ) -> RunReport {
        let started_at = Utc::now();
        let mut datasets = Vec::with_capacity(descriptors.len());
        let mut stop = false;

        for descriptor in descriptors {
            let mut report = DatasetReport::new(&descriptor.name, &descriptor.table, options.mode);
            if stop {
                // Stays PENDING so the report shows where to resume
                datasets.push(report);
                continue;
            }

            let span = info_span!("dataset", name = %descriptor.name, table = %descriptor.table);
            self.run_dataset(descriptor, options, &mut report)
                .instrument(span)
                .await;

            if report.state != RunState::Succeeded {
                stop = true;
            }
            datasets.push(report);
        }

        RunReport {
            started_at,
            finished_at: Utc::now(),
            datasets,
        }
    }

    async fn run_dataset(
        &self,
        descriptor: &DatasetDescriptor,
        options: &PipelineOptions,
        report: &mut DatasetReport,
    ) {
        if let Err(e) = descriptor.validate() {
            error!(error = %e, "Descriptor rejected");
            report.error = Some(e.to_string());
            report.finish(RunState::Failed);
            return;
        }

        if let Err(e) = self.store.claim_table(&descriptor.table).await {
            error!(error = %e, "Could not claim target table");
            report.error = Some(e.to_string());
            report.finish(RunState::Failed);
            return;
        }

        let outcome = self.load_claimed(descriptor, options, report).await;
        if let Err(e) = self.store.release_table(&descriptor.table).await {
            warn!(error = %e, "Releasing the table claim failed");
        }

        if let Err(e) = outcome {
            error!(error = %e, state = %report.state, "Dataset failed");
            report.error = Some(e.to_string());
            report.finish(RunState::Failed);
        }
    }

    /// Everything that runs while the table claim is held
    async fn load_claimed(
        &self,
        descriptor: &DatasetDescriptor,
        options: &PipelineOptions,
        report: &mut DatasetReport,
    ) -> Result<()> {
        let schema = TableSchema::from_descriptor(descriptor);
        self.store.prepare_table(&schema, options.mode).await?;
        let baseline = match options.mode {
            LoadMode::Overwrite => 0,
            LoadMode::Append => self.store.count_rows(&schema.table).await?,
        };

        report.state = RunState::Reading;
        info!(path = %descriptor.path.display(), encoding = %descriptor.encoding, "Reading source");

        let shared = Arc::new(descriptor.clone());
        let (tx, rx) = mpsc::channel::<MapperItem>(CHANNEL_DEPTH);
        let producer = {
            let descriptor = Arc::clone(&shared);
            tokio::task::spawn_blocking(move || -> (u64, Result<()>) {
                let mut src = match source::open(&descriptor) {
                    Ok(src) => src,
                    Err(e) => return (0, Err(e)),
                };
                let mapper = SchemaMapper::new(Arc::clone(&descriptor));
                loop {
                    match src.next_record() {
                        Ok(Some(raw)) => {
                            let item = match mapper.map(&raw) {
                                Ok(mapped) => MapperItem::Mapped(mapped),
                                Err(rejection) => MapperItem::Rejected(rejection),
                            };
                            // The loader dropping its receiver ends the read
                            if tx.blocking_send(item).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => return (src.decode_repairs(), Err(e)),
                    }
                }
                (src.decode_repairs(), Ok(()))
            })
        };

        // Mapping rides the reader task; the pipeline observes it as the
        // phase between spawning the reader and draining the channel.
        report.state = RunState::Mapping;
        let progress = options.progress.then(|| {
            let bar = indicatif::ProgressBar::new_spinner();
            bar.set_message(format!("loading {}", descriptor.table));
            bar
        });

        report.state = RunState::Loading;
        let loader = Loader::new(
            &*self.store,
            &schema,
            options.mode,
            options.loader.clone(),
            options.cancel.clone(),
            progress.clone(),
            descriptor.rejection_threshold,
        );
        let load_result = loader.load(rx, descriptor.batch_size).await;
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        let (decode_repairs, read_result) = producer
            .await
            .map_err(|e| EtlError::Source {
                dataset: descriptor.name.clone(),
                message: format!("reader task panicked: {}", e),
            })?;
        report.decode_repairs = decode_repairs;

        let stats = load_result?;
        report.read = stats.read;
        report.inserted = stats.inserted;
        report.rejected = stats.rejected;
        report.batches_committed = stats.batches_committed;
        report.rejection_sample = stats.rejection_sample.clone();

        // A read failure outranks a clean-looking load of the prefix, and
        // the source is the stage to blame for it
        if let Err(e) = read_result {
            report.state = RunState::Reading;
            return Err(e);
        }

        if stats.cancelled {
            warn!(batches = stats.batches_committed, "Run cancelled between batches");
            report.finish(RunState::Cancelled);
            return Ok(());
        }

        report.state = RunState::Indexing;
        report.indexes = index::build_indexes(
            &*self.store,
            &schema,
            &descriptor.indexes,
            options.loader.op_timeout,
            &options.cancel,
        )
        .await?;
        if options.cancel.is_cancelled() {
            warn!(indexes = report.indexes.len(), "Run cancelled during indexing");
            report.finish(RunState::Cancelled);
            return Ok(());
        }

        report.state = RunState::Verifying;
        let verification = verify::verify_dataset(
            &*self.store,
            &schema,
            descriptor,
            baseline + stats.inserted,
            options.loader.op_timeout,
        )
        .await?;
        let passed = verification.passed();
        let failures = verification.failures();
        report.verification = Some(verification);

        if passed {
            report.finish(RunState::Succeeded);
        } else {
            report.error = Some(failures.join("; "));
            report.finish(RunState::Failed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{
        ColumnKind, ColumnSpec, GeometrySpec, IndexDescriptor, IndexKind, SourceFormat,
    };
    use crate::store::MemStore;
    use std::io::Write;
    use std::path::Path;

    fn write_file(path: &Path, contents: &str) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    fn node_descriptor(path: &Path) -> DatasetDescriptor {
        DatasetDescriptor {
            name: "moct_node".into(),
            path: path.to_path_buf(),
            encoding: "UTF-8".into(),
            source_srid: 4326,
            target_srid: 4326,
            format: SourceFormat::Delimited {
                delimiter: ',',
                header_rows: 1,
                field_order: None,
            },
            key_column: "node_id".into(),
            columns: vec![ColumnSpec {
                field: "NODE_ID".into(),
                column: "node_id".into(),
                kind: ColumnKind::Text,
            }],
            geometry: GeometrySpec::PointFields {
                x_field: "X".into(),
                y_field: "Y".into(),
            },
            table: "moct_node".into(),
            batch_size: 2,
            rejection_threshold: 0.5,
            indexes: vec![IndexDescriptor {
                columns: vec!["geom".into()],
                kind: IndexKind::Spatial,
            }],
            bounds: None,
            referential_check: None,
        }
    }

    #[tokio::test]
    async fn a_clean_dataset_reaches_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("nodes.csv");
        write_file(
            &csv,
            "NODE_ID,X,Y\nN1,126.97,37.56\nN2,127.02,37.51\nN3,126.90,37.60\n",
        );

        let store = Arc::new(MemStore::new());
        let pipeline = Pipeline::new(Arc::clone(&store));
        let report = pipeline
            .run(
                &[node_descriptor(&csv)],
                &PipelineOptions::new(LoadMode::Overwrite),
            )
            .await;

        assert!(report.succeeded());
        let d = &report.datasets[0];
        assert_eq!(d.state, RunState::Succeeded);
        assert_eq!((d.read, d.inserted, d.rejected), (3, 3, 0));
        assert_eq!(d.indexes, vec!["idx_moct_node_geom"]);
        assert!(d.verification.as_ref().unwrap().passed());
        assert_eq!(store.row_count("moct_node"), 3);
        // Claim released after the run
        store.claim_table("moct_node").await.unwrap();
    }

    #[tokio::test]
    async fn a_bad_coordinate_rejects_one_record_not_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("nodes.csv");
        write_file(
            &csv,
            "NODE_ID,X,Y\nN1,126.97,37.56\nN2,not-a-number,37.51\nN3,126.90,37.60\n",
        );

        let store = Arc::new(MemStore::new());
        let pipeline = Pipeline::new(Arc::clone(&store));
        let report = pipeline
            .run(
                &[node_descriptor(&csv)],
                &PipelineOptions::new(LoadMode::Overwrite),
            )
            .await;

        let d = &report.datasets[0];
        assert_eq!(d.state, RunState::Succeeded);
        assert_eq!((d.read, d.inserted, d.rejected), (3, 2, 1));
        assert_eq!(d.rejection_sample.len(), 1);
        assert_eq!(d.rejection_sample[0].field, "X");
        assert_eq!(store.row_count("moct_node"), 2);
    }

    #[tokio::test]
    async fn the_run_stops_at_the_first_failed_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("nodes.csv");
        write_file(&good, "NODE_ID,X,Y\nN1,126.97,37.56\n");
        let missing = dir.path().join("does-not-exist.csv");

        let mut first = node_descriptor(&missing);
        first.name = "broken".into();
        let second = node_descriptor(&good);

        let store = Arc::new(MemStore::new());
        let pipeline = Pipeline::new(Arc::clone(&store));
        let report = pipeline
            .run(
                &[first, second],
                &PipelineOptions::new(LoadMode::Overwrite),
            )
            .await;

        assert_eq!(report.datasets[0].state, RunState::Failed);
        assert_eq!(report.datasets[0].failed_stage, Some(RunState::Reading));
        assert!(report.datasets[0].error.is_some());
        assert_eq!(report.datasets[1].state, RunState::Pending);
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn a_held_claim_fails_the_dataset_without_touching_data() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("nodes.csv");
        write_file(&csv, "NODE_ID,X,Y\nN1,126.97,37.56\n");

        let store = Arc::new(MemStore::new());
        store.claim_table("moct_node").await.unwrap();

        let pipeline = Pipeline::new(Arc::clone(&store));
        let report = pipeline
            .run(
                &[node_descriptor(&csv)],
                &PipelineOptions::new(LoadMode::Overwrite),
            )
            .await;

        let d = &report.datasets[0];
        assert_eq!(d.state, RunState::Failed);
        assert!(d.error.as_ref().unwrap().contains("moct_node"));
        assert_eq!(store.row_count("moct_node"), 0);
    }
}
