//! Run reporting
//!
//! Every pipeline run produces a [`RunReport`]: per-dataset counts, the
//! terminal state, the first rejections, index names, and the verification
//! outcome. The report is printable for operators and serializable to JSON
//! for machine consumption.

use chrono::{DateTime, Utc};
use nodelink_common::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::descriptor::LoadMode;
use crate::mapper::Rejection;
use crate::verify::VerificationReport;

/// How many rejections are retained per dataset
pub const REJECTION_SAMPLE_LIMIT: usize = 20;

/// Lifecycle of one dataset within a run.
///
/// A dataset moves forward through the working states and ends in exactly
/// one of `Succeeded`, `Failed`, or `Cancelled`. Datasets skipped because
/// an earlier one failed stay `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Reading,
    Mapping,
    Loading,
    Indexing,
    Verifying,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "PENDING",
            RunState::Reading => "READING",
            RunState::Mapping => "MAPPING",
            RunState::Loading => "LOADING",
            RunState::Indexing => "INDEXING",
            RunState::Verifying => "VERIFYING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Outcome of one dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetReport {
    pub dataset: String,
    pub table: String,
    pub mode: LoadMode,
    pub state: RunState,
    /// Stage that was active when a failed dataset failed
    pub failed_stage: Option<RunState>,
    pub read: u64,
    pub inserted: u64,
    pub rejected: u64,
    /// Malformed byte sequences repaired while decoding the source
    pub decode_repairs: u64,
    pub batches_committed: u64,
    /// First rejections, bounded by [`REJECTION_SAMPLE_LIMIT`]
    pub rejection_sample: Vec<Rejection>,
    pub indexes: Vec<String>,
    pub verification: Option<VerificationReport>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DatasetReport {
    pub fn new(dataset: &str, table: &str, mode: LoadMode) -> Self {
        Self {
            dataset: dataset.to_string(),
            table: table.to_string(),
            mode,
            state: RunState::Pending,
            failed_stage: None,
            read: 0,
            inserted: 0,
            rejected: 0,
            decode_repairs: 0,
            batches_committed: 0,
            rejection_sample: Vec::new(),
            indexes: Vec::new(),
            verification: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, state: RunState) {
        debug_assert!(state.is_terminal());
        // Failures that never entered a stage (descriptor validation, a
        // held claim) have no stage to name
        if state == RunState::Failed && self.state != RunState::Pending {
            self.failed_stage = Some(self.state);
        }
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

/// Outcome of one pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetReport>,
}

impl RunReport {
    /// True when every dataset reached `SUCCEEDED`
    pub fn succeeded(&self) -> bool {
        !self.datasets.is_empty()
            && self.datasets.iter().all(|d| d.state == RunState::Succeeded)
    }

    /// Human-readable summary, one block per dataset
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let elapsed = self.finished_at - self.started_at;
        out.push_str(&format!(
            "Run finished in {}.{:03}s ({} dataset{})\n",
            elapsed.num_seconds(),
            elapsed.num_milliseconds().rem_euclid(1000),
            self.datasets.len(),
            if self.datasets.len() == 1 { "" } else { "s" }
        ));
        for d in &self.datasets {
            let stage = match d.failed_stage {
                Some(stage) => format!(" (during {})", stage),
                None => String::new(),
            };
            out.push_str(&format!(
                "  {} -> {} [{}] {}{}: read={} inserted={} rejected={} repairs={} batches={}\n",
                d.dataset, d.table, d.mode, d.state, stage, d.read, d.inserted, d.rejected,
                d.decode_repairs, d.batches_committed
            ));
            if !d.indexes.is_empty() {
                out.push_str(&format!("    indexes: {}\n", d.indexes.join(", ")));
            }
            if let Some(v) = &d.verification {
                out.push_str(&format!("    verification: {}\n", v));
            }
            for rejection in &d.rejection_sample {
                out.push_str(&format!("    rejected: {}\n", rejection));
            }
            if let Some(error) = &d.error {
                out.push_str(&format!("    error: {}\n", error));
            }
        }
        out
    }

    /// Persist the report as pretty-printed JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EtlError::Config(format!("report serialization failed: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_the_three_outcomes() {
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::Loading.is_terminal());
    }

    #[test]
    fn summary_carries_counts_and_state() {
        let mut dataset = DatasetReport::new("moct_link", "moct_link", LoadMode::Overwrite);
        dataset.read = 10;
        dataset.inserted = 9;
        dataset.rejected = 1;
        dataset.finish(RunState::Succeeded);

        let report = RunReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            datasets: vec![dataset],
        };
        let summary = report.summary();
        assert!(summary.contains("SUCCEEDED"));
        assert!(summary.contains("read=10 inserted=9 rejected=1"));
        assert!(report.succeeded());
    }

    #[test]
    fn a_failure_names_the_active_stage() {
        let mut dataset = DatasetReport::new("moct_link", "moct_link", LoadMode::Overwrite);
        dataset.state = RunState::Reading;
        dataset.error = Some("declared 1 header row(s) but detected 0".into());
        dataset.finish(RunState::Failed);
        assert_eq!(dataset.state, RunState::Failed);
        assert_eq!(dataset.failed_stage, Some(RunState::Reading));

        let report = RunReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            datasets: vec![dataset],
        };
        assert!(report.summary().contains("FAILED (during READING)"));
    }

    #[test]
    fn a_failure_before_any_stage_names_none() {
        let mut dataset = DatasetReport::new("moct_link", "moct_link", LoadMode::Overwrite);
        dataset.error = Some("table already claimed".into());
        dataset.finish(RunState::Failed);
        assert_eq!(dataset.failed_stage, None);
    }

    #[test]
    fn a_failed_dataset_fails_the_run() {
        let mut ok = DatasetReport::new("moct_node", "moct_node", LoadMode::Overwrite);
        ok.finish(RunState::Succeeded);
        let mut bad = DatasetReport::new("moct_link", "moct_link", LoadMode::Overwrite);
        bad.error = Some("boom".into());
        bad.finish(RunState::Failed);

        let report = RunReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            datasets: vec![ok, bad],
        };
        assert!(!report.succeeded());
    }

    #[test]
    fn report_round_trips_through_json() {
        let mut dataset = DatasetReport::new("moct_node", "moct_node", LoadMode::Append);
        dataset.finish(RunState::Cancelled);
        let report = RunReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            datasets: vec![dataset],
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write_json(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: RunReport = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.datasets[0].state, RunState::Cancelled);
        assert_eq!(parsed.datasets[0].mode, LoadMode::Append);
    }
}
