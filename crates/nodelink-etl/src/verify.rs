//! Post-load verification
//!
//! After indexing, every dataset is checked against what the load claimed:
//! the target row count must equal the inserted count, every geometry must
//! fall inside the plausible coordinate range for the target SRID, and for
//! link tables a sample of rows must resolve both node references. Any
//! failed check fails the dataset even though the data is already
//! committed, so silent corruption never reports success.

use nodelink_common::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::descriptor::DatasetDescriptor;
use crate::store::{bounded, SpatialStore, TableSchema};

/// Cap on reported out-of-bounds keys
const OUT_OF_BOUNDS_SAMPLE_LIMIT: i64 = 20;

/// Referential spot-check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferentialSummary {
    pub sampled: u64,
    /// Keys of sampled rows with at least one unresolved endpoint
    pub unresolved: Vec<String>,
}

/// Outcome of all checks for one dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub row_count_expected: u64,
    pub row_count_actual: u64,
    /// Keys of rows outside the plausible coordinate range, bounded
    pub out_of_bounds: Vec<String>,
    pub referential: Option<ReferentialSummary>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.failures().is_empty()
    }

    /// One line per failed check, empty when everything passed
    pub fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.row_count_actual != self.row_count_expected {
            failures.push(format!(
                "row count mismatch: expected {}, found {}",
                self.row_count_expected, self.row_count_actual
            ));
        }
        if !self.out_of_bounds.is_empty() {
            failures.push(format!(
                "{} row(s) outside the plausible coordinate range, e.g. {}",
                self.out_of_bounds.len(),
                self.out_of_bounds
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        if let Some(referential) = &self.referential {
            if !referential.unresolved.is_empty() {
                failures.push(format!(
                    "{} of {} sampled link(s) reference missing nodes, e.g. {}",
                    referential.unresolved.len(),
                    referential.sampled,
                    referential
                        .unresolved
                        .iter()
                        .take(3)
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
        }
        failures
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            write!(
                f,
                "passed (rows={}{})",
                self.row_count_actual,
                match &self.referential {
                    Some(r) => format!(", referential sample={}", r.sampled),
                    None => String::new(),
                }
            )
        } else {
            write!(f, "FAILED: {}", self.failures().join("; "))
        }
    }
}

/// Run every applicable check for one loaded dataset.
///
/// Every store call is bounded by `timeout`; a timeout fails the check.
pub async fn verify_dataset(
    store: &dyn SpatialStore,
    schema: &TableSchema,
    descriptor: &DatasetDescriptor,
    expected_rows: u64,
    timeout: Duration,
) -> Result<VerificationReport> {
    let actual = bounded(timeout, store.count_rows(&schema.table)).await?;

    let out_of_bounds = match descriptor.effective_bounds() {
        Some(bounds) => {
            bounded(
                timeout,
                store.keys_outside_bounds(schema, &bounds, OUT_OF_BOUNDS_SAMPLE_LIMIT),
            )
            .await?
        }
        None => Vec::new(),
    };

    let referential = match &descriptor.referential_check {
        Some(check) => {
            let outcome = bounded(timeout, store.unresolved_references(schema, check)).await?;
            Some(ReferentialSummary {
                sampled: outcome.sampled,
                unresolved: outcome.unresolved,
            })
        }
        None => None,
    };

    let report = VerificationReport {
        row_count_expected: expected_rows,
        row_count_actual: actual,
        out_of_bounds,
        referential,
    };
    if report.passed() {
        info!(table = %schema.table, rows = actual, "Verification passed");
    } else {
        warn!(table = %schema.table, failures = ?report.failures(), "Verification failed");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_report() -> VerificationReport {
        VerificationReport {
            row_count_expected: 9,
            row_count_actual: 9,
            out_of_bounds: Vec::new(),
            referential: Some(ReferentialSummary {
                sampled: 9,
                unresolved: Vec::new(),
            }),
        }
    }

    #[test]
    fn clean_checks_pass() {
        let report = clean_report();
        assert!(report.passed());
        assert!(report.failures().is_empty());
        assert!(report.to_string().starts_with("passed"));
    }

    #[test]
    fn row_count_mismatch_fails() {
        let mut report = clean_report();
        report.row_count_actual = 8;
        assert!(!report.passed());
        assert!(report.failures()[0].contains("expected 9, found 8"));
    }

    #[test]
    fn out_of_bounds_rows_fail() {
        let mut report = clean_report();
        report.out_of_bounds = vec!["N7".into()];
        assert!(!report.passed());
        assert!(report.to_string().contains("coordinate range"));
    }

    #[test]
    fn unresolved_references_fail() {
        let mut report = clean_report();
        report.referential = Some(ReferentialSummary {
            sampled: 9,
            unresolved: vec!["L3".into(), "L5".into()],
        });
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("2 of 9"));
    }
}
