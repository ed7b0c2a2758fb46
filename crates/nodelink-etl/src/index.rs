//! Post-load indexing
//!
//! Indexes are created after the data lands, not before, so bulk insertion
//! never pays index maintenance. Index names are deterministic and creation
//! is idempotent, so a rerun over an existing table is a no-op rather than
//! an error.

use std::time::Duration;

use nodelink_common::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::descriptor::IndexDescriptor;
use crate::store::{bounded, SpatialStore, TableSchema};

/// Create every declared index, then refresh planner statistics.
///
/// Every store call is bounded by `timeout`; a timeout here is fatal. A
/// cancelled token stops the stage between statements and returns the
/// names created so far, so the caller sees how far indexing got.
pub async fn build_indexes(
    store: &dyn SpatialStore,
    schema: &TableSchema,
    indexes: &[IndexDescriptor],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let mut names = Vec::with_capacity(indexes.len());
    for index in indexes {
        if cancel.is_cancelled() {
            return Ok(names);
        }
        let name = bounded(timeout, store.create_index(schema, index)).await?;
        info!(table = %schema.table, index = %name, kind = ?index.kind, "Index ready");
        names.push(name);
    }
    if cancel.is_cancelled() {
        return Ok(names);
    }
    bounded(timeout, store.refresh_statistics(&schema.table)).await?;
    Ok(names)
}
