//! Target store abstraction
//!
//! The pipeline talks to the spatial store through [`SpatialStore`]: typed
//! table creation/replacement, bulk row transfer, a single-row fallback
//! path, idempotent index creation, statistics refresh, the verification
//! queries, and an advisory per-table claim so two pipelines never write
//! the same table concurrently.
//!
//! [`PgStore`] is the production implementation (PostgreSQL/PostGIS via
//! sqlx); [`MemStore`] backs the tests.

mod memory;
mod pg;

pub use memory::MemStore;
pub use pg::PgStore;

use std::time::Duration;

use async_trait::async_trait;
use nodelink_common::{EtlError, Result};

use crate::descriptor::{
    Bounds, ColumnKind, DatasetDescriptor, IndexDescriptor, LoadMode, ReferentialCheck,
};
use crate::mapper::MappedRecord;

/// Name of the geometry column on every target table
pub const GEOMETRY_COLUMN: &str = "geom";

/// Column contract of one target table
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub key_column: String,
    pub columns: Vec<(String, ColumnKind)>,
    /// SRID of the geometry column
    pub srid: i32,
}

impl TableSchema {
    pub fn from_descriptor(descriptor: &DatasetDescriptor) -> Self {
        Self {
            table: descriptor.table.clone(),
            key_column: descriptor.key_column.clone(),
            columns: descriptor
                .columns
                .iter()
                .map(|c| (c.column.clone(), c.kind.clone()))
                .collect(),
            srid: descriptor.target_srid,
        }
    }

    /// All column names in insertion order, geometry last
    pub fn column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|(name, _)| name.as_str())
            .chain(std::iter::once(GEOMETRY_COLUMN))
            .collect()
    }
}

/// Result of the referential spot-check query
#[derive(Debug, Clone)]
pub struct ReferentialOutcome {
    /// How many link rows were sampled
    pub sampled: u64,
    /// Keys of sampled rows with at least one unresolved endpoint
    pub unresolved: Vec<String>,
}

/// Operations the pipeline needs from the target store
#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Create the target table. Overwrite mode drops any existing table
    /// first; append mode creates it only if absent.
    async fn prepare_table(&self, schema: &TableSchema, mode: LoadMode) -> Result<()>;

    /// Bulk transfer of one batch as a single all-or-nothing unit.
    /// Returns the number of rows that landed.
    async fn copy_rows(&self, schema: &TableSchema, rows: &[MappedRecord]) -> Result<u64>;

    /// Single-row fallback used to isolate offenders after a batch failure
    async fn insert_row(&self, schema: &TableSchema, row: &MappedRecord) -> Result<()>;

    /// Which of the given keys already exist in the table
    async fn existing_keys(&self, schema: &TableSchema, keys: &[String]) -> Result<Vec<String>>;

    /// Create the index if absent; returns its name
    async fn create_index(&self, schema: &TableSchema, index: &IndexDescriptor) -> Result<String>;

    /// Refresh planner statistics for the table
    async fn refresh_statistics(&self, table: &str) -> Result<()>;

    async fn count_rows(&self, table: &str) -> Result<u64>;

    /// Keys of rows whose geometry falls outside the plausible range,
    /// capped at `limit`
    async fn keys_outside_bounds(
        &self,
        schema: &TableSchema,
        bounds: &Bounds,
        limit: i64,
    ) -> Result<Vec<String>>;

    /// Sample link rows and resolve both endpoint references
    async fn unresolved_references(
        &self,
        schema: &TableSchema,
        check: &ReferentialCheck,
    ) -> Result<ReferentialOutcome>;

    /// Exclusive advisory claim on a table name, held until released.
    /// Fails immediately if another pipeline holds the claim.
    async fn claim_table(&self, table: &str) -> Result<()>;

    async fn release_table(&self, table: &str) -> Result<()>;
}

/// Bound one store call to `limit`. A timeout surfaces as a transient
/// database error; callers without a retry budget fail outright.
pub(crate) async fn bounded<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EtlError::Database(format!(
            "operation timed out after {:?}",
            limit
        ))),
    }
}
