//! In-memory spatial store
//!
//! Implements the full [`SpatialStore`] contract against process-local
//! state, including primary-key enforcement and batch all-or-nothing
//! semantics, so loader and pipeline behavior is testable without a
//! database. Failure injection covers the two classes the loader has to
//! handle: per-row constraint violations and transient connectivity loss.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use nodelink_common::{EtlError, Result};

use super::{ReferentialOutcome, SpatialStore, TableSchema};
use crate::descriptor::{Bounds, IndexDescriptor, LoadMode, ReferentialCheck};
use crate::mapper::MappedRecord;

/// One stored row
#[derive(Debug, Clone)]
pub struct MemRow {
    pub key: String,
    pub record: MappedRecord,
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<String>,
    key_column: String,
    rows: Vec<MemRow>,
    indexes: BTreeSet<String>,
    analyze_count: u32,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, MemTable>,
    claims: HashSet<String>,
    fail_keys: HashSet<String>,
    transient_failures: u32,
}

/// Process-local store for tests
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every batch or row containing this key fail like a constraint
    /// violation
    pub fn fail_key(&self, key: &str) {
        self.lock().fail_keys.insert(key.to_string());
    }

    /// Make the next `n` write operations fail like connectivity loss
    pub fn inject_transient_failures(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn keys(&self, table: &str) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn index_names(&self, table: &str) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.indexes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn analyze_count(&self, table: &str) -> u32 {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.analyze_count)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a test already panicked
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_transient(inner: &mut Inner) -> bool {
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            true
        } else {
            false
        }
    }

    fn column_position(table: &MemTable, column: &str) -> Option<usize> {
        table.columns.iter().position(|c| c == column)
    }
}

#[async_trait]
impl SpatialStore for MemStore {
    async fn prepare_table(&self, schema: &TableSchema, mode: LoadMode) -> Result<()> {
        let mut inner = self.lock();
        let fresh = MemTable {
            columns: schema.columns.iter().map(|(n, _)| n.clone()).collect(),
            key_column: schema.key_column.clone(),
            ..MemTable::default()
        };
        match mode {
            LoadMode::Overwrite => {
                inner.tables.insert(schema.table.clone(), fresh);
            }
            LoadMode::Append => {
                inner.tables.entry(schema.table.clone()).or_insert(fresh);
            }
        }
        Ok(())
    }

    async fn copy_rows(&self, schema: &TableSchema, rows: &[MappedRecord]) -> Result<u64> {
        let mut inner = self.lock();
        if Self::take_transient(&mut inner) {
            return Err(EtlError::Database("connection reset by peer (injected)".into()));
        }

        for row in rows {
            if inner.fail_keys.contains(&row.key) {
                return Err(EtlError::Database(format!(
                    "row for key {} violates a constraint (injected)",
                    row.key
                )));
            }
        }

        let table = inner
            .tables
            .get_mut(&schema.table)
            .ok_or_else(|| EtlError::Database(format!("relation {} does not exist", schema.table)))?;

        let mut seen: HashSet<&str> = table.rows.iter().map(|r| r.key.as_str()).collect();
        for row in rows {
            if !seen.insert(&row.key) {
                return Err(EtlError::Database(format!(
                    "duplicate key value violates unique constraint: {}",
                    row.key
                )));
            }
        }

        for row in rows {
            table.rows.push(MemRow {
                key: row.key.clone(),
                record: row.clone(),
            });
        }
        Ok(rows.len() as u64)
    }

    async fn insert_row(&self, schema: &TableSchema, row: &MappedRecord) -> Result<()> {
        let mut inner = self.lock();
        if Self::take_transient(&mut inner) {
            return Err(EtlError::Database("connection reset by peer (injected)".into()));
        }
        if inner.fail_keys.contains(&row.key) {
            return Err(EtlError::Database(format!(
                "row for key {} violates a constraint (injected)",
                row.key
            )));
        }

        let table = inner
            .tables
            .get_mut(&schema.table)
            .ok_or_else(|| EtlError::Database(format!("relation {} does not exist", schema.table)))?;
        if table.rows.iter().any(|r| r.key == row.key) {
            return Err(EtlError::Database(format!(
                "duplicate key value violates unique constraint: {}",
                row.key
            )));
        }
        table.rows.push(MemRow {
            key: row.key.clone(),
            record: row.clone(),
        });
        Ok(())
    }

    async fn existing_keys(&self, schema: &TableSchema, keys: &[String]) -> Result<Vec<String>> {
        let inner = self.lock();
        let table = match inner.tables.get(&schema.table) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        Ok(table
            .rows
            .iter()
            .filter(|r| keys.contains(&r.key))
            .map(|r| r.key.clone())
            .collect())
    }

    async fn create_index(&self, schema: &TableSchema, index: &IndexDescriptor) -> Result<String> {
        let mut inner = self.lock();
        let table = inner.tables.get_mut(&schema.table).ok_or_else(|| EtlError::Index {
            table: schema.table.clone(),
            message: "relation does not exist".into(),
        })?;
        let name = index.name(&schema.table);
        table.indexes.insert(name.clone());
        Ok(name)
    }

    async fn refresh_statistics(&self, table: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(t) = inner.tables.get_mut(table) {
            t.analyze_count += 1;
        }
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        Ok(self.row_count(table) as u64)
    }

    async fn keys_outside_bounds(
        &self,
        schema: &TableSchema,
        bounds: &Bounds,
        limit: i64,
    ) -> Result<Vec<String>> {
        let inner = self.lock();
        let table = match inner.tables.get(&schema.table) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        Ok(table
            .rows
            .iter()
            .filter(|r| {
                r.record
                    .geometry
                    .coords()
                    .iter()
                    .any(|c| !bounds.contains(c.x, c.y))
            })
            .take(limit.max(0) as usize)
            .map(|r| r.key.clone())
            .collect())
    }

    async fn unresolved_references(
        &self,
        schema: &TableSchema,
        check: &ReferentialCheck,
    ) -> Result<ReferentialOutcome> {
        let inner = self.lock();
        let links = inner
            .tables
            .get(&schema.table)
            .ok_or_else(|| EtlError::Database(format!("relation {} does not exist", schema.table)))?;
        let node_keys: HashSet<String> = inner
            .tables
            .get(&check.node_table)
            .map(|t| t.rows.iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default();

        let from_pos = Self::column_position(links, &check.from_column);
        let to_pos = Self::column_position(links, &check.to_column);
        let (from_pos, to_pos) = match (from_pos, to_pos) {
            (Some(f), Some(t)) => (f, t),
            _ => {
                return Err(EtlError::Database(format!(
                    "columns {} / {} missing on {}",
                    check.from_column, check.to_column, schema.table
                )))
            }
        };

        let sample: Vec<&MemRow> = links
            .rows
            .iter()
            .take(check.sample_size as usize)
            .collect();
        let unresolved = sample
            .iter()
            .filter(|r| {
                let f = r.record.values[from_pos].to_copy_text();
                let t = r.record.values[to_pos].to_copy_text();
                !node_keys.contains(&f) || !node_keys.contains(&t)
            })
            .map(|r| r.key.clone())
            .collect();

        Ok(ReferentialOutcome {
            sampled: sample.len() as u64,
            unresolved,
        })
    }

    async fn claim_table(&self, table: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.claims.insert(table.to_string()) {
            return Err(EtlError::TableClaimed {
                table: table.to_string(),
            });
        }
        Ok(())
    }

    async fn release_table(&self, table: &str) -> Result<()> {
        self.lock().claims.remove(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ColumnKind, IndexKind};
    use crate::geom::Geometry;
    use crate::mapper::ColumnValue;

    fn schema() -> TableSchema {
        TableSchema {
            table: "moct_node".into(),
            key_column: "node_id".into(),
            columns: vec![("node_id".into(), ColumnKind::Text)],
            srid: 4326,
        }
    }

    fn record(key: &str) -> MappedRecord {
        MappedRecord {
            index: 0,
            key: key.into(),
            values: vec![ColumnValue::Text(key.into())],
            geometry: Geometry::point(4326, 126.97, 37.56).unwrap(),
        }
    }

    #[tokio::test]
    async fn copy_is_all_or_nothing() {
        let store = MemStore::new();
        let schema = schema();
        store.prepare_table(&schema, LoadMode::Overwrite).await.unwrap();

        store
            .copy_rows(&schema, &[record("N1"), record("N2")])
            .await
            .unwrap();
        // Duplicate N2 fails the whole batch; N3 must not land
        let err = store
            .copy_rows(&schema, &[record("N3"), record("N2")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
        assert_eq!(store.keys("moct_node"), vec!["N1", "N2"]);
    }

    #[tokio::test]
    async fn overwrite_resets_append_keeps() {
        let store = MemStore::new();
        let schema = schema();
        store.prepare_table(&schema, LoadMode::Overwrite).await.unwrap();
        store.copy_rows(&schema, &[record("N1")]).await.unwrap();

        store.prepare_table(&schema, LoadMode::Append).await.unwrap();
        assert_eq!(store.row_count("moct_node"), 1);

        store.prepare_table(&schema, LoadMode::Overwrite).await.unwrap();
        assert_eq!(store.row_count("moct_node"), 0);
    }

    #[tokio::test]
    async fn index_creation_is_idempotent() {
        let store = MemStore::new();
        let schema = schema();
        store.prepare_table(&schema, LoadMode::Overwrite).await.unwrap();
        let index = IndexDescriptor {
            columns: vec!["geom".into()],
            kind: IndexKind::Spatial,
        };
        store.create_index(&schema, &index).await.unwrap();
        store.create_index(&schema, &index).await.unwrap();
        assert_eq!(store.index_names("moct_node").len(), 1);
    }

    #[tokio::test]
    async fn claims_are_exclusive() {
        let store = MemStore::new();
        store.claim_table("moct_node").await.unwrap();
        assert!(matches!(
            store.claim_table("moct_node").await,
            Err(EtlError::TableClaimed { .. })
        ));
        store.release_table("moct_node").await.unwrap();
        store.claim_table("moct_node").await.unwrap();
    }
}
