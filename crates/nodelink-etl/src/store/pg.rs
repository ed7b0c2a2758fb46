//! PostgreSQL/PostGIS store
//!
//! Bulk insertion rides the COPY protocol (one COPY per batch; a COPY is a
//! single statement, so the batch is atomic). Geometry travels as EWKT,
//! which the PostGIS geometry input parser accepts directly on the COPY
//! path and via `ST_GeomFromEWKT` on the single-row fallback path.
//!
//! The advisory table claim uses `pg_try_advisory_lock(hashtext(name))` on
//! a dedicated connection per claim; closing that session releases the
//! lock even when a run aborts.

use std::collections::HashMap;

use async_trait::async_trait;
use nodelink_common::{EtlError, Result};
use sqlx::postgres::{PgConnection, PgPool, PgPoolCopyExt};
use sqlx::{Connection, Row};
use tokio::sync::Mutex;

use super::{ReferentialOutcome, SpatialStore, TableSchema, GEOMETRY_COLUMN};
use crate::config::DbConfig;
use crate::descriptor::{Bounds, ColumnKind, IndexDescriptor, IndexKind, LoadMode, ReferentialCheck};
use crate::mapper::{ColumnValue, MappedRecord};

/// PostGIS-backed spatial store
pub struct PgStore {
    pool: PgPool,
    url: String,
    claims: Mutex<HashMap<String, PgConnection>>,
}

impl PgStore {
    /// Connect a pool using the environment-backed configuration
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let pool = config.pool().await?;
        Ok(Self {
            pool,
            url: config.url.clone(),
            claims: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> EtlError {
    EtlError::Database(e.to_string())
}

fn column_type(kind: &ColumnKind) -> String {
    match kind {
        ColumnKind::Text => "TEXT".to_string(),
        ColumnKind::Integer => "BIGINT".to_string(),
        ColumnKind::Decimal { precision, scale } => format!("NUMERIC({}, {})", precision, scale),
    }
}

/// Escape one value for the COPY text format
fn escape_copy_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn copy_buffer(rows: &[MappedRecord]) -> String {
    let mut buf = String::new();
    for row in rows {
        let mut first = true;
        for value in &row.values {
            if !first {
                buf.push('\t');
            }
            buf.push_str(&escape_copy_text(&value.to_copy_text()));
            first = false;
        }
        buf.push('\t');
        buf.push_str(&row.geometry.to_ewkt());
        buf.push('\n');
    }
    buf
}

#[async_trait]
impl SpatialStore for PgStore {
    async fn prepare_table(&self, schema: &TableSchema, mode: LoadMode) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if mode == LoadMode::Overwrite {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", schema.table))
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }

        let mut columns: Vec<String> = schema
            .columns
            .iter()
            .map(|(name, kind)| {
                if name == &schema.key_column {
                    format!("{} {} PRIMARY KEY", name, column_type(kind))
                } else {
                    format!("{} {}", name, column_type(kind))
                }
            })
            .collect();
        columns.push(format!(
            "{} geometry(Geometry, {})",
            GEOMETRY_COLUMN, schema.srid
        ));

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            schema.table,
            columns.join(", ")
        );
        sqlx::query(&ddl).execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn copy_rows(&self, schema: &TableSchema, rows: &[MappedRecord]) -> Result<u64> {
        let statement = format!(
            "COPY {} ({}) FROM STDIN",
            schema.table,
            schema.column_names().join(", ")
        );
        let mut sink = self
            .pool
            .copy_in_raw(&statement)
            .await
            .map_err(db_err)?;
        let buf = copy_buffer(rows);
        if let Err(e) = sink.send(buf.as_bytes()).await {
            let _ = sink.abort("batch transfer failed").await;
            return Err(db_err(e));
        }
        sink.finish().await.map_err(db_err)
    }

    async fn insert_row(&self, schema: &TableSchema, row: &MappedRecord) -> Result<()> {
        let columns = schema.column_names().join(", ");
        let mut placeholders: Vec<String> =
            (1..=schema.columns.len()).map(|i| format!("${}", i)).collect();
        placeholders.push(format!("ST_GeomFromEWKT(${})", schema.columns.len() + 1));

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            schema.table,
            columns,
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for value in &row.values {
            query = match value {
                ColumnValue::Text(s) => query.bind(s),
                ColumnValue::Integer(i) => query.bind(i),
                ColumnValue::Decimal(d) => query.bind(d),
            };
        }
        query = query.bind(row.geometry.to_ewkt());

        query.execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn existing_keys(&self, schema: &TableSchema, keys: &[String]) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT {key}::text FROM {table} WHERE {key}::text = ANY($1)",
            key = schema.key_column,
            table = schema.table
        );
        let rows = sqlx::query(&sql)
            .bind(keys)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    async fn create_index(&self, schema: &TableSchema, index: &IndexDescriptor) -> Result<String> {
        let name = index.name(&schema.table);
        let sql = match index.kind {
            IndexKind::Spatial => format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} USING GIST ({})",
                name,
                schema.table,
                index.columns.join(", ")
            ),
            IndexKind::Attribute => format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                name,
                schema.table,
                index.columns.join(", ")
            ),
        };
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| EtlError::Index {
                table: schema.table.clone(),
                message: e.to_string(),
            })?;
        Ok(name)
    }

    async fn refresh_statistics(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("ANALYZE {}", table))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn keys_outside_bounds(
        &self,
        schema: &TableSchema,
        bounds: &Bounds,
        limit: i64,
    ) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT {key}::text FROM {table} \
             WHERE NOT ({geom} @ ST_MakeEnvelope($1, $2, $3, $4, $5)) LIMIT $6",
            key = schema.key_column,
            table = schema.table,
            geom = GEOMETRY_COLUMN
        );
        let rows = sqlx::query(&sql)
            .bind(bounds.min_x)
            .bind(bounds.min_y)
            .bind(bounds.max_x)
            .bind(bounds.max_y)
            .bind(schema.srid)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    async fn unresolved_references(
        &self,
        schema: &TableSchema,
        check: &ReferentialCheck,
    ) -> Result<ReferentialOutcome> {
        let sampled: i64 = sqlx::query_scalar(&format!(
            "SELECT LEAST(COUNT(*), $1::bigint) FROM {}",
            schema.table
        ))
        .bind(i64::from(check.sample_size))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let sql = format!(
            "WITH sample AS ( \
               SELECT {key}::text AS key, {from_col}::text AS f, {to_col}::text AS t \
               FROM {table} LIMIT $1 \
             ) \
             SELECT s.key FROM sample s \
             LEFT JOIN {node_table} nf ON nf.{node_key}::text = s.f \
             LEFT JOIN {node_table} nt ON nt.{node_key}::text = s.t \
             WHERE nf.{node_key} IS NULL OR nt.{node_key} IS NULL",
            key = schema.key_column,
            from_col = check.from_column,
            to_col = check.to_column,
            table = schema.table,
            node_table = check.node_table,
            node_key = check.node_key_column
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(check.sample_size))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(ReferentialOutcome {
            sampled: sampled as u64,
            unresolved: rows.iter().map(|r| r.get::<String, _>(0)).collect(),
        })
    }

    async fn claim_table(&self, table: &str) -> Result<()> {
        let mut claims = self.claims.lock().await;
        if claims.contains_key(table) {
            return Err(EtlError::TableClaimed {
                table: table.to_string(),
            });
        }

        // Advisory locks are session-scoped, so each claim gets its own
        // connection; the lock dies with the session on any abort path.
        let mut conn = PgConnection::connect(&self.url).await.map_err(db_err)?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(table)
            .fetch_one(&mut conn)
            .await
            .map_err(db_err)?;
        if !locked {
            let _ = conn.close().await;
            return Err(EtlError::TableClaimed {
                table: table.to_string(),
            });
        }

        claims.insert(table.to_string(), conn);
        Ok(())
    }

    async fn release_table(&self, table: &str) -> Result<()> {
        let conn = self.claims.lock().await.remove(table);
        if let Some(mut conn) = conn {
            let _: std::result::Result<bool, _> =
                sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1))")
                    .bind(table)
                    .fetch_one(&mut conn)
                    .await;
            let _ = conn.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Geometry;

    #[test]
    fn copy_text_escaping_covers_control_characters() {
        assert_eq!(escape_copy_text("plain"), "plain");
        assert_eq!(escape_copy_text("a\tb"), "a\\tb");
        assert_eq!(escape_copy_text("a\nb\rc"), "a\\nb\\rc");
        assert_eq!(escape_copy_text("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn copy_buffer_is_one_line_per_row() {
        let rows = vec![MappedRecord {
            index: 0,
            key: "N1".into(),
            values: vec![
                ColumnValue::Text("N1".into()),
                ColumnValue::Integer(60),
            ],
            geometry: Geometry::point(4326, 126.97, 37.56).unwrap(),
        }];
        let buf = copy_buffer(&rows);
        assert_eq!(buf, "N1\t60\tSRID=4326;POINT(126.97 37.56)\n");
    }

    #[test]
    fn column_types_match_declared_kinds() {
        assert_eq!(column_type(&ColumnKind::Text), "TEXT");
        assert_eq!(column_type(&ColumnKind::Integer), "BIGINT");
        assert_eq!(
            column_type(&ColumnKind::Decimal {
                precision: 12,
                scale: 3
            }),
            "NUMERIC(12, 3)"
        );
    }
}
