//! Dataset descriptors
//!
//! A [`DatasetDescriptor`] identifies one input dataset: where it lives, how
//! its bytes decode, which coordinate system it is expressed in, how source
//! fields map to target columns, and which indexes the target table gets.
//! Descriptors are loaded from TOML, validated before any I/O, and never
//! mutated once a pipeline run starts.

use std::path::{Path, PathBuf};

use nodelink_common::{EtlError, Result};
use serde::{Deserialize, Serialize};

use crate::proj;

/// Default batch size for bulk loading
pub const DEFAULT_BATCH_SIZE: usize = 5_000;

/// Default rejection-rate threshold (fraction of read records)
pub const DEFAULT_REJECTION_THRESHOLD: f64 = 0.01;

/// Default CSV delimiter
pub const DEFAULT_DELIMITER: char = ',';

/// How records are pulled out of the source file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceFormat {
    /// Delimited text (CSV and friends)
    Delimited {
        /// Field delimiter, a single ASCII character
        #[serde(default = "default_delimiter")]
        delimiter: char,
        /// Number of leading non-data rows to strip. The source verifies
        /// this count against the file and fails fast on mismatch.
        #[serde(default)]
        header_rows: usize,
        /// Positional field names, required when `header_rows` is zero
        #[serde(default)]
        field_order: Option<Vec<String>>,
    },
    /// ESRI shapefile (geometry from .shp, attributes from .dbf)
    Shapefile,
}

fn default_delimiter() -> char {
    DEFAULT_DELIMITER
}

/// Typed kind of a target column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    /// Fixed-point decimal. Precision must exceed the maximum magnitude
    /// observed in the source data; (12, 3) covers the MOCT attribute
    /// columns with room to spare.
    Decimal { precision: u32, scale: u32 },
}

/// Maps one source field to one target column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Field name in the source (DBF attribute or CSV header)
    pub field: String,
    /// Column name in the target table
    pub column: String,
    #[serde(flatten)]
    pub kind: ColumnKind,
}

/// Where the geometry value comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeometrySpec {
    /// Build a point from two coordinate fields of the record
    PointFields { x_field: String, y_field: String },
    /// Take the vertices of the source shape (point or polyline)
    Shape,
}

/// Index kind: spatial indexes back proximity/containment queries,
/// attribute indexes back equality/range lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Spatial,
    Attribute,
}

/// One index to create on the target table after a successful load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub columns: Vec<String>,
    pub kind: IndexKind,
}

impl IndexDescriptor {
    /// Deterministic index name, so reruns hit `IF NOT EXISTS` instead of
    /// creating duplicates.
    pub fn name(&self, table: &str) -> String {
        format!("idx_{}_{}", table, self.columns.join("_"))
    }
}

/// Plausible coordinate range for the target SRID, used by the verifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Valid longitude/latitude range for EPSG:4326
    pub fn lon_lat() -> Self {
        Self {
            min_x: -180.0,
            min_y: -90.0,
            max_x: 180.0,
            max_y: 90.0,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// Referential spot-check: sample links and resolve both endpoints
/// against the node table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferentialCheck {
    /// Table holding the referenced nodes
    pub node_table: String,
    /// Key column of the node table
    pub node_key_column: String,
    /// Column of this dataset referencing the start node
    pub from_column: String,
    /// Column of this dataset referencing the end node
    pub to_column: String,
    /// How many links to sample
    #[serde(default = "default_sample_size")]
    pub sample_size: u32,
}

fn default_sample_size() -> u32 {
    1_000
}

/// Whether an existing target table is replaced or appended to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Drop and recreate the target table before loading (full refresh)
    Overwrite,
    /// Keep existing rows; fail naming the conflicting primary keys if
    /// the table already contains any of the incoming keys
    Append,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::Overwrite => write!(f, "overwrite"),
            LoadMode::Append => write!(f, "append"),
        }
    }
}

/// Identifies one input dataset and its target table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Dataset name, used in logs and the run report
    pub name: String,
    /// Source file path (.csv or .shp)
    pub path: PathBuf,
    /// Declared source text encoding label (e.g. "EUC-KR", "UTF-8")
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// SRID the source coordinates are expressed in
    pub source_srid: i32,
    /// SRID geometries are reprojected to before insertion
    pub target_srid: i32,
    pub format: SourceFormat,
    /// Target column holding the primary key
    pub key_column: String,
    pub columns: Vec<ColumnSpec>,
    pub geometry: GeometrySpec,
    /// Target table name
    pub table: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fraction of read records that may be rejected before the run fails
    #[serde(default = "default_rejection_threshold")]
    pub rejection_threshold: f64,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
    /// Plausible coordinate range; defaults to lon/lat bounds when the
    /// target SRID is 4326
    #[serde(default)]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub referential_check: Option<ReferentialCheck>,
}

fn default_encoding() -> String {
    "UTF-8".to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_rejection_threshold() -> f64 {
    DEFAULT_REJECTION_THRESHOLD
}

impl DatasetDescriptor {
    /// Load a descriptor from a TOML file and validate it
    pub fn from_toml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let descriptor: DatasetDescriptor = toml::from_str(&text)
            .map_err(|e| EtlError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Fail-fast validation, run before any I/O.
    ///
    /// Identifier checks matter: table and column names are interpolated
    /// into DDL and COPY statements, so anything outside
    /// `[a-z_][a-z0-9_]*` is refused here.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EtlError::Config("dataset name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(EtlError::Config(format!(
                "dataset '{}': batch size must be non-zero",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&self.rejection_threshold) {
            return Err(EtlError::Config(format!(
                "dataset '{}': rejection threshold {} outside [0, 1]",
                self.name, self.rejection_threshold
            )));
        }
        if self.columns.is_empty() {
            return Err(EtlError::Config(format!(
                "dataset '{}': no columns mapped",
                self.name
            )));
        }

        check_identifier(&self.name, &self.table)?;
        for spec in &self.columns {
            check_identifier(&self.name, &spec.column)?;
            if let ColumnKind::Decimal { precision, scale } = spec.kind {
                if precision == 0 || precision > 18 || scale >= precision {
                    return Err(EtlError::Config(format!(
                        "dataset '{}': column '{}' has invalid decimal ({}, {})",
                        self.name, spec.column, precision, scale
                    )));
                }
            }
        }

        if !self.columns.iter().any(|c| c.column == self.key_column) {
            return Err(EtlError::Config(format!(
                "dataset '{}': key column '{}' is not among the mapped columns",
                self.name, self.key_column
            )));
        }

        for srid in [self.source_srid, self.target_srid] {
            if !proj::is_supported(srid) {
                return Err(EtlError::UnknownSrid(srid));
            }
        }

        if encoding_rs::Encoding::for_label(self.encoding.as_bytes()).is_none() {
            return Err(EtlError::Config(format!(
                "dataset '{}': unknown encoding label '{}'",
                self.name, self.encoding
            )));
        }

        match (&self.format, &self.geometry) {
            (SourceFormat::Shapefile, GeometrySpec::PointFields { .. }) => {
                return Err(EtlError::Config(format!(
                    "dataset '{}': shapefile sources carry their own geometry; \
                     use geometry kind 'shape'",
                    self.name
                )));
            }
            (SourceFormat::Delimited { .. }, GeometrySpec::Shape) => {
                return Err(EtlError::Config(format!(
                    "dataset '{}': delimited sources have no shape; \
                     use geometry kind 'point_fields'",
                    self.name
                )));
            }
            _ => {}
        }

        if let SourceFormat::Delimited {
            header_rows,
            field_order,
            ..
        } = &self.format
        {
            if *header_rows == 0 && field_order.is_none() {
                return Err(EtlError::Config(format!(
                    "dataset '{}': header_rows is 0, so field_order must list \
                     the source fields positionally",
                    self.name
                )));
            }
        }

        for index in &self.indexes {
            if index.columns.is_empty() {
                return Err(EtlError::Config(format!(
                    "dataset '{}': index with no columns",
                    self.name
                )));
            }
            for column in &index.columns {
                check_identifier(&self.name, column)?;
            }
        }

        if let Some(check) = &self.referential_check {
            check_identifier(&self.name, &check.node_table)?;
            check_identifier(&self.name, &check.node_key_column)?;
            for column in [&check.from_column, &check.to_column] {
                if !self.columns.iter().any(|c| &c.column == column) {
                    return Err(EtlError::Config(format!(
                        "dataset '{}': referential check column '{}' is not mapped",
                        self.name, column
                    )));
                }
            }
            if check.sample_size == 0 {
                return Err(EtlError::Config(format!(
                    "dataset '{}': referential sample size must be non-zero",
                    self.name
                )));
            }
        }

        Ok(())
    }

    /// Source field name feeding the key column
    pub fn key_field(&self) -> &str {
        self.columns
            .iter()
            .find(|c| c.column == self.key_column)
            .map(|c| c.field.as_str())
            // validate() guarantees the key column is mapped
            .unwrap_or(self.key_column.as_str())
    }

    /// Plausible coordinate range for verification
    pub fn effective_bounds(&self) -> Option<Bounds> {
        match self.bounds {
            Some(bounds) => Some(bounds),
            None if self.target_srid == proj::WGS84 => Some(Bounds::lon_lat()),
            None => None,
        }
    }
}

fn check_identifier(dataset: &str, ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if head_ok && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(())
    } else {
        Err(EtlError::Config(format!(
            "dataset '{}': '{}' is not a valid SQL identifier",
            dataset, ident
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_descriptor() -> DatasetDescriptor {
        DatasetDescriptor {
            name: "moct_link".into(),
            path: "data/moct_link.csv".into(),
            encoding: "EUC-KR".into(),
            source_srid: 5179,
            target_srid: 4326,
            format: SourceFormat::Delimited {
                delimiter: ',',
                header_rows: 1,
                field_order: None,
            },
            key_column: "link_id".into(),
            columns: vec![
                ColumnSpec {
                    field: "LINK_ID".into(),
                    column: "link_id".into(),
                    kind: ColumnKind::Text,
                },
                ColumnSpec {
                    field: "MAX_SPD".into(),
                    column: "speed_limit".into(),
                    kind: ColumnKind::Integer,
                },
            ],
            geometry: GeometrySpec::PointFields {
                x_field: "GRS80TM_X".into(),
                y_field: "GRS80TM_Y".into(),
            },
            table: "moct_link".into(),
            batch_size: 100,
            rejection_threshold: 0.01,
            indexes: vec![IndexDescriptor {
                columns: vec!["geom".into()],
                kind: IndexKind::Spatial,
            }],
            bounds: None,
            referential_check: None,
        }
    }

    #[test]
    fn valid_descriptor_passes() {
        assert!(link_descriptor().validate().is_ok());
    }

    #[test]
    fn unknown_srid_is_a_config_error() {
        let mut d = link_descriptor();
        d.source_srid = 99999;
        assert!(matches!(d.validate(), Err(EtlError::UnknownSrid(99999))));
    }

    #[test]
    fn unknown_encoding_is_a_config_error() {
        let mut d = link_descriptor();
        d.encoding = "KLINGON-8".into();
        assert!(matches!(d.validate(), Err(EtlError::Config(_))));
    }

    #[test]
    fn key_column_must_be_mapped() {
        let mut d = link_descriptor();
        d.key_column = "missing".into();
        assert!(matches!(d.validate(), Err(EtlError::Config(_))));
    }

    #[test]
    fn headerless_delimited_requires_field_order() {
        let mut d = link_descriptor();
        d.format = SourceFormat::Delimited {
            delimiter: ',',
            header_rows: 0,
            field_order: None,
        };
        assert!(matches!(d.validate(), Err(EtlError::Config(_))));
    }

    #[test]
    fn sql_identifiers_are_checked() {
        let mut d = link_descriptor();
        d.table = "moct_link; DROP TABLE nodes".into();
        assert!(matches!(d.validate(), Err(EtlError::Config(_))));
    }

    #[test]
    fn index_names_are_deterministic() {
        let index = IndexDescriptor {
            columns: vec!["f_node".into(), "t_node".into()],
            kind: IndexKind::Attribute,
        };
        assert_eq!(index.name("moct_link"), "idx_moct_link_f_node_t_node");
    }

    #[test]
    fn bounds_default_to_lon_lat_for_wgs84() {
        let d = link_descriptor();
        let bounds = d.effective_bounds().unwrap();
        assert!(bounds.contains(126.97, 37.56));
        assert!(!bounds.contains(200.0, 0.0));
    }

    #[test]
    fn descriptor_round_trips_through_toml() {
        let d = link_descriptor();
        let text = toml::to_string(&d).unwrap();
        let back: DatasetDescriptor = toml::from_str(&text).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(back.key_field(), "LINK_ID");
    }
}
