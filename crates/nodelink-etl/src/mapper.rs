//! Schema mapping
//!
//! Transforms one raw record into one typed row matching the target table,
//! or rejects it with a reason naming the offending field and input. A
//! rejection isolates exactly one record; the run continues and the
//! rejection counts against the dataset's rejection-rate threshold.
//!
//! Geometry always gets the source SRID attached first and is then
//! reprojected to the target SRID. The store never sees source-CRS
//! coordinates.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::descriptor::{ColumnKind, DatasetDescriptor, GeometrySpec};
use crate::geom::Geometry;
use crate::proj;
use crate::source::RawRecord;

/// One typed column value of a mapped record
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(String),
    Integer(i64),
    Decimal(Decimal),
}

impl ColumnValue {
    /// Text form for the COPY wire format
    pub fn to_copy_text(&self) -> String {
        match self {
            ColumnValue::Text(s) => s.clone(),
            ColumnValue::Integer(i) => i.to_string(),
            ColumnValue::Decimal(d) => d.to_string(),
        }
    }
}

/// A record mapped to the target table's column contract. Values are
/// aligned with the descriptor's column order; geometry is carried
/// separately and already reprojected.
#[derive(Debug, Clone)]
pub struct MappedRecord {
    pub index: u64,
    pub key: String,
    pub values: Vec<ColumnValue>,
    pub geometry: Geometry,
}

/// Why one record was rejected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub record_index: u64,
    pub key: Option<String>,
    pub field: String,
    pub input: String,
    pub reason: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "record {} (key {:?}): field '{}'",
            self.record_index, self.key, self.field
        )?;
        if !self.input.is_empty() {
            write!(f, " = '{}'", self.input)?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// Maps raw records for one dataset
pub struct SchemaMapper {
    descriptor: Arc<DatasetDescriptor>,
}

impl SchemaMapper {
    pub fn new(descriptor: Arc<DatasetDescriptor>) -> Self {
        Self { descriptor }
    }

    /// Map one raw record, or reject it.
    ///
    /// Key uniqueness is deliberately not checked here; the store enforces
    /// the primary key and duplicates surface as loader rejections.
    pub fn map(&self, raw: &RawRecord) -> Result<MappedRecord, Rejection> {
        let d = &self.descriptor;

        let key_field = d.key_field();
        let key = match raw.get(key_field) {
            Some(value) if !value.trim().is_empty() => value.trim().to_string(),
            Some(value) => {
                return Err(self.reject(raw, None, key_field, value, "empty key"));
            }
            None => {
                return Err(self.reject(raw, None, key_field, "", "missing field"));
            }
        };

        let mut values = Vec::with_capacity(d.columns.len());
        for spec in &d.columns {
            let input = match raw.get(&spec.field) {
                Some(value) => value,
                None => {
                    return Err(self.reject(raw, Some(&key), &spec.field, "", "missing field"));
                }
            };
            let value = match &spec.kind {
                ColumnKind::Text => ColumnValue::Text(input.to_string()),
                ColumnKind::Integer => match input.trim().parse::<i64>() {
                    Ok(i) => ColumnValue::Integer(i),
                    Err(_) => {
                        return Err(self.reject(
                            raw,
                            Some(&key),
                            &spec.field,
                            input,
                            "not an integer",
                        ));
                    }
                },
                ColumnKind::Decimal { precision, scale } => {
                    match Decimal::from_str(input.trim()) {
                        Ok(value) => {
                            let limit = Decimal::from(10i64.pow(precision - scale));
                            if value.abs() >= limit {
                                return Err(self.reject(
                                    raw,
                                    Some(&key),
                                    &spec.field,
                                    input,
                                    "exceeds declared precision",
                                ));
                            }
                            ColumnValue::Decimal(value.round_dp(*scale))
                        }
                        Err(_) => {
                            return Err(self.reject(
                                raw,
                                Some(&key),
                                &spec.field,
                                input,
                                "not a decimal",
                            ));
                        }
                    }
                }
            };
            values.push(value);
        }

        let geometry = self.map_geometry(raw, &key)?;

        Ok(MappedRecord {
            index: raw.index,
            key,
            values,
            geometry,
        })
    }

    fn map_geometry(&self, raw: &RawRecord, key: &str) -> Result<Geometry, Rejection> {
        let d = &self.descriptor;

        let source_geometry = match &d.geometry {
            GeometrySpec::PointFields { x_field, y_field } => {
                let x = self.coordinate_field(raw, key, x_field)?;
                let y = self.coordinate_field(raw, key, y_field)?;
                Geometry::point(d.source_srid, x, y)
                    .map_err(|e| self.reject(raw, Some(key), x_field, "", &e.to_string()))?
            }
            GeometrySpec::Shape => {
                let vertices = raw.vertices.clone().ok_or_else(|| {
                    self.reject(raw, Some(key), "geometry", "", "unsupported or missing shape")
                })?;
                match vertices.len() {
                    0 => {
                        return Err(self.reject(raw, Some(key), "geometry", "", "empty shape"));
                    }
                    1 => Geometry::point(d.source_srid, vertices[0].x, vertices[0].y)
                        .map_err(|e| self.reject(raw, Some(key), "geometry", "", &e.to_string()))?,
                    _ => Geometry::line_string(d.source_srid, vertices)
                        .map_err(|e| self.reject(raw, Some(key), "geometry", "", &e.to_string()))?,
                }
            }
        };

        if !source_geometry.is_finite() {
            return Err(self.reject(raw, Some(key), "geometry", "", "non-finite coordinate"));
        }

        let reprojected = proj::reproject(&source_geometry, d.target_srid)
            .map_err(|e| self.reject(raw, Some(key), "geometry", "", &e.to_string()))?;

        if !reprojected.is_finite() {
            return Err(self.reject(
                raw,
                Some(key),
                "geometry",
                "",
                "coordinate outside projection domain",
            ));
        }

        Ok(reprojected)
    }

    fn coordinate_field(&self, raw: &RawRecord, key: &str, field: &str) -> Result<f64, Rejection> {
        let input = raw
            .get(field)
            .ok_or_else(|| self.reject(raw, Some(key), field, "", "missing field"))?;
        input
            .trim()
            .parse::<f64>()
            .map_err(|_| self.reject(raw, Some(key), field, input, "not a coordinate"))
    }

    fn reject(
        &self,
        raw: &RawRecord,
        key: Option<&str>,
        field: &str,
        input: &str,
        reason: &str,
    ) -> Rejection {
        Rejection {
            record_index: raw.index,
            key: key.map(str::to_string),
            field: field.to_string(),
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ColumnSpec, SourceFormat};
    use crate::geom::Coord;

    fn descriptor() -> Arc<DatasetDescriptor> {
        Arc::new(DatasetDescriptor {
            name: "links".into(),
            path: "unused.csv".into(),
            encoding: "UTF-8".into(),
            source_srid: proj::KOREA_UNIFIED,
            target_srid: proj::WGS84,
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
                ColumnSpec {
                    field: "LENGTH".into(),
                    column: "length_m".into(),
                    kind: ColumnKind::Decimal {
                        precision: 12,
                        scale: 3,
                    },
                },
            ],
            geometry: GeometrySpec::PointFields {
                x_field: "X".into(),
                y_field: "Y".into(),
            },
            table: "moct_link".into(),
            batch_size: 10,
            rejection_threshold: 0.5,
            indexes: vec![],
            bounds: None,
            referential_check: None,
        })
    }

    fn raw(fields: &[(&str, &str)]) -> RawRecord {
        RawRecord {
            index: 7,
            fields: fields
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            vertices: None,
        }
    }

    #[test]
    fn maps_and_reprojects_a_valid_record() {
        let mapper = SchemaMapper::new(descriptor());
        let record = raw(&[
            ("LINK_ID", "1000001"),
            ("MAX_SPD", "60"),
            ("LENGTH", "253.124"),
            ("X", "953900.0"),
            ("Y", "1952000.0"),
        ]);

        let mapped = mapper.map(&record).unwrap();
        assert_eq!(mapped.key, "1000001");
        assert_eq!(mapped.values[1], ColumnValue::Integer(60));
        assert_eq!(mapped.geometry.srid(), proj::WGS84);
        let c = mapped.geometry.coords()[0];
        assert!((125.0..130.0).contains(&c.x));
        assert!((36.0..39.0).contains(&c.y));
    }

    #[test]
    fn integer_parse_failure_names_field_and_input() {
        let mapper = SchemaMapper::new(descriptor());
        let record = raw(&[
            ("LINK_ID", "1000002"),
            ("MAX_SPD", "sixty"),
            ("LENGTH", "1.0"),
            ("X", "953900.0"),
            ("Y", "1952000.0"),
        ]);

        let rejection = mapper.map(&record).unwrap_err();
        assert_eq!(rejection.key.as_deref(), Some("1000002"));
        assert_eq!(rejection.field, "MAX_SPD");
        assert_eq!(rejection.input, "sixty");
        assert_eq!(rejection.record_index, 7);
    }

    #[test]
    fn decimal_magnitude_is_bounded_by_declared_precision() {
        let mapper = SchemaMapper::new(descriptor());
        let record = raw(&[
            ("LINK_ID", "1000003"),
            ("MAX_SPD", "60"),
            ("LENGTH", "1234567890.0"),
            ("X", "953900.0"),
            ("Y", "1952000.0"),
        ]);

        let rejection = mapper.map(&record).unwrap_err();
        assert_eq!(rejection.field, "LENGTH");
        assert_eq!(rejection.reason, "exceeds declared precision");
    }

    #[test]
    fn bad_coordinate_rejects_only_that_record() {
        let mapper = SchemaMapper::new(descriptor());
        let record = raw(&[
            ("LINK_ID", "1000004"),
            ("MAX_SPD", "60"),
            ("LENGTH", "1.0"),
            ("X", "not-a-number"),
            ("Y", "1952000.0"),
        ]);

        let rejection = mapper.map(&record).unwrap_err();
        assert_eq!(rejection.field, "X");
        assert_eq!(rejection.reason, "not a coordinate");
    }

    #[test]
    fn missing_mapped_field_is_a_rejection() {
        let mapper = SchemaMapper::new(descriptor());
        let record = raw(&[
            ("LINK_ID", "1000005"),
            ("MAX_SPD", "60"),
            ("X", "953900.0"),
            ("Y", "1952000.0"),
        ]);

        let rejection = mapper.map(&record).unwrap_err();
        assert_eq!(rejection.field, "LENGTH");
        assert_eq!(rejection.reason, "missing field");
    }

    #[test]
    fn shape_records_map_to_lines() {
        let mut d = (*descriptor()).clone();
        d.format = SourceFormat::Shapefile;
        d.geometry = GeometrySpec::Shape;
        let mapper = SchemaMapper::new(Arc::new(d));

        let mut record = raw(&[
            ("LINK_ID", "1000006"),
            ("MAX_SPD", "60"),
            ("LENGTH", "1.0"),
        ]);
        record.vertices = Some(vec![
            Coord::new(953_900.0, 1_952_000.0),
            Coord::new(954_000.0, 1_952_100.0),
        ]);

        let mapped = mapper.map(&record).unwrap();
        assert_eq!(mapped.geometry.coords().len(), 2);
        assert_eq!(mapped.geometry.srid(), proj::WGS84);

        record.vertices = None;
        let rejection = mapper.map(&record).unwrap_err();
        assert_eq!(rejection.reason, "unsupported or missing shape");
    }
}
