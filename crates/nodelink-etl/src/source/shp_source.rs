//! Shapefile record source
//!
//! Wraps the `shapefile` crate's paired .shp/.dbf reader (the node set
//! ships as a national point shapefile). Shape vertices are passed through
//! raw in source coordinates; attribute decoding is the DBF reader's job,
//! so the decode-repair counter of this source stays at zero.
//!
//! The underlying reader wants `&mut self` iteration, so records are pumped
//! through a bounded channel from a dedicated thread; the source side stays
//! lazy and single-pass.

use std::sync::mpsc::{sync_channel, Receiver};

use nodelink_common::{EtlError, Result};

use super::{RawRecord, RecordSource};
use crate::descriptor::DatasetDescriptor;
use crate::geom::Coord;

/// Records buffered between the reader thread and the pipeline
const CHANNEL_DEPTH: usize = 256;

/// Record source for ESRI shapefiles
pub struct ShpSource {
    receiver: Receiver<Result<RawRecord>>,
    finished: bool,
}

impl ShpSource {
    /// Open the .shp/.dbf pair and start the reader thread
    pub fn open(descriptor: &DatasetDescriptor) -> Result<Self> {
        let reader = shapefile::Reader::from_path(&descriptor.path).map_err(|e| {
            EtlError::Source {
                dataset: descriptor.name.clone(),
                message: format!("{}: {}", descriptor.path.display(), e),
            }
        })?;

        let dataset = descriptor.name.clone();
        let field_order: Vec<String> =
            descriptor.columns.iter().map(|c| c.field.clone()).collect();

        let (sender, receiver) = sync_channel(CHANNEL_DEPTH);
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut index = 0u64;
            for shape_record in reader.iter_shapes_and_records() {
                let item = match shape_record {
                    Ok((shape, record)) => {
                        let fields = field_order
                            .iter()
                            .filter_map(|name| {
                                record
                                    .get(name)
                                    .map(|value| (name.clone(), field_value_to_string(value)))
                            })
                            .collect();
                        let raw = RawRecord {
                            index,
                            fields,
                            vertices: shape_vertices(&shape),
                        };
                        index += 1;
                        Ok(raw)
                    }
                    Err(e) => Err(EtlError::Source {
                        dataset: dataset.clone(),
                        message: e.to_string(),
                    }),
                };
                let failed = item.is_err();
                if sender.send(item).is_err() || failed {
                    // Consumer hung up, or the read error ends the stream
                    return;
                }
            }
        });

        Ok(Self {
            receiver,
            finished: false,
        })
    }
}

impl RecordSource for ShpSource {
    fn next_record(&mut self) -> Result<Option<RawRecord>> {
        if self.finished {
            return Ok(None);
        }
        match self.receiver.recv() {
            Ok(Ok(record)) => Ok(Some(record)),
            Ok(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            Err(_) => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    fn decode_repairs(&self) -> u64 {
        // DBF text decoding is delegated to the dbase reader
        0
    }
}

/// Vertices of the supported shape kinds, in shapefile order.
/// Unsupported kinds map to `None` and are rejected per record downstream.
fn shape_vertices(shape: &shapefile::Shape) -> Option<Vec<Coord>> {
    use shapefile::Shape;
    match shape {
        Shape::Point(p) => Some(vec![Coord::new(p.x, p.y)]),
        Shape::PointM(p) => Some(vec![Coord::new(p.x, p.y)]),
        Shape::PointZ(p) => Some(vec![Coord::new(p.x, p.y)]),
        Shape::Polyline(line) => Some(
            line.parts()
                .iter()
                .flat_map(|part| part.iter().map(|p| Coord::new(p.x, p.y)))
                .collect(),
        ),
        Shape::PolylineM(line) => Some(
            line.parts()
                .iter()
                .flat_map(|part| part.iter().map(|p| Coord::new(p.x, p.y)))
                .collect(),
        ),
        Shape::PolylineZ(line) => Some(
            line.parts()
                .iter()
                .flat_map(|part| part.iter().map(|p| Coord::new(p.x, p.y)))
                .collect(),
        ),
        _ => None,
    }
}

fn field_value_to_string(value: &shapefile::dbase::FieldValue) -> String {
    use shapefile::dbase::FieldValue;
    match value {
        FieldValue::Character(Some(s)) => s.clone(),
        FieldValue::Character(None) => String::new(),
        FieldValue::Numeric(Some(n)) => format_dbf_number(*n),
        FieldValue::Numeric(None) => String::new(),
        FieldValue::Float(Some(f)) => format_dbf_number(f64::from(*f)),
        FieldValue::Float(None) => String::new(),
        FieldValue::Integer(i) => i.to_string(),
        FieldValue::Logical(Some(b)) => b.to_string(),
        FieldValue::Logical(None) => String::new(),
        FieldValue::Date(Some(d)) => format!("{:04}-{:02}-{:02}", d.year(), d.month(), d.day()),
        FieldValue::Date(None) => String::new(),
        other => format!("{:?}", other),
    }
}

/// DBF numeric fields are f64 even for id-like integer data; keep whole
/// numbers free of a trailing `.0` so they coerce as integers downstream.
fn format_dbf_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
