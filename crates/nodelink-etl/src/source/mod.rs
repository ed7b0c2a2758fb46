//! Record sources
//!
//! A record source turns one input dataset into a lazy, finite, single-pass
//! sequence of raw records, with every value already decoded to UTF-8
//! regardless of the source encoding. Encoding violations are repaired
//! (replacement character) and counted, never silently dropped; structural
//! problems like a wrong header-row declaration fail fast at open time.

mod csv_source;
mod shp_source;

pub use csv_source::CsvSource;
pub use shp_source::ShpSource;

use nodelink_common::Result;

use crate::descriptor::{DatasetDescriptor, SourceFormat};
use crate::geom::Coord;

/// One raw record: field name to decoded text value, in source order,
/// plus the raw shape vertices for shapefile sources. Never mutated after
/// emission; the mapper produces a new record instead.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Zero-based position among the data records of the source
    pub index: u64,
    pub fields: Vec<(String, String)>,
    /// Vertices of the source shape, in source coordinates
    pub vertices: Option<Vec<Coord>>,
}

impl RawRecord {
    /// Look a field up by name
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    }
}

/// A lazy, single-pass sequence of raw records
pub trait RecordSource: Send {
    /// Next record, or `None` at end of input. Errors here are fatal for
    /// the run (per-record problems belong to the mapper).
    fn next_record(&mut self) -> Result<Option<RawRecord>>;

    /// How many byte sequences were invalid in the declared encoding and
    /// repaired so far
    fn decode_repairs(&self) -> u64;
}

/// Open the source a descriptor points at
pub fn open(descriptor: &DatasetDescriptor) -> Result<Box<dyn RecordSource>> {
    match &descriptor.format {
        SourceFormat::Delimited { .. } => Ok(Box::new(CsvSource::open(descriptor)?)),
        SourceFormat::Shapefile => Ok(Box::new(ShpSource::open(descriptor)?)),
    }
}
