//! Delimited-text record source
//!
//! Streams a CSV file through a decoding reader that converts the declared
//! source encoding (the link table ships as EUC-KR) to UTF-8. Invalid byte
//! sequences are replaced with U+FFFD and counted per run; the count ends
//! up in the run report, so best-effort repair never turns into silent
//! corruption.
//!
//! The declared header-row count is enforced at open time: exactly that
//! many leading non-data rows must be present, no more, no fewer. A row
//! counts as non-data when any of its cells names a declared source field.

use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use encoding_rs::{Decoder, DecoderResult, Encoding};
use nodelink_common::{EtlError, Result};

use super::{RawRecord, RecordSource};
use crate::descriptor::{DatasetDescriptor, GeometrySpec, SourceFormat};

/// Replacement character emitted for each repaired byte sequence
const REPLACEMENT: &str = "\u{FFFD}";

/// `Read` adapter decoding the declared source encoding to UTF-8,
/// counting every malformed sequence it repairs.
struct DecodingReader<R: Read> {
    inner: R,
    decoder: Decoder,
    raw: Vec<u8>,
    raw_start: usize,
    raw_end: usize,
    pending: Vec<u8>,
    pending_start: usize,
    eof: bool,
    finished: bool,
    repairs: Arc<AtomicU64>,
}

impl<R: Read> DecodingReader<R> {
    fn new(inner: R, encoding: &'static Encoding, repairs: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            decoder: encoding.new_decoder(),
            raw: vec![0u8; 8192],
            raw_start: 0,
            raw_end: 0,
            pending: Vec::new(),
            pending_start: 0,
            eof: false,
            finished: false,
            repairs,
        }
    }

    fn refill_pending(&mut self) -> std::io::Result<()> {
        self.pending.clear();
        self.pending_start = 0;

        while self.pending.is_empty() && !self.finished {
            if self.raw_start == self.raw_end && !self.eof {
                let n = self.inner.read(&mut self.raw)?;
                self.raw_start = 0;
                self.raw_end = n;
                if n == 0 {
                    self.eof = true;
                }
            }

            let mut out = [0u8; 8192];
            let src = &self.raw[self.raw_start..self.raw_end];
            let last = self.eof;
            let (result, read, written) =
                self.decoder
                    .decode_to_utf8_without_replacement(src, &mut out, last);
            self.raw_start += read;
            self.pending.extend_from_slice(&out[..written]);

            match result {
                DecoderResult::InputEmpty => {
                    if last {
                        self.finished = true;
                    }
                }
                DecoderResult::OutputFull => {}
                DecoderResult::Malformed(_, _) => {
                    self.repairs.fetch_add(1, Ordering::Relaxed);
                    self.pending.extend_from_slice(REPLACEMENT.as_bytes());
                }
            }
        }

        Ok(())
    }
}

impl<R: Read> Read for DecodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending_start == self.pending.len() {
            if self.finished {
                return Ok(0);
            }
            self.refill_pending()?;
            if self.pending.is_empty() {
                return Ok(0);
            }
        }

        let available = &self.pending[self.pending_start..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_start += n;
        Ok(n)
    }
}

/// Record source for delimited text files
pub struct CsvSource {
    reader: csv::Reader<DecodingReader<BufReader<File>>>,
    field_names: Vec<String>,
    peeked: Option<csv::StringRecord>,
    next_index: u64,
    dataset: String,
    repairs: Arc<AtomicU64>,
}

impl std::fmt::Debug for CsvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvSource")
            .field("field_names", &self.field_names)
            .field("next_index", &self.next_index)
            .field("dataset", &self.dataset)
            .finish_non_exhaustive()
    }
}

impl CsvSource {
    /// Open the file, strip and verify the declared header rows
    pub fn open(descriptor: &DatasetDescriptor) -> Result<Self> {
        let (delimiter, header_rows, field_order) = match &descriptor.format {
            SourceFormat::Delimited {
                delimiter,
                header_rows,
                field_order,
            } => (*delimiter, *header_rows, field_order.clone()),
            SourceFormat::Shapefile => {
                return Err(EtlError::Config(format!(
                    "dataset '{}' is not delimited",
                    descriptor.name
                )))
            }
        };
        if !delimiter.is_ascii() {
            return Err(EtlError::Config(format!(
                "dataset '{}': delimiter must be ASCII",
                descriptor.name
            )));
        }

        // validate() already vetted the label
        let encoding = Encoding::for_label(descriptor.encoding.as_bytes())
            .ok_or_else(|| EtlError::Config(format!("unknown encoding '{}'", descriptor.encoding)))?;

        let file = File::open(&descriptor.path).map_err(|e| EtlError::Source {
            dataset: descriptor.name.clone(),
            message: format!("{}: {}", descriptor.path.display(), e),
        })?;

        let repairs = Arc::new(AtomicU64::new(0));
        let decoding = DecodingReader::new(BufReader::new(file), encoding, repairs.clone());
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter as u8)
            .has_headers(false)
            .flexible(true)
            .from_reader(decoding);

        let known_fields = Self::known_fields(descriptor, field_order.as_deref());

        // Strip exactly the declared number of header rows
        let mut header_record = None;
        for row in 0..header_rows {
            let mut record = csv::StringRecord::new();
            let got = reader.read_record(&mut record).map_err(|e| EtlError::Source {
                dataset: descriptor.name.clone(),
                message: e.to_string(),
            })?;
            if !got || !is_header_row(&record, &known_fields) {
                return Err(EtlError::HeaderMismatch {
                    dataset: descriptor.name.clone(),
                    declared: header_rows,
                    detected: row,
                });
            }
            header_record = Some(record.clone());
        }

        let field_names: Vec<String> = match (header_record, field_order) {
            (Some(record), _) => record.iter().map(|s| s.trim().to_string()).collect(),
            // validate() guarantees field_order is present when header_rows is 0
            (None, Some(order)) => order,
            (None, None) => {
                return Err(EtlError::Config(format!(
                    "dataset '{}': no field names available",
                    descriptor.name
                )))
            }
        };

        // One row of lookahead to catch an undeclared extra header
        let mut peeked = None;
        let mut record = csv::StringRecord::new();
        let got = reader.read_record(&mut record).map_err(|e| EtlError::Source {
            dataset: descriptor.name.clone(),
            message: e.to_string(),
        })?;
        if got {
            if is_header_row(&record, &known_fields) {
                return Err(EtlError::HeaderMismatch {
                    dataset: descriptor.name.clone(),
                    declared: header_rows,
                    detected: header_rows + 1,
                });
            }
            peeked = Some(record);
        }

        Ok(Self {
            reader,
            field_names,
            peeked,
            next_index: 0,
            dataset: descriptor.name.clone(),
            repairs,
        })
    }

    fn known_fields(descriptor: &DatasetDescriptor, field_order: Option<&[String]>) -> Vec<String> {
        let mut fields: Vec<String> = descriptor
            .columns
            .iter()
            .map(|c| c.field.to_lowercase())
            .collect();
        if let GeometrySpec::PointFields { x_field, y_field } = &descriptor.geometry {
            fields.push(x_field.to_lowercase());
            fields.push(y_field.to_lowercase());
        }
        if let Some(order) = field_order {
            fields.extend(order.iter().map(|f| f.to_lowercase()));
        }
        fields
    }
}

fn is_header_row(record: &csv::StringRecord, known_fields: &[String]) -> bool {
    record
        .iter()
        .any(|cell| known_fields.iter().any(|f| f == &cell.trim().to_lowercase()))
}

impl RecordSource for CsvSource {
    fn next_record(&mut self) -> Result<Option<RawRecord>> {
        let record = match self.peeked.take() {
            Some(record) => record,
            None => {
                let mut record = csv::StringRecord::new();
                let got = self
                    .reader
                    .read_record(&mut record)
                    .map_err(|e| EtlError::Source {
                        dataset: self.dataset.clone(),
                        message: e.to_string(),
                    })?;
                if !got {
                    return Ok(None);
                }
                record
            }
        };

        let fields = self
            .field_names
            .iter()
            .zip(record.iter())
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(RawRecord {
            index,
            fields,
            vertices: None,
        }))
    }

    fn decode_repairs(&self) -> u64 {
        self.repairs.load(Ordering::Relaxed)
    }
}
