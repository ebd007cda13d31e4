//! Streaming access to file-backed tables.
//!
//! A [`ChunkedSource`] never loads a whole file unless asked to
//! ([`ChunkedSource::read_all`]). Structure comes from the header row,
//! types from a bounded preview, and rows from a forward-only iterator of
//! [`Table`] chunks. Iterators are single-pass: iterating again means calling
//! [`ChunkedSource::iter_chunks`] again, which reopens the file.

use crate::error::{PipelineError, Result, ResultExt as _};
use crate::schema::{Column, ColumnType, Schema};
use crate::table::{Table, Value, looks_temporal};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, sync_channel};
use std::thread::JoinHandle;
use tempfile::TempPath;

/// Rows sampled for type inference when no configuration says otherwise.
pub const DEFAULT_SAMPLE_ROWS: usize = 1_000;

/// A CSV file with a header row.
#[derive(Debug, Clone)]
pub struct ChunkedSource {
    path: PathBuf,
    delimiter: u8,
}

impl ChunkedSource {
    /// Open a source, failing early if the file is missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(PipelineError::source_error(&path, "file not found"));
        }
        Ok(Self {
            path,
            delimiter: b',',
        })
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, used as the origin name in fan-out layouts.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn byte_size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path).for_source(&self.path)?.len())
    }

    fn reader(&self) -> Result<csv::Reader<File>> {
        csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .from_path(&self.path)
            .for_source(&self.path)
    }

    fn header_names(&self, reader: &mut csv::Reader<File>) -> Result<Vec<String>> {
        let headers = reader.headers().for_source(&self.path)?;
        if headers.is_empty() {
            return Err(PipelineError::source_error(&self.path, "missing header row"));
        }
        Ok(headers.iter().map(ToOwned::to_owned).collect())
    }

    /// Header-only structure: every column is [`ColumnType::Unknown`].
    pub fn read_schema(&self) -> Result<Schema> {
        let mut reader = self.reader()?;
        let names = self.header_names(&mut reader)?;
        Schema::new(
            names
                .into_iter()
                .map(|n| Column::new(n, ColumnType::Unknown))
                .collect(),
        )
        .map_err(|e| PipelineError::source_error(&self.path, e))
    }

    /// Header plus types inferred from at most `sample_rows` rows.
    pub fn infer_schema(&self, sample_rows: usize) -> Result<Schema> {
        let mut reader = self.reader()?;
        let names = self.header_names(&mut reader)?;
        let mut samples: Vec<Vec<String>> = vec![Vec::new(); names.len()];

        for record in reader.records().take(sample_rows) {
            let record = record.for_source(&self.path)?;
            for (idx, field) in record.iter().enumerate() {
                if !field.is_empty()
                    && let Some(column) = samples.get_mut(idx)
                {
                    column.push(field.to_owned());
                }
            }
        }

        let columns = names
            .into_iter()
            .zip(samples)
            .map(|(name, values)| Column::new(name, infer_type(&values)))
            .collect();
        Schema::new(columns).map_err(|e| PipelineError::source_error(&self.path, e))
    }

    /// The first `n` rows, parsed per `schema`. The rest of the file is not read.
    pub fn preview(&self, schema: &Schema, n: usize) -> Result<Table> {
        let mut chunks = self.iter_chunks(schema.clone(), n.max(1))?;
        if n == 0 {
            return Ok(Table::empty(schema.clone()));
        }
        chunks
            .next()
            .unwrap_or_else(|| Ok(Table::empty(schema.clone())))
    }

    /// Lazy, finite, forward-only chunks of at most `chunk_rows` rows.
    pub fn iter_chunks(&self, schema: Schema, chunk_rows: usize) -> Result<Chunks> {
        let mut reader = self.reader()?;
        let names = self.header_names(&mut reader)?;
        if names != schema.names() {
            return Err(PipelineError::source_error(
                &self.path,
                format!(
                    "header {names:?} does not match expected columns {:?}",
                    schema.names()
                ),
            ));
        }
        Ok(Chunks {
            records: reader.into_records(),
            path: self.path.clone(),
            schema,
            chunk_rows: chunk_rows.max(1),
            keep_text: false,
            done: false,
            _temp: None,
        })
    }

    /// Every row at once.
    pub fn read_all(&self, schema: &Schema) -> Result<Table> {
        self.read_all_with_text(schema, false)
    }

    /// Every row at once, optionally with each row's source text.
    pub fn read_all_with_text(&self, schema: &Schema, keep_text: bool) -> Result<Table> {
        let chunks = self.iter_chunks(schema.clone(), 65_536)?.with_text(keep_text);
        Table::concat(schema.clone(), chunks)
    }
}

fn infer_type(values: &[String]) -> ColumnType {
    if values.is_empty() {
        ColumnType::Unknown
    } else if values.iter().all(|v| v.parse::<f64>().is_ok()) {
        ColumnType::Number
    } else if values.iter().all(|v| v == "true" || v == "false") {
        ColumnType::Boolean
    } else if values.iter().all(|v| looks_temporal(v)) {
        ColumnType::Temporal
    } else {
        ColumnType::String
    }
}

/// Forward-only chunk iterator over one open file.
pub struct Chunks {
    records: csv::StringRecordsIntoIter<File>,
    path: PathBuf,
    schema: Schema,
    chunk_rows: usize,
    /// Attach each row's source text to the chunk.
    keep_text: bool,
    done: bool,
    /// Keeps a scratch file alive for as long as it is being read.
    _temp: Option<TempPath>,
}

impl Chunks {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Carry every row's original field text along with its parsed values.
    pub fn with_text(mut self, keep_text: bool) -> Self {
        self.keep_text = keep_text;
        self
    }

    /// Tie the lifetime of a temporary file to this iterator; the file is
    /// deleted once the iterator is dropped.
    pub(crate) fn owning(mut self, temp: TempPath) -> Self {
        self._temp = Some(temp);
        self
    }

    fn next_chunk(&mut self) -> Result<Option<Table>> {
        let mut rows = Vec::with_capacity(self.chunk_rows.min(8_192));
        let mut text = Vec::new();
        while rows.len() < self.chunk_rows {
            match self.records.next() {
                Some(record) => {
                    let record = record.for_source(&self.path)?;
                    rows.push(
                        self.schema
                            .iter()
                            .zip(record.iter())
                            .map(|(column, field)| Value::parse(field, column.kind))
                            .collect(),
                    );
                    if self.keep_text {
                        text.push(record);
                    }
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if rows.is_empty() {
            return Ok(None);
        }
        let table = Table::new(self.schema.clone(), rows)?;
        if self.keep_text {
            table.with_text(text).map(Some)
        } else {
            Ok(Some(table))
        }
    }
}

impl Iterator for Chunks {
    type Item = Result<Table>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(table)) => Some(Ok(table)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Boxed chunk stream used by the executor.
pub type ChunkStream = Box<dyn Iterator<Item = Result<Table>> + Send>;

/// Read chunks on a background thread, at most `depth` chunks ahead, so disk
/// reads overlap with processing. Chunk order is preserved.
pub fn prefetch(chunks: Chunks, depth: usize) -> ChunkStream {
    let (tx, rx) = sync_channel(depth.max(1));
    let handle = std::thread::spawn(move || {
        for chunk in chunks {
            let failed = chunk.is_err();
            if tx.send(chunk).is_err() || failed {
                break;
            }
        }
    });
    Box::new(Prefetched {
        rx,
        handle: Some(handle),
    })
}

struct Prefetched {
    rx: Receiver<Result<Table>>,
    handle: Option<JoinHandle<()>>,
}

impl Iterator for Prefetched {
    type Item = Result<Table>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.recv() {
            Ok(chunk) => Some(chunk),
            Err(_) => {
                if let Some(handle) = self.handle.take()
                    && handle.join().is_err()
                {
                    return Some(Err(PipelineError::Other(
                        "chunk reader thread panicked".to_owned(),
                    )));
                }
                None
            }
        }
    }
}
