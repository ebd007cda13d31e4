//! Key-partitioned fan-out of CSV files.
//!
//! Every row of an input file lands in `output/<key>/<file name>`, where
//! `key` is the trimmed value of the partition column. Destinations are
//! append-only: a rerun over the same input appends every row again, so a
//! caller that wants a clean result clears the output directory first.
//!
//! Files are read with their original text preserved. Rows above the header
//! (the first row containing the partition column name) are a preamble and
//! are repeated at the top of every new destination.

mod sink;
mod verify;

pub use sink::{Destinations, STAGE_LIMIT};
pub use verify::{FanOutVerification, KeyViolation, verify_fanout, verify_fanout_with_limit};

use crate::cancel::CancellationToken;
use crate::config::FanOutConfig;
use crate::error::{PipelineError, Result, ResultExt as _};
use csv::StringRecord;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Rows read between flushes and cancellation checks.
pub const DEFAULT_CHUNK_ROWS: usize = 50_000;

/// Counts for one fanned-out file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileFanOut {
    pub rows_written: u64,
    pub rows_skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of [`FanOutWriter::run_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    /// Files fanned out completely.
    pub files: usize,
    pub skipped_files: Vec<SkippedFile>,
    pub rows_written: u64,
    pub rows_skipped: u64,
    /// Destination files touched by the writer.
    pub destinations: usize,
}

/// Splits CSV files into per-key destination files.
#[derive(Debug)]
pub struct FanOutWriter {
    sinks: Destinations,
    config: FanOutConfig,
    chunk_rows: usize,
    cancel: CancellationToken,
}

impl FanOutWriter {
    pub fn new(output_dir: impl Into<PathBuf>, config: FanOutConfig) -> Self {
        Self {
            sinks: Destinations::new(output_dir, config.max_open_files),
            config,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    pub fn output_dir(&self) -> &Path {
        self.sinks.root()
    }

    /// Fan out one file. Rows staged before a failure are still flushed, so
    /// every destination stays a valid prefix.
    pub fn run_file(&mut self, path: &Path, column: &str) -> Result<FileFanOut> {
        self.cancel.check()?;
        let result = self.split(path, column);
        self.sinks.flush()?;
        result
    }

    fn split(&mut self, path: &Path, column: &str) -> Result<FileFanOut> {
        let origin = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::source_error(path, "not a file path"))?;

        let mut records = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .for_source(path)?
            .into_records();
        let (preamble, header, idx) =
            find_header(&mut records, column, self.config.header_scan_limit, path)?;

        let written_before = self.sinks.rows_written();
        let mut skipped = 0_u64;
        let mut unusable = 0_u64;
        let mut seen = 0_usize;
        for record in records {
            let record = record.for_source(path)?;
            let key = record.get(idx).map(str::trim).unwrap_or_default();
            if key.is_empty() {
                skipped += 1;
            } else if !self
                .sinks
                .stage(key, &origin, &preamble, &header, &record)?
            {
                skipped += 1;
                unusable += 1;
            }

            seen += 1;
            if seen % self.chunk_rows == 0 {
                self.sinks.flush()?;
                debug!(path = %path.display(), rows = seen, "Fan-out progress");
                self.cancel.check()?;
            }
        }
        self.sinks.flush()?;

        if unusable > 0 {
            warn!(
                path = %path.display(),
                rows = unusable,
                "Skipped rows whose key cannot name a directory"
            );
        }
        let outcome = FileFanOut {
            rows_written: self.sinks.rows_written() - written_before,
            rows_skipped: skipped,
        };
        info!(
            path = %path.display(),
            rows_written = outcome.rows_written,
            rows_skipped = outcome.rows_skipped,
            "Fanned out file"
        );
        Ok(outcome)
    }

    /// Fan out several files. A file that cannot be read or lacks the
    /// partition column is skipped with a warning; write failures and
    /// cancellation stop the batch.
    pub fn run_batch<P: AsRef<Path>>(
        &mut self,
        files: impl IntoIterator<Item = P>,
        column: &str,
    ) -> Result<FanOutReport> {
        let mut report = FanOutReport::default();
        for path in files {
            let path = path.as_ref();
            match self.run_file(path, column) {
                Ok(outcome) => {
                    report.files += 1;
                    report.rows_written += outcome.rows_written;
                    report.rows_skipped += outcome.rows_skipped;
                }
                Err(e) if e.is_per_source() => {
                    warn!(path = %path.display(), error = %e, "Skipping source");
                    report.skipped_files.push(SkippedFile {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    self.sinks.finish()?;
                    return Err(e);
                }
            }
        }
        self.sinks.finish()?;
        report.destinations = self.sinks.destinations();
        info!(
            files = report.files,
            skipped = report.skipped_files.len(),
            rows_written = report.rows_written,
            destinations = report.destinations,
            "Fan-out finished"
        );
        Ok(report)
    }

    /// Fan out every `*.csv` file directly inside `input_dir`, by name.
    pub fn run_dir(&mut self, input_dir: &Path, column: &str) -> Result<FanOutReport> {
        let files = csv_files(input_dir)?;
        info!(
            input = %input_dir.display(),
            output = %self.sinks.root().display(),
            files = files.len(),
            "Starting fan-out"
        );
        self.run_batch(files, column)
    }
}

/// `*.csv` files directly inside `dir`, sorted by name.
pub(crate) fn csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).for_source(dir)? {
        let path = entry.for_source(dir)?.path();
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Read up to `limit` rows looking for the one containing `column`. Returns
/// the rows above it, the header itself and the column's position.
pub(crate) fn find_header<R: std::io::Read>(
    records: &mut csv::StringRecordsIntoIter<R>,
    column: &str,
    limit: usize,
    path: &Path,
) -> Result<(Vec<StringRecord>, StringRecord, usize)> {
    let mut preamble = Vec::new();
    for record in records.by_ref().take(limit) {
        let record = record.for_source(path)?;
        if let Some(idx) = record.iter().position(|field| header_name(field) == column) {
            return Ok((preamble, record, idx));
        }
        preamble.push(record);
    }
    Err(PipelineError::MissingColumn {
        path: path.to_path_buf(),
        column: column.to_owned(),
    })
}

fn header_name(field: &str) -> &str {
    field.trim_start_matches('\u{feff}').trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).expect("write input");
        path
    }

    fn read(path: PathBuf) -> String {
        std::fs::read_to_string(path).expect("read destination")
    }

    #[test]
    fn test_partition_by_key_in_row_order() -> anyhow::Result<()> {
        let input = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        let a = write(input.path(), "a.csv", "storeId,amount\n1,100\n2,50\n1,30\n");

        let mut writer = FanOutWriter::new(output.path(), FanOutConfig::default());
        let outcome = writer.run_file(&a, "storeId")?;
        assert_eq!(outcome.rows_written, 3);

        assert_eq!(
            read(output.path().join("1").join("a.csv")),
            "storeId,amount\n1,100\n1,30\n"
        );
        assert_eq!(read(output.path().join("2").join("a.csv")), "storeId,amount\n2,50\n");
        Ok(())
    }

    #[test]
    fn test_preamble_precedes_header() -> anyhow::Result<()> {
        let input = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        let a = write(
            input.path(),
            "a.csv",
            "Export,2024-05-01\nstoreId,amount\n9,1\n,2\n9\n",
        );

        let mut writer = FanOutWriter::new(output.path(), FanOutConfig::default());
        let outcome = writer.run_file(&a, "storeId")?;
        assert_eq!(outcome.rows_written, 2);
        assert_eq!(outcome.rows_skipped, 1);
        // "9" alone still carries the key field.
        assert_eq!(
            read(output.path().join("9").join("a.csv")),
            "Export,2024-05-01\nstoreId,amount\n9,1\n9\n"
        );
        Ok(())
    }

    #[test]
    fn test_short_rows_are_skipped() -> anyhow::Result<()> {
        let input = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        let a = write(input.path(), "a.csv", "amount,storeId\n1,5\n2\n3,5\n");

        let mut writer = FanOutWriter::new(output.path(), FanOutConfig::default());
        let outcome = writer.run_file(&a, "storeId")?;
        assert_eq!(outcome.rows_written, 2);
        assert_eq!(outcome.rows_skipped, 1);
        Ok(())
    }

    #[test]
    fn test_batch_skips_file_without_column() -> anyhow::Result<()> {
        let input = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        write(input.path(), "a.csv", "storeId,amount\n1,100\n");
        write(input.path(), "b.csv", "shop,amount\n1,100\n");
        write(input.path(), "notes.txt", "storeId\n1\n");

        let mut writer = FanOutWriter::new(output.path(), FanOutConfig::default());
        let report = writer.run_dir(input.path(), "storeId")?;
        assert_eq!(report.files, 1);
        assert_eq!(report.skipped_files.len(), 1);
        assert!(report.skipped_files[0].path.ends_with("b.csv"));
        assert_eq!(report.destinations, 1);
        assert!(!output.path().join("1").join("b.csv").exists());
        Ok(())
    }

    #[test]
    fn test_cancelled_writer_stops_before_reading() -> anyhow::Result<()> {
        let input = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        write(input.path(), "a.csv", "storeId\n1\n");

        let token = CancellationToken::new();
        token.cancel();
        let mut writer =
            FanOutWriter::new(output.path(), FanOutConfig::default()).with_cancellation(token);
        let err = writer
            .run_dir(input.path(), "storeId")
            .expect_err("cancelled run");
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!output.path().join("1").exists());
        Ok(())
    }
}
