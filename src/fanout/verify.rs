//! Post-run checks of a fan-out output directory.

use super::{csv_files, find_header};
use crate::error::{PipelineError, Result, ResultExt as _};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

/// Sample rows kept per violating file.
const SAMPLES_PER_FILE: usize = 5;

/// A destination row whose key does not match its directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyViolation {
    pub key: String,
    pub file: String,
    /// One-based line number within the destination file.
    pub line: u64,
    pub actual: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutVerification {
    /// Key directories found.
    pub keys: usize,
    /// Per key, input file names without a destination under that key.
    pub missing_files: BTreeMap<String, BTreeSet<String>>,
    /// Per key, destination file names with no matching input.
    pub extra_files: BTreeMap<String, BTreeSet<String>>,
    pub checked_files: usize,
    /// Files with at least one violation.
    pub violated_files: usize,
    pub violation_count: u64,
    /// Up to five sample violations per file.
    pub violations: Vec<KeyViolation>,
    /// Key directories holding more files than the limit, with their count.
    pub crowded_keys: BTreeMap<String, usize>,
}

impl FanOutVerification {
    pub fn is_ok(&self) -> bool {
        self.missing_files.is_empty()
            && self.extra_files.is_empty()
            && self.violation_count == 0
            && self.crowded_keys.is_empty()
    }
}

/// Check `output_dir` against the `*.csv` files of `input_dir`: every key
/// directory should hold one file per input, and every row in it should
/// carry that key in `column`.
pub fn verify_fanout(
    input_dir: &Path,
    output_dir: &Path,
    column: &str,
) -> Result<FanOutVerification> {
    verify_fanout_with_limit(input_dir, output_dir, column, None)
}

/// [`verify_fanout`], also failing every key directory that holds more than
/// `max_files_per_key` files of any kind.
pub fn verify_fanout_with_limit(
    input_dir: &Path,
    output_dir: &Path,
    column: &str,
    max_files_per_key: Option<usize>,
) -> Result<FanOutVerification> {
    let inputs: BTreeSet<String> = csv_files(input_dir)?
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();

    let mut keys = Vec::new();
    for entry in std::fs::read_dir(output_dir).for_source(output_dir)? {
        let path = entry.for_source(output_dir)?.path();
        if path.is_dir()
            && let Some(name) = path.file_name()
        {
            keys.push(name.to_string_lossy().into_owned());
        }
    }
    keys.sort();

    let mut report = FanOutVerification {
        keys: keys.len(),
        ..FanOutVerification::default()
    };
    for key in &keys {
        let dir = output_dir.join(key);
        if let Some(limit) = max_files_per_key {
            let count = count_files(&dir)?;
            if count > limit {
                warn!(key = %key, files = count, limit, "Key directory exceeds file limit");
                report.crowded_keys.insert(key.clone(), count);
            }
        }
        let files = csv_files(&dir)?;
        let names: BTreeSet<String> = files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();

        let missing: BTreeSet<String> = inputs.difference(&names).cloned().collect();
        if !missing.is_empty() {
            report.missing_files.insert(key.clone(), missing);
        }
        let extra: BTreeSet<String> = names.difference(&inputs).cloned().collect();
        if !extra.is_empty() {
            report.extra_files.insert(key.clone(), extra);
        }

        for path in &files {
            report.checked_files += 1;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (count, samples) = check_file(path, key, &name, column)?;
            if count > 0 {
                report.violated_files += 1;
                report.violation_count += count;
                report.violations.extend(samples);
            }
        }
    }

    info!(
        output = %output_dir.display(),
        keys = report.keys,
        checked_files = report.checked_files,
        violations = report.violation_count,
        crowded_keys = report.crowded_keys.len(),
        "Verified fan-out output"
    );
    Ok(report)
}

fn count_files(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir).for_source(dir)? {
        if entry.for_source(dir)?.path().is_file() {
            count += 1;
        }
    }
    Ok(count)
}

fn check_file(path: &Path, key: &str, name: &str, column: &str) -> Result<(u64, Vec<KeyViolation>)> {
    let violation = |line: u64, actual: &str| KeyViolation {
        key: key.to_owned(),
        file: name.to_owned(),
        line,
        actual: actual.to_owned(),
    };

    let mut records = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .for_source(path)?
        .into_records();
    let idx = match find_header(&mut records, column, usize::MAX, path) {
        Ok((_, _, idx)) => idx,
        Err(PipelineError::MissingColumn { .. }) => {
            return Ok((1, vec![violation(1, "<missing header>")]));
        }
        Err(e) => return Err(e),
    };

    let mut count = 0_u64;
    let mut samples = Vec::new();
    for record in records {
        let record = record.for_source(path)?;
        let actual = record.get(idx).unwrap_or_default();
        if actual.trim() != key {
            count += 1;
            if samples.len() < SAMPLES_PER_FILE {
                let line = record.position().map_or(0, csv::Position::line);
                samples.push(violation(line, actual));
            }
        }
    }
    Ok((count, samples))
}
