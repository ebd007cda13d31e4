use super::{
    Capabilities, Category, ExecContext, Operation, Params, Validation, parse_params, to_params,
};
use crate::config::FanOutConfig;
use crate::error::{PipelineError, Result};
use crate::fanout::Destinations;
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::Schema;
use crate::table::Table;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionParams {
    /// Column whose trimmed value names the destination directory.
    pub column: String,
    pub output_dir: PathBuf,
}

/// Terminal fan-out step: writes every row to
/// `output_dir/<key>/<origin file name>` and forwards its input unchanged.
///
/// Keys and written rows use the field text read from the source, so `007`
/// and `7` land in different directories. Every run opens its destinations
/// afresh; a pipeline holding this step runs one execution at a time.
#[derive(Debug)]
pub struct PartitionBy {
    params: PartitionParams,
    max_open_files: usize,
    sinks: Mutex<Destinations>,
    skipped: AtomicU64,
}

impl PartitionBy {
    pub const NAME: &'static str = "partition_by";

    pub fn new(params: PartitionParams) -> Self {
        Self::with_max_open_files(params, FanOutConfig::default().max_open_files)
    }

    pub fn with_max_open_files(params: PartitionParams, max_open_files: usize) -> Self {
        let sinks = Destinations::new(params.output_dir.clone(), max_open_files);
        Self {
            params,
            max_open_files,
            sinks: Mutex::new(sinks),
            skipped: AtomicU64::new(0),
        }
    }

    fn sinks(&self) -> MutexGuard<'_, Destinations> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self::new(parse_params(Self::NAME, params)?))
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Partition into files", Category::Partition)
            .param(
                "column",
                ParamSpec::required(ParamKind::String, "Column whose value picks the directory"),
            )
            .param(
                "output_dir",
                ParamSpec::required(ParamKind::String, "Directory receiving one folder per key"),
            )
    }

    /// Rows written to disk by the current or last run.
    pub fn rows_written(&self) -> u64 {
        self.sinks().rows_written()
    }

    /// Rows without a usable key in the current or last run.
    pub fn rows_skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Operation for PartitionBy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::Partition
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::streaming(false)
    }

    fn params(&self) -> Params {
        to_params(&self.params)
    }

    fn describe(&self) -> String {
        format!(
            "Partition by {} into {}",
            self.params.column,
            self.params.output_dir.display()
        )
    }

    fn check_params(&self) -> Vec<String> {
        if self.params.output_dir.as_os_str().is_empty() {
            vec!["an output directory is required".to_owned()]
        } else {
            Vec::new()
        }
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        v.require_columns(input, [&self.params.column], "partition by");
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        Ok(input.clone())
    }

    fn execute(&self, input: Table, ctx: &ExecContext<'_>) -> Result<Table> {
        let idx = input.schema().index_of(&self.params.column).ok_or_else(|| {
            PipelineError::Other(format!("column '{}' not found", self.params.column))
        })?;
        let header = StringRecord::from(input.schema().names());

        let mut sinks = self.sinks();
        let mut skipped = 0_u64;
        for row in 0..input.len() {
            let fields = input.fields(row);
            let key = fields[idx].trim();
            let staged = !key.is_empty()
                && sinks.stage(
                    key,
                    ctx.origin,
                    &[],
                    &header,
                    fields.iter().map(|f| f.as_bytes()),
                )?;
            if !staged {
                skipped += 1;
            }
        }
        sinks.flush()?;
        self.skipped.fetch_add(skipped, Ordering::Relaxed);
        debug!(
            origin = ctx.origin,
            rows = input.len(),
            skipped,
            destinations = sinks.destinations(),
            "Partitioned chunk"
        );
        drop(sinks);
        Ok(input)
    }

    fn needs_source_text(&self) -> bool {
        true
    }

    fn start_run(&self) -> Result<()> {
        let mut sinks = self.sinks();
        *sinks = Destinations::new(self.params.output_dir.clone(), self.max_open_files);
        self.skipped.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn finish_run(&self) -> Result<()> {
        let mut sinks = self.sinks();
        sinks.finish()?;
        debug!(
            output_dir = %self.params.output_dir.display(),
            rows = sinks.rows_written(),
            "Closed partition destinations"
        );
        Ok(())
    }
}
