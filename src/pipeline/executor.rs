//! Pipeline execution engine.
//!
//! Runs a validated step chain on one of three paths:
//!
//! - **in-memory**: read the source whole, run every step once;
//! - **chunked**: stream the row-wise prefix chunk by chunk, fold the first
//!   two-phase step's partial state, or collect everything for the first
//!   materialising step, then run the remaining steps once;
//! - **out-of-core**: hand the translated query to the engine and stream its
//!   result.
//!
//! Every step is told when a run starts and when it ends, including when the
//! run fails or its stream is dropped early.

use super::plan::{Backend, Barrier, ExecutionPlan};
use crate::cancel::CancellationToken;
use crate::engine::OutOfCoreEngine;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::operation::{Chunking, ExecContext, Operation};
use crate::schema::Schema;
use crate::source::{ChunkStream, ChunkedSource, prefetch};
use crate::table::Table;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lazy, single-pass sequence of output chunks. Each chunk is pulled from the
/// source and pushed through the remaining steps on demand.
pub struct RowStream {
    schema: Schema,
    chunks: ChunkStream,
    steps: Vec<Arc<dyn Operation>>,
    /// Steps whose run ends with this stream.
    owned: Vec<Arc<dyn Operation>>,
    origin: String,
    cancel: CancellationToken,
    done: bool,
}

impl RowStream {
    fn new(
        schema: Schema,
        chunks: ChunkStream,
        steps: Vec<Arc<dyn Operation>>,
        origin: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            schema,
            chunks,
            owned: steps.clone(),
            steps,
            origin,
            cancel,
            done: false,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn owning(mut self, steps: &[Arc<dyn Operation>]) -> Self {
        self.owned = steps.to_vec();
        self
    }

    /// End the run for this stream's steps. Idempotent.
    fn close(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        finish_steps(&self.owned)
    }

    fn advance(&mut self) -> Result<Option<Table>> {
        self.cancel.check()?;
        let Some(chunk) = self.chunks.next() else {
            return Ok(None);
        };
        let ctx = ExecContext {
            origin: &self.origin,
            cancel: &self.cancel,
        };
        let mut table = chunk?;
        let rows_in = table.len();
        for step in &self.steps {
            table = step.execute(table, &ctx)?;
        }
        debug!(rows_in, rows_out = table.len(), "Processed chunk");
        Ok(Some(table))
    }
}

impl Iterator for RowStream {
    type Item = Result<Table>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(table)) => Some(Ok(table)),
            Ok(None) => self.close().err().map(Err),
            Err(e) => {
                if let Err(close) = self.close() {
                    warn!(error = %close, "Failed to finish steps after an error");
                }
                Some(Err(e))
            }
        }
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(origin = %self.origin, error = %e, "Failed to finish steps of an abandoned stream");
        }
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("schema", &self.schema)
            .field("steps", &self.steps.len())
            .field("origin", &self.origin)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Output {
    Table(Table),
    Stream(RowStream),
}

/// Result of one pipeline run.
#[derive(Debug)]
pub struct Execution {
    pub schema: Schema,
    pub backend: Backend,
    pub warnings: Vec<String>,
    pub output: Output,
}

impl Execution {
    /// Materialise the output.
    pub fn collect(self) -> Result<Table> {
        match self.output {
            Output::Table(table) => Ok(table),
            Output::Stream(stream) => Table::concat(self.schema, stream),
        }
    }

    /// Run the output to completion without keeping it. Returns the row count.
    pub fn drain(self) -> Result<usize> {
        match self.output {
            Output::Table(table) => Ok(table.len()),
            Output::Stream(stream) => {
                let mut rows = 0;
                for chunk in stream {
                    rows += chunk?.len();
                }
                Ok(rows)
            }
        }
    }
}

/// One source processed by a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub path: PathBuf,
    pub backend: Backend,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSource {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of a multi-file run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub completed: Vec<SourceOutcome>,
    pub skipped: Vec<SkippedSource>,
}

impl BatchReport {
    pub fn rows(&self) -> usize {
        self.completed.iter().map(|o| o.rows).sum()
    }
}

/// Everything one run needs, borrowed from the pipeline.
pub(crate) struct Run<'a> {
    pub source: &'a ChunkedSource,
    pub source_schema: &'a Schema,
    pub steps: &'a [Arc<dyn Operation>],
    pub schemas: &'a [Schema],
    pub engine: &'a OutOfCoreEngine,
    pub chunk_rows: usize,
    pub prefetch: bool,
    pub cancel: &'a CancellationToken,
}

impl Run<'_> {
    fn output_schema(&self) -> Schema {
        self.schemas
            .last()
            .cloned()
            .unwrap_or_else(|| self.source_schema.clone())
    }

    /// Input schema of step `idx`.
    fn input_of(&self, idx: usize) -> &Schema {
        match idx {
            0 => self.source_schema,
            _ => &self.schemas[idx - 1],
        }
    }

    fn origin(&self) -> String {
        self.source.file_name()
    }

    pub(crate) fn execute(&self, plan: ExecutionPlan) -> Result<Execution> {
        self.cancel.check()?;
        info!(
            source = %self.source.path().display(),
            backend = %plan.backend,
            bytes = plan.source_bytes,
            steps = self.steps.len(),
            "Executing pipeline"
        );
        for warning in &plan.warnings {
            warn!(source = %self.source.path().display(), "{warning}");
        }

        for (idx, step) in self.steps.iter().enumerate() {
            if let Err(e) = step.start_run() {
                self.abandon(&self.steps[..idx]);
                return Err(e);
            }
        }
        match self.dispatch(plan) {
            Ok(execution) => {
                // Streams finish their own steps once drained or dropped.
                if matches!(execution.output, Output::Table(_)) {
                    finish_steps(self.steps)?;
                }
                Ok(execution)
            }
            Err(e) => {
                self.abandon(self.steps);
                Err(e)
            }
        }
    }

    fn abandon(&self, steps: &[Arc<dyn Operation>]) {
        if let Err(e) = finish_steps(steps) {
            warn!(source = %self.source.path().display(), error = %e, "Failed to finish steps after an error");
        }
    }

    /// Whether any step writes the source's field text.
    fn keep_text(&self) -> bool {
        self.steps.iter().any(|s| s.needs_source_text())
    }

    fn dispatch(&self, plan: ExecutionPlan) -> Result<Execution> {
        match plan.backend {
            Backend::InMemory => self.in_memory(plan),
            Backend::Chunked => self.chunked(plan),
            Backend::OutOfCore => match self.out_of_core(&plan) {
                Err(e) if e.kind() == ErrorKind::Backend => {
                    let message = format!("out-of-core engine failed, rerunning chunked: {e}");
                    warn!(source = %self.source.path().display(), error = %e, "Falling back to chunked execution");
                    let mut fallback = plan.chunked(self.steps);
                    fallback.warnings.push(message);
                    self.chunked(fallback)
                }
                other => other,
            },
        }
    }

    fn in_memory(&self, plan: ExecutionPlan) -> Result<Execution> {
        let table = self
            .source
            .read_all_with_text(self.source_schema, self.keep_text())?;
        let table = self.run_steps(table, 0)?;
        Ok(Execution {
            schema: self.output_schema(),
            backend: Backend::InMemory,
            warnings: plan.warnings,
            output: Output::Table(table),
        })
    }

    fn out_of_core(&self, plan: &ExecutionPlan) -> Result<Execution> {
        let query = plan
            .query
            .as_ref()
            .ok_or_else(|| PipelineError::Other("out-of-core plan without a query".to_owned()))?;
        let chunks = self.engine.run(query, self.chunk_rows)?;
        Ok(Execution {
            schema: self.output_schema(),
            backend: Backend::OutOfCore,
            warnings: plan.warnings.clone(),
            output: Output::Stream(RowStream::new(
                query.output_schema.clone(),
                Box::new(chunks),
                Vec::new(),
                self.origin(),
                self.cancel.clone(),
            )
            .owning(self.steps)),
        })
    }

    fn chunked(&self, plan: ExecutionPlan) -> Result<Execution> {
        let chunks = self
            .source
            .iter_chunks(self.source_schema.clone(), self.chunk_rows)?
            .with_text(self.keep_text());
        let chunks: ChunkStream = if self.prefetch {
            prefetch(chunks, 2)
        } else {
            Box::new(chunks)
        };

        let prefix_len = plan.barrier.map_or(self.steps.len(), |b| b.step);
        let stream = RowStream::new(
            match prefix_len {
                0 => self.source_schema.clone(),
                n => self.schemas[n - 1].clone(),
            },
            chunks,
            self.steps[..prefix_len].to_vec(),
            self.origin(),
            self.cancel.clone(),
        );

        let Some(Barrier { step, chunking }) = plan.barrier else {
            return Ok(Execution {
                schema: self.output_schema(),
                backend: Backend::Chunked,
                warnings: plan.warnings,
                output: Output::Stream(stream),
            });
        };

        let op = &self.steps[step];
        let merged = match chunking {
            Chunking::TwoPhase => {
                let mut state = op.partial(self.input_of(step)).ok_or_else(|| {
                    PipelineError::Other(format!("{} has no partial state", op.name()))
                })?;
                let mut chunks = 0_usize;
                for chunk in stream {
                    state.update(&chunk?)?;
                    chunks += 1;
                }
                debug!(step, operation = op.name(), chunks, "Merging partial state");
                self.cancel.check()?;
                state.finish()?
            }
            Chunking::Materialize | Chunking::RowWise => {
                let table = Table::concat(self.input_of(step).clone(), stream)?;
                self.cancel.check()?;
                op.execute(table, &self.context(&self.origin()))?
            }
        };
        let table = self.run_steps(merged, step + 1)?;
        Ok(Execution {
            schema: self.output_schema(),
            backend: Backend::Chunked,
            warnings: plan.warnings,
            output: Output::Table(table),
        })
    }

    fn context<'c>(&'c self, origin: &'c str) -> ExecContext<'c> {
        ExecContext {
            origin,
            cancel: self.cancel,
        }
    }

    /// Run steps `from..` once over a whole table.
    fn run_steps(&self, mut table: Table, from: usize) -> Result<Table> {
        let origin = self.origin();
        let ctx = self.context(&origin);
        for (idx, step) in self.steps.iter().enumerate().skip(from) {
            self.cancel.check()?;
            table = step.execute(table, &ctx)?;
            debug!(step = idx, operation = step.name(), rows = table.len(), "Applied step");
        }
        Ok(table)
    }
}

/// Finish every step, reporting the first failure after trying them all.
fn finish_steps(steps: &[Arc<dyn Operation>]) -> Result<()> {
    let mut first = None;
    for step in steps {
        if let Err(e) = step.finish_run() {
            warn!(operation = step.name(), error = %e, "Failed to finish step");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}
