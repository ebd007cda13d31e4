//! Backend selection.

use crate::config::{BackendPreference, EngineConfig};
use crate::engine::Query;
use crate::error::{PipelineError, Result};
use crate::operation::{Chunking, Operation};
use crate::schema::Schema;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Whole source loaded, every step run once.
    InMemory,
    /// Source read chunk by chunk.
    Chunked,
    /// Steps translated into one query for the out-of-core engine.
    OutOfCore,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InMemory => "in-memory",
            Self::Chunked => "chunked",
            Self::OutOfCore => "out-of-core",
        })
    }
}

/// First step that cannot be applied chunk by chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub step: usize,
    pub chunking: Chunking,
}

/// Resolved backend for one run. Derived fresh for every execution.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub backend: Backend,
    pub source_bytes: u64,
    /// The out-of-core query, covering every step.
    pub query: Option<Query>,
    pub barrier: Option<Barrier>,
    pub warnings: Vec<String>,
}

impl ExecutionPlan {
    /// Pick the backend for `steps` over a source of `source_bytes` bytes.
    pub(crate) fn resolve(
        steps: &[Arc<dyn Operation>],
        source: &Path,
        source_schema: &Schema,
        source_bytes: u64,
        config: &EngineConfig,
    ) -> Result<Self> {
        let unsupported = steps
            .iter()
            .position(|s| !s.capabilities().out_of_core);
        let oversized = source_bytes > config.out_of_core_threshold_bytes;

        let backend = match config.backend {
            BackendPreference::Auto if !oversized => Backend::InMemory,
            BackendPreference::Auto if unsupported.is_none() => Backend::OutOfCore,
            BackendPreference::Auto | BackendPreference::Chunked => Backend::Chunked,
            BackendPreference::InMemory => Backend::InMemory,
            BackendPreference::OutOfCore => {
                if let Some(idx) = unsupported {
                    return Err(PipelineError::Configuration {
                        step: Some(idx),
                        message: format!(
                            "{} has no out-of-core form; choose another backend",
                            steps[idx].name()
                        ),
                    });
                }
                Backend::OutOfCore
            }
        };

        let mut plan = Self {
            backend,
            source_bytes,
            query: None,
            barrier: barrier(steps),
            warnings: Vec::new(),
        };
        match backend {
            Backend::OutOfCore => {
                plan.query = Some(build_query(steps, source, source_schema)?);
            }
            Backend::Chunked => plan.note_materialisation(steps),
            Backend::InMemory if oversized => plan.warnings.push(format!(
                "source is {source_bytes} bytes and the in-memory backend loads it whole"
            )),
            Backend::InMemory => {}
        }
        Ok(plan)
    }

    /// Plan for the chunked path, used after an out-of-core failure.
    pub(crate) fn chunked(&self, steps: &[Arc<dyn Operation>]) -> Self {
        let mut plan = Self {
            backend: Backend::Chunked,
            source_bytes: self.source_bytes,
            query: None,
            barrier: self.barrier,
            warnings: self.warnings.clone(),
        };
        plan.note_materialisation(steps);
        plan
    }

    fn note_materialisation(&mut self, steps: &[Arc<dyn Operation>]) {
        if let Some(Barrier {
            step,
            chunking: Chunking::Materialize,
        }) = self.barrier
        {
            self.warnings.push(format!(
                "step {} ({}) needs every row in memory at once",
                step + 1,
                steps[step].name()
            ));
        }
    }
}

fn barrier(steps: &[Arc<dyn Operation>]) -> Option<Barrier> {
    steps.iter().enumerate().find_map(|(step, op)| {
        let chunking = op.capabilities().chunking;
        (chunking != Chunking::RowWise).then_some(Barrier { step, chunking })
    })
}

fn build_query(steps: &[Arc<dyn Operation>], source: &Path, schema: &Schema) -> Result<Query> {
    let mut query = Query::new(source, schema.clone());
    for (idx, step) in steps.iter().enumerate() {
        let input = query.output_schema.clone();
        let fragment = step.query_fragment(&input).ok_or_else(|| PipelineError::Configuration {
            step: Some(idx),
            message: format!("{} produced no query fragment", step.name()),
        })?;
        let output = step.output_schema(&input)?;
        query.push(fragment, output);
    }
    Ok(query)
}
