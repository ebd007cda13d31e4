//! Pipelines: an ordered chain of configured operations over one source.
//!
//! Building a pipeline instantiates every step through a [`Registry`] and
//! threads the source schema through them, so configuration and schema
//! problems surface with their step index before any row moves. Execution
//! then picks a backend per run:
//!
//! - sources up to `out_of_core_threshold_bytes` run **in memory**;
//! - larger sources run **out of core** when every step has a query form;
//! - otherwise they run **chunked**, with the first stateful step either
//!   merging per-chunk partial state or materialising its input (with a
//!   warning).
//!
//! `partition_by` has no query form: it writes the field text it read, so a
//! large source with a partition step always runs chunked. Its destinations
//! are reopened for every run, which makes one execution at a time the rule
//! for a pipeline holding that step.
//!
//! # Example
//!
//! ```no_run
//! use tabflow::cancel::CancellationToken;
//! use tabflow::pipeline::PipelineBuilder;
//! use tabflow::registry::Registry;
//! use serde_json::json;
//!
//! let registry = Registry::with_builtins();
//! let pipeline = PipelineBuilder::new(&registry, "sales.csv")
//!     .step_json("filter", json!({"predicate": {"binary": {
//!         "op": "gt", "left": {"column": "amount"}, "right": {"literal": 1000}
//!     }}}))
//!     .step_json("group_by", json!({
//!         "by": ["store"],
//!         "aggregations": [{"column": "amount", "function": "sum"}]
//!     }))
//!     .build()?;
//!
//! let totals = pipeline.execute(&CancellationToken::new())?.collect()?;
//! println!("{} stores", totals.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod executor;
mod plan;
mod spec;
mod validation;

pub use executor::{BatchReport, Execution, Output, RowStream, SkippedSource, SourceOutcome};
pub use plan::{Backend, Barrier, ExecutionPlan};
pub use spec::{PipelineSpec, SPEC_VERSION, StepSpec};
pub use validation::propagate;

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::engine::OutOfCoreEngine;
use crate::error::{PipelineError, Result};
use crate::operation::{Operation, Params};
use crate::registry::Registry;
use crate::schema::Schema;
use crate::source::ChunkedSource;
use executor::Run;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Collects steps for a [`Pipeline`].
#[derive(Debug)]
pub struct PipelineBuilder<'r> {
    registry: &'r Registry,
    source: PathBuf,
    config: EngineConfig,
    name: String,
    steps: Vec<StepSpec>,
}

impl<'r> PipelineBuilder<'r> {
    pub fn new(registry: &'r Registry, source: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            source: source.into(),
            config: EngineConfig::default(),
            name: String::new(),
            steps: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn step(mut self, operation: impl Into<String>, params: Params) -> Self {
        self.steps.push(StepSpec::new(operation, params));
        self
    }

    /// Add a step whose parameters are given as a JSON object.
    pub fn step_json(mut self, operation: impl Into<String>, params: serde_json::Value) -> Self {
        self.steps.push(StepSpec::from_json_params(operation, params));
        self
    }

    /// Instantiate and validate every step.
    pub fn build(self) -> Result<Pipeline> {
        Pipeline::assemble(self.registry, self.name, &self.source, &self.steps, self.config)
    }
}

/// A validated step chain bound to one source.
pub struct Pipeline {
    name: String,
    source: ChunkedSource,
    source_schema: Schema,
    steps: Vec<Arc<dyn Operation>>,
    /// Running schema after every step.
    schemas: Vec<Schema>,
    config: EngineConfig,
    engine: OutOfCoreEngine,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("source", &self.source.path())
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Replay a saved spec against its own source.
    pub fn from_spec(registry: &Registry, spec: &PipelineSpec, config: EngineConfig) -> Result<Self> {
        Self::from_spec_with_source(registry, spec, &spec.source, config)
    }

    /// Replay a saved spec against another source. Steps that no longer
    /// validate fail with [`PipelineError::SchemaDrift`].
    pub fn from_spec_with_source(
        registry: &Registry,
        spec: &PipelineSpec,
        source: &Path,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::assemble(registry, spec.name.clone(), source, &spec.steps, config).map_err(|e| {
            let drift = validation::as_drift(e);
            if let PipelineError::SchemaDrift { step, .. } = &drift {
                warn!(spec = %spec.name, source = %source.display(), step, "Saved pipeline drifted");
            }
            drift
        })
    }

    fn assemble(
        registry: &Registry,
        name: String,
        source: &Path,
        specs: &[StepSpec],
        config: EngineConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PipelineError::config(format!("{e:#}")))?;

        let mut steps: Vec<Arc<dyn Operation>> = Vec::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            let op = registry
                .instantiate(&spec.operation, &spec.params)
                .map_err(|e| PipelineError::Configuration {
                    step: Some(idx),
                    message: e.to_string(),
                })?;
            steps.push(Arc::from(op));
        }

        let source = ChunkedSource::open(source)?;
        let source_schema = source.infer_schema(config.schema_sample_rows)?;
        let schemas = propagate(&steps, &source_schema)?;

        let engine = match &config.scratch_dir {
            Some(dir) => OutOfCoreEngine::new().with_scratch_dir(dir),
            None => OutOfCoreEngine::new(),
        };
        info!(
            pipeline = %name,
            source = %source.path().display(),
            steps = steps.len(),
            "Built pipeline"
        );
        Ok(Self {
            name,
            source,
            source_schema,
            steps,
            schemas,
            config,
            engine,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &ChunkedSource {
        &self.source
    }

    pub fn source_schema(&self) -> &Schema {
        &self.source_schema
    }

    pub fn steps(&self) -> &[Arc<dyn Operation>] {
        &self.steps
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Schema of the final step's output.
    pub fn output_schema(&self) -> &Schema {
        self.schemas.last().unwrap_or(&self.source_schema)
    }

    /// Running schema after every step, when the chain is fed `input`.
    pub fn validate_against(&self, input: &Schema) -> Result<Vec<Schema>> {
        propagate(&self.steps, input)
    }

    /// The persisted form of this pipeline.
    pub fn to_spec(&self) -> PipelineSpec {
        PipelineSpec {
            version: SPEC_VERSION.to_owned(),
            name: self.name.clone(),
            source: self.source.path().to_path_buf(),
            steps: self
                .steps
                .iter()
                .map(|op| StepSpec::new(op.name(), op.params()))
                .collect(),
        }
    }

    /// Resolve the backend for a run over the pipeline's own source.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        ExecutionPlan::resolve(
            &self.steps,
            self.source.path(),
            &self.source_schema,
            self.source.byte_size()?,
            &self.config,
        )
    }

    pub fn execute(&self, cancel: &CancellationToken) -> Result<Execution> {
        let plan = self.plan()?;
        self.run(&self.source, &self.source_schema, &self.schemas, cancel)
            .execute(plan)
    }

    /// Run the pipeline over several sources, each validated against its own
    /// schema. Per-source failures are logged and recorded; write failures and
    /// cancellation stop the batch.
    pub fn execute_batch<P: AsRef<Path>>(
        &self,
        sources: impl IntoIterator<Item = P>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for path in sources {
            let path = path.as_ref();
            cancel.check()?;
            match self.execute_source(path, cancel) {
                Ok(outcome) => report.completed.push(outcome),
                Err(e) if e.is_per_source() => {
                    warn!(source = %path.display(), step = ?e.step(), error = %e, "Skipping source");
                    report.skipped.push(SkippedSource {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            completed = report.completed.len(),
            skipped = report.skipped.len(),
            rows = report.rows(),
            "Batch finished"
        );
        Ok(report)
    }

    fn execute_source(&self, path: &Path, cancel: &CancellationToken) -> Result<SourceOutcome> {
        let source = ChunkedSource::open(path)?;
        let schema = source.infer_schema(self.config.schema_sample_rows)?;
        let schemas = propagate(&self.steps, &schema)?;
        let plan = ExecutionPlan::resolve(
            &self.steps,
            source.path(),
            &schema,
            source.byte_size()?,
            &self.config,
        )?;
        let execution = self.run(&source, &schema, &schemas, cancel).execute(plan)?;
        let backend = execution.backend;
        let rows = execution.drain()?;
        Ok(SourceOutcome {
            path: path.to_path_buf(),
            backend,
            rows,
        })
    }

    fn run<'a>(
        &'a self,
        source: &'a ChunkedSource,
        source_schema: &'a Schema,
        schemas: &'a [Schema],
        cancel: &'a CancellationToken,
    ) -> Run<'a> {
        Run {
            source,
            source_schema,
            steps: &self.steps,
            schemas,
            engine: &self.engine,
            chunk_rows: self.config.chunk_rows,
            prefetch: self.config.prefetch,
            cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendPreference;
    use crate::schema::ColumnType;
    use serde_json::json;

    fn sales(dir: &Path) -> PathBuf {
        let path = dir.join("sales.csv");
        std::fs::write(&path, "store,amount,note\nA,100,x\nB,50,\nA,30,y\n").expect("write sales");
        path
    }

    fn builder<'r>(registry: &'r Registry, source: &Path) -> PipelineBuilder<'r> {
        PipelineBuilder::new(registry, source)
            .name("totals")
            .step_json("select_columns", json!({"columns": ["store", "amount"]}))
            .step_json(
                "compute_column",
                json!({"name": "double", "expr": {"binary": {
                    "op": "mul", "left": {"column": "amount"}, "right": {"literal": 2}
                }}}),
            )
            .step_json(
                "group_by",
                json!({"by": ["store"], "aggregations": [
                    {"column": "double", "function": "sum", "alias": "total"}
                ]}),
            )
    }

    #[test]
    fn test_predicted_schema_matches_result() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = Registry::with_builtins();
        let pipeline = builder(&registry, &sales(dir.path())).build()?;

        let predicted = pipeline.output_schema().clone();
        assert_eq!(predicted.names(), vec!["store", "total"]);
        assert_eq!(predicted.type_of("total"), Some(ColumnType::Number));

        let result = pipeline.execute(&CancellationToken::new())?.collect()?;
        assert_eq!(result.schema(), &predicted);
        assert_eq!(result.to_text(), vec![vec!["A", "260"], vec!["B", "100"]]);
        Ok(())
    }

    #[test]
    fn test_build_error_names_the_step() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = Registry::with_builtins();
        let err = PipelineBuilder::new(&registry, sales(dir.path()))
            .step_json("drop_columns", json!({"columns": ["note"]}))
            .step_json("select_columns", json!({"columns": ["note"]}))
            .build()
            .expect_err("note was dropped");
        assert!(matches!(err, PipelineError::Schema { step: 1, .. }));

        let err = PipelineBuilder::new(&registry, sales(dir.path()))
            .step_json("median", json!({}))
            .build()
            .expect_err("unknown operation");
        assert_eq!(err.step(), Some(0));
        Ok(())
    }

    #[test]
    fn test_spec_round_trip_and_drift() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = Registry::with_builtins();
        let pipeline = builder(&registry, &sales(dir.path())).build()?;
        let spec = pipeline.to_spec();

        let replayed = Pipeline::from_spec(&registry, &spec, EngineConfig::default())?;
        assert_eq!(replayed.output_schema(), pipeline.output_schema());

        let other = dir.path().join("other.csv");
        std::fs::write(&other, "shop,amount\nA,1\n")?;
        let err = Pipeline::from_spec_with_source(&registry, &spec, &other, EngineConfig::default())
            .expect_err("store column is gone");
        assert!(matches!(err, PipelineError::SchemaDrift { step: 0, .. }));
        Ok(())
    }

    #[test]
    fn test_chunked_matches_in_memory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = Registry::with_builtins();
        let source = sales(dir.path());
        let token = CancellationToken::new();

        let in_memory = builder(&registry, &source).build()?.execute(&token)?;
        assert_eq!(in_memory.backend, Backend::InMemory);

        let config = EngineConfig {
            backend: BackendPreference::Chunked,
            chunk_rows: 1,
            ..EngineConfig::default()
        };
        let chunked = builder(&registry, &source).config(config).build()?.execute(&token)?;
        assert_eq!(chunked.backend, Backend::Chunked);
        assert_eq!(chunked.collect()?, in_memory.collect()?);
        Ok(())
    }

    #[test]
    fn test_cancelled_before_start() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = Registry::with_builtins();
        let pipeline = builder(&registry, &sales(dir.path())).build()?;
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            pipeline.execute(&token),
            Err(PipelineError::Cancelled)
        ));
        Ok(())
    }
}
