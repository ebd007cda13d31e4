//! The uniform transformation-step abstraction.
//!
//! Every step is an [`Operation`]: it validates itself against an input
//! schema, predicts its output schema without touching data, and has an
//! in-memory form ([`Operation::execute`]) plus, where it can be expressed
//! declaratively, an out-of-core form ([`Operation::query_fragment`]). The two
//! forms must produce the same rows in the same column order.
//!
//! [`Capabilities`] tell the pipeline which forms exist and how the in-memory
//! form behaves when the input arrives in chunks, so backend selection stays a
//! mechanical check instead of a per-operation special case.

pub mod aggregate;
pub mod append;
pub mod cast;
pub mod columns;
pub mod compute;
pub mod filter;
pub mod join;
pub mod lookup;
pub mod partition;
pub mod pivot;
pub mod sort;

use crate::cancel::CancellationToken;
use crate::engine::QueryFragment;
use crate::error::{PipelineError, Result};
use crate::schema::Schema;
use crate::table::Table;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bound parameter values, as persisted in a pipeline spec.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Coarse grouping shown in configuration UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Source,
    Transform,
    Aggregate,
    Partition,
}

/// How the in-memory form composes over chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunking {
    /// Applying the step per chunk and concatenating equals one whole-table pass.
    RowWise,
    /// Partial state per chunk, merged at the end ([`Operation::partial`]).
    TwoPhase,
    /// Needs every input row at once.
    Materialize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Has a [`QueryFragment`] form for the out-of-core engine.
    pub out_of_core: bool,
    pub chunking: Chunking,
}

impl Capabilities {
    pub const fn streaming(out_of_core: bool) -> Self {
        Self {
            out_of_core,
            chunking: Chunking::RowWise,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    /// Missing or incompatible columns.
    Schema,
    /// Parameter values out of their domain.
    Configuration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
}

/// Outcome of [`Operation::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    pub errors: Vec<Issue>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|i| i.message.clone()).collect()
    }

    pub fn schema_error(&mut self, message: impl Into<String>) {
        self.errors.push(Issue {
            kind: IssueKind::Schema,
            message: message.into(),
        });
    }

    pub fn config_error(&mut self, message: impl Into<String>) {
        self.errors.push(Issue {
            kind: IssueKind::Configuration,
            message: message.into(),
        });
    }

    /// Record a schema error for every name in `columns` absent from `schema`.
    pub fn require_columns<'a>(
        &mut self,
        schema: &Schema,
        columns: impl IntoIterator<Item = &'a String>,
        what: &str,
    ) {
        for missing in schema.missing(columns) {
            self.schema_error(format!("cannot {what} non-existent column '{missing}'"));
        }
    }

    /// Convert into the pipeline error for step `step`: configuration problems
    /// take precedence, since they would fail on any input.
    pub fn into_error(self, step: usize) -> Option<PipelineError> {
        if self.is_valid() {
            return None;
        }
        let message = self.messages().join("; ");
        if self
            .errors
            .iter()
            .any(|i| i.kind == IssueKind::Configuration)
        {
            Some(PipelineError::Configuration {
                step: Some(step),
                message,
            })
        } else {
            Some(PipelineError::Schema { step, message })
        }
    }
}

/// Per-run context handed to the in-memory form.
#[derive(Debug, Clone, Copy)]
pub struct ExecContext<'a> {
    /// File name of the source the rows came from.
    pub origin: &'a str,
    pub cancel: &'a CancellationToken,
}

/// Accumulator for the two-phase chunked form of a stateful step.
pub trait PartialState: Send {
    /// Fold one chunk into the state.
    fn update(&mut self, chunk: &Table) -> Result<()>;

    /// Merge everything seen so far into the step's output.
    fn finish(self: Box<Self>) -> Result<Table>;
}

/// One schema-aware transformation step.
pub trait Operation: Send + Sync + fmt::Debug {
    /// Registered name.
    fn name(&self) -> &'static str;

    fn category(&self) -> Category;

    fn capabilities(&self) -> Capabilities;

    /// Bound parameters, round-trippable through the registry.
    fn params(&self) -> Params;

    /// Human-readable summary of the configured step.
    fn describe(&self) -> String;

    /// Schema-independent parameter checks (value domains).
    fn check_params(&self) -> Vec<String> {
        Vec::new()
    }

    /// Check the step against its input schema. Never reads data.
    fn validate(&self, input: &Schema) -> Validation;

    /// Predicted output schema. Pure function of `input` and the parameters;
    /// only meaningful once [`Operation::validate`] passed.
    fn output_schema(&self, input: &Schema) -> Result<Schema>;

    /// In-memory form.
    fn execute(&self, input: Table, ctx: &ExecContext<'_>) -> Result<Table>;

    /// Two-phase state, for steps whose chunking is [`Chunking::TwoPhase`].
    fn partial(&self, _input: &Schema) -> Option<Box<dyn PartialState>> {
        None
    }

    /// Out-of-core form, for steps with `out_of_core` capability.
    fn query_fragment(&self, _input: &Schema) -> Option<QueryFragment> {
        None
    }

    /// Whether the step wants rows to carry the field text they were read
    /// from (see [`Table::text`]).
    fn needs_source_text(&self) -> bool {
        false
    }

    /// Called once before a run reads its first row.
    fn start_run(&self) -> Result<()> {
        Ok(())
    }

    /// Called once after a run's last row, and when a run fails.
    fn finish_run(&self) -> Result<()> {
        Ok(())
    }
}

/// Deserialize typed parameters, reporting failures as parameter errors.
pub fn parse_params<T: DeserializeOwned>(operation: &str, params: &Params) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(params.clone())).map_err(|e| {
        PipelineError::Parameter {
            operation: operation.to_owned(),
            message: e.to_string(),
        }
    })
}

/// Serialize typed parameters back into the persisted map.
pub fn to_params<T: Serialize>(params: &T) -> Params {
    match serde_json::to_value(params) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => Params::new(),
    }
}

/// Shared helper for in-memory execution through a two-phase state.
pub(crate) fn run_partial(state: Box<dyn PartialState>, input: &Table) -> Result<Table> {
    let mut state = state;
    state.update(input)?;
    state.finish()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::schema::ColumnType;

    pub fn ctx(token: &CancellationToken) -> ExecContext<'_> {
        ExecContext {
            origin: "test.csv",
            cancel: token,
        }
    }

    /// `store,amount` table with the rows `(1,100),(2,50),(1,30)`.
    pub fn sales() -> Table {
        let schema = Schema::from_pairs([
            ("store", ColumnType::String),
            ("amount", ColumnType::Number),
        ])
        .expect("valid schema");
        Table::from_text(
            schema,
            &[vec!["1", "100"], vec!["2", "50"], vec!["1", "30"]],
        )
        .expect("valid table")
    }
}
