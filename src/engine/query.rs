use crate::expr::Expr;
use crate::operation::aggregate::AggFunction;
use crate::schema::{ColumnType, Schema};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Join flavour supported by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

/// One resolved aggregation: `function(column) AS alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub column: String,
    pub function: AggFunction,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CastColumn {
    pub name: String,
    pub from: ColumnType,
    pub to: ColumnType,
}

/// A single relational step, expressed as data.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFragment {
    /// Keep rows whose predicate is true.
    Filter(Expr),
    /// Keep exactly these columns, in this order.
    Select(Vec<String>),
    /// `(old, new)` for every input column, in output order.
    Rename(Vec<(String, String)>),
    /// Add or replace one column.
    WithColumn { name: String, expr: Expr },
    Cast(Vec<CastColumn>),
    /// Group by `by` (first-occurrence order); empty `by` is a global aggregate.
    Aggregate {
        by: Vec<String>,
        aggregations: Vec<Aggregation>,
    },
    /// Stable sort, nulls last.
    Sort { by: Vec<String>, descending: Vec<bool> },
    Join {
        right: PathBuf,
        right_schema: Schema,
        left_on: Vec<String>,
        right_on: Vec<String>,
        how: JoinKind,
        /// Output column names, in order.
        columns: Vec<String>,
    },
    /// Concatenate further files with the same columns.
    Append { sources: Vec<PathBuf>, schema: Schema },
}

impl QueryFragment {
    /// Short name used in log events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filter(_) => "filter",
            Self::Select(_) => "select",
            Self::Rename(_) => "rename",
            Self::WithColumn { .. } => "with_column",
            Self::Cast(_) => "cast",
            Self::Aggregate { .. } => "aggregate",
            Self::Sort { .. } => "sort",
            Self::Join { .. } => "join",
            Self::Append { .. } => "append",
        }
    }
}

/// A declarative query against one file.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub source: PathBuf,
    pub source_schema: Schema,
    pub fragments: Vec<QueryFragment>,
    /// Predicted schema of the result.
    pub output_schema: Schema,
}

impl Query {
    pub fn new(source: impl Into<PathBuf>, source_schema: Schema) -> Self {
        Self {
            source: source.into(),
            output_schema: source_schema.clone(),
            source_schema,
            fragments: Vec::new(),
        }
    }

    /// Append a fragment whose result has `output_schema`.
    pub fn push(&mut self, fragment: QueryFragment, output_schema: Schema) {
        self.fragments.push(fragment);
        self.output_schema = output_schema;
    }
}
