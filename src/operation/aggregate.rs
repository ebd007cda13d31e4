//! Grouped aggregation and the accumulators it shares with pivoting.

use super::{
    Capabilities, Category, Chunking, ExecContext, Operation, Params, PartialState, Validation,
    parse_params, run_partial, to_params,
};
use crate::engine::{Aggregation, QueryFragment};
use crate::error::{PipelineError, Result};
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::{Column, ColumnType, Schema};
use crate::table::{Row, Table, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Supported aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunction {
    Sum,
    Mean,
    Min,
    Max,
    Count,
    First,
}

impl AggFunction {
    pub const NAMES: [&'static str; 6] = ["sum", "mean", "min", "max", "count", "first"];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(Self::Sum),
            "mean" => Some(Self::Mean),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "count" => Some(Self::Count),
            "first" => Some(Self::First),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::First => "first",
        }
    }

    /// Whether the input column must be numeric.
    pub fn needs_number(self) -> bool {
        matches!(self, Self::Sum | Self::Mean)
    }

    /// Result type for an input column of type `input`.
    pub fn output_type(self, input: ColumnType) -> ColumnType {
        match self {
            Self::Sum | Self::Mean | Self::Count => ColumnType::Number,
            Self::Min | Self::Max | Self::First => input,
        }
    }
}

impl fmt::Display for AggFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running state of one aggregate over one group.
#[derive(Debug, Clone)]
pub(crate) enum Accumulator {
    Sum(f64),
    Mean { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Count(u64),
    First(Option<Value>),
}

impl Accumulator {
    pub(crate) fn new(function: AggFunction) -> Self {
        match function {
            AggFunction::Sum => Self::Sum(0.0),
            AggFunction::Mean => Self::Mean { sum: 0.0, count: 0 },
            AggFunction::Min => Self::Min(None),
            AggFunction::Max => Self::Max(None),
            AggFunction::Count => Self::Count(0),
            AggFunction::First => Self::First(None),
        }
    }

    pub(crate) fn update(&mut self, value: &Value) {
        match self {
            Self::Sum(total) => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                }
            }
            Self::Mean { sum, count } => {
                if let Some(n) = value.as_f64() {
                    *sum += n;
                    *count += 1;
                }
            }
            Self::Min(current) => keep_extreme(current, value, Ordering::Less),
            Self::Max(current) => keep_extreme(current, value, Ordering::Greater),
            Self::Count(count) => {
                if !value.is_null() {
                    *count += 1;
                }
            }
            Self::First(first) => {
                if first.is_none() {
                    *first = Some(value.clone());
                }
            }
        }
    }

    pub(crate) fn finish(self) -> Value {
        match self {
            Self::Sum(total) => Value::Number(total),
            Self::Mean { count: 0, .. } => Value::Null,
            Self::Mean { sum, count } => Value::Number(sum / count as f64),
            Self::Count(count) => Value::Number(count as f64),
            Self::Min(v) | Self::Max(v) | Self::First(v) => v.unwrap_or(Value::Null),
        }
    }
}

fn keep_extreme(current: &mut Option<Value>, value: &Value, wanted: Ordering) {
    if value.is_null() {
        return;
    }
    let replace = match current {
        None => true,
        Some(existing) => value.compare(existing) == Some(wanted),
    };
    if replace {
        *current = Some(value.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationParams {
    pub column: String,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl AggregationParams {
    pub fn new(column: impl Into<String>, function: AggFunction) -> Self {
        Self {
            column: column.into(),
            function: function.as_str().to_owned(),
            alias: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Output column name: the alias, or `<column>_<function>`.
    pub fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.column, self.function))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByParams {
    #[serde(default)]
    pub by: Vec<String>,
    pub aggregations: Vec<AggregationParams>,
}

/// `group_by`: one output row per distinct key, in first-occurrence order.
#[derive(Debug, Clone)]
pub struct GroupBy {
    params: GroupByParams,
}

impl GroupBy {
    pub const NAME: &'static str = "group_by";

    pub fn new(by: Vec<String>, aggregations: Vec<AggregationParams>) -> Self {
        Self {
            params: GroupByParams { by, aggregations },
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            params: parse_params(Self::NAME, params)?,
        })
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Group and aggregate", Category::Aggregate)
            .param(
                "by",
                ParamSpec::with_default(
                    ParamKind::StringList,
                    serde_json::json!([]),
                    "Grouping columns; empty aggregates the whole table",
                ),
            )
            .param(
                "aggregations",
                ParamSpec::required(
                    ParamKind::ObjectList,
                    "List of {column, function, alias?}",
                ),
            )
    }

    fn resolved(&self) -> Vec<Aggregation> {
        self.params
            .aggregations
            .iter()
            .filter_map(|a| {
                AggFunction::parse(&a.function).map(|function| Aggregation {
                    column: a.column.clone(),
                    function,
                    alias: a.output_name(),
                })
            })
            .collect()
    }
}

impl Operation for GroupBy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::Aggregate
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            out_of_core: true,
            chunking: Chunking::TwoPhase,
        }
    }

    fn params(&self) -> Params {
        to_params(&self.params)
    }

    fn describe(&self) -> String {
        let aggs: Vec<String> = self
            .params
            .aggregations
            .iter()
            .map(|a| format!("{}({})", a.function, a.column))
            .collect();
        if self.params.by.is_empty() {
            format!("Aggregate {}", aggs.join(", "))
        } else {
            format!("Group by {} computing {}", self.params.by.join(", "), aggs.join(", "))
        }
    }

    fn check_params(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.params.aggregations.is_empty() {
            problems.push("at least one aggregation is required".to_owned());
        }
        for agg in &self.params.aggregations {
            if AggFunction::parse(&agg.function).is_none() {
                problems.push(format!(
                    "unknown aggregation function '{}' (expected one of {})",
                    agg.function,
                    AggFunction::NAMES.join(", ")
                ));
            }
        }
        let mut names: Vec<String> = self.params.by.clone();
        for agg in &self.params.aggregations {
            let name = agg.output_name();
            if names.contains(&name) {
                problems.push(format!("duplicate output column '{name}'"));
            }
            names.push(name);
        }
        problems
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        v.require_columns(input, &self.params.by, "group by");
        for agg in &self.params.aggregations {
            let Some(kind) = input.type_of(&agg.column) else {
                v.schema_error(format!("cannot aggregate non-existent column '{}'", agg.column));
                continue;
            };
            if let Some(function) = AggFunction::parse(&agg.function)
                && function.needs_number()
                && kind != ColumnType::Number
            {
                v.schema_error(format!(
                    "'{function}' needs a number column, but '{}' is {kind}",
                    agg.column
                ));
            }
        }
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let mut columns = Vec::new();
        for name in &self.params.by {
            let column = input
                .get(name)
                .ok_or_else(|| PipelineError::Other(format!("column '{name}' not found")))?;
            columns.push(column.clone());
        }
        for agg in self.resolved() {
            let kind = input
                .type_of(&agg.column)
                .ok_or_else(|| PipelineError::Other(format!("column '{}' not found", agg.column)))?;
            columns.push(Column::new(agg.alias, agg.function.output_type(kind)));
        }
        Schema::new(columns).map_err(PipelineError::Other)
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let state = self
            .partial(input.schema())
            .ok_or_else(|| PipelineError::Other("group_by state unavailable".to_owned()))?;
        run_partial(state, &input)
    }

    fn partial(&self, input: &Schema) -> Option<Box<dyn PartialState>> {
        let output = self.output_schema(input).ok()?;
        let keys = self
            .params
            .by
            .iter()
            .map(|name| input.index_of(name))
            .collect::<Option<Vec<_>>>()?;
        let aggregates = self
            .resolved()
            .into_iter()
            .map(|agg| input.index_of(&agg.column).map(|idx| (idx, agg.function)))
            .collect::<Option<Vec<_>>>()?;
        Some(Box::new(GroupState {
            keys,
            aggregates,
            output,
            groups: IndexMap::new(),
        }))
    }

    fn query_fragment(&self, _input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::Aggregate {
            by: self.params.by.clone(),
            aggregations: self.resolved(),
        })
    }
}

/// Two-phase state: accumulators per group, carried across chunks. Rows are
/// folded in arrival order, so the result does not depend on chunk size.
struct GroupState {
    keys: Vec<usize>,
    aggregates: Vec<(usize, AggFunction)>,
    output: Schema,
    groups: IndexMap<Vec<Value>, Vec<Accumulator>>,
}

impl GroupState {
    fn fresh(&self) -> Vec<Accumulator> {
        self.aggregates
            .iter()
            .map(|(_, f)| Accumulator::new(*f))
            .collect()
    }
}

impl PartialState for GroupState {
    fn update(&mut self, chunk: &Table) -> Result<()> {
        for row in chunk.rows() {
            let key: Vec<Value> = self.keys.iter().map(|&idx| row[idx].clone()).collect();
            if !self.groups.contains_key(&key) {
                let fresh = self.fresh();
                self.groups.insert(key.clone(), fresh);
            }
            if let Some(accumulators) = self.groups.get_mut(&key) {
                for (acc, (idx, _)) in accumulators.iter_mut().zip(&self.aggregates) {
                    acc.update(&row[*idx]);
                }
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Table> {
        let mut state = *self;
        if state.keys.is_empty() && state.groups.is_empty() {
            let fresh = state.fresh();
            state.groups.insert(Vec::new(), fresh);
        }
        let rows: Vec<Row> = state
            .groups
            .into_iter()
            .map(|(mut key, accumulators)| {
                key.extend(accumulators.into_iter().map(Accumulator::finish));
                key
            })
            .collect();
        Table::new(state.output, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::operation::testing::{ctx, sales};

    fn sum_by_store() -> GroupBy {
        GroupBy::new(
            vec!["store".to_owned()],
            vec![
                AggregationParams::new("amount", AggFunction::Sum).alias("total"),
                AggregationParams::new("amount", AggFunction::Count),
            ],
        )
    }

    #[test]
    fn test_groups_in_first_occurrence_order() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let op = sum_by_store();
        let out = op.execute(sales(), &ctx(&token))?;

        assert_eq!(out.schema().names(), vec!["store", "total", "amount_count"]);
        assert_eq!(out.to_text(), vec![vec!["1", "130", "2"], vec!["2", "50", "1"]]);
        assert_eq!(&op.output_schema(sales().schema())?, out.schema());
        Ok(())
    }

    #[test]
    fn test_two_phase_matches_single_pass() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let op = sum_by_store();
        let table = sales();
        let expected = op.execute(table.clone(), &ctx(&token))?;

        let mut state = op.partial(table.schema()).expect("two-phase state");
        for row in table.rows() {
            state.update(&Table::new(table.schema().clone(), vec![row.clone()])?)?;
        }
        assert_eq!(state.finish()?, expected);
        Ok(())
    }

    #[test]
    fn test_global_aggregate_on_empty_input() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let op = GroupBy::new(
            Vec::new(),
            vec![
                AggregationParams::new("amount", AggFunction::Sum),
                AggregationParams::new("amount", AggFunction::Mean),
            ],
        );
        let empty = Table::empty(sales().schema().clone());
        let out = op.execute(empty, &ctx(&token))?;
        assert_eq!(out.to_text(), vec![vec!["0", ""]]);
        Ok(())
    }

    #[test]
    fn test_unknown_function_is_configuration_problem() {
        let op = GroupBy::new(
            vec!["store".to_owned()],
            vec![AggregationParams {
                column: "amount".to_owned(),
                function: "median".to_owned(),
                alias: None,
            }],
        );
        assert_eq!(op.check_params().len(), 1);
        let v = op.validate(sales().schema());
        assert!(matches!(
            v.into_error(0),
            Some(PipelineError::Configuration { .. })
        ));
    }

    #[test]
    fn test_sum_needs_number_column() {
        let op = GroupBy::new(
            Vec::new(),
            vec![AggregationParams::new("store", AggFunction::Sum)],
        );
        assert!(!op.validate(sales().schema()).is_valid());
    }

    #[test]
    fn test_accumulators_ignore_nulls() {
        let mut min = Accumulator::new(AggFunction::Min);
        let mut first = Accumulator::new(AggFunction::First);
        for v in [Value::Null, Value::Number(3.0), Value::Number(1.0)] {
            min.update(&v);
            first.update(&v);
        }
        assert_eq!(min.finish(), Value::Number(1.0));
        assert_eq!(first.finish(), Value::Null);
    }
}
