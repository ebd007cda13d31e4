use super::aggregate::{Accumulator, AggFunction};
use super::{
    Capabilities, Category, Chunking, ExecContext, Operation, Params, PartialState, Validation,
    parse_params, run_partial, to_params,
};
use crate::error::{PipelineError, Result};
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::{Column, ColumnType, Schema};
use crate::table::{Row, Table, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

fn default_function() -> String {
    "sum".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotParams {
    #[serde(default)]
    pub index: Vec<String>,
    /// Column whose values become output columns.
    pub columns: String,
    /// Column aggregated into the cells.
    pub values: String,
    /// Declared output columns; other values of `columns` are ignored.
    pub pivot_values: Vec<String>,
    #[serde(default = "default_function")]
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<f64>,
}

/// Long-to-wide reshaping. The output columns are declared up front so the
/// output schema is known before any row is read.
#[derive(Debug, Clone)]
pub struct Pivot {
    params: PivotParams,
}

impl Pivot {
    pub const NAME: &'static str = "pivot";

    pub fn new(params: PivotParams) -> Self {
        Self { params }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            params: parse_params(Self::NAME, params)?,
        })
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Pivot", Category::Aggregate)
            .param(
                "index",
                ParamSpec::with_default(
                    ParamKind::StringList,
                    serde_json::json!([]),
                    "Row identity columns",
                ),
            )
            .param(
                "columns",
                ParamSpec::required(ParamKind::String, "Column whose values become columns"),
            )
            .param(
                "values",
                ParamSpec::required(ParamKind::String, "Column aggregated into the cells"),
            )
            .param(
                "pivot_values",
                ParamSpec::required(ParamKind::StringList, "Output columns to produce"),
            )
            .param(
                "function",
                ParamSpec::with_default(
                    ParamKind::Choice(AggFunction::NAMES.iter().map(|s| (*s).to_owned()).collect()),
                    serde_json::json!("sum"),
                    "Aggregation applied per cell",
                ),
            )
            .param(
                "fill",
                ParamSpec::optional(ParamKind::Number, "Value for cells with no rows"),
            )
    }

    fn function(&self) -> Result<AggFunction> {
        AggFunction::parse(&self.params.function).ok_or_else(|| {
            PipelineError::config(format!(
                "unknown aggregation function '{}'",
                self.params.function
            ))
        })
    }
}

impl Operation for Pivot {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::Aggregate
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            out_of_core: false,
            chunking: Chunking::TwoPhase,
        }
    }

    fn params(&self) -> Params {
        to_params(&self.params)
    }

    fn describe(&self) -> String {
        format!(
            "Pivot {} by {} into {} column(s) using {}",
            self.params.values,
            self.params.columns,
            self.params.pivot_values.len(),
            self.params.function
        )
    }

    fn check_params(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if AggFunction::parse(&self.params.function).is_none() {
            problems.push(format!(
                "unknown aggregation function '{}'",
                self.params.function
            ));
        }
        if self.params.pivot_values.is_empty() {
            problems.push("at least one pivot value is required".to_owned());
        }
        let mut names = self.params.index.clone();
        for value in &self.params.pivot_values {
            if names.contains(value) {
                problems.push(format!("duplicate output column '{value}'"));
            }
            names.push(value.clone());
        }
        problems
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        v.require_columns(input, &self.params.index, "pivot on");
        v.require_columns(
            input,
            [&self.params.columns, &self.params.values],
            "pivot",
        );
        if let (Ok(function), Some(kind)) = (self.function(), input.type_of(&self.params.values)) {
            if function.needs_number() && kind != ColumnType::Number {
                v.schema_error(format!(
                    "'{function}' needs a number column, but '{}' is {kind}",
                    self.params.values
                ));
            }
            if self.params.fill.is_some() && function.output_type(kind) != ColumnType::Number {
                v.schema_error("a numeric fill needs numeric pivot cells");
            }
        }
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let function = self.function()?;
        let mut columns = Vec::new();
        for name in &self.params.index {
            let column = input
                .get(name)
                .ok_or_else(|| PipelineError::Other(format!("column '{name}' not found")))?;
            columns.push(column.clone());
        }
        let values = input.type_of(&self.params.values).ok_or_else(|| {
            PipelineError::Other(format!("column '{}' not found", self.params.values))
        })?;
        for value in &self.params.pivot_values {
            columns.push(Column::new(value.clone(), function.output_type(values)));
        }
        Schema::new(columns).map_err(PipelineError::Other)
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let state = self
            .partial(input.schema())
            .ok_or_else(|| PipelineError::Other("pivot state unavailable".to_owned()))?;
        run_partial(state, &input)
    }

    fn partial(&self, input: &Schema) -> Option<Box<dyn PartialState>> {
        Some(Box::new(PivotState {
            output: self.output_schema(input).ok()?,
            index: self
                .params
                .index
                .iter()
                .map(|name| input.index_of(name))
                .collect::<Option<Vec<_>>>()?,
            pivot_column: input.index_of(&self.params.columns)?,
            value_column: input.index_of(&self.params.values)?,
            targets: self
                .params
                .pivot_values
                .iter()
                .enumerate()
                .map(|(slot, value)| (value.clone(), slot))
                .collect(),
            function: self.function().ok()?,
            fill: self.params.fill.map(Value::Number),
            rows: IndexMap::new(),
        }))
    }
}

/// Cells are `None` until a row lands in them, which is what separates an
/// absent cell (filled) from a cell whose values were all null.
struct PivotState {
    output: Schema,
    index: Vec<usize>,
    pivot_column: usize,
    value_column: usize,
    targets: IndexMap<String, usize>,
    function: AggFunction,
    fill: Option<Value>,
    rows: IndexMap<Vec<Value>, Vec<Option<Accumulator>>>,
}

impl PartialState for PivotState {
    fn update(&mut self, chunk: &Table) -> Result<()> {
        for row in chunk.rows() {
            let key: Vec<Value> = self.index.iter().map(|&idx| row[idx].clone()).collect();
            let slot = match &row[self.pivot_column] {
                Value::Null => None,
                value => self.targets.get(&*value.render()).copied(),
            };
            let (width, function) = (self.targets.len(), self.function);
            let cells = self.rows.entry(key).or_insert_with(|| vec![None; width]);
            if let Some(slot) = slot {
                cells[slot]
                    .get_or_insert_with(|| Accumulator::new(function))
                    .update(&row[self.value_column]);
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Table> {
        let mut state = *self;
        if state.index.is_empty() && state.rows.is_empty() {
            state.rows.insert(Vec::new(), vec![None; state.targets.len()]);
        }
        let fill = state.fill.unwrap_or(Value::Null);
        let rows: Vec<Row> = state
            .rows
            .into_iter()
            .map(|(mut key, cells)| {
                key.extend(cells.into_iter().map(|cell| match cell {
                    Some(acc) => acc.finish(),
                    None => fill.clone(),
                }));
                key
            })
            .collect();
        Table::new(state.output, rows)
    }
}
