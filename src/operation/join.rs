use super::{
    Capabilities, Category, ExecContext, Operation, Params, Validation, parse_params, to_params,
};
use crate::engine::{JoinKind, QueryFragment};
use crate::error::{PipelineError, Result};
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::{Column, ColumnType, Schema};
use crate::source::{ChunkedSource, DEFAULT_SAMPLE_ROWS};
use crate::table::{Row, Table, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Suffix for right-hand columns whose names clash with left-hand ones.
pub const RIGHT_SUFFIX: &str = "_right";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinParams {
    /// CSV file joined onto the running table.
    pub right: PathBuf,
    pub left_on: Vec<String>,
    /// Right-hand key columns; defaults to `left_on`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_on: Option<Vec<String>>,
    #[serde(default)]
    pub how: JoinKind,
}

#[derive(Debug)]
struct RightSide {
    table: Table,
    index: HashMap<Vec<Value>, Vec<usize>>,
}

/// Equi-join against a second file. The right-hand file is read once and
/// indexed; the left-hand side streams through unchanged in order.
#[derive(Debug)]
pub struct Join {
    params: JoinParams,
    right_schema: Schema,
    right: Mutex<Option<Arc<RightSide>>>,
}

impl Join {
    pub const NAME: &'static str = "join";

    /// Bind parameters and read the right-hand file's schema.
    pub fn new(params: JoinParams) -> Result<Self> {
        let right_schema = ChunkedSource::open(&params.right)?.infer_schema(DEFAULT_SAMPLE_ROWS)?;
        Ok(Self {
            params,
            right_schema,
            right: Mutex::new(None),
        })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(parse_params(Self::NAME, params)?)
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Join another file", Category::Source)
            .param("right", ParamSpec::required(ParamKind::String, "Path of the file to join"))
            .param("left_on", ParamSpec::required(ParamKind::StringList, "Key columns"))
            .param(
                "right_on",
                ParamSpec::optional(
                    ParamKind::StringList,
                    "Key columns of the joined file, default the same names",
                ),
            )
            .param(
                "how",
                ParamSpec::with_default(
                    ParamKind::Choice(vec!["inner".to_owned(), "left".to_owned()]),
                    serde_json::json!("inner"),
                    "Join type",
                ),
            )
    }

    pub fn right_schema(&self) -> &Schema {
        &self.right_schema
    }

    fn right_on(&self) -> &[String] {
        self.params.right_on.as_deref().unwrap_or(&self.params.left_on)
    }

    /// Indices of right-hand columns carried into the output.
    fn carried(&self) -> Vec<usize> {
        let keys = self.right_on();
        self.right_schema
            .iter()
            .enumerate()
            .filter(|(_, c)| !keys.contains(&c.name))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn right_side(&self) -> Result<Arc<RightSide>> {
        let mut slot = self.right.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(side) = slot.as_ref() {
            return Ok(Arc::clone(side));
        }

        let table = ChunkedSource::open(&self.params.right)?.read_all(&self.right_schema)?;
        let keys = self
            .right_on()
            .iter()
            .map(|name| self.right_schema.index_of(name))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| PipelineError::Other("join key missing from right file".to_owned()))?;
        let mut index: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
        for (row_idx, row) in table.rows().iter().enumerate() {
            let key: Vec<Value> = keys.iter().map(|&k| row[k].clone()).collect();
            if key.iter().any(Value::is_null) {
                continue;
            }
            index.entry(key).or_default().push(row_idx);
        }
        debug!(
            path = %self.params.right.display(),
            rows = table.len(),
            keys = index.len(),
            "Indexed right-hand join input"
        );

        let side = Arc::new(RightSide { table, index });
        *slot = Some(Arc::clone(&side));
        Ok(side)
    }
}

fn same_class(a: ColumnType, b: ColumnType) -> bool {
    a == b || (a.is_text_like() && b.is_text_like())
}

impl Operation for Join {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::Source
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::streaming(true)
    }

    fn params(&self) -> Params {
        to_params(&self.params)
    }

    fn describe(&self) -> String {
        format!(
            "{:?} join {} on {}",
            self.params.how,
            self.params.right.display(),
            self.params.left_on.join(", ")
        )
    }

    fn check_params(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.params.left_on.is_empty() {
            problems.push("at least one join key is required".to_owned());
        }
        if self.right_on().len() != self.params.left_on.len() {
            problems.push(format!(
                "{} left keys but {} right keys",
                self.params.left_on.len(),
                self.right_on().len()
            ));
        }
        problems
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        v.require_columns(input, &self.params.left_on, "join on");
        for name in self.right_schema.missing(self.right_on()) {
            v.schema_error(format!(
                "join key '{name}' not found in {}",
                self.params.right.display()
            ));
        }
        for (left, right) in self.params.left_on.iter().zip(self.right_on()) {
            if let (Some(lt), Some(rt)) = (input.type_of(left), self.right_schema.type_of(right))
                && !same_class(lt, rt)
            {
                v.schema_error(format!("cannot join {left} ({lt}) with {right} ({rt})"));
            }
        }
        if v.is_valid()
            && let Err(e) = self.output_schema(input)
        {
            v.schema_error(e.to_string());
        }
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let mut columns = input.columns().to_vec();
        for idx in self.carried() {
            let column = &self.right_schema.columns()[idx];
            let name = if input.contains(&column.name) {
                format!("{}{RIGHT_SUFFIX}", column.name)
            } else {
                column.name.clone()
            };
            columns.push(Column::new(name, column.kind));
        }
        Schema::new(columns).map_err(PipelineError::Other)
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let schema = self.output_schema(input.schema())?;
        let right = self.right_side()?;
        let keys = self
            .params
            .left_on
            .iter()
            .map(|name| input.schema().index_of(name))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| PipelineError::Other("join key missing from input".to_owned()))?;
        let carried = self.carried();

        let (_, rows) = input.into_parts();
        let mut out: Vec<Row> = Vec::with_capacity(rows.len());
        for row in rows {
            let key: Vec<Value> = keys.iter().map(|&k| row[k].clone()).collect();
            let matches = if key.iter().any(Value::is_null) {
                None
            } else {
                right.index.get(&key)
            };
            match matches {
                Some(hits) => {
                    for &hit in hits {
                        let right_row = &right.table.rows()[hit];
                        let mut joined = row.clone();
                        joined.extend(carried.iter().map(|&idx| right_row[idx].clone()));
                        out.push(joined);
                    }
                }
                None if self.params.how == JoinKind::Left => {
                    let mut joined = row;
                    joined.extend(carried.iter().map(|_| Value::Null));
                    out.push(joined);
                }
                None => {}
            }
        }
        Table::new(schema, out)
    }

    fn query_fragment(&self, input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::Join {
            right: self.params.right.clone(),
            right_schema: self.right_schema.clone(),
            left_on: self.params.left_on.clone(),
            right_on: self.right_on().to_vec(),
            how: self.params.how,
            columns: self.output_schema(input).ok()?.names(),
        })
    }
}
