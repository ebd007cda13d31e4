use super::{
    Capabilities, Category, ExecContext, Operation, Params, Validation, parse_params, to_params,
};
use crate::engine::QueryFragment;
use crate::error::{PipelineError, Result};
use crate::expr::Expr;
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::{Column, Schema};
use crate::table::{Row, Table};
use csv::StringRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeParams {
    pub name: String,
    pub expr: Expr,
}

/// Adds a column computed from existing ones. Reusing an existing name
/// replaces that column in place.
#[derive(Debug, Clone)]
pub struct ComputeColumn {
    params: ComputeParams,
}

impl ComputeColumn {
    pub const NAME: &'static str = "compute_column";

    pub fn new(name: impl Into<String>, expr: Expr) -> Self {
        Self {
            params: ComputeParams {
                name: name.into(),
                expr,
            },
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            params: parse_params(Self::NAME, params)?,
        })
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Compute column", Category::Transform)
            .param("name", ParamSpec::required(ParamKind::String, "Output column name"))
            .param(
                "expr",
                ParamSpec::required(ParamKind::Expr, "Expression over existing columns"),
            )
    }
}

impl Operation for ComputeColumn {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::Transform
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::streaming(true)
    }

    fn params(&self) -> Params {
        to_params(&self.params)
    }

    fn describe(&self) -> String {
        format!("Set {} = {}", self.params.name, self.params.expr)
    }

    fn check_params(&self) -> Vec<String> {
        if self.params.name.trim().is_empty() {
            vec!["output column name is empty".to_owned()]
        } else {
            Vec::new()
        }
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        if let Err(e) = self.params.expr.infer_type(input) {
            v.schema_error(e);
        }
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let kind = self
            .params
            .expr
            .infer_type(input)
            .map_err(PipelineError::Other)?;
        Ok(input.with_column(Column::new(self.params.name.clone(), kind)))
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let schema = self.output_schema(input.schema())?;
        let (in_schema, rows, text) = input.into_parts_with_text();
        let target = in_schema.index_of(&self.params.name);
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|mut row| {
                let value = self.params.expr.eval(&in_schema, &row);
                match target {
                    Some(idx) => row[idx] = value,
                    None => row.push(value),
                }
                row
            })
            .collect();
        let text = text.map(|records| {
            records
                .iter()
                .zip(&rows)
                .map(|(record, row)| {
                    let computed = row[target.unwrap_or(row.len() - 1)].render();
                    let mut fields: Vec<&str> = record.iter().collect();
                    match target {
                        Some(idx) => fields[idx] = computed.as_ref(),
                        None => fields.push(computed.as_ref()),
                    }
                    fields.into_iter().collect::<StringRecord>()
                })
                .collect()
        });
        let table = Table::new(schema, rows)?;
        match text {
            Some(text) => table.with_text(text),
            None => Ok(table),
        }
    }

    fn query_fragment(&self, _input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::WithColumn {
            name: self.params.name.clone(),
            expr: self.params.expr.clone(),
        })
    }
}
