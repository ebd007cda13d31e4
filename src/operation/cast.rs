use super::{
    Capabilities, Category, ExecContext, Operation, Params, Validation, parse_params, to_params,
};
use crate::engine::{CastColumn, QueryFragment};
use crate::error::{PipelineError, Result};
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::{Column, ColumnType, Schema};
use crate::table::{Table, Value, format_number};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastParams {
    /// Column name → target type name.
    pub columns: BTreeMap<String, String>,
}

/// Converts columns between string, number and boolean. Values that do not
/// convert become null.
#[derive(Debug, Clone)]
pub struct CastTypes {
    params: CastParams,
}

fn target_type(name: &str) -> Option<ColumnType> {
    ColumnType::parse(name).filter(|t| {
        matches!(
            t,
            ColumnType::String | ColumnType::Number | ColumnType::Boolean
        )
    })
}

/// Convert one value to `to`.
pub fn convert(value: Value, to: ColumnType) -> Value {
    match (value, to) {
        (Value::Null, _) => Value::Null,
        (Value::Number(n), ColumnType::String) => Value::Text(format_number(n)),
        (Value::Number(n), ColumnType::Boolean) => Value::Bool(n != 0.0),
        (Value::Bool(b), ColumnType::String) => Value::Text(b.to_string()),
        (Value::Bool(b), ColumnType::Number) => Value::Number(if b { 1.0 } else { 0.0 }),
        (Value::Text(s), ColumnType::Number) => Value::parse(&s, ColumnType::Number),
        (Value::Text(s), ColumnType::Boolean) => Value::parse(&s, ColumnType::Boolean),
        (value, _) => value,
    }
}

impl CastTypes {
    pub const NAME: &'static str = "cast_types";

    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, ColumnType)>,
        S: Into<String>,
    {
        Self {
            params: CastParams {
                columns: columns
                    .into_iter()
                    .map(|(name, kind)| (name.into(), kind.as_str().to_owned()))
                    .collect(),
            },
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            params: parse_params(Self::NAME, params)?,
        })
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Change column types", Category::Transform).param(
            "columns",
            ParamSpec::required(
                ParamKind::StringMap,
                "Object of column name to string, number or boolean",
            ),
        )
    }

    fn casts(&self, input: &Schema) -> Vec<CastColumn> {
        self.params
            .columns
            .iter()
            .filter_map(|(name, to)| {
                let from = input.type_of(name)?;
                Some(CastColumn {
                    name: name.clone(),
                    from,
                    to: target_type(to)?,
                })
            })
            .collect()
    }
}

impl Operation for CastTypes {
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
        let pairs: Vec<String> = self
            .params
            .columns
            .iter()
            .map(|(name, to)| format!("{name} as {to}"))
            .collect();
        format!("Cast {}", pairs.join(", "))
    }

    fn check_params(&self) -> Vec<String> {
        self.params
            .columns
            .iter()
            .filter(|(_, to)| target_type(to).is_none())
            .map(|(name, to)| {
                format!("cannot cast '{name}' to '{to}' (expected string, number or boolean)")
            })
            .collect()
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        v.require_columns(input, self.params.columns.keys(), "cast");
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let mut schema = input.clone();
        for (name, to) in &self.params.columns {
            let kind = target_type(to)
                .ok_or_else(|| PipelineError::config(format!("unsupported type '{to}'")))?;
            if !schema.contains(name) {
                return Err(PipelineError::Other(format!("column '{name}' not found")));
            }
            schema = schema.with_column(Column::new(name.clone(), kind));
        }
        Ok(schema)
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let schema = self.output_schema(input.schema())?;
        let targets: Vec<(usize, ColumnType)> = self
            .casts(input.schema())
            .into_iter()
            .filter_map(|c| input.schema().index_of(&c.name).map(|idx| (idx, c.to)))
            .collect();
        let (_, mut rows, text) = input.into_parts_with_text();
        for row in &mut rows {
            for &(idx, to) in &targets {
                let value = std::mem::replace(&mut row[idx], Value::Null);
                row[idx] = convert(value, to);
            }
        }
        // Converted cells no longer match their source text.
        let text = text.map(|records| {
            records
                .iter()
                .zip(&rows)
                .map(|(record, row)| {
                    record
                        .iter()
                        .enumerate()
                        .map(|(idx, field)| {
                            if targets.iter().any(|&(t, _)| t == idx) {
                                row[idx].render().into_owned()
                            } else {
                                field.to_owned()
                            }
                        })
                        .collect::<StringRecord>()
                })
                .collect()
        });
        let table = Table::new(schema, rows)?;
        match text {
            Some(text) => table.with_text(text),
            None => Ok(table),
        }
    }

    fn query_fragment(&self, input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::Cast(self.casts(input)))
    }
}
