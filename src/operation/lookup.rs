use super::{
    Capabilities, Category, ExecContext, Operation, Params, Validation, parse_params, to_params,
};
use crate::error::{PipelineError, Result};
use crate::lookup::KeyedLookup;
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::{Column, ColumnType, Schema};
use crate::table::{Table, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupParams {
    /// Column holding the lookup keys.
    pub column: String,
    /// Output column, default `<column>_mapped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_column: Option<String>,
    /// Value written when a key is not found; null when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<String>,
}

/// Appends the mapped value of a key column, resolved through a
/// [`KeyedLookup`] one batch per chunk.
#[derive(Debug)]
pub struct Lookup {
    params: LookupParams,
    store: Arc<dyn KeyedLookup>,
}

impl Lookup {
    pub const NAME: &'static str = "lookup";

    pub fn new(params: LookupParams, store: Arc<dyn KeyedLookup>) -> Self {
        Self { params, store }
    }

    pub fn from_params(params: &Params, store: Arc<dyn KeyedLookup>) -> Result<Self> {
        Ok(Self::new(parse_params(Self::NAME, params)?, store))
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Look up mapped values", Category::Transform)
            .param("column", ParamSpec::required(ParamKind::String, "Key column"))
            .param(
                "output_column",
                ParamSpec::optional(ParamKind::String, "Output column, default <column>_mapped"),
            )
            .param(
                "missing",
                ParamSpec::optional(ParamKind::String, "Value for keys without a mapping"),
            )
    }

    fn output_column(&self) -> String {
        self.params
            .output_column
            .clone()
            .unwrap_or_else(|| format!("{}_mapped", self.params.column))
    }
}

impl Operation for Lookup {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::Transform
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::streaming(false)
    }

    fn params(&self) -> Params {
        to_params(&self.params)
    }

    fn describe(&self) -> String {
        format!("Look up {} into {}", self.params.column, self.output_column())
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        v.require_columns(input, [&self.params.column], "look up");
        let output = self.output_column();
        if input.contains(&output) {
            v.schema_error(format!("output column '{output}' already exists"));
        }
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let mut columns = input.columns().to_vec();
        columns.push(Column::new(self.output_column(), ColumnType::String));
        Schema::new(columns).map_err(PipelineError::Other)
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let schema = self.output_schema(input.schema())?;
        let idx = input.schema().index_of(&self.params.column).ok_or_else(|| {
            PipelineError::Other(format!("column '{}' not found", self.params.column))
        })?;

        let (_, mut rows, text) = input.into_parts_with_text();
        let keys: Vec<String> = rows
            .iter()
            .map(|row| row[idx].render().trim().to_owned())
            .collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let found = self.store.get_many(&key_refs);

        let missing = self
            .params
            .missing
            .as_ref()
            .map_or(Value::Null, |m| Value::Text(m.clone()));
        let mut matched = 0_usize;
        for ((row, key), value) in rows.iter_mut().zip(&keys).zip(found) {
            let value = match value {
                Some(v) if !key.is_empty() => {
                    matched += 1;
                    Value::Text(v)
                }
                _ => missing.clone(),
            };
            row.push(value);
        }
        debug!(rows = rows.len(), matched, "Resolved lookup batch");
        let text = text.map(|records| {
            records
                .iter()
                .zip(&rows)
                .map(|(record, row)| {
                    let mut record = record.clone();
                    if let Some(value) = row.last() {
                        record.push_field(&value.render());
                    }
                    record
                })
                .collect()
        });
        let table = Table::new(schema, rows)?;
        match text {
            Some(text) => table.with_text(text),
            None => Ok(table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::lookup::MemoryLookup;
    use crate::operation::testing::{ctx, sales};

    #[test]
    fn test_lookup_marks_missing_keys() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let store = Arc::new(MemoryLookup::from_pairs([("1", "Leeds")]));
        let op = Lookup::new(
            LookupParams {
                column: "store".to_owned(),
                output_column: Some("city".to_owned()),
                missing: Some("?".to_owned()),
            },
            store,
        );
        let out = op.execute(sales(), &ctx(&token))?;
        let cities: Vec<String> = out.to_text().into_iter().map(|r| r[2].clone()).collect();
        assert_eq!(cities, vec!["Leeds", "?", "Leeds"]);
        Ok(())
    }

    #[test]
    fn test_default_output_column() {
        let op = Lookup::new(
            LookupParams {
                column: "store".to_owned(),
                output_column: None,
                missing: None,
            },
            Arc::new(MemoryLookup::new()),
        );
        let schema = op.output_schema(sales().schema()).expect("valid schema");
        assert_eq!(schema.names(), vec!["store", "amount", "store_mapped"]);
    }
}
