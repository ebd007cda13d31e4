//! Column selection, removal and renaming.

use super::{
    Capabilities, Category, ExecContext, Operation, Params, Validation, parse_params, to_params,
};
use crate::engine::QueryFragment;
use crate::error::{PipelineError, Result};
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::{Column, Schema};
use crate::table::{Row, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnListParams {
    pub columns: Vec<String>,
}

/// Reorder and project rows onto the columns at `indices`.
fn project(input: Table, schema: Schema, indices: &[usize]) -> Result<Table> {
    let (_, rows, text) = input.into_parts_with_text();
    let rows: Vec<Row> = rows
        .into_iter()
        .map(|row| indices.iter().map(|&idx| row[idx].clone()).collect())
        .collect();
    let table = Table::new(schema, rows)?;
    match text {
        Some(text) => table.with_text(
            text.iter()
                .map(|record| indices.iter().map(|&idx| record.get(idx).unwrap_or("")).collect())
                .collect(),
        ),
        None => Ok(table),
    }
}

fn indices_of(input: &Schema, names: &[String]) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|name| {
            input
                .index_of(name)
                .ok_or_else(|| PipelineError::Other(format!("column '{name}' not found")))
        })
        .collect()
}

fn duplicates(names: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    let mut dups = Vec::new();
    for name in names {
        if seen.contains(name) {
            dups.push(name.clone());
        } else {
            seen.push(name.clone());
        }
    }
    dups
}

/// Keep only the listed columns, in the listed order.
#[derive(Debug, Clone)]
pub struct SelectColumns {
    params: ColumnListParams,
}

impl SelectColumns {
    pub const NAME: &'static str = "select_columns";

    pub fn new(columns: Vec<String>) -> Self {
        Self {
            params: ColumnListParams { columns },
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            params: parse_params(Self::NAME, params)?,
        })
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Select columns", Category::Transform).param(
            "columns",
            ParamSpec::required(ParamKind::StringList, "Columns to keep, in output order"),
        )
    }
}

impl Operation for SelectColumns {
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
        format!("Keep columns {}", self.params.columns.join(", "))
    }

    fn check_params(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.params.columns.is_empty() {
            problems.push("at least one column must be selected".to_owned());
        }
        for dup in duplicates(&self.params.columns) {
            problems.push(format!("column '{dup}' selected twice"));
        }
        problems
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        v.require_columns(input, &self.params.columns, "select");
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let columns = self
            .params
            .columns
            .iter()
            .map(|name| {
                input
                    .get(name)
                    .cloned()
                    .ok_or_else(|| PipelineError::Other(format!("column '{name}' not found")))
            })
            .collect::<Result<Vec<Column>>>()?;
        Schema::new(columns).map_err(PipelineError::Other)
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let schema = self.output_schema(input.schema())?;
        let indices = indices_of(input.schema(), &self.params.columns)?;
        project(input, schema, &indices)
    }

    fn query_fragment(&self, _input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::Select(self.params.columns.clone()))
    }
}

/// Remove the listed columns, keeping the rest in their original order.
#[derive(Debug, Clone)]
pub struct DropColumns {
    params: ColumnListParams,
}

impl DropColumns {
    pub const NAME: &'static str = "drop_columns";

    pub fn new(columns: Vec<String>) -> Self {
        Self {
            params: ColumnListParams { columns },
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            params: parse_params(Self::NAME, params)?,
        })
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Drop columns", Category::Transform).param(
            "columns",
            ParamSpec::required(ParamKind::StringList, "Columns to remove"),
        )
    }

    fn remaining(&self, input: &Schema) -> Vec<String> {
        input
            .iter()
            .filter(|c| !self.params.columns.contains(&c.name))
            .map(|c| c.name.clone())
            .collect()
    }
}

impl Operation for DropColumns {
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
        format!("Drop columns {}", self.params.columns.join(", "))
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        v.require_columns(input, &self.params.columns, "drop");
        if v.is_valid() && self.remaining(input).is_empty() {
            v.schema_error("cannot drop every column");
        }
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let columns = input
            .iter()
            .filter(|c| !self.params.columns.contains(&c.name))
            .cloned()
            .collect();
        Schema::new(columns).map_err(PipelineError::Other)
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let schema = self.output_schema(input.schema())?;
        let indices = indices_of(input.schema(), &schema.names())?;
        project(input, schema, &indices)
    }

    fn query_fragment(&self, input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::Select(self.remaining(input)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameParams {
    /// Old name → new name.
    pub mapping: BTreeMap<String, String>,
}

/// Rename columns in place; unlisted columns keep their names.
#[derive(Debug, Clone)]
pub struct RenameColumns {
    params: RenameParams,
}

impl RenameColumns {
    pub const NAME: &'static str = "rename_columns";

    pub fn new<I, S>(mapping: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            params: RenameParams {
                mapping: mapping
                    .into_iter()
                    .map(|(old, new)| (old.into(), new.into()))
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
        OperationDescriptor::new(Self::NAME, "Rename columns", Category::Transform).param(
            "mapping",
            ParamSpec::required(ParamKind::StringMap, "Object of old name to new name"),
        )
    }

    fn renamed(&self, name: &str) -> String {
        self.params
            .mapping
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_owned())
    }
}

impl Operation for RenameColumns {
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
            .mapping
            .iter()
            .map(|(old, new)| format!("{old} -> {new}"))
            .collect();
        format!("Rename {}", pairs.join(", "))
    }

    fn check_params(&self) -> Vec<String> {
        self.params
            .mapping
            .iter()
            .filter(|(_, new)| new.trim().is_empty())
            .map(|(old, _)| format!("new name for '{old}' is empty"))
            .collect()
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        v.require_columns(input, self.params.mapping.keys(), "rename");
        if v.is_valid()
            && let Err(e) = self.output_schema(input)
        {
            v.schema_error(e.to_string());
        }
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let columns = input
            .iter()
            .map(|c| Column::new(self.renamed(&c.name), c.kind))
            .collect();
        Schema::new(columns).map_err(PipelineError::Other)
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let schema = self.output_schema(input.schema())?;
        let (_, rows, text) = input.into_parts_with_text();
        let table = Table::new(schema, rows)?;
        match text {
            Some(text) => table.with_text(text),
            None => Ok(table),
        }
    }

    fn query_fragment(&self, input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::Rename(
            input
                .iter()
                .map(|c| (c.name.clone(), self.renamed(&c.name)))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::operation::testing::{ctx, sales};

    #[test]
    fn test_select_reorders() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let op = SelectColumns::new(vec!["amount".to_owned(), "store".to_owned()]);
        let out = op.execute(sales(), &ctx(&token))?;
        assert_eq!(out.schema().names(), vec!["amount", "store"]);
        assert_eq!(out.to_text()[0], vec!["100", "1"]);
        Ok(())
    }

    #[test]
    fn test_select_rejects_duplicates_and_missing() {
        let schema = sales().schema().clone();
        let dup = SelectColumns::new(vec!["store".to_owned(), "store".to_owned()]);
        assert_eq!(dup.check_params().len(), 1);
        let missing = SelectColumns::new(vec!["price".to_owned()]);
        assert_eq!(
            missing.validate(&schema).messages(),
            vec!["cannot select non-existent column 'price'"]
        );
    }

    #[test]
    fn test_drop_keeps_order() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let op = DropColumns::new(vec!["store".to_owned()]);
        let out = op.execute(sales(), &ctx(&token))?;
        assert_eq!(out.schema().names(), vec!["amount"]);

        let all = DropColumns::new(vec!["store".to_owned(), "amount".to_owned()]);
        assert!(!all.validate(sales().schema()).is_valid());
        Ok(())
    }

    #[test]
    fn test_rename_in_place() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let op = RenameColumns::new([("store", "store_id")]);
        let out = op.execute(sales(), &ctx(&token))?;
        assert_eq!(out.schema().names(), vec!["store_id", "amount"]);

        let clash = RenameColumns::new([("store", "amount")]);
        assert!(!clash.validate(sales().schema()).is_valid());
        Ok(())
    }
}
