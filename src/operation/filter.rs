use super::{
    Capabilities, Category, ExecContext, Operation, Params, Validation, parse_params, to_params,
};
use crate::engine::QueryFragment;
use crate::error::Result;
use crate::expr::Expr;
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::{ColumnType, Schema};
use crate::table::Table;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub predicate: Expr,
}

/// Keeps the rows whose predicate evaluates to true; null counts as false.
#[derive(Debug, Clone)]
pub struct Filter {
    params: FilterParams,
}

impl Filter {
    pub const NAME: &'static str = "filter";

    pub fn new(predicate: Expr) -> Self {
        Self {
            params: FilterParams { predicate },
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            params: parse_params(Self::NAME, params)?,
        })
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Filter rows", Category::Transform).param(
            "predicate",
            ParamSpec::required(ParamKind::Expr, "Boolean expression a row must satisfy"),
        )
    }
}

impl Operation for Filter {
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
        format!("Keep rows where {}", self.params.predicate)
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        match self.params.predicate.infer_type(input) {
            Ok(ColumnType::Boolean) => {}
            Ok(other) => v.schema_error(format!("filter predicate must be boolean, got {other}")),
            Err(e) => v.schema_error(e),
        }
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        Ok(input.clone())
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let (schema, rows, text) = input.into_parts_with_text();
        let predicate = &self.params.predicate;
        let keep: Vec<bool> = rows.iter().map(|row| predicate.matches(&schema, row)).collect();
        let kept = rows
            .into_iter()
            .zip(&keep)
            .filter_map(|(row, &k)| k.then_some(row))
            .collect();
        let table = Table::new(schema, kept)?;
        match text {
            Some(text) => table.with_text(
                text.into_iter()
                    .zip(&keep)
                    .filter_map(|(record, &k)| k.then_some(record))
                    .collect(),
            ),
            None => Ok(table),
        }
    }

    fn query_fragment(&self, _input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::Filter(self.params.predicate.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::operation::testing::{ctx, sales};

    #[test]
    fn test_filter_keeps_matching_rows_in_order() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let op = Filter::new(Expr::col("amount").gt_eq(Expr::lit(50)));
        let out = op.execute(sales(), &ctx(&token))?;
        assert_eq!(out.to_text(), vec![vec!["1", "100"], vec!["2", "50"]]);
        Ok(())
    }

    #[test]
    fn test_predicate_must_be_boolean() {
        let schema = sales().schema().clone();
        assert!(!Filter::new(Expr::col("amount")).validate(&schema).is_valid());
        assert!(!Filter::new(Expr::col("price").gt(Expr::lit(1))).validate(&schema).is_valid());
        assert!(Filter::new(Expr::col("store").eq(Expr::lit("1"))).validate(&schema).is_valid());
    }

    #[test]
    fn test_params_round_trip() -> anyhow::Result<()> {
        let op = Filter::new(Expr::col("amount").gt(Expr::lit(1000)));
        let rebuilt = Filter::from_params(&op.params())?;
        assert_eq!(rebuilt.params, op.params);
        Ok(())
    }
}
