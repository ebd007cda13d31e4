use super::{
    Capabilities, Category, Chunking, ExecContext, Operation, Params, Validation, parse_params,
    to_params,
};
use crate::engine::QueryFragment;
use crate::error::{PipelineError, Result};
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::Schema;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortParams {
    pub by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descending: Option<Vec<bool>>,
}

/// Stable multi-key sort. Nulls sort last regardless of direction.
#[derive(Debug, Clone)]
pub struct Sort {
    params: SortParams,
}

impl Sort {
    pub const NAME: &'static str = "sort";

    pub fn new(by: Vec<String>, descending: Option<Vec<bool>>) -> Self {
        Self {
            params: SortParams { by, descending },
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            params: parse_params(Self::NAME, params)?,
        })
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Sort rows", Category::Transform)
            .param("by", ParamSpec::required(ParamKind::StringList, "Sort keys"))
            .param(
                "descending",
                ParamSpec::optional(ParamKind::BoolList, "Per-key direction, default ascending"),
            )
    }

    fn directions(&self) -> Vec<bool> {
        self.params
            .descending
            .clone()
            .unwrap_or_else(|| vec![false; self.params.by.len()])
    }
}

impl Operation for Sort {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::Transform
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            out_of_core: true,
            chunking: Chunking::Materialize,
        }
    }

    fn params(&self) -> Params {
        to_params(&self.params)
    }

    fn describe(&self) -> String {
        let keys: Vec<String> = self
            .params
            .by
            .iter()
            .zip(self.directions())
            .map(|(key, desc)| format!("{key} {}", if desc { "desc" } else { "asc" }))
            .collect();
        format!("Sort by {}", keys.join(", "))
    }

    fn check_params(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.params.by.is_empty() {
            problems.push("at least one sort key is required".to_owned());
        }
        if let Some(desc) = &self.params.descending
            && desc.len() != self.params.by.len()
        {
            problems.push(format!(
                "'descending' has {} entries but there are {} sort keys",
                desc.len(),
                self.params.by.len()
            ));
        }
        problems
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        v.require_columns(input, &self.params.by, "sort by");
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        Ok(input.clone())
    }

    fn execute(&self, input: Table, _ctx: &ExecContext<'_>) -> Result<Table> {
        let keys: Vec<(usize, bool)> = self
            .params
            .by
            .iter()
            .zip(self.directions())
            .map(|(name, desc)| {
                input
                    .schema()
                    .index_of(name)
                    .map(|idx| (idx, desc))
                    .ok_or_else(|| PipelineError::Other(format!("column '{name}' not found")))
            })
            .collect::<Result<_>>()?;

        let (schema, rows, text) = input.into_parts_with_text();
        let mut order: Vec<usize> = (0..rows.len()).collect();
        order.sort_by(|&a, &b| {
            for &(idx, desc) in &keys {
                let (x, y) = (&rows[a][idx], &rows[b][idx]);
                let ord = match (x.is_null(), y.is_null()) {
                    (false, false) if desc => y.sort_cmp(x),
                    _ => x.sort_cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        let sorted = permute(rows, &order);
        let table = Table::new(schema, sorted)?;
        match text {
            Some(text) => table.with_text(permute(text, &order)),
            None => Ok(table),
        }
    }

    fn query_fragment(&self, _input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::Sort {
            by: self.params.by.clone(),
            descending: self.directions(),
        })
    }
}

/// Reorder `items` so that position `i` holds the element at `order[i]`.
fn permute<T>(items: Vec<T>, order: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    order.iter().filter_map(|&i| slots[i].take()).collect()
}
