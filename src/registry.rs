//! Explicit name → operation table.
//!
//! A [`Registry`] is an ordinary value: build one with
//! [`Registry::with_builtins`] (or empty, with fakes, in tests) and hand it to
//! the pipeline builder. Each entry pairs an [`OperationDescriptor`], which
//! configuration UIs and the natural-language collaborator read, with a
//! factory that binds parameters into a boxed [`Operation`].

use crate::error::{PipelineError, Result};
use crate::lookup::KeyedLookup;
use crate::operation::aggregate::GroupBy;
use crate::operation::append::AppendSources;
use crate::operation::cast::CastTypes;
use crate::operation::columns::{DropColumns, RenameColumns, SelectColumns};
use crate::operation::compute::ComputeColumn;
use crate::operation::filter::Filter;
use crate::operation::join::Join;
use crate::operation::lookup::Lookup;
use crate::operation::partition::PartitionBy;
use crate::operation::pivot::Pivot;
use crate::operation::sort::Sort;
use crate::operation::{Category, Operation, Params};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::error;

/// Shape a parameter value must have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    StringList,
    BoolList,
    StringMap,
    /// A serialised [`crate::expr::Expr`].
    Expr,
    ObjectList,
    /// One of a fixed set of strings.
    Choice(Vec<String>),
}

impl ParamKind {
    fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(JsonValue::is_string)),
            Self::BoolList => value
                .as_array()
                .is_some_and(|items| items.iter().all(JsonValue::is_boolean)),
            Self::StringMap => value
                .as_object()
                .is_some_and(|map| map.values().all(JsonValue::is_string)),
            Self::Expr => value.is_object(),
            Self::ObjectList => value
                .as_array()
                .is_some_and(|items| items.iter().all(JsonValue::is_object)),
            Self::Choice(options) => value
                .as_str()
                .is_some_and(|s| options.iter().any(|o| o == s)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::String => "a string".to_owned(),
            Self::Number => "a number".to_owned(),
            Self::Boolean => "a boolean".to_owned(),
            Self::StringList => "a list of strings".to_owned(),
            Self::BoolList => "a list of booleans".to_owned(),
            Self::StringMap => "an object of strings".to_owned(),
            Self::Expr => "an expression object".to_owned(),
            Self::ObjectList => "a list of objects".to_owned(),
            Self::Choice(options) => format!("one of {}", options.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: ParamKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    pub description: String,
}

impl ParamSpec {
    pub fn required(kind: ParamKind, description: &str) -> Self {
        Self {
            kind,
            required: true,
            default: None,
            description: description.to_owned(),
        }
    }

    pub fn optional(kind: ParamKind, description: &str) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            description: description.to_owned(),
        }
    }

    pub fn with_default(kind: ParamKind, default: JsonValue, description: &str) -> Self {
        Self {
            kind,
            required: false,
            default: Some(default),
            description: description.to_owned(),
        }
    }
}

/// Registered name, label, category and parameter schema of an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub label: String,
    pub category: Category,
    pub params: BTreeMap<String, ParamSpec>,
}

impl OperationDescriptor {
    pub fn new(name: &str, label: &str, category: Category) -> Self {
        Self {
            name: name.to_owned(),
            label: label.to_owned(),
            category,
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: &str, spec: ParamSpec) -> Self {
        self.params.insert(name.to_owned(), spec);
        self
    }

    /// Check `params` against the parameter schema, returning them with
    /// defaults filled in. Explicit nulls count as absent.
    pub fn bind(&self, params: &Params) -> Result<Params> {
        let problem = |message: String| PipelineError::Parameter {
            operation: self.name.clone(),
            message,
        };

        if let Some(unknown) = params.keys().find(|k| !self.params.contains_key(*k)) {
            return Err(problem(format!("unexpected parameter '{unknown}'")));
        }

        let mut bound = Params::new();
        for (name, spec) in &self.params {
            match params.get(name).filter(|v| !v.is_null()) {
                Some(value) => {
                    if !spec.kind.accepts(value) {
                        return Err(problem(format!(
                            "parameter '{name}' must be {}",
                            spec.kind.describe()
                        )));
                    }
                    bound.insert(name.clone(), value.clone());
                }
                None => {
                    if let Some(default) = &spec.default {
                        bound.insert(name.clone(), default.clone());
                    } else if spec.required {
                        return Err(problem(format!("missing required parameter '{name}'")));
                    }
                }
            }
        }
        Ok(bound)
    }
}

pub type Factory = Arc<dyn Fn(&Params) -> Result<Box<dyn Operation>> + Send + Sync>;

struct Entry {
    descriptor: OperationDescriptor,
    factory: Factory,
}

/// Process-scoped operation table.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("operations", &self.names())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in operation except `lookup`, which needs a store
    /// ([`Registry::register_lookup`]).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: Vec<(OperationDescriptor, Factory)> = vec![
            (Filter::descriptor(), boxed(Filter::from_params)),
            (SelectColumns::descriptor(), boxed(SelectColumns::from_params)),
            (DropColumns::descriptor(), boxed(DropColumns::from_params)),
            (RenameColumns::descriptor(), boxed(RenameColumns::from_params)),
            (ComputeColumn::descriptor(), boxed(ComputeColumn::from_params)),
            (CastTypes::descriptor(), boxed(CastTypes::from_params)),
            (Sort::descriptor(), boxed(Sort::from_params)),
            (GroupBy::descriptor(), boxed(GroupBy::from_params)),
            (Pivot::descriptor(), boxed(Pivot::from_params)),
            (Join::descriptor(), boxed(Join::from_params)),
            (AppendSources::descriptor(), boxed(AppendSources::from_params)),
            (PartitionBy::descriptor(), boxed(PartitionBy::from_params)),
        ];
        let failed: Vec<String> = builtins
            .into_iter()
            .filter_map(|(descriptor, factory)| registry.register(descriptor, factory).err())
            .map(|e| e.to_string())
            .collect();
        for e in &failed {
            error!(error = %e, "Built-in operation not registered");
        }
        debug_assert!(failed.is_empty(), "built-ins failed to register: {failed:?}");
        registry
    }

    /// Register `lookup` backed by `store`.
    pub fn register_lookup(&mut self, store: Arc<dyn KeyedLookup>) -> Result<()> {
        let factory: Factory = Arc::new(move |params: &Params| {
            Ok(Box::new(Lookup::from_params(params, Arc::clone(&store))?) as Box<dyn Operation>)
        });
        self.register(Lookup::descriptor(), factory)
    }

    /// Add an operation. Fails if the name is taken.
    pub fn register(&mut self, descriptor: OperationDescriptor, factory: Factory) -> Result<()> {
        if self.entries.contains_key(&descriptor.name) {
            return Err(PipelineError::DuplicateName(descriptor.name));
        }
        self.entries.insert(
            descriptor.name.clone(),
            Entry {
                descriptor,
                factory,
            },
        );
        Ok(())
    }

    /// Bind `params` to the operation registered as `name`.
    pub fn instantiate(&self, name: &str, params: &Params) -> Result<Box<dyn Operation>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| PipelineError::UnknownOperation(name.to_owned()))?;
        let bound = entry.descriptor.bind(params)?;
        let operation = (entry.factory)(&bound)?;

        let problems = operation.check_params();
        if !problems.is_empty() {
            return Err(PipelineError::Parameter {
                operation: name.to_owned(),
                message: problems.join("; "),
            });
        }
        Ok(operation)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&OperationDescriptor> {
        self.entries.get(name).map(|e| &e.descriptor)
    }

    /// All descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<&OperationDescriptor> {
        let mut out: Vec<_> = self.entries.values().map(|e| &e.descriptor).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors().into_iter().map(|d| d.name.as_str()).collect()
    }
}

fn boxed<T, F>(build: F) -> Factory
where
    T: Operation + 'static,
    F: Fn(&Params) -> Result<T> + Send + Sync + 'static,
{
    Arc::new(move |params: &Params| Ok(Box::new(build(params)?) as Box<dyn Operation>))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: JsonValue) -> Params {
        value.as_object().cloned().expect("object params")
    }

    #[test]
    fn test_builtins_are_listed_sorted() {
        let registry = Registry::with_builtins();
        let names = registry.names();
        assert!(names.contains(&"group_by"));
        assert!(!names.contains(&"lookup"));
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_every_builtin_is_registered() {
        let registry = Registry::with_builtins();
        assert_eq!(
            registry.names(),
            vec![
                "append_sources",
                "cast_types",
                "compute_column",
                "drop_columns",
                "filter",
                "group_by",
                "join",
                "partition_by",
                "pivot",
                "rename_columns",
                "select_columns",
                "sort",
            ]
        );
    }

    #[test]
    fn test_duplicate_name() {
        let mut registry = Registry::with_builtins();
        let err = registry
            .register(Filter::descriptor(), boxed(Filter::from_params))
            .expect_err("duplicate must fail");
        assert!(matches!(err, PipelineError::DuplicateName(name) if name == "filter"));
    }

    #[test]
    fn test_unknown_operation() {
        let err = Registry::with_builtins()
            .instantiate("explode", &Params::new())
            .expect_err("unknown name");
        assert!(matches!(err, PipelineError::UnknownOperation(_)));
    }

    #[test]
    fn test_parameter_errors() {
        let registry = Registry::with_builtins();

        let missing = registry
            .instantiate("select_columns", &Params::new())
            .expect_err("missing required");
        assert!(missing.to_string().contains("missing required parameter 'columns'"));

        let wrong = registry
            .instantiate("select_columns", &params(json!({ "columns": "a" })))
            .expect_err("wrong type");
        assert!(matches!(wrong, PipelineError::Parameter { .. }));

        let out_of_domain = registry
            .instantiate(
                "group_by",
                &params(json!({
                    "by": ["store"],
                    "aggregations": [{ "column": "amount", "function": "median" }]
                })),
            )
            .expect_err("unknown function");
        assert!(out_of_domain.to_string().contains("median"));
    }

    #[test]
    fn test_defaults_are_filled() -> anyhow::Result<()> {
        let registry = Registry::with_builtins();
        let op = registry.instantiate(
            "join",
            &params(json!({ "right": "missing.csv", "left_on": ["id"], "how": "left" })),
        );
        // The right-hand file does not exist, so binding succeeds but building fails.
        assert!(matches!(op, Err(PipelineError::Source { .. })));

        let op = registry.instantiate(
            "group_by",
            &params(json!({ "aggregations": [{ "column": "amount", "function": "sum" }] })),
        )?;
        assert_eq!(op.params().get("by"), Some(&json!([])));
        Ok(())
    }

    #[test]
    fn test_isolated_fake_registry() -> anyhow::Result<()> {
        let mut registry = Registry::new();
        registry.register(
            OperationDescriptor::new("only_filter", "Fake", Category::Transform)
                .param("predicate", ParamSpec::required(ParamKind::Expr, "Predicate")),
            boxed(Filter::from_params),
        )?;
        assert_eq!(registry.names(), vec!["only_filter"]);
        assert!(registry.instantiate("filter", &Params::new()).is_err());
        Ok(())
    }
}
