//! Natural-language collaborator contract.
//!
//! A translator turns free text plus the columns currently on offer into one
//! structured step, or declares that nothing matched. The pipeline never
//! reads the text itself: whatever the translator proposes goes through
//! [`admit`] like any hand-written step.

use crate::error::Result;
use crate::operation::Operation;
use crate::pipeline::StepSpec;
use crate::registry::Registry;
use crate::schema::Schema;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Step(StepSpec),
    NoMatch,
}

/// Free text to step descriptor.
pub trait Translator: Send + Sync {
    fn translate(&self, text: &str, columns: &[String]) -> Translation;
}

/// Instantiate a proposed step and check it against the schema it would see.
///
/// # Errors
///
/// Unknown operation or bad parameters from the registry, or the
/// configuration/schema error the step reports for `schema`.
pub fn admit(registry: &Registry, step: &StepSpec, schema: &Schema) -> Result<Box<dyn Operation>> {
    let operation = registry.instantiate(&step.operation, &step.params)?;
    if let Some(err) = operation.validate(schema).into_error(0) {
        return Err(err);
    }
    debug!(operation = %step.operation, "Admitted translated step");
    Ok(operation)
}

/// Ask `translator` for a step over `schema` and admit it.
/// `Ok(None)` when the translator found no match.
pub fn propose(
    translator: &dyn Translator,
    registry: &Registry,
    text: &str,
    schema: &Schema,
) -> Result<Option<Box<dyn Operation>>> {
    let columns = schema.names();
    match translator.translate(text, &columns) {
        Translation::Step(step) => admit(registry, &step, schema).map(Some),
        Translation::NoMatch => {
            info!(columns = columns.len(), "Translator found no matching operation");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::schema::ColumnType;
    use serde_json::json;

    /// Maps "keep <column>" onto select_columns, without checking the column.
    struct KeepTranslator;

    impl Translator for KeepTranslator {
        fn translate(&self, text: &str, _columns: &[String]) -> Translation {
            match text.strip_prefix("keep ") {
                Some(column) => Translation::Step(StepSpec::from_json_params(
                    "select_columns",
                    json!({"columns": [column.trim()]}),
                )),
                None => Translation::NoMatch,
            }
        }
    }

    fn schema() -> Schema {
        Schema::from_pairs([("store", ColumnType::String), ("amount", ColumnType::Number)])
            .expect("valid schema")
    }

    #[test]
    fn test_admits_valid_step() -> anyhow::Result<()> {
        let registry = Registry::with_builtins();
        let op = propose(&KeepTranslator, &registry, "keep amount", &schema())?
            .expect("translator matched");
        assert_eq!(op.name(), "select_columns");
        assert_eq!(op.output_schema(&schema())?.names(), vec!["amount"]);
        Ok(())
    }

    #[test]
    fn test_no_match_is_not_an_error() -> anyhow::Result<()> {
        let registry = Registry::with_builtins();
        assert!(propose(&KeepTranslator, &registry, "make it pretty", &schema())?.is_none());
        Ok(())
    }

    #[test]
    fn test_rejects_step_over_missing_column() {
        let registry = Registry::with_builtins();
        let err = propose(&KeepTranslator, &registry, "keep region", &schema())
            .expect_err("region is not a column");
        assert!(matches!(err, PipelineError::Schema { step: 0, .. }));
    }

    #[test]
    fn test_rejects_unknown_operation() {
        let registry = Registry::with_builtins();
        let step = StepSpec::from_json_params("summon", json!({}));
        let err = admit(&registry, &step, &schema()).expect_err("not registered");
        assert!(matches!(err, PipelineError::UnknownOperation(_)));
    }
}
