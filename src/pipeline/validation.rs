//! Build-time schema propagation.
//!
//! Steps are checked in order against the running schema. The first failing
//! step stops the walk: the input schema of every later step is undefined.

use crate::error::{PipelineError, Result};
use crate::operation::{Category, Operation};
use crate::schema::Schema;
use std::sync::Arc;
use tracing::debug;

/// Running schema after every step, one entry per step.
pub fn propagate(steps: &[Arc<dyn Operation>], source: &Schema) -> Result<Vec<Schema>> {
    let mut schemas = Vec::with_capacity(steps.len());
    let mut running = source.clone();
    for (idx, step) in steps.iter().enumerate() {
        if step.category() == Category::Partition && idx + 1 != steps.len() {
            return Err(PipelineError::Configuration {
                step: Some(idx),
                message: format!("{} must be the last step", step.name()),
            });
        }
        if let Some(err) = step.validate(&running).into_error(idx) {
            return Err(err);
        }
        running = step.output_schema(&running).map_err(|e| PipelineError::Schema {
            step: idx,
            message: e.to_string(),
        })?;
        debug!(step = idx, operation = step.name(), schema = %running, "Propagated schema");
        schemas.push(running.clone());
    }
    Ok(schemas)
}

/// Rewrap a validation failure as drift of a saved pipeline.
pub fn as_drift(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Schema { step, message }
        | PipelineError::Configuration {
            step: Some(step),
            message,
        } => PipelineError::SchemaDrift { step, message },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::columns::{DropColumns, SelectColumns};
    use crate::operation::partition::{PartitionBy, PartitionParams};
    use crate::schema::ColumnType;

    fn schema() -> Schema {
        Schema::from_pairs([
            ("store", ColumnType::String),
            ("amount", ColumnType::Number),
            ("note", ColumnType::String),
        ])
        .expect("valid schema")
    }

    #[test]
    fn test_schema_threads_through_steps() -> anyhow::Result<()> {
        let steps: Vec<Arc<dyn Operation>> = vec![
            Arc::new(DropColumns::new(vec!["note".to_owned()])),
            Arc::new(SelectColumns::new(vec!["amount".to_owned()])),
        ];
        let schemas = propagate(&steps, &schema())?;
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0].names(), vec!["store", "amount"]);
        assert_eq!(schemas[1].names(), vec!["amount"]);
        Ok(())
    }

    #[test]
    fn test_first_failure_stops_the_walk() {
        let steps: Vec<Arc<dyn Operation>> = vec![
            Arc::new(DropColumns::new(vec!["note".to_owned()])),
            Arc::new(SelectColumns::new(vec!["note".to_owned()])),
            Arc::new(SelectColumns::new(vec!["missing".to_owned()])),
        ];
        let err = propagate(&steps, &schema()).expect_err("note was dropped");
        assert!(matches!(err, PipelineError::Schema { step: 1, .. }));
        assert!(matches!(as_drift(err), PipelineError::SchemaDrift { step: 1, .. }));
    }

    #[test]
    fn test_partition_must_be_last() {
        let steps: Vec<Arc<dyn Operation>> = vec![
            Arc::new(PartitionBy::new(PartitionParams {
                column: "store".to_owned(),
                output_dir: "out".into(),
            })),
            Arc::new(DropColumns::new(vec!["note".to_owned()])),
        ];
        let err = propagate(&steps, &schema()).expect_err("partition is not last");
        assert_eq!(err.step(), Some(0));
    }
}
