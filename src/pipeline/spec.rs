//! Persisted pipeline recipes.
//!
//! A spec is the save/load contract: a source reference plus an ordered list
//! of `{operation, params}` records. Loading a spec never runs anything;
//! [`Pipeline::from_spec`](super::Pipeline::from_spec) replays it.

use crate::operation::Params;
use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Current pipeline spec version
pub const SPEC_VERSION: &str = "0.1";

/// One configured step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Registered operation name.
    pub operation: String,
    #[serde(default)]
    pub params: Params,
}

impl StepSpec {
    pub fn new(operation: impl Into<String>, params: Params) -> Self {
        Self {
            operation: operation.into(),
            params,
        }
    }

    /// Build from a JSON object literal; anything but an object yields no
    /// parameters.
    pub fn from_json_params(operation: impl Into<String>, params: serde_json::Value) -> Self {
        let params = match params {
            serde_json::Value::Object(map) => map,
            _ => Params::new(),
        };
        Self::new(operation, params)
    }
}

/// A saved pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Format version for future migrations
    pub version: String,

    /// Human-readable pipeline name
    pub name: String,

    /// Source the steps were built against
    pub source: PathBuf,

    /// Ordered sequence of transformation steps
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            version: SPEC_VERSION.to_owned(),
            name: name.into(),
            source: source.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Load a pipeline spec from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline spec {}", path.display()))?;
        Self::from_json(&content)
    }

    /// Parse a pipeline spec from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(json).context("Failed to parse pipeline spec JSON")?;
        if spec.version != SPEC_VERSION {
            bail!(
                "Unsupported spec version '{}', expected '{SPEC_VERSION}'",
                spec.version
            );
        }
        Ok(spec)
    }

    /// Save pipeline spec to a JSON file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = self.to_json()?;
        std::fs::write(path.as_ref(), json).context("Failed to write pipeline spec file")
    }

    /// Serialize pipeline spec to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize pipeline spec")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_serialization() -> Result<()> {
        let spec = PipelineSpec::new("sales", "data/sales.csv")
            .with_step(StepSpec::from_json_params(
                "select_columns",
                json!({"columns": ["store", "amount"]}),
            ))
            .with_step(StepSpec::from_json_params(
                "group_by",
                json!({"by": ["store"], "aggregations": [{"column": "amount", "function": "sum"}]}),
            ));

        let json = spec.to_json()?;
        assert!(json.contains("\"version\": \"0.1\""));
        assert!(json.contains("\"operation\": \"group_by\""));

        let parsed = PipelineSpec::from_json(&json)?;
        assert_eq!(parsed, spec);
        Ok(())
    }

    #[test]
    fn test_file_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("recipe.json");
        let spec = PipelineSpec::new("empty", "in.csv");
        spec.to_file(&path)?;
        assert_eq!(PipelineSpec::from_file(&path)?, spec);
        Ok(())
    }

    #[test]
    fn test_rejects_unknown_version() {
        let json = r#"{"version": "9", "name": "x", "source": "a.csv", "steps": []}"#;
        assert!(PipelineSpec::from_json(json).is_err());
    }
}
