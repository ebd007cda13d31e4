//! Engine configuration.
//!
//! Settings persist as pretty JSON. Every field has a default, so a partial
//! file (or none at all) is a valid configuration.

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 100 MiB.
pub const DEFAULT_OUT_OF_CORE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Which backend a pipeline run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Pick by source size and step capabilities.
    #[default]
    Auto,
    InMemory,
    Chunked,
    OutOfCore,
}

impl BackendPreference {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "in_memory" | "memory" => Some(Self::InMemory),
            "chunked" => Some(Self::Chunked),
            "out_of_core" => Some(Self::OutOfCore),
            _ => None,
        }
    }
}

/// Fan-out writer limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Destination files held open at once; the least recently used one is
    /// closed when the limit is hit.
    pub max_open_files: usize,
    /// Leading rows searched for the header row.
    pub header_scan_limit: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_open_files: 256,
            header_scan_limit: 64,
        }
    }
}

/// Pipeline engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sources larger than this run out of core when every step allows it.
    pub out_of_core_threshold_bytes: u64,
    /// Rows per chunk on the chunked path.
    pub chunk_rows: usize,
    /// Rows sampled for type inference.
    pub schema_sample_rows: usize,
    /// Read the next chunk while the current one is processed.
    pub prefetch: bool,
    pub backend: BackendPreference,
    /// Scratch directory for out-of-core results; system temp dir when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
    pub fanout: FanOutConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            out_of_core_threshold_bytes: DEFAULT_OUT_OF_CORE_THRESHOLD,
            chunk_rows: 50_000,
            schema_sample_rows: crate::source::DEFAULT_SAMPLE_ROWS,
            prefetch: true,
            backend: BackendPreference::Auto,
            scratch_dir: None,
            fanout: FanOutConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default location of the user's config file.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(config_dir.join("tabflow").join("engine.json"))
    }

    /// Load configuration from disk. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config from {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&contents).context("Failed to parse engine config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize engine config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write engine config to {}", path.display()))?;
        Ok(())
    }

    /// Apply `TABFLOW_OUT_OF_CORE_THRESHOLD`, `TABFLOW_CHUNK_ROWS` and
    /// `TABFLOW_BACKEND` from the environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = var("TABFLOW_OUT_OF_CORE_THRESHOLD") {
            self.out_of_core_threshold_bytes = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid TABFLOW_OUT_OF_CORE_THRESHOLD '{raw}'"))?;
        }
        if let Some(raw) = var("TABFLOW_CHUNK_ROWS") {
            self.chunk_rows = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid TABFLOW_CHUNK_ROWS '{raw}'"))?;
        }
        if let Some(raw) = var("TABFLOW_BACKEND") {
            self.backend = BackendPreference::parse(&raw)
                .with_context(|| format!("Invalid TABFLOW_BACKEND '{raw}'"))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_rows == 0 {
            bail!("chunk_rows must be greater than zero");
        }
        if self.schema_sample_rows == 0 {
            bail!("schema_sample_rows must be greater than zero");
        }
        if self.fanout.max_open_files == 0 {
            bail!("fanout.max_open_files must be greater than zero");
        }
        if self.fanout.header_scan_limit == 0 {
            bail!("fanout.header_scan_limit must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"chunk_rows": 10, "backend": "chunked"}"#)?;

        let config = EngineConfig::load(&path)?;
        assert_eq!(config.chunk_rows, 10);
        assert_eq!(config.backend, BackendPreference::Chunked);
        assert_eq!(config.out_of_core_threshold_bytes, DEFAULT_OUT_OF_CORE_THRESHOLD);
        assert_eq!(config.fanout.max_open_files, 256);
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("engine.json");
        let config = EngineConfig {
            prefetch: false,
            ..EngineConfig::default()
        };
        config.save(&path)?;
        assert_eq!(EngineConfig::load(&path)?, config);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_default() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(
            EngineConfig::load(&dir.path().join("absent.json"))?,
            EngineConfig::default()
        );
        Ok(())
    }

    #[test]
    fn test_env_overrides() -> Result<()> {
        let config = EngineConfig::default().with_overrides(|key| match key {
            "TABFLOW_CHUNK_ROWS" => Some("128".to_owned()),
            "TABFLOW_BACKEND" => Some("out_of_core".to_owned()),
            _ => None,
        })?;
        assert_eq!(config.chunk_rows, 128);
        assert_eq!(config.backend, BackendPreference::OutOfCore);

        let bad = EngineConfig::default().with_overrides(|key| {
            (key == "TABFLOW_CHUNK_ROWS").then(|| "0".to_owned())
        });
        assert!(bad.is_err());
        Ok(())
    }
}
