//! Error taxonomy for pipeline building and execution.
//!
//! Every failure a pipeline can surface is one [`PipelineError`] variant, and
//! every variant belongs to exactly one [`ErrorKind`]:
//!
//! - **Configuration**: bad parameters, caught when an operation is
//!   instantiated or validated, never while rows move.
//! - **Schema**: missing or incompatible columns, caught while the schema is
//!   threaded through the steps.
//! - **Source**: an unreadable or malformed input file. In a multi-file batch
//!   only that file is skipped.
//! - **Backend**: the out-of-core engine rejected or failed a query. The
//!   pipeline falls back to the chunked in-memory path.
//! - **Io**: a destination could not be written. Fatal for the run.
//!
//! ```
//! use tabflow::error::{ErrorKind, PipelineError};
//!
//! let err = PipelineError::Schema { step: 2, message: "column 'amount' not found".to_owned() };
//! assert_eq!(err.kind(), ErrorKind::Schema);
//! assert_eq!(err.to_string(), "Schema error at step 3: column 'amount' not found");
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

/// Coarse error category used by the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Schema,
    Source,
    Backend,
    Io,
    Cancelled,
}

/// Main error type for tabflow operations.
#[derive(Debug)]
pub enum PipelineError {
    /// Invalid parameters or engine settings. `step` is the zero-based step
    /// index when the problem belongs to one step.
    Configuration { step: Option<usize>, message: String },

    /// A step's input schema does not satisfy the step.
    Schema { step: usize, message: String },

    /// A saved pipeline no longer validates against the source it is replayed on.
    SchemaDrift { step: usize, message: String },

    /// An operation name was registered twice.
    DuplicateName(String),

    /// No operation is registered under this name.
    UnknownOperation(String),

    /// Parameters do not satisfy the operation's parameter schema.
    Parameter { operation: String, message: String },

    /// Input file unreadable or malformed.
    Source { path: PathBuf, message: String },

    /// The partition column is absent from a source.
    MissingColumn { path: PathBuf, column: String },

    /// The out-of-core engine failed.
    Backend(String),

    /// Writing a destination failed.
    Io { path: Option<PathBuf>, source: std::io::Error },

    /// The run was cancelled between chunks.
    Cancelled,

    /// Anything else, with context.
    Other(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. }
            | Self::DuplicateName(_)
            | Self::UnknownOperation(_)
            | Self::Parameter { .. }
            | Self::Other(_) => ErrorKind::Configuration,
            Self::Schema { .. } | Self::SchemaDrift { .. } => ErrorKind::Schema,
            Self::Source { .. } | Self::MissingColumn { .. } => ErrorKind::Source,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Io { .. } => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a multi-file batch should record this error and move on to the
    /// next file instead of stopping.
    pub fn is_per_source(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Io | ErrorKind::Cancelled)
    }

    /// Step index the error points at, if any.
    pub fn step(&self) -> Option<usize> {
        match self {
            Self::Configuration { step, .. } => *step,
            Self::Schema { step, .. } | Self::SchemaDrift { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            step: None,
            message: message.into(),
        }
    }

    pub(crate) fn source_error(path: &Path, message: impl Into<String>) -> Self {
        Self::Source {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration {
                step: Some(step),
                message,
            } => write!(f, "Configuration error at step {}: {message}", step + 1),
            Self::Configuration { step: None, message } => {
                write!(f, "Configuration error: {message}")
            }
            Self::Schema { step, message } => {
                write!(f, "Schema error at step {}: {message}", step + 1)
            }
            Self::SchemaDrift { step, message } => write!(
                f,
                "Saved pipeline no longer matches the source at step {}: {message}",
                step + 1
            ),
            Self::DuplicateName(name) => write!(f, "Operation '{name}' is already registered"),
            Self::UnknownOperation(name) => write!(f, "Unknown operation '{name}'"),
            Self::Parameter { operation, message } => {
                write!(f, "Invalid parameters for '{operation}': {message}")
            }
            Self::Source { path, message } => {
                write!(f, "Source error in {}: {message}", path.display())
            }
            Self::MissingColumn { path, column } => write!(
                f,
                "Column '{column}' not found in {}",
                path.display()
            ),
            Self::Backend(msg) => write!(f, "Out-of-core engine error: {msg}"),
            Self::Io {
                path: Some(path),
                source,
            } => write!(f, "I/O error writing {}: {source}", path.display()),
            Self::Io { path: None, source } => write!(f, "I/O error: {source}"),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: None,
            source: err,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("JSON error: {err}"))
    }
}

impl From<polars::error::PolarsError> for PipelineError {
    fn from(err: polars::error::PolarsError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Result type alias for tabflow operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Attach the file an error concerns.
pub trait ResultExt<T> {
    /// Report the error as a problem with the input file at `path`.
    fn for_source(self, path: &Path) -> Result<T>;

    /// Report the error as a failed write to `path`.
    fn for_destination(self, path: &Path) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, csv::Error> {
    fn for_source(self, path: &Path) -> Result<T> {
        self.map_err(|e| PipelineError::source_error(path, e.to_string()))
    }

    fn for_destination(self, path: &Path) -> Result<T> {
        self.map_err(|e| PipelineError::Io {
            path: Some(path.to_path_buf()),
            source: std::io::Error::other(e.to_string()),
        })
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn for_source(self, path: &Path) -> Result<T> {
        self.map_err(|e| PipelineError::source_error(path, e.to_string()))
    }

    fn for_destination(self, path: &Path) -> Result<T> {
        self.map_err(|e| PipelineError::Io {
            path: Some(path.to_path_buf()),
            source: e,
        })
    }
}
