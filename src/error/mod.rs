//! Error handling for the imputation engine.
//!
//! The first four variants form the domain taxonomy: parse failures on
//! allocation strings, models that fail to converge, validation failures on
//! imputed values, and storage shape mismatches. The remaining variants wrap
//! infrastructure errors from the IO and Arrow/Parquet stack.

pub mod util;

use std::path::PathBuf;

use parquet::errors::ParquetError;
use thiserror::Error;

use crate::models::ImputationIndex;

/// Specialized error type for imputation operations
#[derive(Error, Debug)]
pub enum ImputationError {
    /// Malformed allocation string
    #[error("Parse error in allocation '{input}': {message}")]
    Parse { input: String, message: String },

    /// Model failed to stabilize within its iteration or time budget
    #[error("Convergence error for '{variable}' (m={imputation}): {message}")]
    Convergence {
        variable: String,
        imputation: ImputationIndex,
        message: String,
    },

    /// Duplicate imputation index, NULL after imputation, out-of-range value
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Storage shape mismatch
    #[error("Schema error: {message}")]
    Schema { message: String },

    /// Invalid study configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A stage exceeded its configured failure threshold
    #[error("Stage '{stage}' failed {failure_rate:.3} of its units (threshold {threshold:.3})")]
    StageFailed {
        stage: String,
        failure_rate: f64,
        threshold: f64,
    },

    /// Error opening or reading a file, with the path involved
    #[error("IO error at {path}: {message}")]
    Path {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Arrow serialization error: {0}")]
    SerdeArrow(#[from] serde_arrow::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Background task failed to complete
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ImputationError {
    /// Create a parse error for an allocation string
    pub fn parse(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            input: input.into(),
            message: message.into(),
        }
    }

    /// Create a convergence error for a variable in one completed world
    pub fn convergence(
        variable: impl Into<String>,
        imputation: ImputationIndex,
        message: impl Into<String>,
    ) -> Self {
        Self::Convergence {
            variable: variable.into(),
            imputation,
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a path-scoped IO error
    pub fn path(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a path-scoped IO error that wraps the underlying cause
    pub fn path_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Short name of the taxonomy bucket this error belongs to
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Convergence { .. } => "convergence",
            Self::Validation { .. } => "validation",
            Self::Schema { .. } => "schema",
            Self::Config { .. } => "config",
            Self::StageFailed { .. } => "stage",
            _ => "io",
        }
    }
}

/// Result type for imputation operations
pub type Result<T> = std::result::Result<T, ImputationError>;
