//! IO utilities for file operations
//!
//! This module provides the Parquet read and write helpers used by the
//! input reader and the imputation store.

pub mod parquet;

// Re-export commonly used functions for convenience
pub use parquet::{find_parquet_files, read_parquet, read_parquet_schema, write_parquet};
