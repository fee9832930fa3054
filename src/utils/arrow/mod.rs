//! Arrow data handling utilities
//!
//! Column lookup with type adaptation and typed per-row extraction of
//! catalog values from record batches.

pub mod array_utils;
pub mod extractors;

// Re-export commonly used functions for convenience
pub use array_utils::{downcast_array, get_column};
pub use extractors::{extract_boolean, extract_float64, extract_string, extract_value};
