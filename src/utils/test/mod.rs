//! Test utilities
//!
//! Synthetic study data and helpers shared by unit and integration tests.

pub mod fixtures;
pub mod helpers;

// Re-export commonly used functions for convenience
pub use fixtures::{SYNTHETIC_STUDY, synthetic_config, synthetic_sources};
pub use helpers::write_source_parquet;
