//! Utility modules shared across the crate
//!
//! Arrow column helpers, parquet file IO, logging and progress reporting, and
//! the synthetic fixtures used by tests and demos.

pub mod arrow;
pub mod io;
pub mod logging;
pub mod test;

// Re-export commonly used functions for convenience
pub use io::parquet::DEFAULT_BATCH_SIZE;
pub use io::{find_parquet_files, read_parquet, write_parquet};
pub use logging::{log_operation_complete, log_operation_start, log_warning};
