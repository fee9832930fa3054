//! Logging utilities for output and progress tracking
//!
//! This module provides the logging helpers used around file operations and
//! the progress bars shown while stages run.

pub mod log;
pub mod progress;

// Re-export commonly used functions for convenience
pub use log::{log_operation_complete, log_operation_start, log_warning};
pub use progress::{create_main_progress_bar, create_stage_progress_bar, finish_progress_bar};
