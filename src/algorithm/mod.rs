//! Imputation algorithms
//!
//! Allocation parsing, seeded sampling, the pluggable model strategies and
//! the three imputation stages that use them.

pub mod allocation;
pub mod models;
pub mod sampling;
pub mod stages;
