//! A Rust library for multiple imputation of study survey data, producing M
//! completed datasets with selective Parquet storage and deterministic seeding.

pub mod algorithm;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod reader;
pub mod storage;
pub mod utils;

// Re-export the most common types for easier use
// Core types
pub use config::{FormalCareRule, StudyConfig, StudyConfigBuilder};
pub use error::{ImputationError, Result};
pub use models::{
    BaseDataset, CompletedDataset, ImputationIndex, ImputedValueRow, SourceRecord, Value,
    VariableCatalog, VariableGroup, VariableKind, VariableSpec,
};

// Algorithms
pub use algorithm::allocation::AllocationDistribution;
pub use algorithm::models::{Imputer, ImputerRegistry, ModelFamily};
pub use algorithm::stages::{Issue, IssueKind, StageKind};

// Orchestration and storage
pub use pipeline::{ImputationPipeline, RunOutcome, RunReport};
pub use reader::read_source_records;
pub use storage::{ImputationStore, MetadataEntry, StoreSession};

// Arrow types
pub use arrow::record_batch::RecordBatch;
