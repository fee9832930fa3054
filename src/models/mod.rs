//! Domain models for the imputation engine
//!
//! This module contains the value types, the variable catalog, and the
//! record structures that flow between stages and storage.

pub mod record;
pub mod types;
pub mod variable;

// Re-export commonly used types
pub use record::{
    BaseDataset, CompletedDataset, CompletedRecord, ImputedRows, ImputedValueRow, SourceRecord,
    dataset_schema,
};
pub use types::{ImputationIndex, Value, VariableGroup, VariableKind};
pub use variable::{
    ChildcareRoles, RECEIVES_CARE_YES, VariableCatalog, VariableCatalogBuilder, VariableSpec,
};
