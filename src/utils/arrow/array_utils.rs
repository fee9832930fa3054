//! Utilities for working with Arrow arrays.
//!
//! This module provides utility functions for safely extracting columns from
//! record batches, casting them to the type the catalog expects.

use arrow::array::{Array, ArrayRef};
use arrow::compute::{can_cast_types, cast};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use log::{debug, warn};

use crate::error::{ImputationError, Result};

/// Get a column from a record batch with automatic type adaptation
///
/// # Arguments
///
/// * `batch` - The record batch containing the column
/// * `column_name` - The name of the column to extract
/// * `expected_type` - The expected data type for the column
/// * `required` - Whether the column is required (error if missing) or optional (None if missing)
///
/// # Returns
///
/// * `Ok(Some(ArrayRef))` - The column array (cast if necessary) if found
/// * `Ok(None)` - If the column is not found and `required` is false
/// * `Err` - If the column is missing but required, or cannot be cast
pub fn get_column(
    batch: &RecordBatch,
    column_name: &str,
    expected_type: &DataType,
    required: bool,
) -> Result<Option<ArrayRef>> {
    let Ok(idx) = batch.schema().index_of(column_name) else {
        if required {
            return Err(ImputationError::schema(format!(
                "Column '{column_name}' not found in record batch"
            )));
        }
        warn!("Column '{column_name}' not found in record batch");
        return Ok(None);
    };

    let column = batch.column(idx);
    let actual_type = column.data_type();
    if actual_type == expected_type {
        return Ok(Some(column.clone()));
    }

    if !can_cast_types(actual_type, expected_type) {
        return Err(ImputationError::schema(format!(
            "Column '{column_name}' has type {actual_type:?}, expected {expected_type:?}"
        )));
    }
    debug!("Casting column '{column_name}' from {actual_type:?} to {expected_type:?}");
    Ok(Some(cast(column, expected_type)?))
}

/// Downcast an array reference to a concrete array type
///
/// # Arguments
///
/// * `array` - The array to downcast
/// * `column_name` - Column name used in the error message
/// * `type_name` - Human-readable name of the expected type
pub fn downcast_array<'a, T: Array + 'static>(
    array: &'a ArrayRef,
    column_name: &str,
    type_name: &str,
) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        ImputationError::schema(format!(
            "Column '{column_name}' could not be read as a {type_name} array"
        ))
    })
}
