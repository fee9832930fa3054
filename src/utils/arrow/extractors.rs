//! Field extraction utilities for Arrow record batches
//!
//! Typed per-row accessors. A NULL cell, an empty string, or a NaN float all
//! read as a missing value.

use arrow::array::{Array, BooleanArray, Float64Array, StringArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;

use crate::error::Result;
use crate::models::{Value, VariableKind, VariableSpec};
use crate::utils::arrow::array_utils::{downcast_array, get_column};

/// Extract a string value from a record batch
///
/// # Returns
///
/// * `Ok(Some(String))` - The extracted string value
/// * `Ok(None)` - If the cell is null or empty, or the column is absent and not required
pub fn extract_string(
    batch: &RecordBatch,
    row: usize,
    column_name: &str,
    required: bool,
) -> Result<Option<String>> {
    let Some(array) = get_column(batch, column_name, &DataType::Utf8, required)? else {
        return Ok(None);
    };
    let string_array = downcast_array::<StringArray>(&array, column_name, "String")?;
    if row < string_array.len() && !string_array.is_null(row) {
        let value = string_array.value(row);
        if !value.is_empty() {
            return Ok(Some(value.to_string()));
        }
    }
    Ok(None)
}

/// Extract a float64 value from a record batch
pub fn extract_float64(
    batch: &RecordBatch,
    row: usize,
    column_name: &str,
    required: bool,
) -> Result<Option<f64>> {
    let Some(array) = get_column(batch, column_name, &DataType::Float64, required)? else {
        return Ok(None);
    };
    let float_array = downcast_array::<Float64Array>(&array, column_name, "Float64")?;
    if row < float_array.len() && !float_array.is_null(row) {
        let value = float_array.value(row);
        if !value.is_nan() {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Extract a boolean value from a record batch
pub fn extract_boolean(
    batch: &RecordBatch,
    row: usize,
    column_name: &str,
    required: bool,
) -> Result<Option<bool>> {
    let Some(array) = get_column(batch, column_name, &DataType::Boolean, required)? else {
        return Ok(None);
    };
    let bool_array = downcast_array::<BooleanArray>(&array, column_name, "Boolean")?;
    if row < bool_array.len() && !bool_array.is_null(row) {
        return Ok(Some(bool_array.value(row)));
    }
    Ok(None)
}

/// Extract the value of a catalog variable, typed by its kind
pub fn extract_value(
    batch: &RecordBatch,
    row: usize,
    spec: &VariableSpec,
) -> Result<Option<Value>> {
    let value = match spec.kind {
        VariableKind::Continuous => {
            extract_float64(batch, row, &spec.name, false)?.map(Value::Number)
        }
        VariableKind::Categorical | VariableKind::Ordinal => {
            extract_string(batch, row, &spec.name, false)?.map(Value::Category)
        }
        VariableKind::Indicator => extract_boolean(batch, row, &spec.name, false)?.map(Value::Flag),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VariableGroup;
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_missing_markers_read_as_none() {
        let schema = Schema::new(vec![
            Field::new("county", DataType::Utf8, true),
            Field::new("income", DataType::Float64, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec![Some("06037"), Some(""), None])),
                Arc::new(Float64Array::from(vec![Some(1.5), Some(f64::NAN), None])),
            ],
        )
        .unwrap();

        assert_eq!(extract_string(&batch, 0, "county", true).unwrap().as_deref(), Some("06037"));
        assert_eq!(extract_string(&batch, 1, "county", true).unwrap(), None);
        assert_eq!(extract_float64(&batch, 1, "income", true).unwrap(), None);

        let income =
            VariableSpec::new("income", VariableGroup::Sociodemographic, VariableKind::Continuous);
        assert_eq!(extract_value(&batch, 0, &income).unwrap(), Some(Value::Number(1.5)));
        assert_eq!(extract_value(&batch, 2, &income).unwrap(), None);
    }
}
