//! Arrow codecs for the per-variable imputation tables and the base table

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, StringArray,
    StringBuilder, UInt32Array, UInt32Builder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::error::{ImputationError, Result};
use crate::models::{
    BaseDataset, CompletedRecord, ImputationIndex, ImputedValueRow, Value, VariableCatalog,
    VariableKind,
};
use crate::utils::arrow::{
    downcast_array, extract_boolean, extract_string, extract_value, get_column,
};

pub const RECORD_ID: &str = "record_id";
pub const IMPUTATION_INDEX: &str = "imputation_index";
pub const VALUE: &str = "value";

/// Schema of one `(study, variable)` imputation table
#[must_use]
pub fn imputation_schema(kind: VariableKind) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(RECORD_ID, DataType::Utf8, false),
        Field::new(IMPUTATION_INDEX, DataType::UInt32, false),
        Field::new(VALUE, kind.data_type(), false),
    ]))
}

/// Encode rows in their given order
pub fn rows_to_batch(rows: &[ImputedValueRow], kind: VariableKind) -> Result<RecordBatch> {
    let mut ids = StringBuilder::new();
    let mut indices = UInt32Builder::with_capacity(rows.len());
    for row in rows {
        ids.append_value(&row.record_id);
        indices.append_value(row.imputation.get());
    }

    let mismatch = |row: &ImputedValueRow| {
        ImputationError::schema(format!(
            "Value {:?} for record '{}' does not fit a {kind:?} column",
            row.value, row.record_id
        ))
    };
    let values: ArrayRef = match kind {
        VariableKind::Continuous => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for row in rows {
                builder.append_value(row.value.as_number().ok_or_else(|| mismatch(row))?);
            }
            Arc::new(builder.finish())
        }
        VariableKind::Categorical | VariableKind::Ordinal => {
            let mut builder = StringBuilder::new();
            for row in rows {
                builder.append_value(row.value.as_category().ok_or_else(|| mismatch(row))?);
            }
            Arc::new(builder.finish())
        }
        VariableKind::Indicator => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for row in rows {
                builder.append_value(row.value.as_flag().ok_or_else(|| mismatch(row))?);
            }
            Arc::new(builder.finish())
        }
    };

    Ok(RecordBatch::try_new(
        imputation_schema(kind),
        vec![Arc::new(ids.finish()), Arc::new(indices.finish()), values],
    )?)
}

/// Decode an imputation table batch, rejecting NULL cells
pub fn batch_to_rows(batch: &RecordBatch, kind: VariableKind) -> Result<Vec<ImputedValueRow>> {
    let column = |name: &str, data_type: &DataType| {
        get_column(batch, name, data_type, true)?
            .ok_or_else(|| ImputationError::schema(format!("Column '{name}' missing")))
    };
    let ids_ref = column(RECORD_ID, &DataType::Utf8)?;
    let indices_ref = column(IMPUTATION_INDEX, &DataType::UInt32)?;
    let values_ref = column(VALUE, &kind.data_type())?;
    let ids = downcast_array::<StringArray>(&ids_ref, RECORD_ID, "String")?;
    let indices = downcast_array::<UInt32Array>(&indices_ref, IMPUTATION_INDEX, "UInt32")?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        if ids.is_null(i) || indices.is_null(i) || values_ref.is_null(i) {
            return Err(ImputationError::validation(format!(
                "NULL cell in stored imputation row {i}"
            )));
        }
        let value = match kind {
            VariableKind::Continuous => Value::Number(
                downcast_array::<Float64Array>(&values_ref, VALUE, "Float64")?.value(i),
            ),
            VariableKind::Categorical | VariableKind::Ordinal => Value::category(
                downcast_array::<StringArray>(&values_ref, VALUE, "String")?.value(i),
            ),
            VariableKind::Indicator => Value::Flag(
                downcast_array::<BooleanArray>(&values_ref, VALUE, "Boolean")?.value(i),
            ),
        };
        rows.push(ImputedValueRow::new(
            ids.value(i),
            ImputationIndex::new(indices.value(i))?,
            value,
        ));
    }
    Ok(rows)
}

/// Decode the stored base table
pub fn batches_to_base(batches: &[RecordBatch], catalog: &VariableCatalog) -> Result<BaseDataset> {
    let mut records = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let record_id = extract_string(batch, row, RECORD_ID, true)?.ok_or_else(|| {
                ImputationError::schema(format!("Base row {row} has no record_id"))
            })?;
            let included = extract_boolean(batch, row, "included", true)?.unwrap_or(false);
            let mut values = std::collections::BTreeMap::new();
            for spec in catalog.variables() {
                if let Some(value) = extract_value(batch, row, spec)? {
                    values.insert(spec.name.clone(), value);
                }
            }
            records.push(CompletedRecord {
                record_id,
                included,
                values,
            });
        }
    }
    BaseDataset::from_records(records)
}
