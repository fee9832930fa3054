//! Reader for the transformed input snapshot
//!
//! The upstream transform writes one parquet row per participant with
//! `record_id`, `included`, one `<geo>_allocation` string per geography
//! variable and one typed column per catalog variable. Columns missing from
//! the file are treated as all-missing.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use arrow::array::{ArrayRef, BooleanBuilder, Float64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use itertools::Itertools;

use crate::error::{ImputationError, Result};
use crate::models::{
    SourceRecord, Value, VariableCatalog, VariableGroup, VariableKind, VariableSpec,
};
use crate::utils::arrow::{extract_boolean, extract_string, extract_value};
use crate::utils::io::read_parquet;
use crate::utils::logging::{log_operation_complete, log_operation_start, log_warning};

/// Expected layout of the input snapshot
#[must_use]
pub fn input_schema(catalog: &VariableCatalog) -> SchemaRef {
    let mut fields = vec![
        Field::new("record_id", DataType::Utf8, false),
        Field::new("included", DataType::Boolean, false),
    ];
    fields.extend(
        catalog
            .group(VariableGroup::Geography)
            .map(|spec| Field::new(spec.allocation_column(), DataType::Utf8, true)),
    );
    fields.extend(
        catalog
            .variables()
            .iter()
            .map(|spec| Field::new(&spec.name, spec.kind.data_type(), true)),
    );
    Arc::new(Schema::new(fields))
}

/// Read the input snapshot at `path`
pub fn read_source_records(path: &Path, catalog: &VariableCatalog) -> Result<Vec<SourceRecord>> {
    let start = Instant::now();
    log_operation_start("Reading source records from", path);

    let batches = read_parquet(path)?;
    let mut records = Vec::new();
    for batch in &batches {
        records.extend(batch_to_source_records(batch, catalog)?);
    }

    let mut seen = BTreeSet::new();
    if let Some(dup) = records.iter().find(|r| !seen.insert(r.record_id.as_str())) {
        return Err(ImputationError::validation(format!(
            "Duplicate record id '{}' in {}",
            dup.record_id,
            path.display()
        )));
    }

    log_operation_complete("read", path, records.len(), Some(start.elapsed()));
    Ok(records)
}

/// Convert one input batch to source records
pub fn batch_to_source_records(
    batch: &RecordBatch,
    catalog: &VariableCatalog,
) -> Result<Vec<SourceRecord>> {
    let schema = batch.schema();
    let has = |name: &str| schema.index_of(name).is_ok();

    let allocation_columns: Vec<(&VariableSpec, String)> = catalog
        .group(VariableGroup::Geography)
        .map(|spec| (spec, spec.allocation_column()))
        .filter(|(_, column)| {
            let present = has(column);
            if !present {
                log_warning(&format!("Input has no '{column}' column"), None);
            }
            present
        })
        .collect();
    let value_columns: Vec<&VariableSpec> = catalog
        .variables()
        .iter()
        .filter(|spec| {
            let present = has(&spec.name);
            if !present && spec.group != VariableGroup::Geography {
                log_warning(&format!("Input has no '{}' column", spec.name), None);
            }
            present
        })
        .collect();

    let mut records = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let record_id = extract_string(batch, row, "record_id", true)?.ok_or_else(|| {
            ImputationError::validation(format!("Input row {row} has no record_id"))
        })?;
        let included = extract_boolean(batch, row, "included", true)?.unwrap_or(false);
        let mut record = SourceRecord::new(record_id, included);

        for (spec, column) in &allocation_columns {
            if let Some(raw) = extract_string(batch, row, column, false)? {
                record.allocations.insert(spec.name.clone(), raw);
            }
        }
        for spec in &value_columns {
            if let Some(value) = extract_value(batch, row, spec)? {
                record.values.insert(spec.name.clone(), value);
            }
        }
        records.push(record);
    }
    Ok(records)
}

/// Build an input batch from source records
pub fn source_records_to_batch(
    sources: &[SourceRecord],
    catalog: &VariableCatalog,
) -> Result<RecordBatch> {
    let mut ids = StringBuilder::new();
    let mut included = BooleanBuilder::new();
    for source in sources {
        ids.append_value(&source.record_id);
        included.append_value(source.included);
    }
    let mut columns: Vec<ArrayRef> = vec![Arc::new(ids.finish()), Arc::new(included.finish())];

    for spec in catalog.group(VariableGroup::Geography) {
        let mut builder = StringBuilder::new();
        for source in sources {
            builder.append_option(source.allocations.get(&spec.name));
        }
        columns.push(Arc::new(builder.finish()));
    }

    for spec in catalog.variables() {
        let values = sources.iter().map(|s| s.values.get(&spec.name)).collect_vec();
        let column: ArrayRef = match spec.kind {
            VariableKind::Continuous => {
                let mut builder = Float64Builder::with_capacity(values.len());
                for value in values {
                    builder.append_option(value.and_then(Value::as_number));
                }
                Arc::new(builder.finish())
            }
            VariableKind::Categorical | VariableKind::Ordinal => {
                let mut builder = StringBuilder::new();
                for value in values {
                    builder.append_option(value.and_then(Value::as_category));
                }
                Arc::new(builder.finish())
            }
            VariableKind::Indicator => {
                let mut builder = BooleanBuilder::with_capacity(values.len());
                for value in values {
                    builder.append_option(value.and_then(Value::as_flag));
                }
                Arc::new(builder.finish())
            }
        };
        columns.push(column);
    }

    Ok(RecordBatch::try_new(input_schema(catalog), columns)?)
}
