//! Record-level data structures
//!
//! `SourceRecord` is one row of the transformed input snapshot. The observed
//! layer built from it is the `BaseDataset`; overlaying the imputation rows of
//! one index `m` onto a copy of it gives a `CompletedDataset`.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanBuilder, Float64Builder, StringBuilder};
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use log::warn;
use serde::{Deserialize, Serialize};

use super::types::{ImputationIndex, Value, VariableGroup, VariableKind};
use super::variable::VariableCatalog;
use crate::algorithm::allocation::AllocationDistribution;
use crate::config::FormalCareRule;
use crate::error::{ImputationError, Result};

/// One participant row from the transformed input
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceRecord {
    pub record_id: String,
    pub included: bool,
    /// Geography variable name to its `unit:weight;...` allocation string
    #[serde(default)]
    pub allocations: BTreeMap<String, String>,
    /// Observed values; an absent key is a missing value
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl SourceRecord {
    pub fn new(record_id: impl Into<String>, included: bool) -> Self {
        Self {
            record_id: record_id.into(),
            included,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_allocation(mut self, variable: &str, allocation: impl Into<String>) -> Self {
        self.allocations.insert(variable.to_string(), allocation.into());
        self
    }

    #[must_use]
    pub fn with_value(mut self, variable: &str, value: Value) -> Self {
        self.values.insert(variable.to_string(), value);
        self
    }
}

/// One imputed cell destined for the `(study, variable)` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputedValueRow {
    pub record_id: String,
    pub imputation: ImputationIndex,
    pub value: Value,
}

impl ImputedValueRow {
    pub fn new(record_id: impl Into<String>, imputation: ImputationIndex, value: Value) -> Self {
        Self {
            record_id: record_id.into(),
            imputation,
            value,
        }
    }
}

/// Imputation rows keyed by variable name
pub type ImputedRows = BTreeMap<String, Vec<ImputedValueRow>>;

/// A record with observed and (possibly) imputed values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedRecord {
    pub record_id: String,
    pub included: bool,
    pub values: BTreeMap<String, Value>,
}

impl CompletedRecord {
    #[must_use]
    pub fn get(&self, variable: &str) -> Option<&Value> {
        self.values.get(variable)
    }
}

fn position_of(records: &[CompletedRecord], record_id: &str) -> Option<usize> {
    records
        .binary_search_by(|r| r.record_id.as_str().cmp(record_id))
        .ok()
}

/// The observed layer of a study, sorted by record id
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BaseDataset {
    records: Vec<CompletedRecord>,
}

impl BaseDataset {
    /// Build the observed layer from the transformed input
    ///
    /// Geography columns are filled only where the allocation puts all of its
    /// weight on a single unit. Allocation strings that fail to parse are left
    /// missing here; the geography stage reports them. The derived indicator
    /// is set only when both care type and hours are observed.
    pub fn from_source(
        records: &[SourceRecord],
        catalog: &VariableCatalog,
        allocation_tolerance: f64,
        rule: &FormalCareRule,
    ) -> Result<Self> {
        let mut rows = Vec::with_capacity(records.len());
        for source in records {
            let mut values = BTreeMap::new();
            for spec in catalog.variables() {
                if spec.group == VariableGroup::Geography {
                    if let Some(value) = source.values.get(&spec.name) {
                        values.insert(spec.name.clone(), value.clone());
                    } else if let Some(raw) = source.allocations.get(&spec.name) {
                        if let Ok(distribution) =
                            AllocationDistribution::parse(raw, allocation_tolerance)
                        {
                            if let Some(unit) = distribution.determined_unit() {
                                values.insert(spec.name.clone(), Value::category(unit));
                            }
                        }
                    }
                    continue;
                }
                if let Some(value) = source.values.get(&spec.name) {
                    if !value.matches_kind(spec.kind) || value.is_null_like() {
                        return Err(ImputationError::validation(format!(
                            "Record '{}' has a {value:?} value for {:?} variable '{}'",
                            source.record_id, spec.kind, spec.name
                        )));
                    }
                    values.insert(spec.name.clone(), value.clone());
                }
            }

            let roles = catalog.childcare();
            if !values.contains_key(&roles.indicator) {
                let care_type = values.get(&roles.care_type).and_then(Value::as_category);
                let hours = values.get(&roles.care_hours).and_then(Value::as_number);
                if let Some((care_type, hours)) = care_type.zip(hours) {
                    let flag = rule.evaluate(care_type, hours);
                    values.insert(roles.indicator.clone(), Value::Flag(flag));
                }
            }

            rows.push(CompletedRecord {
                record_id: source.record_id.clone(),
                included: source.included,
                values,
            });
        }

        Self::from_records(rows)
    }

    /// Wrap already-built records, sorting them and rejecting duplicate ids
    pub fn from_records(mut records: Vec<CompletedRecord>) -> Result<Self> {
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        if let Some(pair) = records.windows(2).find(|w| w[0].record_id == w[1].record_id) {
            return Err(ImputationError::validation(format!(
                "Duplicate record id '{}' in base dataset",
                pair[0].record_id
            )));
        }
        Ok(Self { records })
    }

    #[must_use]
    pub fn records(&self) -> &[CompletedRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, record_id: &str) -> Option<&CompletedRecord> {
        position_of(&self.records, record_id).map(|i| &self.records[i])
    }

    #[must_use]
    pub fn contains(&self, record_id: &str) -> bool {
        position_of(&self.records, record_id).is_some()
    }

    /// Start a completed world for index `m` from the observed layer
    #[must_use]
    pub fn complete(&self, imputation: ImputationIndex) -> CompletedDataset {
        CompletedDataset {
            imputation,
            records: self.records.clone(),
        }
    }

    /// Arrow view of the observed layer
    pub fn to_record_batch(&self, catalog: &VariableCatalog) -> Result<RecordBatch> {
        records_to_batch(&self.records, catalog)
    }
}

/// One fully materialized world for a single imputation index
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedDataset {
    imputation: ImputationIndex,
    records: Vec<CompletedRecord>,
}

impl CompletedDataset {
    #[must_use]
    pub const fn imputation(&self) -> ImputationIndex {
        self.imputation
    }

    #[must_use]
    pub fn records(&self) -> &[CompletedRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn record(&self, record_id: &str) -> Option<&CompletedRecord> {
        position_of(&self.records, record_id).map(|i| &self.records[i])
    }

    /// Completed value of one variable for one record
    #[must_use]
    pub fn value(&self, record_id: &str, variable: &str) -> Option<&Value> {
        self.record(record_id).and_then(|r| r.get(variable))
    }

    /// Overlay imputation rows that belong to this world
    ///
    /// Rows for other indices are a caller bug and are rejected, as are rows
    /// for records that are not part of the dataset.
    pub fn apply(&mut self, variable: &str, rows: &[ImputedValueRow]) -> Result<usize> {
        let mut applied = 0;
        for row in rows {
            if row.imputation != self.imputation {
                return Err(ImputationError::validation(format!(
                    "Row for m={} applied to completed dataset m={}",
                    row.imputation, self.imputation
                )));
            }
            let Some(idx) = position_of(&self.records, &row.record_id) else {
                return Err(ImputationError::validation(format!(
                    "Imputation row for unknown record '{}' in '{variable}'",
                    row.record_id
                )));
            };
            self.records[idx]
                .values
                .insert(variable.to_string(), row.value.clone());
            applied += 1;
        }
        Ok(applied)
    }

    /// Arrow view of the completed world
    pub fn to_record_batch(&self, catalog: &VariableCatalog) -> Result<RecordBatch> {
        records_to_batch(&self.records, catalog)
    }
}

/// Arrow schema shared by base and completed datasets
#[must_use]
pub fn dataset_schema(catalog: &VariableCatalog) -> SchemaRef {
    let mut fields = vec![
        Field::new("record_id", arrow::datatypes::DataType::Utf8, false),
        Field::new("included", arrow::datatypes::DataType::Boolean, false),
    ];
    fields.extend(
        catalog
            .variables()
            .iter()
            .map(|v| Field::new(&v.name, v.kind.data_type(), true)),
    );
    Arc::new(Schema::new(fields))
}

fn records_to_batch(records: &[CompletedRecord], catalog: &VariableCatalog) -> Result<RecordBatch> {
    let mut ids = StringBuilder::new();
    let mut included = BooleanBuilder::new();
    for record in records {
        ids.append_value(&record.record_id);
        included.append_value(record.included);
    }
    let mut columns: Vec<ArrayRef> = vec![Arc::new(ids.finish()), Arc::new(included.finish())];

    for spec in catalog.variables() {
        let column: ArrayRef = match spec.kind {
            VariableKind::Continuous => {
                let mut builder = Float64Builder::with_capacity(records.len());
                for record in records {
                    builder.append_option(record.get(&spec.name).and_then(Value::as_number));
                }
                Arc::new(builder.finish())
            }
            VariableKind::Categorical | VariableKind::Ordinal => {
                let mut builder = StringBuilder::new();
                for record in records {
                    builder.append_option(record.get(&spec.name).and_then(Value::as_category));
                }
                Arc::new(builder.finish())
            }
            VariableKind::Indicator => {
                let mut builder = BooleanBuilder::with_capacity(records.len());
                for record in records {
                    builder.append_option(record.get(&spec.name).and_then(Value::as_flag));
                }
                Arc::new(builder.finish())
            }
        };
        columns.push(column);
    }

    let unexpected = records
        .iter()
        .flat_map(|r| r.values.keys())
        .find(|name| catalog.get(name).is_none());
    if let Some(name) = unexpected {
        warn!("Dropping column '{name}' that is not part of the variable catalog");
    }

    Ok(RecordBatch::try_new(dataset_schema(catalog), columns)?)
}
