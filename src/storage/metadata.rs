//! Imputation metadata table
//!
//! One row per imputed variable recording how its table was produced. The
//! table is (de)serialized with `serde_arrow` from `MetadataEntry`.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::datatypes::{FieldRef, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_arrow::schema::{SchemaLike, TracingOptions};

use crate::algorithm::models::ModelFamily;
use crate::error::Result;

/// Provenance of one `(study, variable)` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub variable: String,
    pub model_family: String,
    pub imputations: u32,
    pub seed: u64,
    /// RFC 3339 generation time
    pub generated_at: String,
    pub row_count: u64,
    /// Hash of the inputs that determine the draws, for resume
    pub input_fingerprint: String,
}

impl MetadataEntry {
    /// Entry stamped with the current time
    #[must_use]
    pub fn new(
        variable: &str,
        family: ModelFamily,
        imputations: u32,
        seed: u64,
        row_count: usize,
        input_fingerprint: &str,
    ) -> Self {
        Self {
            variable: variable.to_string(),
            model_family: family.to_string(),
            imputations,
            seed,
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            row_count: row_count as u64,
            input_fingerprint: input_fingerprint.to_string(),
        }
    }
}

fn fields() -> Result<Vec<FieldRef>> {
    Ok(Vec::<FieldRef>::from_type::<MetadataEntry>(
        TracingOptions::default(),
    )?)
}

/// Encode entries as a record batch
pub fn metadata_to_batch(entries: &[MetadataEntry]) -> Result<RecordBatch> {
    let fields = fields()?;
    if entries.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::new(fields))));
    }
    Ok(serde_arrow::to_record_batch(&fields, &entries)?)
}

/// Decode entries from a record batch
pub fn batch_to_metadata(batch: &RecordBatch) -> Result<Vec<MetadataEntry>> {
    Ok(serde_arrow::from_record_batch(batch)?)
}

/// Replace the entries of the given variables, keeping the others
#[must_use]
pub fn merge_entries(
    existing: Vec<MetadataEntry>,
    updates: &[MetadataEntry],
) -> Vec<MetadataEntry> {
    let mut by_variable: BTreeMap<String, MetadataEntry> = existing
        .into_iter()
        .map(|e| (e.variable.clone(), e))
        .collect();
    for entry in updates {
        by_variable.insert(entry.variable.clone(), entry.clone());
    }
    by_variable.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(variable: &str, rows: usize) -> MetadataEntry {
        MetadataEntry::new(variable, ModelFamily::ClassificationTree, 5, 42, rows, "abc")
    }

    #[test]
    fn test_metadata_batch_decodes() {
        let entries = vec![entry("care_type", 10), entry("county", 4)];
        let batch = metadata_to_batch(&entries).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch_to_metadata(&batch).unwrap(), entries);
        assert_eq!(metadata_to_batch(&[]).unwrap().num_rows(), 0);
    }

    #[test]
    fn test_merge_replaces_by_variable() {
        let merged = merge_entries(
            vec![entry("county", 4), entry("puma", 2)],
            &[entry("county", 9)],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].row_count, 9);
        assert_eq!(merged[1].variable, "puma");
    }

    #[test]
    fn test_generated_at_is_rfc3339() {
        let e = entry("county", 1);
        assert!(chrono::DateTime::parse_from_rfc3339(&e.generated_at).is_ok());
    }
}
