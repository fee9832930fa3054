//! Test helper functions

use std::path::Path;

use crate::error::Result;
use crate::models::{SourceRecord, VariableCatalog};
use crate::reader::source_records_to_batch;
use crate::utils::io::write_parquet;

/// Write source records in the transformed input layout
pub fn write_source_parquet(
    path: &Path,
    sources: &[SourceRecord],
    catalog: &VariableCatalog,
) -> Result<usize> {
    let batch = source_records_to_batch(sources, catalog)?;
    write_parquet(path, batch.schema(), &[batch])
}
