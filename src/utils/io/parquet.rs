//! Parquet file operations
//!
//! This module provides utilities for reading Parquet files into Arrow record
//! batches and for writing tables with full-replace semantics: a table is
//! written to a temporary sibling and renamed over the destination, so a
//! reader never sees a partially written file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use itertools::Itertools;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::error::util::{ensure_directory, replace_file, safe_open_file};
use crate::error::{ImputationError, Result};
use crate::utils::logging::{log_operation_complete, log_operation_start, log_warning};

/// Default batch size for Parquet reading
pub const DEFAULT_BATCH_SIZE: usize = 16384;

/// Helper function to get batch size from environment
#[must_use]
pub fn get_batch_size() -> Option<usize> {
    std::env::var("PARQUET_BATCH_SIZE")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
}

/// Read a parquet file into Arrow record batches
///
/// # Arguments
/// * `path` - Path to the Parquet file
///
/// # Returns
/// A vector of `RecordBatch` objects
pub fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>> {
    let start = Instant::now();
    log_operation_start("Reading parquet file", path);

    let file = safe_open_file(path, "parquet read")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(get_batch_size().unwrap_or(DEFAULT_BATCH_SIZE));
    let reader = builder.build()?;
    let batches: Vec<RecordBatch> = reader.collect::<std::result::Result<_, _>>()?;

    let rows = batches.iter().map(RecordBatch::num_rows).sum();
    log_operation_complete("read", path, rows, Some(start.elapsed()));
    Ok(batches)
}

/// Read only the Arrow schema of a parquet file
pub fn read_parquet_schema(path: &Path) -> Result<SchemaRef> {
    let file = safe_open_file(path, "parquet schema")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    Ok(builder.schema().clone())
}

/// Write record batches to `path`, replacing any existing file
///
/// The file is written to `<path>.tmp` first and renamed into place once the
/// footer is flushed.
pub fn write_parquet(path: &Path, schema: SchemaRef, batches: &[RecordBatch]) -> Result<usize> {
    let start = Instant::now();
    if let Some(parent) = path.parent() {
        ensure_directory(parent, "parquet output")?;
    }
    let tmp = temp_path(path);
    let file = File::create(&tmp).map_err(|e| {
        ImputationError::path_with_source(&tmp, "Failed to create temporary table file", e)
    })?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let written = (|| -> Result<usize> {
        let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
        let mut rows = 0;
        for batch in batches {
            writer.write(batch)?;
            rows += batch.num_rows();
        }
        writer.close()?;
        Ok(rows)
    })();

    let rows = match written {
        Ok(rows) => rows,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
    };
    replace_file(&tmp, path)?;
    log_operation_complete("wrote", path, rows, Some(start.elapsed()));
    Ok(rows)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Find all Parquet files in a directory, sorted by path
///
/// A missing directory yields an empty list.
pub fn find_parquet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ImputationError::path_with_source(dir, "Failed to read directory", e)
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "parquet") {
            files.push(path);
        }
    }

    if files.is_empty() {
        log_warning("No Parquet files found in directory", Some(dir));
    }
    Ok(files.into_iter().sorted().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{StringArray, UInt32Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("record_id", DataType::Utf8, false),
            Field::new("imputation_index", DataType::UInt32, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a", "b"])),
                Arc::new(UInt32Array::from(vec![1, 2])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("table.parquet");
        let batch = batch();
        assert_eq!(write_parquet(&path, batch.schema(), &[batch.clone()]).unwrap(), 2);
        assert!(!temp_path(&path).exists());

        let read = read_parquet(&path).unwrap();
        assert_eq!(read.iter().map(RecordBatch::num_rows).sum::<usize>(), 2);
        assert_eq!(read_parquet_schema(&path).unwrap().fields(), batch.schema().fields());
    }

    #[test]
    fn test_find_parquet_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let batch = batch();
        for name in ["b.parquet", "a.parquet"] {
            write_parquet(&dir.path().join(name), batch.schema(), &[batch.clone()]).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let files = find_parquet_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.parquet", "b.parquet"]);
        assert!(find_parquet_files(&dir.path().join("missing")).unwrap().is_empty());
    }
}
