//! Utility functions for error handling
//!
//! Path helpers that attach the offending path and the purpose of the access
//! to IO failures.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{ImputationError, Result};

/// Safely open a file with rich error information
///
/// # Arguments
/// * `path` - The path to the file to open
/// * `purpose` - Why the file is being opened (for error context)
pub fn safe_open_file(path: &Path, purpose: &str) -> Result<fs::File> {
    if !path.exists() {
        return Err(ImputationError::path(
            path,
            format!("File not found (needed for: {purpose})"),
        ));
    }

    if !path.is_file() {
        return Err(ImputationError::path(
            path,
            format!("Path is not a file (expected a file for: {purpose})"),
        ));
    }

    fs::File::open(path).map_err(|e| {
        let context = match e.kind() {
            io::ErrorKind::PermissionDenied => {
                "Permission denied - check file permissions".to_string()
            }
            io::ErrorKind::NotFound => {
                "File not found - it may have been deleted during operation".to_string()
            }
            _ => format!("Failed to open file for: {purpose}"),
        };
        ImputationError::path_with_source(path, context, e)
    })
}

/// Create a directory (and parents) if it does not exist yet
pub fn ensure_directory(path: &Path, purpose: &str) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(ImputationError::path(
            path,
            format!("Path is not a directory (expected a directory for: {purpose})"),
        ));
    }
    fs::create_dir_all(path).map_err(|e| {
        ImputationError::path_with_source(
            path,
            format!("Failed to create directory for: {purpose}"),
            e,
        )
    })
}

/// Atomically move a fully written temporary file over its destination
pub fn replace_file(tmp: &Path, dest: &Path) -> Result<()> {
    fs::rename(tmp, dest).map_err(|e| {
        let _ = fs::remove_file(tmp);
        ImputationError::path_with_source(dest, "Failed to replace table file", e)
    })
}

/// Remove a file if it exists; returns whether there was one
pub fn remove_file_if_exists(path: &Path, purpose: &str) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ImputationError::path_with_source(
            path,
            format!("Failed to remove file for: {purpose}"),
            e,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = safe_open_file(&dir.path().join("absent.parquet"), "test").unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_ensure_directory_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(ensure_directory(&file, "test").is_err());
        assert!(ensure_directory(&dir.path().join("a/b"), "test").is_ok());
        assert!(dir.path().join("a/b").is_dir());
    }

    #[test]
    fn test_remove_file_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("table.parquet");
        fs::write(&file, b"x").unwrap();
        assert!(remove_file_if_exists(&file, "test").unwrap());
        assert!(!file.exists());
        assert!(!remove_file_if_exists(&file, "test").unwrap());
    }
}
