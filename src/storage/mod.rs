//! Selective imputation storage
//!
//! Only values that needed imputation are persisted, one parquet table per
//! `(study, variable)` with rows `(record_id, imputation_index, value)`. The
//! observed layer is stored once per study as `base.parquet`; completed
//! datasets are composed at retrieval time by overlaying the rows of one
//! index `m` onto the base.
//!
//! ```text
//! <root>/<study>/study.json
//! <root>/<study>/base.parquet
//! <root>/<study>/imputation_metadata.parquet
//! <root>/<study>/imputations/<variable>.parquet
//! ```
//!
//! All access goes through a [`StoreSession`] scoped to one study and run.

pub mod async_ops;
pub mod metadata;
pub mod tables;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use log::{debug, info};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::util::{ensure_directory, remove_file_if_exists, replace_file, safe_open_file};
use crate::error::{ImputationError, Result};
use crate::models::{
    BaseDataset, CompletedDataset, ImputationIndex, ImputedValueRow, VariableCatalog, VariableKind,
};
use crate::utils::io::{find_parquet_files, read_parquet, write_parquet};

pub use metadata::MetadataEntry;

const MANIFEST_FILE: &str = "study.json";
const BASE_FILE: &str = "base.parquet";
const METADATA_FILE: &str = "imputation_metadata.parquet";
const IMPUTATIONS_DIR: &str = "imputations";

/// Study-level facts needed to validate and compose imputations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyManifest {
    pub study_id: String,
    pub imputations: u32,
    pub seed: u64,
    pub created_at: String,
    pub catalog: VariableCatalog,
}

/// Root of the imputation store
#[derive(Debug)]
pub struct ImputationStore {
    root: PathBuf,
    /// One writer lock per table path
    locks: Mutex<FxHashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ImputationStore {
    /// Open (creating if needed) the store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        ensure_directory(&root, "imputation store root")?;
        Ok(Arc::new(Self {
            root,
            locks: Mutex::new(FxHashMap::default()),
        }))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn study_dir(&self, study_id: &str) -> PathBuf {
        self.root.join(study_id)
    }

    #[must_use]
    pub fn table_path(&self, study_id: &str, variable: &str) -> PathBuf {
        self.study_dir(study_id)
            .join(IMPUTATIONS_DIR)
            .join(format!("{variable}.parquet"))
    }

    #[must_use]
    pub fn base_path(&self, study_id: &str) -> PathBuf {
        self.study_dir(study_id).join(BASE_FILE)
    }

    #[must_use]
    pub fn metadata_path(&self, study_id: &str) -> PathBuf {
        self.study_dir(study_id).join(METADATA_FILE)
    }

    fn manifest_path(&self, study_id: &str) -> PathBuf {
        self.study_dir(study_id).join(MANIFEST_FILE)
    }

    fn table_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Start a session for one study
    ///
    /// An existing study's manifest and base table are loaded so the session
    /// can validate and retrieve immediately.
    pub fn open_session(self: &Arc<Self>, study_id: &str) -> Result<StoreSession> {
        let run_id = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let manifest_path = self.manifest_path(study_id);
        let state = if manifest_path.is_file() {
            Some(Arc::new(self.load_state(study_id)?))
        } else {
            None
        };
        debug!("Opened store session {run_id} for study '{study_id}'");
        Ok(StoreSession {
            store: Arc::clone(self),
            study_id: study_id.to_string(),
            run_id,
            state,
            stats: SessionStats::default(),
        })
    }

    fn load_state(&self, study_id: &str) -> Result<StudyState> {
        let path = self.manifest_path(study_id);
        let file = safe_open_file(&path, "study manifest")?;
        let manifest: StudyManifest = serde_json::from_reader(std::io::BufReader::new(file))?;
        manifest.catalog.validate()?;
        let batches = read_parquet(&self.base_path(study_id))?;
        let base = tables::batches_to_base(&batches, &manifest.catalog)?;
        Ok(StudyState { manifest, base })
    }
}

#[derive(Debug)]
struct StudyState {
    manifest: StudyManifest,
    base: BaseDataset,
}

#[derive(Debug, Default)]
struct SessionStats {
    tables_written: AtomicUsize,
    rows_written: AtomicUsize,
    tables_read: AtomicUsize,
    tables_removed: AtomicUsize,
}

/// Explicit storage session for one study and one run
///
/// Dropping the session releases it; `close` does the same and reports what
/// the session wrote.
#[derive(Debug)]
pub struct StoreSession {
    store: Arc<ImputationStore>,
    study_id: String,
    run_id: String,
    state: Option<Arc<StudyState>>,
    stats: SessionStats,
}

/// What one session wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionSummary {
    pub tables_written: usize,
    pub rows_written: usize,
    pub tables_read: usize,
    pub tables_removed: usize,
}

impl StoreSession {
    #[must_use]
    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn imputation_store(&self) -> &Arc<ImputationStore> {
        &self.store
    }

    fn state(&self) -> Result<&Arc<StudyState>> {
        self.state.as_ref().ok_or_else(|| {
            ImputationError::schema(format!(
                "Study '{}' has no base dataset; create the study first",
                self.study_id
            ))
        })
    }

    /// Whether the study's base dataset exists
    #[must_use]
    pub fn has_study(&self) -> bool {
        self.state.is_some()
    }

    /// The study's stored base dataset
    pub fn base(&self) -> Result<&BaseDataset> {
        Ok(&self.state()?.base)
    }

    /// Number of completed datasets of the study
    pub fn imputations(&self) -> Result<u32> {
        Ok(self.state()?.manifest.imputations)
    }

    /// Create or replace the study: manifest and base table
    pub fn create_study(
        &mut self,
        catalog: &VariableCatalog,
        base: &BaseDataset,
        imputations: u32,
        seed: u64,
    ) -> Result<()> {
        if imputations == 0 {
            return Err(ImputationError::validation("imputations must be at least 1"));
        }
        let study_dir = self.store.study_dir(&self.study_id);
        ensure_directory(&study_dir.join(IMPUTATIONS_DIR), "imputation tables")?;

        let batch = base.to_record_batch(catalog)?;
        write_parquet(&self.store.base_path(&self.study_id), batch.schema(), &[batch])?;

        let manifest = StudyManifest {
            study_id: self.study_id.clone(),
            imputations,
            seed,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            catalog: catalog.clone(),
        };
        let path = self.store.manifest_path(&self.study_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?).map_err(|e| {
            ImputationError::path_with_source(&tmp, "Failed to write study manifest", e)
        })?;
        replace_file(&tmp, &path)?;

        info!(
            "Created study '{}' with {} base records and M={imputations}",
            self.study_id,
            base.len()
        );
        self.state = Some(Arc::new(StudyState {
            manifest,
            base: base.clone(),
        }));
        Ok(())
    }

    /// Replace the table of `variable` with exactly `rows`
    ///
    /// Rejects duplicate `(record, m)` pairs, NULL values, indices above M,
    /// unknown records, and values whose type does not match the variable.
    pub fn store(&self, variable: &str, rows: &[ImputedValueRow]) -> Result<usize> {
        let state = self.state()?;
        let spec = state.manifest.catalog.get(variable).ok_or_else(|| {
            ImputationError::schema(format!(
                "Variable '{variable}' is not part of the base schema of study '{}'",
                self.study_id
            ))
        })?;
        validate_rows(state, variable, spec.kind, rows)?;

        let mut sorted = rows.to_vec();
        sorted.sort_by(|a, b| {
            a.record_id
                .cmp(&b.record_id)
                .then(a.imputation.cmp(&b.imputation))
        });
        let batch = tables::rows_to_batch(&sorted, spec.kind)?;

        let path = self.store.table_path(&self.study_id, variable);
        let lock = self.store.table_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let written = write_parquet(&path, batch.schema(), &[batch])?;

        self.stats.tables_written.fetch_add(1, Ordering::Relaxed);
        self.stats.rows_written.fetch_add(written, Ordering::Relaxed);
        Ok(written)
    }

    /// Record provenance for the given variables, keeping other entries
    pub fn record_metadata(&self, entries: &[MetadataEntry]) -> Result<()> {
        let path = self.store.metadata_path(&self.study_id);
        let lock = self.store.table_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let existing = self.read_metadata_unlocked(&path)?;
        let merged = metadata::merge_entries(existing, entries);
        let batch = metadata::metadata_to_batch(&merged)?;
        write_parquet(&path, batch.schema(), &[batch])?;
        Ok(())
    }

    /// All metadata entries of the study
    pub fn read_metadata(&self) -> Result<Vec<MetadataEntry>> {
        let path = self.store.metadata_path(&self.study_id);
        let lock = self.store.table_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_metadata_unlocked(&path)
    }

    fn read_metadata_unlocked(&self, path: &Path) -> Result<Vec<MetadataEntry>> {
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for batch in read_parquet(path)? {
            entries.extend(metadata::batch_to_metadata(&batch)?);
        }
        Ok(entries)
    }

    /// Whether `variable`'s table exists and was produced from `fingerprint`
    pub fn table_is_current(&self, variable: &str, fingerprint: &str) -> Result<bool> {
        if !self.store.table_path(&self.study_id, variable).is_file() {
            return Ok(false);
        }
        Ok(self
            .read_metadata()?
            .iter()
            .any(|e| e.variable == variable && e.input_fingerprint == fingerprint))
    }

    /// Stored tables that were not produced from `fingerprint`
    pub fn stale_variables(&self, fingerprint: &str) -> Result<Vec<String>> {
        let current: FxHashSet<String> = self
            .read_metadata()?
            .into_iter()
            .filter(|e| e.input_fingerprint == fingerprint)
            .map(|e| e.variable)
            .collect();
        Ok(self
            .stored_variables()?
            .into_iter()
            .filter(|v| !current.contains(v))
            .collect())
    }

    /// Delete the tables of `variables` along with their metadata entries
    ///
    /// Returns how many tables existed.
    pub fn discard(&self, variables: &[String]) -> Result<usize> {
        let mut removed = 0;
        for variable in variables {
            let path = self.store.table_path(&self.study_id, variable);
            let lock = self.store.table_lock(&path);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if remove_file_if_exists(&path, "discarded imputation table")? {
                removed += 1;
            }
        }

        let path = self.store.metadata_path(&self.study_id);
        let lock = self.store.table_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = self.read_metadata_unlocked(&path)?;
        if existing.iter().any(|e| variables.contains(&e.variable)) {
            let kept: Vec<MetadataEntry> = existing
                .into_iter()
                .filter(|e| !variables.contains(&e.variable))
                .collect();
            let batch = metadata::metadata_to_batch(&kept)?;
            write_parquet(&path, batch.schema(), &[batch])?;
        }

        if removed > 0 {
            info!(
                "Removed {removed} imputation tables from study '{}'",
                self.study_id
            );
        }
        self.stats.tables_removed.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    /// Variables that currently have a stored table
    pub fn stored_variables(&self) -> Result<Vec<String>> {
        let dir = self.store.study_dir(&self.study_id).join(IMPUTATIONS_DIR);
        Ok(find_parquet_files(&dir)?
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect())
    }

    /// Rows of one variable's table, sorted by `(record, m)`
    pub fn get_variable_imputations(&self, variable: &str) -> Result<Vec<ImputedValueRow>> {
        let state = self.state()?;
        self.stats.tables_read.fetch_add(1, Ordering::Relaxed);
        read_table(&self.store, &self.study_id, state, variable)
    }

    /// One completed dataset: base plus every table's rows for `m`
    pub fn get_complete_dataset(&self, imputation: ImputationIndex) -> Result<CompletedDataset> {
        let state = self.state()?;
        compose(&self.store, &self.study_id, state, imputation)
    }

    /// All M completed datasets, each table read once
    pub fn get_imputation_list(&self) -> Result<Vec<CompletedDataset>> {
        let state = self.state()?;
        let mut worlds: Vec<CompletedDataset> =
            ImputationIndex::all(state.manifest.imputations as usize)
                .map(|m| state.base.complete(m))
                .collect();
        for spec in state.manifest.catalog.variables() {
            if !self.store.table_path(&self.study_id, &spec.name).is_file() {
                continue;
            }
            let rows = read_table(&self.store, &self.study_id, state, &spec.name)?;
            self.stats.tables_read.fetch_add(1, Ordering::Relaxed);
            let mut per_m: Vec<Vec<ImputedValueRow>> = vec![Vec::new(); worlds.len()];
            for row in rows {
                let Some(bucket) = per_m.get_mut(row.imputation.position()) else {
                    return Err(ImputationError::validation(format!(
                        "Stored '{}' row for record '{}' has m={} beyond M={}",
                        spec.name, row.record_id, row.imputation, state.manifest.imputations
                    )));
                };
                bucket.push(row);
            }
            for (world, rows) in worlds.iter_mut().zip(per_m) {
                world.apply(&spec.name, &rows)?;
            }
        }
        Ok(worlds)
    }

    /// Release the session and report what it did
    pub fn close(self) -> SessionSummary {
        let summary = SessionSummary {
            tables_written: self.stats.tables_written.load(Ordering::Relaxed),
            rows_written: self.stats.rows_written.load(Ordering::Relaxed),
            tables_read: self.stats.tables_read.load(Ordering::Relaxed),
            tables_removed: self.stats.tables_removed.load(Ordering::Relaxed),
        };
        info!(
            "Closed store session {} for study '{}': {} tables / {} rows written, \
             {} tables read, {} removed",
            self.run_id,
            self.study_id,
            summary.tables_written,
            summary.rows_written,
            summary.tables_read,
            summary.tables_removed
        );
        summary
    }
}

fn validate_rows(
    state: &StudyState,
    variable: &str,
    kind: VariableKind,
    rows: &[ImputedValueRow],
) -> Result<()> {
    let max = state.manifest.imputations;
    let mut seen: FxHashSet<(&str, ImputationIndex)> = FxHashSet::default();
    for row in rows {
        if row.imputation.get() > max {
            return Err(ImputationError::validation(format!(
                "'{variable}' row for record '{}' has m={} but the study has M={max}",
                row.record_id, row.imputation
            )));
        }
        if row.value.is_null_like() {
            return Err(ImputationError::validation(format!(
                "NULL value for '{variable}' record '{}' m={}",
                row.record_id, row.imputation
            )));
        }
        if !row.value.matches_kind(kind) {
            return Err(ImputationError::schema(format!(
                "Value {:?} for '{variable}' does not match its {kind:?} column",
                row.value
            )));
        }
        if !state.base.contains(&row.record_id) {
            return Err(ImputationError::validation(format!(
                "'{variable}' row for unknown record '{}'",
                row.record_id
            )));
        }
        if !seen.insert((row.record_id.as_str(), row.imputation)) {
            return Err(ImputationError::validation(format!(
                "Duplicate '{variable}' row for record '{}' m={}",
                row.record_id, row.imputation
            )));
        }
    }
    Ok(())
}

fn read_table(
    store: &ImputationStore,
    study_id: &str,
    state: &StudyState,
    variable: &str,
) -> Result<Vec<ImputedValueRow>> {
    let spec = state.manifest.catalog.require(variable)?;
    let path = store.table_path(study_id, variable);
    let lock = store.table_lock(&path);
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
    let mut rows = Vec::new();
    for batch in read_parquet(&path)? {
        rows.extend(tables::batch_to_rows(&batch, spec.kind)?);
    }
    Ok(rows)
}

fn compose(
    store: &ImputationStore,
    study_id: &str,
    state: &StudyState,
    imputation: ImputationIndex,
) -> Result<CompletedDataset> {
    if imputation.get() > state.manifest.imputations {
        return Err(ImputationError::validation(format!(
            "Study '{study_id}' has M={}, requested m={imputation}",
            state.manifest.imputations
        )));
    }
    let mut world = state.base.complete(imputation);
    for spec in state.manifest.catalog.variables() {
        if !store.table_path(study_id, &spec.name).is_file() {
            continue;
        }
        let rows: Vec<ImputedValueRow> = read_table(store, study_id, state, &spec.name)?
            .into_iter()
            .filter(|r| r.imputation == imputation)
            .collect();
        world.apply(&spec.name, &rows)?;
    }
    Ok(world)
}
