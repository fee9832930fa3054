use std::path::Path;
use std::sync::Arc;

use study_impute::utils::test::{synthetic_config, synthetic_sources};
use study_impute::{
    ImputationPipeline, ImputationStore, Result, RunReport, SourceRecord, StudyConfig,
};

/// Records in the default synthetic snapshot
pub const SYNTHETIC_RECORDS: usize = 160;

/// Configuration for tests; a loose threshold so sampling noise never aborts
#[must_use]
pub fn test_config(root: &Path, imputations: usize) -> StudyConfig {
    let mut config = synthetic_config(root, imputations);
    config.seed = 20_240_601;
    config.failure_threshold = 0.25;
    config
}

/// The default synthetic snapshot
#[must_use]
pub fn sources() -> Vec<SourceRecord> {
    synthetic_sources(SYNTHETIC_RECORDS, 11)
}

/// Run the default pipeline over `sources` and return the report and store
pub fn run_pipeline(
    config: StudyConfig,
    sources: &[SourceRecord],
) -> Result<(RunReport, Arc<ImputationStore>)> {
    let store = ImputationStore::new(&config.storage_root)?;
    let pipeline = ImputationPipeline::with_defaults(config)?;
    let report = pipeline.run(&store, sources)?;
    Ok((report, store))
}
