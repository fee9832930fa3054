//! Run orchestration
//!
//! `ImputationPipeline` owns the validated configuration, the variable catalog
//! and the imputer registry. A run builds the observed layer, opens one store
//! session, and executes the stages in dependency order on a dedicated rayon
//! pool. After each stage the output is validated, compared against the
//! failure threshold, persisted one table per variable and overlaid onto the
//! in-memory worlds the next stage reads.
//!
//! Stored tables always describe the current base: tables produced from
//! other inputs are removed when the run starts, and an aborted stage
//! removes its own tables and every downstream table.

pub mod report;
pub mod validation;

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rustc_hash::FxHasher;
use serde::Serialize;

use crate::algorithm::models::{ImputerRegistry, ModelFamily};
use crate::algorithm::stages::{
    StageContext, StageKind, StageOutput, run_childcare, run_geography, run_sociodemographic,
};
use crate::config::{FormalCareRule, StudyConfig};
use crate::error::{ImputationError, Result};
use crate::models::{
    BaseDataset, CompletedDataset, ImputationIndex, ImputedValueRow, SourceRecord,
    VariableCatalog, VariableGroup,
};
use crate::storage::{ImputationStore, MetadataEntry, StoreSession};
use crate::utils::logging::{
    create_main_progress_bar, create_stage_progress_bar, finish_progress_bar,
};

pub use report::{RunOutcome, RunReport, StageStatus, StageSummary, VariableSummary};
pub use validation::validate_stage;

/// Multiple-imputation run for one study
pub struct ImputationPipeline {
    config: StudyConfig,
    catalog: VariableCatalog,
    registry: ImputerRegistry,
    pool: rayon::ThreadPool,
}

impl ImputationPipeline {
    /// Validate inputs and build the worker pool
    pub fn new(
        config: StudyConfig,
        catalog: VariableCatalog,
        registry: ImputerRegistry,
    ) -> Result<Self> {
        config.validate()?;
        catalog.validate()?;
        registry.validate(&catalog)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("impute-worker-{i}"))
            .build()
            .map_err(|e| ImputationError::config(format!("Failed to create thread pool: {e}")))?;

        Ok(Self {
            config,
            catalog,
            registry,
            pool,
        })
    }

    /// Pipeline with the default catalog and model strategies
    pub fn with_defaults(config: StudyConfig) -> Result<Self> {
        let catalog = VariableCatalog::child_development();
        let registry = ImputerRegistry::for_catalog(&catalog);
        Self::new(config, catalog, registry)
    }

    #[must_use]
    pub const fn config(&self) -> &StudyConfig {
        &self.config
    }

    #[must_use]
    pub const fn catalog(&self) -> &VariableCatalog {
        &self.catalog
    }

    /// Run all stages for `sources` and persist the results in `store`
    ///
    /// Returns the run report. A stage that exceeds the failure threshold
    /// stops the run with `RunOutcome::Aborted`; nothing from that stage or
    /// later stages is stored, and tables they left from earlier runs are
    /// removed. Validation and storage failures are errors.
    pub fn run(
        &self,
        store: &Arc<ImputationStore>,
        sources: &[SourceRecord],
    ) -> Result<RunReport> {
        let start = Instant::now();
        let config = &self.config;
        info!("Starting imputation run\n{config}");

        let base = BaseDataset::from_source(
            sources,
            &self.catalog,
            config.allocation_tolerance,
            &config.formal_care,
        )?;
        let fingerprint = input_fingerprint(config, &self.catalog, &self.registry, sources)?;
        debug!("Input fingerprint {fingerprint}");

        let imputations = u32::try_from(config.imputations)
            .map_err(|_| ImputationError::config("imputations does not fit in u32"))?;
        let mut session = store.open_session(&config.study_id)?;
        session.create_study(&self.catalog, &base, imputations, config.seed)?;
        let stale = session.stale_variables(&fingerprint)?;
        if !stale.is_empty() {
            info!("Removing {} tables produced from other inputs", stale.len());
            session.discard(&stale)?;
        }

        let mut report = RunReport::new(
            &config.study_id,
            session.run_id(),
            config.imputations,
            config.seed,
        );
        let mut worlds: Vec<CompletedDataset> = ImputationIndex::all(config.imputations)
            .map(|m| base.complete(m))
            .collect();

        let main_pb = create_main_progress_bar(
            StageKind::ALL.len() as u64,
            Some("Imputation stages"),
            config.show_progress,
        );
        let mut aborted = false;
        for stage in StageKind::ALL {
            if aborted {
                report.record_skipped(stage, config.failure_threshold);
                continue;
            }
            main_pb.set_message(format!("Stage: {stage}"));

            let variables = self.stage_variables(stage);
            if config.resume && self.is_current(&session, &variables, &fingerprint)? {
                let counts = resume_stage(&session, &variables, &mut worlds)?;
                info!("Stage '{stage}' resumed from stored tables");
                report.record_resumed(stage, &counts, config.failure_threshold);
                main_pb.inc(1);
                continue;
            }

            let stage_start = Instant::now();
            let output = self.run_stage(stage, &base, sources, &worlds);
            let elapsed = stage_start.elapsed();

            let rate = output.failure_rate();
            if rate > config.failure_threshold {
                warn!(
                    "Stage '{stage}' failed {} of {} units ({:.2}% > {:.2}%); stopping the run",
                    output.failed(),
                    output.attempted,
                    rate * 100.0,
                    config.failure_threshold * 100.0
                );
                let abandoned: Vec<String> = StageKind::ALL
                    .iter()
                    .skip_while(|s| **s != stage)
                    .flat_map(|s| self.stage_variables(*s))
                    .collect();
                session.discard(&abandoned)?;
                report.record_stage(
                    &output,
                    stage,
                    StageStatus::Aborted,
                    config.failure_threshold,
                    elapsed,
                );
                aborted = true;
                main_pb.inc(1);
                continue;
            }

            validate_stage(&output, &worlds, &self.catalog)?;
            self.persist_stage(&session, &output, &fingerprint)?;
            overlay(&mut worlds, &output)?;

            info!(
                "Stage '{stage}' imputed {} rows in {:.2?} ({} issues)",
                output.row_count(),
                elapsed,
                output.issues.len()
            );
            report.record_stage(
                &output,
                stage,
                StageStatus::Completed,
                config.failure_threshold,
                elapsed,
            );
            main_pb.inc(1);
        }
        finish_progress_bar(&main_pb, Some("Imputation finished"));

        report.finish(session.close(), start.elapsed());
        info!(
            "Imputation run {} finished in {:.2?} with outcome {:?}",
            report.run_id,
            Duration::from_millis(report.runtime_ms),
            report.outcome
        );
        Ok(report)
    }

    fn run_stage(
        &self,
        stage: StageKind,
        base: &BaseDataset,
        sources: &[SourceRecord],
        worlds: &[CompletedDataset],
    ) -> StageOutput {
        let units = match stage {
            StageKind::Geography => self.catalog.group(VariableGroup::Geography).count(),
            _ => worlds.len(),
        };
        let pb = create_stage_progress_bar(units as u64, stage.as_str(), self.config.show_progress);
        let ctx = StageContext {
            config: &self.config,
            catalog: &self.catalog,
            registry: &self.registry,
            progress: Some(&pb),
        };

        let output = self.pool.install(|| match stage {
            StageKind::Geography => run_geography(&ctx, base, sources),
            StageKind::Sociodemographic => run_sociodemographic(&ctx, worlds),
            StageKind::Childcare => run_childcare(&ctx, worlds),
        });
        finish_progress_bar(&pb, Some(&format!("{stage} done")));
        output
    }

    /// Variables whose tables a stage owns
    fn stage_variables(&self, stage: StageKind) -> Vec<String> {
        let groups: &[VariableGroup] = match stage {
            StageKind::Geography => &[VariableGroup::Geography],
            StageKind::Sociodemographic => &[VariableGroup::Sociodemographic],
            StageKind::Childcare => &[VariableGroup::Childcare],
        };
        let mut variables: Vec<String> = self
            .catalog
            .variables()
            .iter()
            .filter(|spec| groups.contains(&spec.group))
            .map(|spec| spec.name.clone())
            .collect();
        if stage == StageKind::Childcare {
            variables.push(self.catalog.childcare().indicator.clone());
        }
        variables
    }

    fn is_current(
        &self,
        session: &StoreSession,
        variables: &[String],
        fingerprint: &str,
    ) -> Result<bool> {
        for variable in variables {
            if !session.table_is_current(variable, fingerprint)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Replace every table the stage owns, including empty ones
    fn persist_stage(
        &self,
        session: &StoreSession,
        output: &StageOutput,
        fingerprint: &str,
    ) -> Result<()> {
        let imputations = session.imputations()?;
        let mut entries = Vec::with_capacity(output.families.len());
        for (variable, family) in &output.families {
            let rows = output.rows.get(variable).map_or(&[][..], Vec::as_slice);
            let written = session.store(variable, rows)?;
            entries.push(MetadataEntry::new(
                variable,
                *family,
                imputations,
                self.config.seed,
                written,
                fingerprint,
            ));
        }
        session.record_metadata(&entries)
    }
}

/// Load a stage's stored tables and overlay them onto the worlds
fn resume_stage(
    session: &StoreSession,
    variables: &[String],
    worlds: &mut [CompletedDataset],
) -> Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    for variable in variables {
        let rows = session.get_variable_imputations(variable)?;
        overlay_rows(worlds, variable, &rows)?;
        counts.insert(variable.clone(), rows.len());
    }
    Ok(counts)
}

fn overlay(worlds: &mut [CompletedDataset], output: &StageOutput) -> Result<()> {
    for (variable, rows) in &output.rows {
        overlay_rows(worlds, variable, rows)?;
    }
    Ok(())
}

fn overlay_rows(
    worlds: &mut [CompletedDataset],
    variable: &str,
    rows: &[ImputedValueRow],
) -> Result<()> {
    let mut per_m: Vec<Vec<ImputedValueRow>> = vec![Vec::new(); worlds.len()];
    for row in rows {
        let Some(bucket) = per_m.get_mut(row.imputation.position()) else {
            return Err(ImputationError::validation(format!(
                "'{variable}' row for record '{}' has m={} beyond M={}",
                row.record_id,
                row.imputation,
                worlds.len()
            )));
        };
        bucket.push(row.clone());
    }
    for (world, rows) in worlds.iter_mut().zip(per_m) {
        world.apply(variable, &rows)?;
    }
    Ok(())
}

/// Everything that determines a run's draws
#[derive(Serialize)]
struct FingerprintInputs<'a> {
    imputations: usize,
    seed: u64,
    allocation_tolerance: f64,
    max_iterations: usize,
    convergence_tolerance: f64,
    fit_time_budget_secs: u64,
    max_weekly_care_hours: f64,
    formal_care: &'a FormalCareRule,
    catalog: &'a VariableCatalog,
    families: BTreeMap<&'a str, Option<ModelFamily>>,
    sources: &'a [SourceRecord],
}

/// Stable hash of the inputs a stored table was produced from
///
/// Worker count, progress display and the failure threshold do not change
/// any draw and are left out.
pub fn input_fingerprint(
    config: &StudyConfig,
    catalog: &VariableCatalog,
    registry: &ImputerRegistry,
    sources: &[SourceRecord],
) -> Result<String> {
    let inputs = FingerprintInputs {
        imputations: config.imputations,
        seed: config.seed,
        allocation_tolerance: config.allocation_tolerance,
        max_iterations: config.max_iterations,
        convergence_tolerance: config.convergence_tolerance,
        fit_time_budget_secs: config.fit_time_budget_secs,
        max_weekly_care_hours: config.max_weekly_care_hours,
        formal_care: &config.formal_care,
        catalog,
        families: catalog
            .variables()
            .iter()
            .map(|spec| (spec.name.as_str(), registry.family(&spec.name)))
            .collect(),
        sources,
    };
    let bytes = serde_json::to_vec(&inputs)?;
    let mut hasher = FxHasher::default();
    hasher.write(&bytes);
    Ok(format!("{:016x}", hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test::{synthetic_config, synthetic_sources};

    #[test]
    fn test_fingerprint_tracks_draw_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let config = synthetic_config(dir.path(), 3);
        let catalog = VariableCatalog::child_development();
        let registry = ImputerRegistry::for_catalog(&catalog);
        let sources = synthetic_sources(20, 1);

        let a = input_fingerprint(&config, &catalog, &registry, &sources).unwrap();
        let b = input_fingerprint(&config, &catalog, &registry, &sources).unwrap();
        assert_eq!(a, b);

        let mut more_workers = config.clone();
        more_workers.workers = 7;
        assert_eq!(a, input_fingerprint(&more_workers, &catalog, &registry, &sources).unwrap());

        let mut reseeded = config.clone();
        reseeded.seed += 1;
        assert_ne!(a, input_fingerprint(&reseeded, &catalog, &registry, &sources).unwrap());
        assert_ne!(
            a,
            input_fingerprint(&config, &catalog, &registry, &sources[1..]).unwrap()
        );
    }

    #[test]
    fn test_stage_variables_cover_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ImputationPipeline::with_defaults(synthetic_config(dir.path(), 2)).unwrap();
        let childcare = pipeline.stage_variables(StageKind::Childcare);
        assert_eq!(
            childcare,
            vec!["receives_care", "care_type", "care_hours", "formal_care"]
        );
        assert_eq!(pipeline.stage_variables(StageKind::Geography), vec!["county", "puma", "cbsa"]);
    }

    #[test]
    fn test_invalid_worker_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = synthetic_config(dir.path(), 2);
        config.workers = 0;
        assert!(matches!(
            ImputationPipeline::with_defaults(config),
            Err(ImputationError::Config { .. })
        ));
    }
}
