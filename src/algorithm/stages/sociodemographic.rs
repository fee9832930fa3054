//! Sociodemographic stage
//!
//! Chained-equation imputation of the sociodemographic block, run separately
//! for every completed world. Each world uses its own completed geography as
//! predictors, so draws for index `m` only ever depend on upstream values of
//! the same `m`.
//!
//! Per world the chain is:
//!
//! 1. fill every missing cell from the variable's marginal distribution;
//! 2. for each cycle, refit each variable on its observed rows using the
//!    current values of everything else and redraw its missing cells;
//! 3. stop once every chain statistic moves less than the configured
//!    tolerance, or when the cycle bound is reached.
//!
//! A failed fit, an invalid draw, or an exhausted time budget aborts the
//! chain for that world and triggers one unconditional marginal pass.

use std::time::Instant;

use log::{debug, warn};
use rayon::prelude::*;

use super::{Issue, IssueKind, StageContext, StageKind, StageOutput, WorldDraws};
use crate::algorithm::models::{FeatureEncoder, MarginalImputer, ModelFamily, TrainingData};
use crate::algorithm::sampling::{FALLBACK_SALT, SeedKey, stream_rng};
use crate::error::{ImputationError, Result};
use crate::models::{
    CompletedDataset, CompletedRecord, ImputationIndex, ImputedValueRow, Value, VariableGroup,
    VariableKind, VariableSpec,
};

/// Impute the sociodemographic block for every completed world
pub fn run_sociodemographic(ctx: &StageContext<'_>, worlds: &[CompletedDataset]) -> StageOutput {
    let targets: Vec<&VariableSpec> = ctx.catalog.group(VariableGroup::Sociodemographic).collect();
    let families = targets
        .iter()
        .map(|spec| {
            let family = ctx.registry.family(&spec.name).unwrap_or(ModelFamily::Marginal);
            (spec.name.clone(), family)
        })
        .collect();
    let mut output = StageOutput::new(StageKind::Sociodemographic, families);

    let per_world: Vec<WorldDraws> = worlds
        .par_iter()
        .map(|world| {
            let draws = impute_world(ctx, &targets, world);
            ctx.tick();
            draws
        })
        .collect();

    for draws in per_world {
        output.absorb(draws);
    }
    output.finish()
}

fn impute_world<'a>(
    ctx: &StageContext<'a>,
    targets: &'a [&'a VariableSpec],
    world: &CompletedDataset,
) -> WorldDraws {
    let imputation = world.imputation();
    let mut chain = Chain::new(*ctx, targets, world);
    let attempted: usize = chain.missing.iter().map(Vec::len).sum();
    if attempted == 0 {
        return WorldDraws::default();
    }

    match chain.run() {
        Ok(cycles) => {
            debug!("Sociodemographic chain for m={imputation} finished after {cycles} cycles");
        }
        Err(e) => {
            warn!("{e}; falling back to marginal draws for m={imputation}");
            chain.initialize(FALLBACK_SALT);
            for (t, spec) in targets.iter().enumerate() {
                if chain.dead[t] || chain.missing[t].is_empty() {
                    continue;
                }
                chain.issues.push(
                    Issue::new(
                        IssueKind::Fallback,
                        &spec.name,
                        format!(
                            "{e}; {} cells drawn from the marginal distribution",
                            chain.missing[t].len()
                        ),
                    )
                    .at(imputation),
                );
            }
        }
    }

    let mut draws = WorldDraws {
        attempted,
        ..WorldDraws::default()
    };
    for (t, spec) in targets.iter().enumerate() {
        if chain.dead[t] {
            continue;
        }
        for &pos in &chain.missing[t] {
            let record = &chain.records[pos];
            match record.get(&spec.name) {
                Some(value) => draws.push(
                    &spec.name,
                    ImputedValueRow::new(&record.record_id, imputation, value.clone()),
                ),
                None => chain.issues.push(
                    Issue::new(IssueKind::Validation, &spec.name, "no value after imputation")
                        .for_record(&record.record_id)
                        .at(imputation),
                ),
            }
        }
    }
    draws.issues = chain.issues;
    draws
}

struct Chain<'a> {
    ctx: StageContext<'a>,
    targets: &'a [&'a VariableSpec],
    imputation: ImputationIndex,
    /// Working copies of the included records of this world
    records: Vec<CompletedRecord>,
    /// Per target: positions with an observed value
    observed: Vec<Vec<usize>>,
    /// Per target: positions needing a value
    missing: Vec<Vec<usize>>,
    /// Per target: no observed value to learn from
    dead: Vec<bool>,
    /// Per target: levels tracked by the chain statistic
    stat_levels: Vec<Vec<String>>,
    /// Per target: spread of observed values used to scale numeric statistics
    scales: Vec<f64>,
    issues: Vec<Issue>,
}

impl<'a> Chain<'a> {
    fn new(
        ctx: StageContext<'a>,
        targets: &'a [&'a VariableSpec],
        world: &CompletedDataset,
    ) -> Self {
        let records: Vec<CompletedRecord> = world
            .records()
            .iter()
            .filter(|r| r.included)
            .cloned()
            .collect();

        let mut observed = Vec::with_capacity(targets.len());
        let mut missing = Vec::with_capacity(targets.len());
        let mut stat_levels = Vec::with_capacity(targets.len());
        let mut scales = Vec::with_capacity(targets.len());
        for spec in targets {
            let (obs, miss): (Vec<usize>, Vec<usize>) =
                (0..records.len()).partition(|&i| records[i].get(&spec.name).is_some());

            let mut levels = spec.levels.clone();
            if levels.is_empty() && spec.kind == VariableKind::Categorical {
                levels = obs
                    .iter()
                    .filter_map(|&i| records[i].get(&spec.name).and_then(Value::as_category))
                    .map(str::to_string)
                    .collect();
                levels.sort();
                levels.dedup();
            }

            let values: Vec<f64> = obs
                .iter()
                .filter_map(|&i| records[i].get(&spec.name).and_then(Value::as_number))
                .collect();
            let scale = if values.len() > 1 {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                    / (values.len() - 1) as f64;
                if var > 0.0 { var.sqrt() } else { 1.0 }
            } else {
                1.0
            };

            observed.push(obs);
            missing.push(miss);
            stat_levels.push(levels);
            scales.push(scale);
        }

        let imputation = world.imputation();
        let mut issues = Vec::new();
        let mut dead = vec![false; targets.len()];
        for (t, spec) in targets.iter().enumerate() {
            if observed[t].is_empty() && !missing[t].is_empty() {
                dead[t] = true;
                for &pos in &missing[t] {
                    issues.push(
                        Issue::new(
                            IssueKind::Convergence,
                            &spec.name,
                            "no observed values to impute from",
                        )
                        .for_record(&records[pos].record_id)
                        .at(imputation),
                    );
                }
            }
        }

        Self {
            ctx,
            targets,
            imputation,
            records,
            observed,
            missing,
            dead,
            stat_levels,
            scales,
            issues,
        }
    }

    /// Fill every missing cell from the marginal distribution
    fn initialize(&mut self, salt: u64) {
        let targets = self.targets;
        for (t, spec) in targets.iter().enumerate() {
            if self.dead[t] || self.missing[t].is_empty() {
                continue;
            }
            let observed: Vec<Value> = self.observed[t]
                .iter()
                .filter_map(|&i| self.records[i].get(&spec.name).cloned())
                .collect();
            let fitted = match MarginalImputer::new(spec).fit_values(&observed) {
                Ok(fitted) => fitted,
                Err(e) => {
                    self.mark_dead(t, &format!("marginal fit failed: {e}"));
                    continue;
                }
            };
            for &pos in &self.missing[t] {
                let record = &mut self.records[pos];
                let key = SeedKey::new(&record.record_id, &spec.name, self.imputation)
                    .with_salt(salt);
                let mut rng = stream_rng(self.ctx.config.seed, &key);
                match fitted.draw(&mut rng) {
                    Ok(value) => {
                        record.values.insert(spec.name.clone(), value);
                    }
                    Err(_) => {
                        record.values.remove(&spec.name);
                    }
                }
            }
        }
    }

    fn mark_dead(&mut self, t: usize, message: &str) {
        self.dead[t] = true;
        let spec = self.targets[t];
        for &pos in &self.missing[t] {
            self.issues.push(
                Issue::new(IssueKind::Convergence, &spec.name, message)
                    .for_record(&self.records[pos].record_id)
                    .at(self.imputation),
            );
        }
    }

    fn predictors(&self, target: &VariableSpec) -> Vec<&'a VariableSpec> {
        self.ctx
            .catalog
            .variables()
            .iter()
            .filter(|v| {
                matches!(
                    v.group,
                    VariableGroup::Deterministic
                        | VariableGroup::Geography
                        | VariableGroup::Sociodemographic
                ) && v.name != target.name
            })
            .collect()
    }

    /// Run the chain; returns the number of cycles used
    fn run(&mut self) -> Result<usize> {
        let start = Instant::now();
        let budget = self.ctx.config.fit_time_budget();
        let max_cycles = self.ctx.config.max_iterations;
        let tolerance = self.ctx.config.convergence_tolerance;

        self.initialize(0);

        let encoders: Vec<FeatureEncoder> = {
            let refs: Vec<&CompletedRecord> = self.records.iter().collect();
            self.targets
                .iter()
                .map(|spec| FeatureEncoder::fit(&refs, &self.predictors(spec)))
                .collect()
        };

        let targets = self.targets;
        let mut previous: Option<Vec<Vec<f64>>> = None;
        for cycle in 1..=max_cycles {
            for (t, spec) in targets.iter().enumerate() {
                if self.dead[t] || self.missing[t].is_empty() {
                    continue;
                }
                if start.elapsed() >= budget {
                    return Err(ImputationError::convergence(
                        &spec.name,
                        self.imputation,
                        format!(
                            "time budget of {}s exhausted in cycle {cycle}",
                            budget.as_secs()
                        ),
                    ));
                }

                let imputer = self.ctx.registry.get(&spec.name)?;
                let mut training = TrainingData::with_capacity(self.observed[t].len());
                for &pos in &self.observed[t] {
                    let record = &self.records[pos];
                    if let Some(value) = record.get(&spec.name) {
                        training.push(encoders[t].encode(record), value.clone());
                    }
                }
                let model_key =
                    SeedKey::for_model(&spec.name, self.imputation).with_salt(cycle as u64);
                let mut model_rng = stream_rng(self.ctx.config.seed, &model_key);
                let fitted = imputer.fit(&training, &mut model_rng).map_err(|e| {
                    ImputationError::convergence(
                        &spec.name,
                        self.imputation,
                        format!("fit failed in cycle {cycle}: {e}"),
                    )
                })?;

                for &pos in &self.missing[t] {
                    let features = encoders[t].encode(&self.records[pos]);
                    let record = &mut self.records[pos];
                    let key = SeedKey::new(&record.record_id, &spec.name, self.imputation)
                        .with_salt(cycle as u64);
                    let mut rng = stream_rng(self.ctx.config.seed, &key);
                    let value = fitted.sample(&features, &mut rng).map_err(|e| {
                        ImputationError::convergence(
                            &spec.name,
                            self.imputation,
                            format!("draw failed in cycle {cycle}: {e}"),
                        )
                    })?;
                    if !value.matches_kind(spec.kind) || value.is_null_like() {
                        return Err(ImputationError::convergence(
                            &spec.name,
                            self.imputation,
                            format!("invalid draw {value:?} in cycle {cycle}"),
                        ));
                    }
                    record.values.insert(spec.name.clone(), value);
                }
            }

            let current = self.statistics();
            if let Some(prev) = &previous {
                if max_delta(prev, &current) <= tolerance {
                    return Ok(cycle);
                }
            }
            previous = Some(current);
        }

        debug!(
            "Sociodemographic chain for m={} used all {max_cycles} cycles \
             without settling below {tolerance}",
            self.imputation
        );
        Ok(max_cycles)
    }

    /// Summary of the imputed cells per target, comparable across cycles
    fn statistics(&self) -> Vec<Vec<f64>> {
        self.targets
            .iter()
            .enumerate()
            .map(|(t, spec)| {
                let cells: Vec<&Value> = self.missing[t]
                    .iter()
                    .filter_map(|&pos| self.records[pos].get(&spec.name))
                    .collect();
                if cells.is_empty() {
                    return Vec::new();
                }
                let n = cells.len() as f64;
                match spec.kind {
                    VariableKind::Continuous => {
                        let mean = cells.iter().filter_map(|v| v.as_number()).sum::<f64>() / n;
                        vec![mean / self.scales[t]]
                    }
                    VariableKind::Ordinal => {
                        let top = (spec.levels.len().max(2) - 1) as f64;
                        let mean = cells
                            .iter()
                            .filter_map(|v| v.as_category().and_then(|l| spec.level_index(l)))
                            .map(|i| i as f64)
                            .sum::<f64>()
                            / n;
                        vec![mean / top]
                    }
                    VariableKind::Categorical | VariableKind::Indicator => self.stat_levels[t]
                        .iter()
                        .map(|level| {
                            cells
                                .iter()
                                .filter(|v| v.as_category() == Some(level.as_str()))
                                .count() as f64
                                / n
                        })
                        .collect(),
                }
            })
            .collect()
    }
}

fn max_delta(previous: &[Vec<f64>], current: &[Vec<f64>]) -> f64 {
    previous
        .iter()
        .zip(current)
        .flat_map(|(a, b)| a.iter().zip(b).map(|(x, y)| (x - y).abs()))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::models::{FitError, FittedImputer, Imputer, ImputerRegistry};
    use crate::config::StudyConfig;
    use crate::models::{BaseDataset, VariableCatalog};
    use crate::utils::test::synthetic_sources;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    #[derive(Debug)]
    struct AlwaysSingular;

    impl Imputer for AlwaysSingular {
        fn family(&self) -> ModelFamily {
            ModelFamily::LinearGaussian
        }

        fn fit(
            &self,
            _data: &TrainingData,
            _rng: &mut StdRng,
        ) -> std::result::Result<Box<dyn FittedImputer>, FitError> {
            Err(FitError::Singular)
        }
    }

    fn worlds(config: &StudyConfig, catalog: &VariableCatalog) -> Vec<CompletedDataset> {
        let sources = synthetic_sources(120, 3);
        let base = BaseDataset::from_source(
            &sources,
            catalog,
            config.allocation_tolerance,
            &config.formal_care,
        )
        .unwrap();
        ImputationIndex::all(config.imputations)
            .map(|m| base.complete(m))
            .collect()
    }

    #[test]
    fn test_every_missing_cell_gets_one_value_per_world() {
        let config = StudyConfig::builder().imputations(3).seed(11).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let registry = ImputerRegistry::for_catalog(&catalog);
        let worlds = worlds(&config, &catalog);
        let ctx = StageContext {
            config: &config,
            catalog: &catalog,
            registry: &registry,
            progress: None,
        };
        let output = run_sociodemographic(&ctx, &worlds);

        assert!(output.attempted > 0);
        assert_eq!(output.failed(), 0);
        assert_eq!(output.row_count(), output.attempted);
        for (variable, rows) in &output.rows {
            let spec = catalog.require(variable).unwrap();
            for row in rows {
                assert!(row.value.matches_kind(spec.kind));
                let world = &worlds[row.imputation.position()];
                assert!(world.value(&row.record_id, variable).is_none());
            }
        }
    }

    #[test]
    fn test_chain_is_reproducible() {
        let config = StudyConfig::builder().imputations(2).seed(5).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let registry = ImputerRegistry::for_catalog(&catalog);
        let worlds = worlds(&config, &catalog);
        let ctx = StageContext {
            config: &config,
            catalog: &catalog,
            registry: &registry,
            progress: None,
        };
        let first = run_sociodemographic(&ctx, &worlds);
        let second = run_sociodemographic(&ctx, &worlds);
        assert_eq!(first.rows, second.rows);
    }

    #[test]
    fn test_fit_failure_falls_back_once_per_world() {
        let config = StudyConfig::builder().imputations(2).seed(5).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let mut registry = ImputerRegistry::for_catalog(&catalog);
        registry.register("household_income", Arc::new(AlwaysSingular));
        let worlds = worlds(&config, &catalog);
        let ctx = StageContext {
            config: &config,
            catalog: &catalog,
            registry: &registry,
            progress: None,
        };
        let output = run_sociodemographic(&ctx, &worlds);

        assert_eq!(output.failed(), 0);
        assert_eq!(output.row_count(), output.attempted);
        let fallbacks: Vec<_> = output
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::Fallback)
            .collect();
        assert!(!fallbacks.is_empty());
        for m in ImputationIndex::all(2) {
            assert!(fallbacks.iter().any(|i| i.imputation == Some(m)));
        }
    }

    #[test]
    fn test_time_budget_triggers_fallback() {
        let config = StudyConfig::builder()
            .imputations(1)
            .fit_time_budget_secs(0)
            .build()
            .unwrap();
        let catalog = VariableCatalog::child_development();
        let registry = ImputerRegistry::for_catalog(&catalog);
        let worlds = worlds(&config, &catalog);
        let ctx = StageContext {
            config: &config,
            catalog: &catalog,
            registry: &registry,
            progress: None,
        };
        let output = run_sociodemographic(&ctx, &worlds);
        assert!(output.issues.iter().any(|i| i.kind == IssueKind::Fallback));
        assert_eq!(output.row_count(), output.attempted);
    }
}
