//! Childcare stage
//!
//! Runs three dependent steps inside every completed world:
//!
//! - **A**: whether the child receives care, predicted from deterministic
//!   fields, geography and the completed sociodemographics. A record that
//!   reports a care type or hours but no answer to the gate question is
//!   edited to "Yes" instead of modelled; edited records never join the
//!   classifier's training rows.
//! - **B**: care type, then weekly hours, only for records whose completed
//!   gate answer is "Yes". Hours draws outside `(0, max_weekly_care_hours]`
//!   are rejected and leave the cell empty.
//! - **C**: the formal-care indicator, derived by rule from completed type
//!   and hours for every record that had any childcare value imputed in
//!   this world. Without both inputs the indicator stays absent.

use std::collections::BTreeMap;
use std::time::Instant;

use log::{debug, info, warn};
use rayon::prelude::*;

use super::{Issue, IssueKind, StageContext, StageKind, StageOutput, WorldDraws};
use crate::algorithm::models::{FeatureEncoder, MarginalImputer, ModelFamily, TrainingData};
use crate::algorithm::sampling::{FALLBACK_SALT, SeedKey, stream_rng};
use crate::error::{ImputationError, Result};
use crate::models::{
    CompletedDataset, CompletedRecord, ImputationIndex, ImputedValueRow, RECEIVES_CARE_YES, Value,
    VariableGroup, VariableSpec,
};

/// Impute the childcare sequence for every completed world
pub fn run_childcare(ctx: &StageContext<'_>, worlds: &[CompletedDataset]) -> StageOutput {
    let roles = ctx.catalog.childcare();
    let mut families = BTreeMap::new();
    for name in [&roles.receives_care, &roles.care_type, &roles.care_hours] {
        let family = ctx.registry.family(name).unwrap_or(ModelFamily::Marginal);
        families.insert(name.clone(), family);
    }
    families.insert(roles.indicator.clone(), ModelFamily::Deterministic);
    let mut output = StageOutput::new(StageKind::Childcare, families);

    let per_world: Vec<WorldDraws> = worlds
        .par_iter()
        .map(|world| {
            let draws = impute_world(ctx, world);
            ctx.tick();
            draws
        })
        .collect();

    for draws in per_world {
        output.absorb(draws);
    }
    output.finish()
}

fn impute_world(ctx: &StageContext<'_>, world: &CompletedDataset) -> WorldDraws {
    let catalog = ctx.catalog;
    let roles = catalog.childcare();
    let specs = (
        catalog.require(&roles.receives_care),
        catalog.require(&roles.care_type),
        catalog.require(&roles.care_hours),
    );
    let (Ok(receives), Ok(care_type), Ok(hours)) = specs else {
        warn!(
            "Variable catalog lacks a childcare role; skipping childcare for m={}",
            world.imputation()
        );
        return WorldDraws::default();
    };

    let mut sequence = Sequence::new(*ctx, world);
    sequence.receives_care(receives, care_type, hours);
    sequence.care_type(receives, care_type, hours);
    sequence.care_hours(receives, care_type, hours);
    sequence.indicator(care_type, hours, &roles.indicator);
    sequence.draws
}

struct Sequence<'a> {
    ctx: StageContext<'a>,
    imputation: ImputationIndex,
    records: Vec<CompletedRecord>,
    /// Records with at least one childcare value imputed in this world
    touched: Vec<bool>,
    draws: WorldDraws,
}

impl<'a> Sequence<'a> {
    fn new(ctx: StageContext<'a>, world: &CompletedDataset) -> Self {
        let records: Vec<CompletedRecord> = world
            .records()
            .iter()
            .filter(|r| r.included)
            .cloned()
            .collect();
        let touched = vec![false; records.len()];
        Self {
            ctx,
            imputation: world.imputation(),
            records,
            touched,
            draws: WorldDraws::default(),
        }
    }

    fn receives_yes(&self, pos: usize, receives: &VariableSpec) -> bool {
        self.records[pos]
            .get(&receives.name)
            .and_then(Value::as_category)
            == Some(RECEIVES_CARE_YES)
    }

    fn upstream_predictors(&self) -> Vec<&'a VariableSpec> {
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
                )
            })
            .collect()
    }

    fn observed(&self, spec: &VariableSpec) -> Vec<usize> {
        (0..self.records.len())
            .filter(|&pos| self.records[pos].get(&spec.name).is_some())
            .collect()
    }

    fn set(&mut self, pos: usize, variable: &str, value: Value) {
        let record = &mut self.records[pos];
        record.values.insert(variable.to_string(), value.clone());
        self.touched[pos] = true;
        self.draws.push(
            variable,
            ImputedValueRow::new(&record.record_id, self.imputation, value),
        );
    }

    fn skip(&mut self, pos: usize, variable: &str, message: &str) {
        self.draws.attempted += 1;
        self.draws.issues.push(
            Issue::new(IssueKind::Skipped, variable, message)
                .for_record(&self.records[pos].record_id)
                .at(self.imputation),
        );
    }

    /// Step A
    fn receives_care(
        &mut self,
        receives: &VariableSpec,
        care_type: &VariableSpec,
        hours: &VariableSpec,
    ) {
        let training = self.observed(receives);
        let mut targets = Vec::new();
        for pos in 0..self.records.len() {
            let record = &self.records[pos];
            if record.get(&receives.name).is_some() {
                continue;
            }
            self.draws.attempted += 1;
            if record.get(&care_type.name).is_some() || record.get(&hours.name).is_some() {
                self.set(pos, &receives.name, Value::category(RECEIVES_CARE_YES));
            } else {
                targets.push(pos);
            }
        }

        let predictors = self.upstream_predictors();
        self.impute(receives, &predictors, &training, &targets, |_| None);
    }

    /// Step B, care type
    fn care_type(
        &mut self,
        receives: &VariableSpec,
        care_type: &VariableSpec,
        hours: &VariableSpec,
    ) {
        let mut targets = Vec::new();
        for pos in 0..self.records.len() {
            if self.records[pos].get(&receives.name).is_none() {
                for spec in [care_type, hours] {
                    if self.records[pos].get(&spec.name).is_none() {
                        self.skip(pos, &spec.name, "receives_care has no completed value");
                    }
                }
                continue;
            }
            let missing = self.records[pos].get(&care_type.name).is_none();
            if self.receives_yes(pos, receives) && missing {
                self.draws.attempted += 1;
                targets.push(pos);
            }
        }

        let predictors = self.upstream_predictors();
        let training = self.observed(care_type);
        self.impute(care_type, &predictors, &training, &targets, |_| None);
    }

    /// Step B, weekly hours
    fn care_hours(
        &mut self,
        receives: &VariableSpec,
        care_type: &VariableSpec,
        hours: &VariableSpec,
    ) {
        let mut targets = Vec::new();
        for pos in 0..self.records.len() {
            if !self.receives_yes(pos, receives) || self.records[pos].get(&hours.name).is_some() {
                continue;
            }
            if self.records[pos].get(&care_type.name).is_none() {
                self.skip(pos, &hours.name, "care_type has no completed value");
                continue;
            }
            self.draws.attempted += 1;
            targets.push(pos);
        }

        let mut predictors: Vec<&VariableSpec> = self.upstream_predictors();
        predictors.push(care_type);
        let training = self.observed(hours);
        let max = self.ctx.config.max_weekly_care_hours;
        self.impute(hours, &predictors, &training, &targets, |value| {
            match value.as_number() {
                Some(h) if h > 0.0 && h <= max => None,
                Some(h) => Some(format!("{h:.1} weekly hours outside (0, {max}]")),
                None => Some(format!("non-numeric hours draw {value:?}")),
            }
        });
    }

    /// Step C
    fn indicator(&mut self, care_type: &VariableSpec, hours: &VariableSpec, indicator: &str) {
        let rule = &self.ctx.config.formal_care;
        let mut derived = Vec::new();
        for (pos, record) in self.records.iter().enumerate() {
            if !self.touched[pos] || record.get(indicator).is_some() {
                continue;
            }
            let kind = record.get(&care_type.name).and_then(Value::as_category);
            let weekly = record.get(&hours.name).and_then(Value::as_number);
            match kind.zip(weekly) {
                Some((kind, weekly)) => derived.push((pos, rule.evaluate(kind, weekly))),
                None => debug!(
                    "No '{indicator}' for record '{}' at m={}: inputs incomplete",
                    record.record_id, self.imputation
                ),
            }
        }

        for (pos, flag) in derived {
            self.draws.attempted += 1;
            self.set(pos, indicator, Value::Flag(flag));
        }
    }

    /// Fit, draw and write one variable; falls back to the marginal once
    fn impute(
        &mut self,
        spec: &VariableSpec,
        predictors: &[&VariableSpec],
        training: &[usize],
        targets: &[usize],
        reject: impl Fn(&Value) -> Option<String>,
    ) {
        if targets.is_empty() {
            return;
        }

        let values = match self.model_draws(spec, predictors, training, targets) {
            Ok(values) => values,
            Err(e) => {
                warn!("{e}; falling back to marginal draws for m={}", self.imputation);
                match self.fallback_draws(spec, training, targets) {
                    Ok(values) => {
                        self.draws.issues.push(
                            Issue::new(
                                IssueKind::Fallback,
                                &spec.name,
                                format!(
                                    "{e}; {} cells drawn from the marginal distribution",
                                    targets.len()
                                ),
                            )
                            .at(self.imputation),
                        );
                        values
                    }
                    Err(fallback) => {
                        warn!("Fallback for '{}' failed: {fallback}", spec.name);
                        for &pos in targets {
                            self.draws.issues.push(
                                Issue::new(IssueKind::Convergence, &spec.name, fallback.to_string())
                                    .for_record(&self.records[pos].record_id)
                                    .at(self.imputation),
                            );
                        }
                        return;
                    }
                }
            }
        };

        for (&pos, value) in targets.iter().zip(values) {
            if let Some(reason) = reject(&value) {
                info!(
                    "Rejected '{}' draw for record '{}' at m={}: {reason}",
                    spec.name, self.records[pos].record_id, self.imputation
                );
                self.draws.issues.push(
                    Issue::new(IssueKind::Rejected, &spec.name, reason)
                        .for_record(&self.records[pos].record_id)
                        .at(self.imputation),
                );
                continue;
            }
            self.set(pos, &spec.name, value);
        }
    }

    fn model_draws(
        &self,
        spec: &VariableSpec,
        predictors: &[&VariableSpec],
        training: &[usize],
        targets: &[usize],
    ) -> Result<Vec<Value>> {
        let start = Instant::now();
        let budget = self.ctx.config.fit_time_budget();
        let convergence =
            |message: String| ImputationError::convergence(&spec.name, self.imputation, message);

        let refs: Vec<&CompletedRecord> = self.records.iter().collect();
        let encoder = FeatureEncoder::fit(&refs, predictors);
        let mut data = TrainingData::with_capacity(training.len());
        for &pos in training {
            let record = &self.records[pos];
            if let Some(value) = record.get(&spec.name) {
                data.push(encoder.encode(record), value.clone());
            }
        }

        let imputer = self.ctx.registry.get(&spec.name)?;
        let model_key = SeedKey::for_model(&spec.name, self.imputation);
        let fitted = imputer
            .fit(&data, &mut stream_rng(self.ctx.config.seed, &model_key))
            .map_err(|e| convergence(format!("fit failed: {e}")))?;

        let mut values = Vec::with_capacity(targets.len());
        for &pos in targets {
            if start.elapsed() >= budget {
                return Err(convergence(format!(
                    "time budget of {}s exhausted",
                    budget.as_secs()
                )));
            }
            let record = &self.records[pos];
            let key = SeedKey::new(&record.record_id, &spec.name, self.imputation);
            let mut rng = stream_rng(self.ctx.config.seed, &key);
            let value = fitted
                .sample(&encoder.encode(record), &mut rng)
                .map_err(|e| convergence(format!("draw failed: {e}")))?;
            let declared = match value.as_category() {
                Some(level) => spec.levels.is_empty() || spec.level_index(level).is_some(),
                None => true,
            };
            if !value.matches_kind(spec.kind) || value.is_null_like() || !declared {
                return Err(convergence(format!("invalid draw {value:?}")));
            }
            values.push(value);
        }
        Ok(values)
    }

    fn fallback_draws(
        &self,
        spec: &VariableSpec,
        training: &[usize],
        targets: &[usize],
    ) -> Result<Vec<Value>> {
        let observed: Vec<Value> = training
            .iter()
            .filter_map(|&pos| self.records[pos].get(&spec.name).cloned())
            .collect();
        let fitted = MarginalImputer::new(spec)
            .fit_values(&observed)
            .map_err(|e| {
                ImputationError::convergence(
                    &spec.name,
                    self.imputation,
                    format!("marginal fit failed: {e}"),
                )
            })?;

        targets
            .iter()
            .map(|&pos| {
                let record = &self.records[pos];
                let key = SeedKey::new(&record.record_id, &spec.name, self.imputation)
                    .with_salt(FALLBACK_SALT);
                fitted.draw(&mut stream_rng(self.ctx.config.seed, &key)).map_err(|e| {
                    ImputationError::convergence(&spec.name, self.imputation, e.to_string())
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::models::{FitError, FittedImputer, Imputer, ImputerRegistry};
    use crate::config::StudyConfig;
    use crate::models::{BaseDataset, SourceRecord, VariableCatalog};
    use crate::utils::test::synthetic_sources;
    use rand::rngs::StdRng;
    use rustc_hash::FxHashSet;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    type FitResult = std::result::Result<Box<dyn FittedImputer>, FitError>;

    #[derive(Debug)]
    struct FixedHours(f64);

    struct FixedDraw(Value);

    impl Imputer for FixedHours {
        fn family(&self) -> ModelFamily {
            ModelFamily::LinearGaussian
        }

        fn fit(&self, _data: &TrainingData, _rng: &mut StdRng) -> FitResult {
            Ok(Box::new(FixedDraw(Value::Number(self.0))))
        }
    }

    impl FittedImputer for FixedDraw {
        fn sample(
            &self,
            _features: &[f64],
            _rng: &mut StdRng,
        ) -> std::result::Result<Value, FitError> {
            Ok(self.0.clone())
        }
    }

    /// Gate model that keeps the targets of every fit and answers "No"
    #[derive(Debug, Default)]
    struct RecordingGate {
        fits: Mutex<Vec<Vec<Value>>>,
    }

    impl Imputer for RecordingGate {
        fn family(&self) -> ModelFamily {
            ModelFamily::ClassificationTree
        }

        fn fit(&self, data: &TrainingData, _rng: &mut StdRng) -> FitResult {
            self.fits.lock().unwrap().push(data.targets.clone());
            Ok(Box::new(FixedDraw(Value::category("No"))))
        }
    }

    fn without_childcare(mut sources: Vec<SourceRecord>) -> Vec<SourceRecord> {
        for source in &mut sources {
            for variable in ["receives_care", "care_type", "care_hours", "formal_care"] {
                source.values.remove(variable);
            }
        }
        sources
    }

    fn worlds(
        config: &StudyConfig,
        catalog: &VariableCatalog,
        sources: &[SourceRecord],
    ) -> Vec<CompletedDataset> {
        let base = BaseDataset::from_source(
            sources,
            catalog,
            config.allocation_tolerance,
            &config.formal_care,
        )
        .unwrap();
        ImputationIndex::all(config.imputations)
            .map(|m| base.complete(m))
            .collect()
    }

    fn run(
        config: &StudyConfig,
        registry: &ImputerRegistry,
        sources: &[SourceRecord],
    ) -> (StageOutput, Vec<CompletedDataset>) {
        let catalog = VariableCatalog::child_development();
        let worlds = worlds(config, &catalog, sources);
        let ctx = StageContext {
            config,
            catalog: &catalog,
            registry,
            progress: None,
        };
        (run_childcare(&ctx, &worlds), worlds)
    }

    #[test]
    fn test_details_only_exist_for_receiving_records() {
        let config = StudyConfig::builder().imputations(3).seed(9).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let registry = ImputerRegistry::for_catalog(&catalog);
        let (output, worlds) = run(&config, &registry, &synthetic_sources(150, 4));

        assert!(output.row_count() > 0);
        for m in ImputationIndex::all(3) {
            let world = &worlds[m.position()];
            let gate: BTreeMap<&str, &Value> = output
                .rows_for("receives_care", m)
                .map(|r| (r.record_id.as_str(), &r.value))
                .collect();
            let completed_gate = |id: &str| {
                gate.get(id)
                    .copied()
                    .or_else(|| world.value(id, "receives_care"))
            };

            for variable in ["care_type", "care_hours", "formal_care"] {
                for row in output.rows_for(variable, m) {
                    assert_eq!(
                        completed_gate(&row.record_id),
                        Some(&Value::category("Yes")),
                        "{variable} imputed for non-receiving record {}",
                        row.record_id
                    );
                }
            }
            for row in output.rows_for("care_hours", m) {
                let h = row.value.as_number().unwrap();
                assert!(h > 0.0 && h <= config.max_weekly_care_hours);
            }
        }
    }

    #[test]
    fn test_imputed_no_leaves_indicator_absent() {
        let config = StudyConfig::builder().imputations(2).seed(5).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let mut registry = ImputerRegistry::for_catalog(&catalog);
        registry.register("receives_care", Arc::new(RecordingGate::default()));
        let sources = without_childcare(synthetic_sources(40, 8));
        let (output, _) = run(&config, &registry, &sources);

        let included = sources.iter().filter(|s| s.included).count();
        for m in ImputationIndex::all(2) {
            let answers: Vec<_> = output.rows_for("receives_care", m).collect();
            assert_eq!(answers.len(), included);
            assert!(answers.iter().all(|r| r.value == Value::category("No")));
            assert_eq!(output.rows_for("formal_care", m).count(), 0);
        }
    }

    #[test]
    fn test_edited_gate_stays_out_of_training() {
        let config = StudyConfig::builder().imputations(2).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let gate = Arc::new(RecordingGate::default());
        let mut registry = ImputerRegistry::for_catalog(&catalog);
        registry.register("receives_care", gate.clone());

        let mut sources = synthetic_sources(60, 1);
        sources.push(
            SourceRecord::new("edited", true).with_value("care_hours", Value::Number(30.0)),
        );
        sources.push(SourceRecord::new("unanswered", true));
        let (output, _) = run(&config, &registry, &sources);

        let observed: Vec<&Value> = sources
            .iter()
            .filter(|s| s.included)
            .filter_map(|s| s.values.get("receives_care"))
            .collect();
        let fits = gate.fits.lock().unwrap();
        assert_eq!(fits.len(), 2);
        for targets in fits.iter() {
            assert_eq!(targets.len(), observed.len());
            let yes = targets.iter().filter(|v| **v == Value::category("Yes")).count();
            let observed_yes = observed
                .iter()
                .filter(|v| ***v == Value::category("Yes"))
                .count();
            assert_eq!(yes, observed_yes);
        }
        for m in ImputationIndex::all(2) {
            let edited = output
                .rows_for("receives_care", m)
                .find(|r| r.record_id == "edited")
                .unwrap();
            assert_eq!(edited.value, Value::category("Yes"));
        }
    }

    #[test]
    fn test_failed_gate_skips_details() {
        let config = StudyConfig::builder().imputations(2).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let registry = ImputerRegistry::for_catalog(&catalog);
        // no observed gate answers: neither the tree nor the marginal can fit
        let sources = without_childcare(synthetic_sources(30, 3));
        let (output, _) = run(&config, &registry, &sources);

        assert_eq!(output.row_count(), 0);
        let issues: FxHashSet<(IssueKind, &str, &str, ImputationIndex)> = output
            .issues
            .iter()
            .filter_map(|i| {
                Some((
                    i.kind,
                    i.variable.as_str(),
                    i.record_id.as_deref()?,
                    i.imputation?,
                ))
            })
            .collect();
        for m in ImputationIndex::all(2) {
            for source in sources.iter().filter(|s| s.included) {
                let id = source.record_id.as_str();
                assert!(issues.contains(&(IssueKind::Convergence, "receives_care", id, m)));
                assert!(issues.contains(&(IssueKind::Skipped, "care_type", id, m)));
                assert!(issues.contains(&(IssueKind::Skipped, "care_hours", id, m)));
            }
        }
        assert!(!output.issues.iter().any(|i| i.variable == "formal_care"));
    }

    #[test]
    fn test_reported_care_implies_receiving() {
        let config = StudyConfig::builder().imputations(2).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let registry = ImputerRegistry::for_catalog(&catalog);
        let mut sources = synthetic_sources(60, 1);
        sources.push(
            SourceRecord::new("edited", true)
                .with_value("care_type", Value::category("Center"))
                .with_value("care_hours", Value::Number(25.0)),
        );
        let (output, _) = run(&config, &registry, &sources);

        for m in ImputationIndex::all(2) {
            let gate: Vec<_> = output
                .rows_for("receives_care", m)
                .filter(|r| r.record_id == "edited")
                .collect();
            assert_eq!(gate.len(), 1);
            assert_eq!(gate[0].value, Value::category("Yes"));
            let indicator: Vec<_> = output
                .rows_for("formal_care", m)
                .filter(|r| r.record_id == "edited")
                .collect();
            // already derivable from observed type and hours
            assert!(indicator.is_empty());
        }
    }

    #[test]
    fn test_out_of_range_hours_are_rejected() {
        let config = StudyConfig::builder().imputations(2).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let mut registry = ImputerRegistry::for_catalog(&catalog);
        registry.register("care_hours", Arc::new(FixedHours(250.0)));
        let (output, _) = run(&config, &registry, &synthetic_sources(150, 2));

        let rejected: Vec<&Issue> = output
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::Rejected)
            .collect();
        assert!(!rejected.is_empty());
        assert!(rejected.iter().all(|i| i.variable == "care_hours"));
        assert!(output.rows["care_hours"].is_empty());

        let rejected_cells: BTreeSet<(String, ImputationIndex)> = rejected
            .iter()
            .map(|i| (i.record_id.clone().unwrap(), i.imputation.unwrap()))
            .collect();
        for row in &output.rows["formal_care"] {
            assert!(!rejected_cells.contains(&(row.record_id.clone(), row.imputation)));
        }
    }

    #[test]
    fn test_childcare_is_reproducible() {
        let config = StudyConfig::builder().imputations(2).seed(77).build().unwrap();
        let catalog = VariableCatalog::child_development();
        let registry = ImputerRegistry::for_catalog(&catalog);
        let sources = synthetic_sources(80, 6);
        let (first, _) = run(&config, &registry, &sources);
        let (second, _) = run(&config, &registry, &sources);
        assert_eq!(first.rows, second.rows);
    }
}
