use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;

use crate::utils::{SYNTHETIC_RECORDS, run_pipeline, sources, test_config};
use study_impute::algorithm::models::{FitError, FittedImputer, TrainingData};
use study_impute::pipeline::StageStatus;
use study_impute::{
    ImputationError, ImputationPipeline, ImputationStore, Imputer, ImputerRegistry, IssueKind,
    ModelFamily, RunOutcome, StageKind, Value, VariableCatalog, VariableGroup,
};

/// Hours model whose every draw is out of range
#[derive(Debug)]
struct ImpossibleHours;

struct ImpossibleDraw;

impl Imputer for ImpossibleHours {
    fn family(&self) -> ModelFamily {
        ModelFamily::LinearGaussian
    }

    fn fit(
        &self,
        _data: &TrainingData,
        _rng: &mut StdRng,
    ) -> Result<Box<dyn FittedImputer>, FitError> {
        Ok(Box::new(ImpossibleDraw))
    }
}

impl FittedImputer for ImpossibleDraw {
    fn sample(&self, _features: &[f64], _rng: &mut StdRng) -> Result<Value, FitError> {
        Ok(Value::Number(250.0))
    }
}

#[test]
fn test_completed_worlds_honor_invariants() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 4);
    let rule = config.formal_care.clone();
    let (report, store) = run_pipeline(config, &sources()).unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.exit_code(), 0);
    assert!(report.stages.iter().all(|s| s.status == StageStatus::Completed));

    let catalog = VariableCatalog::child_development();
    let session = store.open_session(&report.study_id).unwrap();
    let base = session.base().unwrap().clone();
    let worlds = session.get_imputation_list().unwrap();
    assert_eq!(worlds.len(), 4);

    for world in &worlds {
        assert_eq!(world.len(), SYNTHETIC_RECORDS);
        for record in world.records() {
            if !record.included {
                assert_eq!(Some(record), base.get(&record.record_id));
                continue;
            }
            for spec in catalog.group(VariableGroup::Geography) {
                assert!(
                    record.get(&spec.name).is_some(),
                    "{} missing {}",
                    record.record_id,
                    spec.name
                );
            }

            let receiving = record.get("receives_care") == Some(&Value::category("Yes"));
            for detail in ["care_type", "care_hours"] {
                if record.get(detail).is_some() {
                    assert!(receiving, "{detail} present for non-receiving {}", record.record_id);
                }
            }
            if let Some(hours) = record.get("care_hours").and_then(Value::as_number) {
                assert!(hours > 0.0 && hours <= 168.0);
            }
            let derived = match (
                record.get("care_type").and_then(Value::as_category),
                record.get("care_hours").and_then(Value::as_number),
            ) {
                (Some(kind), Some(hours)) => Some(Value::Flag(rule.evaluate(kind, hours))),
                _ => None,
            };
            assert_eq!(record.get("formal_care"), derived.as_ref());
        }
    }

    // tables hold only cells the base leaves missing
    for variable in session.stored_variables().unwrap() {
        for row in session.get_variable_imputations(&variable).unwrap() {
            assert!((1..=4).contains(&row.imputation.get()));
            let observed = base.get(&row.record_id).and_then(|r| r.get(&variable));
            assert!(observed.is_none(), "{variable} row for determined cell {}", row.record_id);
        }
    }
}

#[test]
fn test_sociodemographics_are_complete_for_included_records() {
    let dir = tempfile::tempdir().unwrap();
    let (report, store) = run_pipeline(test_config(dir.path(), 2), &sources()).unwrap();
    let failed: Vec<_> = report
        .issues
        .iter()
        .filter(|i| i.kind.is_failure() && i.variable == "household_income")
        .collect();
    assert!(failed.is_empty());

    let catalog = VariableCatalog::child_development();
    let session = store.open_session(&report.study_id).unwrap();
    for world in session.get_imputation_list().unwrap() {
        for record in world.records().iter().filter(|r| r.included) {
            for spec in catalog.group(VariableGroup::Sociodemographic) {
                assert!(record.get(&spec.name).is_some());
            }
        }
    }
    assert_eq!(
        report.variables["formal_care"].family,
        Some(ModelFamily::Deterministic)
    );
}

#[test]
fn test_rerun_produces_identical_tables() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let (report, _) = run_pipeline(test_config(first.path(), 3), &sources()).unwrap();
    run_pipeline(test_config(second.path(), 3), &sources()).unwrap();

    let tables = |root: &std::path::Path| -> BTreeSet<String> {
        std::fs::read_dir(root.join(&report.study_id).join("imputations"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    };
    let names = tables(first.path());
    assert_eq!(names, tables(second.path()));
    assert!(names.contains("county.parquet"));

    for name in &names {
        let table = |root: &std::path::Path| {
            std::fs::read(root.join(&report.study_id).join("imputations").join(name)).unwrap()
        };
        let (a, b) = (table(first.path()), table(second.path()));
        assert_eq!(a, b, "{name} differs between runs");
    }
}

#[test]
fn test_geography_failures_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut sources = sources();
    for source in &mut sources {
        source
            .allocations
            .insert("county".to_string(), "06037:0.5;06059:0.2".to_string());
    }
    let (report, store) = run_pipeline(test_config(dir.path(), 2), &sources).unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.stages[0].stage, StageKind::Geography);
    assert_eq!(report.stages[0].status, StageStatus::Aborted);
    assert!(report.stages[1..].iter().all(|s| s.status == StageStatus::Skipped));
    assert!(report.issues.iter().any(|i| i.kind == IssueKind::Parse && i.variable == "county"));

    let session = store.open_session(&report.study_id).unwrap();
    assert!(session.stored_variables().unwrap().is_empty());
    assert!(matches!(report.into_result(), Err(ImputationError::StageFailed { .. })));
}

#[test]
fn test_report_serializes_to_json() {
    let dir = tempfile::tempdir().unwrap();
    let (report, _) = run_pipeline(test_config(dir.path(), 2), &sources()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["outcome"], "completed");
    assert_eq!(json["stages"].as_array().unwrap().len(), 3);
    assert!(report.to_string().contains("sociodemographic"));
}

#[test]
fn test_aborted_rerun_leaves_no_stale_tables() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 2);
    let (first, _) = run_pipeline(config.clone(), &sources()).unwrap();
    assert_eq!(first.outcome, RunOutcome::Completed);

    let mut changed: Vec<_> = sources().into_iter().skip(1).collect();
    for source in &mut changed {
        source
            .allocations
            .insert("county".to_string(), "06037:0.5;06059:0.2".to_string());
    }
    let (second, store) = run_pipeline(config, &changed).unwrap();
    assert_eq!(second.outcome, RunOutcome::Aborted);
    assert!(second.session.tables_removed > 0);

    let session = store.open_session(&second.study_id).unwrap();
    assert!(session.stored_variables().unwrap().is_empty());
    assert!(session.read_metadata().unwrap().is_empty());
    let base = session.base().unwrap().clone();
    let worlds = session.get_imputation_list().unwrap();
    assert_eq!(worlds.len(), 2);
    for world in &worlds {
        assert_eq!(world.len(), SYNTHETIC_RECORDS - 1);
        for record in world.records() {
            assert_eq!(Some(record), base.get(&record.record_id));
        }
    }
}

#[test]
fn test_aborted_stage_keeps_upstream_tables() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 2);
    let (first, _) = run_pipeline(config.clone(), &sources()).unwrap();
    assert_eq!(first.outcome, RunOutcome::Completed);

    config.failure_threshold = 0.02;
    let catalog = VariableCatalog::child_development();
    let mut registry = ImputerRegistry::for_catalog(&catalog);
    registry.register("care_hours", Arc::new(ImpossibleHours));
    let store = ImputationStore::new(&config.storage_root).unwrap();
    let pipeline = ImputationPipeline::new(config, catalog.clone(), registry).unwrap();
    let report = pipeline.run(&store, &sources()).unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.stages[2].stage, StageKind::Childcare);
    assert_eq!(report.stages[2].status, StageStatus::Aborted);

    let session = store.open_session(&report.study_id).unwrap();
    let stored: BTreeSet<String> = session.stored_variables().unwrap().into_iter().collect();
    for spec in catalog.variables() {
        let expected = matches!(
            spec.group,
            VariableGroup::Geography | VariableGroup::Sociodemographic
        );
        assert_eq!(stored.contains(&spec.name), expected, "{}", spec.name);
    }
    let worlds = session.get_imputation_list().unwrap();
    let base = session.base().unwrap();
    for world in &worlds {
        for record in world.records() {
            for variable in ["receives_care", "care_type", "care_hours", "formal_care"] {
                let observed = base.get(&record.record_id).and_then(|r| r.get(variable));
                assert_eq!(record.get(variable), observed);
            }
        }
    }
}
