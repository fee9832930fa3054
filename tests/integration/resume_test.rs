use crate::utils::{run_pipeline, sources, test_config};
use study_impute::pipeline::StageStatus;
use study_impute::{RunOutcome, Value};

#[test]
fn test_unchanged_inputs_resume_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 3);
    config.resume = true;

    let (first, store) = run_pipeline(config.clone(), &sources()).unwrap();
    assert!(first.stages.iter().all(|s| s.status == StageStatus::Completed));
    let before = store
        .open_session(&first.study_id)
        .unwrap()
        .get_imputation_list()
        .unwrap();

    let (second, store) = run_pipeline(config, &sources()).unwrap();
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert!(second.stages.iter().all(|s| s.status == StageStatus::Resumed));
    assert_eq!(second.session.tables_written, 0);
    for stage in &second.stages {
        let first_rows = first.stages.iter().find(|s| s.stage == stage.stage).unwrap().rows;
        assert_eq!(stage.rows, first_rows);
    }

    let after = store
        .open_session(&second.study_id)
        .unwrap()
        .get_imputation_list()
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_changed_input_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 2);
    config.resume = true;
    run_pipeline(config.clone(), &sources()).unwrap();

    let mut changed = sources();
    changed[1]
        .values
        .insert("respondent_age".to_string(), Value::Number(33.0));
    let (report, _) = run_pipeline(config, &changed).unwrap();
    assert!(report.stages.iter().all(|s| s.status == StageStatus::Completed));
    assert!(report.session.tables_written > 0);
}

#[test]
fn test_resume_disabled_always_recomputes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 2);
    run_pipeline(config.clone(), &sources()).unwrap();
    let (report, _) = run_pipeline(config, &sources()).unwrap();
    assert!(report.stages.iter().all(|s| s.status == StageStatus::Completed));
}
