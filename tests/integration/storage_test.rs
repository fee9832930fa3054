use study_impute::config::FormalCareRule;
use study_impute::{
    BaseDataset, ImputationError, ImputationIndex, ImputationStore, ImputedValueRow, SourceRecord,
    StoreSession, Value, VariableCatalog,
};

fn m(index: u32) -> ImputationIndex {
    ImputationIndex::new(index).unwrap()
}

fn open_study(root: &std::path::Path, imputations: u32) -> StoreSession {
    let store = ImputationStore::new(root).unwrap();
    let mut session = store.open_session("storage").unwrap();
    let catalog = VariableCatalog::child_development();
    let sources = vec![
        SourceRecord::new("a", true).with_value("household_income", Value::Number(52_000.0)),
        SourceRecord::new("b", true),
        SourceRecord::new("c", true).with_allocation("county", "06037:1.0"),
    ];
    let base = BaseDataset::from_source(&sources, &catalog, 1e-3, &FormalCareRule::default())
        .unwrap();
    session.create_study(&catalog, &base, imputations, 99).unwrap();
    session
}

#[test]
fn test_stored_rows_read_back_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_study(dir.path(), 3);
    let rows = vec![
        ImputedValueRow::new("b", m(2), Value::Number(41_000.0)),
        ImputedValueRow::new("b", m(1), Value::Number(39_500.0)),
        ImputedValueRow::new("a", m(3), Value::Number(12_000.0)),
    ];
    assert_eq!(session.store("household_income", &rows).unwrap(), 3);

    let read = session.get_variable_imputations("household_income").unwrap();
    let keys: Vec<(&str, u32)> = read
        .iter()
        .map(|r| (r.record_id.as_str(), r.imputation.get()))
        .collect();
    assert_eq!(keys, vec![("a", 3), ("b", 1), ("b", 2)]);
    assert_eq!(read[1].value, Value::Number(39_500.0));
}

#[test]
fn test_null_and_duplicate_rows_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_study(dir.path(), 2);

    let null = vec![ImputedValueRow::new("b", m(1), Value::Number(f64::NAN))];
    assert!(matches!(
        session.store("household_income", &null),
        Err(ImputationError::Validation { .. })
    ));

    let duplicate = vec![
        ImputedValueRow::new("b", m(1), Value::Number(1.0)),
        ImputedValueRow::new("b", m(1), Value::Number(2.0)),
    ];
    assert!(matches!(
        session.store("household_income", &duplicate),
        Err(ImputationError::Validation { .. })
    ));

    let beyond = vec![ImputedValueRow::new("b", m(3), Value::Number(1.0))];
    assert!(matches!(
        session.store("household_income", &beyond),
        Err(ImputationError::Validation { .. })
    ));

    let wrong_kind = vec![ImputedValueRow::new("b", m(1), Value::category("high"))];
    assert!(matches!(
        session.store("household_income", &wrong_kind),
        Err(ImputationError::Schema { .. })
    ));

    // nothing was written by the rejected calls
    assert!(session.stored_variables().unwrap().is_empty());
}

#[test]
fn test_record_without_rows_matches_base() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_study(dir.path(), 5);
    session
        .store("household_income", &[ImputedValueRow::new("b", m(3), Value::Number(30_000.0))])
        .unwrap();
    session
        .store("county", &[ImputedValueRow::new("b", m(1), Value::category("06059"))])
        .unwrap();

    let world = session.get_complete_dataset(m(3)).unwrap();
    let base = session.base().unwrap();
    assert_eq!(world.record("a"), base.get("a"));
    assert_eq!(world.record("c"), base.get("c"));
    assert_eq!(world.value("c", "county"), Some(&Value::category("06037")));
    assert_eq!(world.value("b", "household_income"), Some(&Value::Number(30_000.0)));
    assert_eq!(world.value("b", "county"), None);
}

#[test]
fn test_store_replaces_previous_table() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_study(dir.path(), 2);
    session
        .store(
            "puma",
            &[
                ImputedValueRow::new("a", m(1), Value::category("0603701")),
                ImputedValueRow::new("b", m(2), Value::category("0603702")),
            ],
        )
        .unwrap();
    session
        .store("puma", &[ImputedValueRow::new("b", m(1), Value::category("0605901"))])
        .unwrap();

    let rows = session.get_variable_imputations("puma").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record_id, "b");

    let list = session.get_imputation_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].value("b", "puma"), Some(&Value::category("0605901")));
    assert_eq!(list[1].value("b", "puma"), None);
}

#[tokio::test]
async fn test_async_retrieval_matches_sync() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_study(dir.path(), 3);
    session
        .store("household_income", &[ImputedValueRow::new("b", m(2), Value::Number(44_000.0))])
        .unwrap();

    let sync = session.get_imputation_list().unwrap();
    let list = session.get_imputation_list_async().await.unwrap();
    assert_eq!(list, sync);
    let one = session.get_complete_dataset_async(m(2)).await.unwrap();
    assert_eq!(one.value("b", "household_income"), Some(&Value::Number(44_000.0)));
}
