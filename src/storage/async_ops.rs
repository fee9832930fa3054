//! Async retrieval
//!
//! Parquet reads are blocking, so each completed dataset is composed on
//! tokio's blocking pool and the M compositions are joined with `futures`.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::task;

use super::{ImputationStore, StoreSession, StudyState, compose, read_table};
use crate::error::Result;
use crate::models::{CompletedDataset, ImputationIndex, ImputedValueRow};

/// Owned view of a session's study, movable into blocking tasks
#[derive(Clone)]
struct StudyReader {
    store: Arc<ImputationStore>,
    study_id: String,
    state: Arc<StudyState>,
}

impl StudyReader {
    fn complete(&self, imputation: ImputationIndex) -> Result<CompletedDataset> {
        compose(&self.store, &self.study_id, &self.state, imputation)
    }
}

impl StoreSession {
    fn reader(&self) -> Result<StudyReader> {
        Ok(StudyReader {
            store: Arc::clone(&self.store),
            study_id: self.study_id.clone(),
            state: Arc::clone(self.state()?),
        })
    }

    /// Compose one completed dataset without blocking the runtime
    pub async fn get_complete_dataset_async(
        &self,
        imputation: ImputationIndex,
    ) -> Result<CompletedDataset> {
        let reader = self.reader()?;
        task::spawn_blocking(move || reader.complete(imputation)).await?
    }

    /// Compose all M completed datasets concurrently
    pub async fn get_imputation_list_async(&self) -> Result<Vec<CompletedDataset>> {
        let reader = self.reader()?;
        let count = reader.state.manifest.imputations as usize;
        let tasks = ImputationIndex::all(count).map(|m| {
            let reader = reader.clone();
            async move { task::spawn_blocking(move || reader.complete(m)).await? }
        });
        try_join_all(tasks).await
    }

    /// Read one variable's table without blocking the runtime
    pub async fn get_variable_imputations_async(
        &self,
        variable: &str,
    ) -> Result<Vec<ImputedValueRow>> {
        let reader = self.reader()?;
        let variable = variable.to_string();
        task::spawn_blocking(move || {
            read_table(&reader.store, &reader.study_id, &reader.state, &variable)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormalCareRule;
    use crate::models::{BaseDataset, SourceRecord, Value, VariableCatalog};

    #[tokio::test]
    async fn test_async_list_matches_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImputationStore::new(dir.path()).unwrap();
        let mut session = store.open_session("async").unwrap();
        let catalog = VariableCatalog::child_development();
        let sources = vec![SourceRecord::new("a", true), SourceRecord::new("b", true)];
        let base =
            BaseDataset::from_source(&sources, &catalog, 1e-3, &FormalCareRule::default()).unwrap();
        session.create_study(&catalog, &base, 2, 7).unwrap();
        let rows = vec![
            ImputedValueRow::new("a", ImputationIndex::first(), Value::category("06037")),
            ImputedValueRow::new("a", ImputationIndex::new(2).unwrap(), Value::category("06059")),
        ];
        session.store("county", &rows).unwrap();

        let sync = session.get_imputation_list().unwrap();
        let list = session.get_imputation_list_async().await.unwrap();
        assert_eq!(list, sync);
        assert_eq!(list[1].value("a", "county"), Some(&Value::category("06059")));

        let one = session
            .get_complete_dataset_async(ImputationIndex::first())
            .await
            .unwrap();
        assert_eq!(one, sync[0]);
        assert_eq!(session.get_variable_imputations_async("county").await.unwrap(), rows);
    }
}
