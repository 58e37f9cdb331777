use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::models::{Analysis, AnalysisDraft, FileRef, Measurement};

/// Trait for durable analysis records.
///
/// Every call is atomic on its own, but nothing spans calls: an analysis row
/// and its measurement and file rows are written by separate calls, parent
/// first, without a wrapping transaction.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the analysis row. The store assigns `id` and `created_at`; the
    /// returned aggregate has no children yet.
    async fn create_analysis(&self, draft: AnalysisDraft) -> Result<Analysis, PersistenceError>;

    /// Append measurement rows to an existing analysis, keeping their order
    async fn create_measurements(
        &self,
        analysis_id: Uuid,
        measurements: &[Measurement],
    ) -> Result<u64, PersistenceError>;

    /// Append file rows to an existing analysis, keeping their order
    async fn create_files(&self, analysis_id: Uuid, files: &[FileRef])
    -> Result<u64, PersistenceError>;

    /// Full aggregate including measurements and files
    async fn find_analysis(&self, id: Uuid) -> Result<Option<Analysis>, PersistenceError>;

    /// Most recent analyses of one owner, newest first
    async fn list_by_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<Analysis>, PersistenceError>;
}

/// In-memory implementation of RecordStore
#[derive(Default)]
pub struct InMemoryRecordStore {
    analyses: Arc<DashMap<Uuid, Analysis>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            analyses: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_analysis(&self, draft: AnalysisDraft) -> Result<Analysis, PersistenceError> {
        let analysis = Analysis {
            id: Uuid::new_v4(),
            owner_id: draft.owner_id,
            domain_type: draft.domain_type,
            title: draft.title,
            raw_text: draft.raw_text,
            summary: draft.summary,
            findings: draft.findings,
            measurements: Vec::new(),
            files: Vec::new(),
            created_at: Utc::now(),
        };
        self.analyses.insert(analysis.id, analysis.clone());
        Ok(analysis)
    }

    async fn create_measurements(
        &self,
        analysis_id: Uuid,
        measurements: &[Measurement],
    ) -> Result<u64, PersistenceError> {
        let mut entry = self
            .analyses
            .get_mut(&analysis_id)
            .ok_or(PersistenceError::MissingParent(analysis_id))?;
        entry.measurements.extend_from_slice(measurements);
        Ok(measurements.len() as u64)
    }

    async fn create_files(
        &self,
        analysis_id: Uuid,
        files: &[FileRef],
    ) -> Result<u64, PersistenceError> {
        let mut entry = self
            .analyses
            .get_mut(&analysis_id)
            .ok_or(PersistenceError::MissingParent(analysis_id))?;
        entry.files.extend_from_slice(files);
        Ok(files.len() as u64)
    }

    async fn find_analysis(&self, id: Uuid) -> Result<Option<Analysis>, PersistenceError> {
        Ok(self.analyses.get(&id).map(|entry| entry.clone()))
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<Analysis>, PersistenceError> {
        let mut owned: Vec<Analysis> = self
            .analyses
            .iter()
            .filter(|entry| entry.owner_id.as_deref() == Some(owner_id))
            .map(|entry| entry.clone())
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(limit);
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DomainType, Findings};

    fn draft(owner: Option<&str>) -> AnalysisDraft {
        AnalysisDraft {
            owner_id: owner.map(str::to_string),
            domain_type: DomainType::Urine,
            title: Some("Morning sample".to_string()),
            raw_text: None,
            summary: "All values in range.".to_string(),
            findings: Findings::empty(),
        }
    }

    fn measurement(name: &str, value: f64) -> Measurement {
        Measurement {
            name: name.to_string(),
            value,
            unit: None,
            reference_low: None,
            reference_high: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn children_follow_their_parent() {
        let store = InMemoryRecordStore::new();
        let created = store.create_analysis(draft(None)).await.unwrap();
        assert!(created.measurements.is_empty());

        store
            .create_measurements(created.id, &[measurement("Protein", 0.02), measurement("pH", 6.0)])
            .await
            .unwrap();

        let found = store.find_analysis(created.id).await.unwrap().unwrap();
        assert_eq!(found.measurements.len(), 2);
        assert_eq!(found.measurements[0].name, "Protein");
        assert!(found.files.is_empty());
    }

    #[tokio::test]
    async fn children_of_unknown_analysis_are_rejected() {
        let store = InMemoryRecordStore::new();
        let missing = Uuid::new_v4();

        let err = store
            .create_measurements(missing, &[measurement("Hb", 14.2)])
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::MissingParent(id) if id == missing));
    }

    #[tokio::test]
    async fn lists_owner_analyses_newest_first() {
        let store = InMemoryRecordStore::new();
        let first = store.create_analysis(draft(Some("u1"))).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.create_analysis(draft(Some("u1"))).await.unwrap();
        store.create_analysis(draft(Some("u2"))).await.unwrap();
        store.create_analysis(draft(None)).await.unwrap();

        let listed = store.list_by_owner("u1", 10).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        assert_eq!(store.list_by_owner("u1", 1).await.unwrap().len(), 1);
    }
}
