use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PersistenceError, Result};
use crate::identity::Identity;
use crate::intake::{BlobIntake, image_references};
use crate::interpretation::InterpretationClient;
use crate::models::{
    Analysis, AnalysisDraft, AnalysisRequest, Findings, Measurement, MeasurementStatus,
    UploadBlob,
};
use crate::storage::RecordStore;

/// Orchestrates one submission: intake, interpretation, persistence, read-back
#[derive(Clone)]
pub struct AnalysisAssembler {
    intake: Arc<dyn BlobIntake>,
    interpreter: InterpretationClient,
    store: Arc<dyn RecordStore>,
}

impl AnalysisAssembler {
    pub fn new(
        intake: Arc<dyn BlobIntake>,
        interpreter: InterpretationClient,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            intake,
            interpreter,
            store,
        }
    }

    /// Run the whole pipeline and return the persisted aggregate.
    ///
    /// Fails as a unit; files already written by the intake stay on disk.
    pub async fn assemble(
        &self,
        mut request: AnalysisRequest,
        blobs: Vec<UploadBlob>,
        owner: Option<&Identity>,
    ) -> Result<Analysis> {
        if !blobs.is_empty() {
            let stored = self.intake.ingest(blobs).await?;
            request.image_references.extend(image_references(&stored));
            request.uploaded_files.extend(stored);
        }

        let reply = self.interpreter.interpret(&request).await?;

        let created = self
            .store
            .create_analysis(AnalysisDraft {
                owner_id: owner.map(|identity| identity.user_id.clone()),
                domain_type: request.domain_type,
                title: request.title,
                raw_text: request.free_text,
                summary: reply.summary,
                findings: reply.findings.clone(),
            })
            .await?;
        info!(
            analysis_id = %created.id,
            domain_type = %created.domain_type,
            anonymous = owner.is_none(),
            "Analysis created"
        );

        let measurements = derive_measurements(created.id, &reply.findings);
        if !measurements.is_empty() {
            self.store
                .create_measurements(created.id, &measurements)
                .await?;
        }
        if !request.uploaded_files.is_empty() {
            self.store
                .create_files(created.id, &request.uploaded_files)
                .await?;
        }

        let analysis = self
            .store
            .find_analysis(created.id)
            .await?
            .ok_or(PersistenceError::MissingParent(created.id))?;
        info!(
            analysis_id = %analysis.id,
            measurements = analysis.measurements.len(),
            files = analysis.files.len(),
            "Analysis assembled"
        );
        Ok(analysis)
    }

    pub async fn fetch(&self, id: Uuid) -> Result<Option<Analysis>> {
        Ok(self.store.find_analysis(id).await?)
    }

    pub async fn recent_for_owner(&self, owner: &Identity, limit: usize) -> Result<Vec<Analysis>> {
        Ok(self.store.list_by_owner(&owner.user_id, limit).await?)
    }
}

/// Promote every `findings.measurements` entry into a Measurement, in order.
///
/// Values that cannot be read as numbers become `0` instead of dropping the entry.
pub fn derive_measurements(analysis_id: Uuid, findings: &Findings) -> Vec<Measurement> {
    findings
        .measurement_candidates()
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let (measurement, coerced) = coerce_measurement(entry);
            if coerced {
                warn!(
                    analysis_id = %analysis_id,
                    index,
                    name = %measurement.name,
                    "Measurement value is not numeric, stored as 0"
                );
            }
            measurement
        })
        .collect()
}

/// Returns the measurement and whether its value had to be replaced by 0
fn coerce_measurement(entry: &Value) -> (Measurement, bool) {
    let (value, coerced) = coerce_value(entry.get("value"));

    let measurement = Measurement {
        name: coerce_name(entry.get("name")),
        value,
        unit: match entry.get("unit") {
            Some(Value::String(unit)) if !unit.is_empty() => Some(unit.clone()),
            Some(Value::Number(unit)) => Some(unit.to_string()),
            _ => None,
        },
        reference_low: entry.get("referenceLow").and_then(Value::as_f64),
        reference_high: entry.get("referenceHigh").and_then(Value::as_f64),
        status: entry
            .get("status")
            .and_then(Value::as_str)
            .map(MeasurementStatus::from_label),
    };
    (measurement, coerced)
}

fn coerce_name(name: Option<&Value>) -> String {
    match name {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(name)) => name.clone(),
        Some(other) => other.to_string(),
    }
}

fn coerce_value(value: Option<&Value>) -> (f64, bool) {
    let parsed = match value {
        None | Some(Value::Null) => Some(0.0),
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => parse_leading_float(text),
        Some(other) => parse_leading_float(&other.to_string()),
    };

    match parsed {
        Some(number) if number.is_finite() => (number, false),
        _ => (0.0, true),
    }
}

/// Longest numeric prefix after leading whitespace, so `"5.5 g/dL"` reads as 5.5
fn parse_leading_float(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if !text[digits_start..end].bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }

    // optional exponent, only when followed by digits
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'+' | b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }

    text[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IngestionError, InterpretationError, PipelineError};
    use crate::interpretation::{
        CompletionBackend, CompletionPrompt, CompletionService, OFFLINE_SUMMARY,
    };
    use crate::models::{DomainType, FileRef};
    use crate::storage::InMemoryRecordStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Intake that records calls and returns canned references
    #[derive(Default)]
    struct RecordingIntake {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BlobIntake for RecordingIntake {
        async fn ingest(
            &self,
            blobs: Vec<UploadBlob>,
        ) -> std::result::Result<Vec<FileRef>, IngestionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(IngestionError::StorageUnavailable(std::io::Error::other(
                    "disk full",
                )));
            }
            Ok(blobs
                .into_iter()
                .map(|blob| FileRef {
                    location: format!("http://host/uploads/{}", blob.filename),
                    filename: blob.filename,
                    content_type: blob
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    size_bytes: blob.bytes.len() as u64,
                })
                .collect())
        }
    }

    /// Backend returning a fixed completion and remembering the prompt it saw
    struct ScriptedBackend {
        reply: std::result::Result<String, u16>,
        seen: Mutex<Vec<CompletionPrompt>>,
    }

    impl ScriptedBackend {
        fn replying(content: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(content.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(status: u16) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(status),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            prompt: &CompletionPrompt,
        ) -> std::result::Result<String, InterpretationError> {
            self.seen.lock().unwrap().push(prompt.clone());
            self.reply.clone().map_err(|status| InterpretationError::Status {
                status,
                body: String::new(),
            })
        }
    }

    /// Record store whose writes fail from a chosen step on
    struct FailingStore {
        inner: InMemoryRecordStore,
        fail_analysis: bool,
    }

    fn unavailable() -> PersistenceError {
        PersistenceError::Database(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn create_analysis(
            &self,
            draft: AnalysisDraft,
        ) -> std::result::Result<Analysis, PersistenceError> {
            if self.fail_analysis {
                return Err(unavailable());
            }
            self.inner.create_analysis(draft).await
        }

        async fn create_measurements(
            &self,
            _analysis_id: Uuid,
            _measurements: &[Measurement],
        ) -> std::result::Result<u64, PersistenceError> {
            Err(unavailable())
        }

        async fn create_files(
            &self,
            analysis_id: Uuid,
            files: &[FileRef],
        ) -> std::result::Result<u64, PersistenceError> {
            self.inner.create_files(analysis_id, files).await
        }

        async fn find_analysis(
            &self,
            id: Uuid,
        ) -> std::result::Result<Option<Analysis>, PersistenceError> {
            self.inner.find_analysis(id).await
        }

        async fn list_by_owner(
            &self,
            owner_id: &str,
            limit: usize,
        ) -> std::result::Result<Vec<Analysis>, PersistenceError> {
            self.inner.list_by_owner(owner_id, limit).await
        }
    }

    fn assembler_with(
        intake: Arc<RecordingIntake>,
        service: CompletionService,
    ) -> (AnalysisAssembler, Arc<InMemoryRecordStore>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let assembler =
            AnalysisAssembler::new(intake, InterpretationClient::new(service), store.clone());
        (assembler, store)
    }

    fn blood_request() -> AnalysisRequest {
        AnalysisRequest {
            domain_type: DomainType::Blood,
            free_text: Some("Hemoglobin 14.2 g/dL".to_string()),
            vitals: BTreeMap::from([("age".to_string(), "30".to_string())]),
            ..Default::default()
        }
    }

    fn blob(name: &str, content_type: &str) -> UploadBlob {
        UploadBlob {
            filename: name.to_string(),
            content_type: Some(content_type.to_string()),
            bytes: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn offline_submission_persists_fallback_summary() {
        let intake = Arc::new(RecordingIntake::default());
        let (assembler, _) = assembler_with(intake.clone(), CompletionService::Unconfigured);

        let analysis = assembler
            .assemble(blood_request(), Vec::new(), None)
            .await
            .unwrap();

        assert_eq!(analysis.summary, OFFLINE_SUMMARY);
        assert!(analysis.measurements.is_empty());
        assert!(analysis.files.is_empty());
        assert_eq!(analysis.owner_id, None);
        assert_eq!(analysis.raw_text.as_deref(), Some("Hemoglobin 14.2 g/dL"));
        assert_eq!(intake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn only_images_are_forwarded_but_all_files_are_kept() {
        let intake = Arc::new(RecordingIntake::default());
        let backend = ScriptedBackend::replying("1) Fine.\n2) {\"measurements\": []}");
        let (assembler, _) =
            assembler_with(intake.clone(), CompletionService::Configured(backend.clone()));

        let analysis = assembler
            .assemble(
                AnalysisRequest {
                    domain_type: DomainType::Image,
                    ..Default::default()
                },
                vec![blob("scan.png", "image/png"), blob("report.pdf", "application/pdf")],
                None,
            )
            .await
            .unwrap();

        assert_eq!(intake.calls.load(Ordering::SeqCst), 1);
        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].images, vec!["http://host/uploads/scan.png".to_string()]);

        let names: Vec<&str> = analysis.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["scan.png", "report.pdf"]);
    }

    #[tokio::test]
    async fn measurements_are_derived_from_findings() {
        let backend = ScriptedBackend::replying(
            r#"1) Two values reviewed.
2) {"measurements": [
    {"name": "Hemoglobin", "value": "5.5", "unit": "g/dL", "referenceLow": 12, "referenceHigh": 16, "status": "warning"},
    {"name": "Glucose", "value": "abc", "referenceLow": "3.9"}
], "advice": ["Repeat the test"]}"#,
        );
        let identity = Identity {
            user_id: "user-7".to_string(),
            email: "u7@example.com".to_string(),
        };
        let (assembler, _) = assembler_with(
            Arc::new(RecordingIntake::default()),
            CompletionService::Configured(backend),
        );

        let analysis = assembler
            .assemble(blood_request(), Vec::new(), Some(&identity))
            .await
            .unwrap();

        assert_eq!(analysis.owner_id.as_deref(), Some("user-7"));
        assert_eq!(analysis.summary, "Two values reviewed.");
        assert_eq!(analysis.measurements.len(), 2);

        let hb = &analysis.measurements[0];
        assert_eq!(hb.value, 5.5);
        assert_eq!(hb.unit.as_deref(), Some("g/dL"));
        assert_eq!(hb.reference_low, Some(12.0));
        assert_eq!(hb.reference_high, Some(16.0));
        assert_eq!(hb.status, Some(MeasurementStatus::Warning));

        let glucose = &analysis.measurements[1];
        assert_eq!(glucose.value, 0.0);
        assert_eq!(glucose.reference_low, None);
        assert_eq!(glucose.status, None);

        let recent = assembler.recent_for_owner(&identity, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn unparsed_findings_yield_no_measurements() {
        let backend = ScriptedBackend::replying("1) Summary\n2) {broken");
        let (assembler, _) = assembler_with(
            Arc::new(RecordingIntake::default()),
            CompletionService::Configured(backend),
        );

        let analysis = assembler
            .assemble(blood_request(), Vec::new(), None)
            .await
            .unwrap();
        assert!(matches!(analysis.findings, Findings::RawFallback { .. }));
        assert!(analysis.measurements.is_empty());
    }

    #[tokio::test]
    async fn service_failure_persists_nothing() {
        let (assembler, store) = assembler_with(
            Arc::new(RecordingIntake::default()),
            CompletionService::Configured(ScriptedBackend::failing(502)),
        );

        let err = assembler
            .assemble(blood_request(), Vec::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Interpretation(_)));
        assert!(store.list_by_owner("anyone", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn intake_failure_aborts_before_interpretation() {
        let intake = Arc::new(RecordingIntake {
            fail: true,
            ..Default::default()
        });
        let backend = ScriptedBackend::replying("unused");
        let (assembler, _) =
            assembler_with(intake, CompletionService::Configured(backend.clone()));

        let err = assembler
            .assemble(blood_request(), vec![blob("a.png", "image/png")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion(_)));
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_on_the_analysis_row_aborts() {
        let store = Arc::new(FailingStore {
            inner: InMemoryRecordStore::new(),
            fail_analysis: true,
        });
        let assembler = AnalysisAssembler::new(
            Arc::new(RecordingIntake::default()),
            InterpretationClient::unconfigured(),
            store,
        );

        let err = assembler
            .assemble(blood_request(), Vec::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Persistence(PersistenceError::Database(_))
        ));
    }

    #[tokio::test]
    async fn store_failure_on_children_aborts_and_keeps_the_parent() {
        let identity = Identity {
            user_id: "user-9".to_string(),
            email: "u9@example.com".to_string(),
        };
        let store = Arc::new(FailingStore {
            inner: InMemoryRecordStore::new(),
            fail_analysis: false,
        });
        let backend = ScriptedBackend::replying(
            "1) One value.\n2) {\"measurements\": [{\"name\": \"Hb\", \"value\": 14.2}]}",
        );
        let assembler = AnalysisAssembler::new(
            Arc::new(RecordingIntake::default()),
            InterpretationClient::new(CompletionService::Configured(backend)),
            store.clone(),
        );

        let err = assembler
            .assemble(blood_request(), Vec::new(), Some(&identity))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));

        // writes are not wrapped in a transaction
        let orphaned = store.list_by_owner("user-9", 10).await.unwrap();
        assert_eq!(orphaned.len(), 1);
        assert!(orphaned[0].measurements.is_empty());
    }

    #[test]
    fn value_coercion_follows_lenient_rules() {
        assert_eq!(coerce_value(Some(&json!(14.2))), (14.2, false));
        assert_eq!(coerce_value(Some(&json!("5.5"))), (5.5, false));
        assert_eq!(coerce_value(Some(&json!(" 145 g/L"))), (145.0, false));
        assert_eq!(coerce_value(Some(&json!("1e3 cells"))), (1000.0, false));
        assert_eq!(coerce_value(Some(&json!("abc"))), (0.0, true));
        assert_eq!(coerce_value(Some(&json!("."))), (0.0, true));
        assert_eq!(coerce_value(Some(&json!(true))), (0.0, true));
        assert_eq!(coerce_value(None), (0.0, false));
        assert_eq!(coerce_value(Some(&Value::Null)), (0.0, false));
    }

    #[test]
    fn name_and_unit_coercion() {
        let (m, _) = coerce_measurement(&json!({ "value": 1, "unit": "" }));
        assert_eq!(m.name, "");
        assert_eq!(m.unit, None);

        let (m, _) = coerce_measurement(&json!({ "name": 42, "value": 1, "unit": 10 }));
        assert_eq!(m.name, "42");
        assert_eq!(m.unit.as_deref(), Some("10"));

        let (m, coerced) = coerce_measurement(&json!("Hemoglobin"));
        assert_eq!(m.name, "");
        assert_eq!(m.value, 0.0);
        assert!(!coerced);
    }
}
