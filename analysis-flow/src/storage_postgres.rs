use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::models::{
    Analysis, AnalysisDraft, DomainType, FileRef, Findings, Measurement, MeasurementStatus,
};
use crate::storage::RecordStore;

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS analyses (
        id UUID PRIMARY KEY,
        owner_id TEXT,
        domain_type TEXT NOT NULL,
        title TEXT,
        raw_text TEXT,
        summary TEXT NOT NULL,
        findings JSONB NOT NULL,
        findings_kind TEXT NOT NULL DEFAULT 'parsed',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "ALTER TABLE analyses ADD COLUMN IF NOT EXISTS findings_kind TEXT NOT NULL DEFAULT 'parsed'",
    "CREATE INDEX IF NOT EXISTS analyses_owner_created_idx ON analyses (owner_id, created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS measurements (
        id BIGSERIAL PRIMARY KEY,
        analysis_id UUID NOT NULL REFERENCES analyses(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        unit TEXT,
        reference_low DOUBLE PRECISION,
        reference_high DOUBLE PRECISION,
        status TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_files (
        id BIGSERIAL PRIMARY KEY,
        analysis_id UUID NOT NULL REFERENCES analyses(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        size_bytes BIGINT NOT NULL,
        location TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS measurements_analysis_idx ON measurements (analysis_id, position)",
];

const ANALYSIS_COLUMNS: &str =
    "id, owner_id, domain_type, title, raw_text, summary, findings, findings_kind, created_at";

const FINDINGS_PARSED: &str = "parsed";
const FINDINGS_RAW: &str = "raw";

/// Split findings into the stored JSON and its kind; raw text is kept as a JSON string
fn findings_to_columns(findings: &Findings) -> (Value, &'static str) {
    match findings {
        Findings::Parsed(map) => (Value::Object(map.clone()), FINDINGS_PARSED),
        Findings::RawFallback { raw } => (Value::String(raw.clone()), FINDINGS_RAW),
    }
}

fn findings_from_columns(value: Value, kind: &str) -> Findings {
    match (kind, value) {
        (FINDINGS_RAW, Value::String(raw)) => Findings::RawFallback { raw },
        (FINDINGS_PARSED, Value::Object(map)) => Findings::Parsed(map),
        (_, other) => Findings::from(other),
    }
}

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    id: Uuid,
    owner_id: Option<String>,
    domain_type: String,
    title: Option<String>,
    raw_text: Option<String>,
    summary: String,
    findings: Json<Value>,
    findings_kind: String,
    created_at: DateTime<Utc>,
}

impl AnalysisRow {
    fn into_analysis(self, measurements: Vec<Measurement>, files: Vec<FileRef>) -> Analysis {
        Analysis {
            id: self.id,
            owner_id: self.owner_id,
            domain_type: self.domain_type.parse().unwrap_or_default(),
            title: self.title,
            raw_text: self.raw_text,
            summary: self.summary,
            findings: findings_from_columns(self.findings.0, &self.findings_kind),
            measurements,
            files,
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MeasurementRow {
    name: String,
    value: f64,
    unit: Option<String>,
    reference_low: Option<f64>,
    reference_high: Option<f64>,
    status: Option<String>,
}

impl From<MeasurementRow> for Measurement {
    fn from(row: MeasurementRow) -> Self {
        Measurement {
            name: row.name,
            value: row.value,
            unit: row.unit,
            reference_low: row.reference_low,
            reference_high: row.reference_high,
            status: row.status.as_deref().map(MeasurementStatus::from_label),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    filename: String,
    content_type: String,
    size_bytes: i64,
    location: String,
}

impl From<FileRow> for FileRef {
    fn from(row: FileRow) -> Self {
        FileRef {
            filename: row.filename,
            content_type: row.content_type,
            size_bytes: u64::try_from(row.size_bytes).unwrap_or_default(),
            location: row.location,
        }
    }
}

/// PostgreSQL implementation of RecordStore
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create the tables when missing; safe to run on every start
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Analysis record schema ready");
        Ok(())
    }

    async fn parent_exists(&self, analysis_id: Uuid) -> Result<(), PersistenceError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM analyses WHERE id = $1)")
                .bind(analysis_id)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(())
        } else {
            Err(PersistenceError::MissingParent(analysis_id))
        }
    }

    async fn load_children(
        &self,
        analysis_id: Uuid,
    ) -> Result<(Vec<Measurement>, Vec<FileRef>), PersistenceError> {
        let measurements = sqlx::query_as::<_, MeasurementRow>(
            "SELECT name, value, unit, reference_low, reference_high, status \
             FROM measurements WHERE analysis_id = $1 ORDER BY position, id",
        )
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;

        let files = sqlx::query_as::<_, FileRow>(
            "SELECT filename, content_type, size_bytes, location \
             FROM analysis_files WHERE analysis_id = $1 ORDER BY position, id",
        )
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;

        Ok((
            measurements.into_iter().map(Measurement::from).collect(),
            files.into_iter().map(FileRef::from).collect(),
        ))
    }

    async fn next_position(&self, table: &str, analysis_id: Uuid) -> Result<i32, PersistenceError> {
        let sql = format!("SELECT COALESCE(MAX(position) + 1, 0) FROM {table} WHERE analysis_id = $1");
        let next: i32 = sqlx::query_scalar(&sql)
            .bind(analysis_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(next)
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn create_analysis(&self, draft: AnalysisDraft) -> Result<Analysis, PersistenceError> {
        let sql = format!(
            "INSERT INTO analyses \
             (id, owner_id, domain_type, title, raw_text, summary, findings, findings_kind) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {ANALYSIS_COLUMNS}"
        );
        let (findings, findings_kind) = findings_to_columns(&draft.findings);
        let row = sqlx::query_as::<_, AnalysisRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&draft.owner_id)
            .bind(draft.domain_type.as_str())
            .bind(&draft.title)
            .bind(&draft.raw_text)
            .bind(&draft.summary)
            .bind(Json(findings))
            .bind(findings_kind)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into_analysis(Vec::new(), Vec::new()))
    }

    async fn create_measurements(
        &self,
        analysis_id: Uuid,
        measurements: &[Measurement],
    ) -> Result<u64, PersistenceError> {
        self.parent_exists(analysis_id).await?;
        if measurements.is_empty() {
            return Ok(0);
        }
        let offset = self.next_position("measurements", analysis_id).await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO measurements \
             (analysis_id, position, name, value, unit, reference_low, reference_high, status) ",
        );
        builder.push_values(measurements.iter().enumerate(), |mut row, (index, m)| {
            row.push_bind(analysis_id)
                .push_bind(offset + index as i32)
                .push_bind(m.name.clone())
                .push_bind(m.value)
                .push_bind(m.unit.clone())
                .push_bind(m.reference_low)
                .push_bind(m.reference_high)
                .push_bind(m.status.map(|s| s.as_str().to_string()));
        });

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn create_files(
        &self,
        analysis_id: Uuid,
        files: &[FileRef],
    ) -> Result<u64, PersistenceError> {
        self.parent_exists(analysis_id).await?;
        if files.is_empty() {
            return Ok(0);
        }
        let offset = self.next_position("analysis_files", analysis_id).await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO analysis_files \
             (analysis_id, position, filename, content_type, size_bytes, location) ",
        );
        builder.push_values(files.iter().enumerate(), |mut row, (index, f)| {
            row.push_bind(analysis_id)
                .push_bind(offset + index as i32)
                .push_bind(f.filename.clone())
                .push_bind(f.content_type.clone())
                .push_bind(i64::try_from(f.size_bytes).unwrap_or(i64::MAX))
                .push_bind(f.location.clone());
        });

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn find_analysis(&self, id: Uuid) -> Result<Option<Analysis>, PersistenceError> {
        let sql = format!("SELECT {ANALYSIS_COLUMNS} FROM analyses WHERE id = $1");
        let Some(row) = sqlx::query_as::<_, AnalysisRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let (measurements, files) = self.load_children(id).await?;
        Ok(Some(row.into_analysis(measurements, files)))
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<Analysis>, PersistenceError> {
        let sql = format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analyses WHERE owner_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, AnalysisRow>(&sql)
            .bind(owner_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut analyses = Vec::with_capacity(rows.len());
        for row in rows {
            let (measurements, files) = self.load_children(row.id).await?;
            analyses.push(row.into_analysis(measurements, files));
        }
        Ok(analyses)
    }
}
