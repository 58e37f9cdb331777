use analysis_flow::{
    AnalysisAssembler, BlobIntake, Identity, IdentityResolver, InMemoryRecordStore,
    InterpretationClient, JwtIdentityResolver, LocalUploadIntake, PipelineError,
    PostgresRecordStore, RecordStore, UploadBlob,
};
use axum::{
    Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, State,
        rejection::JsonRejection,
        multipart::MultipartError,
    },
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::{Next, from_fn},
    response::Json,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    models::{
        AnalysisListResponse, AnalysisResponse, SubmitAnalysisRequest, UploadResponse,
        UploadedFile,
    },
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

const PROCESSING_FAILED: &str = "Failed to process the analysis, please try again later";
const RECENT_ANALYSES_LIMIT: usize = 10;

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn unauthorized_error() -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Not authorized" })),
    )
}

fn not_found_error(message: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

fn internal_error(message: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
}

fn multipart_error(e: MultipartError) -> ApiError {
    (e.status(), Json(json!({ "error": e.body_text() })))
}

/// Validation problems reach the caller; everything else is logged and hidden
fn pipeline_error(e: PipelineError) -> ApiError {
    match e {
        PipelineError::Validation(message) => bad_request_error(&message),
        other => {
            error!("Analysis processing failed: {}", other);
            internal_error(PROCESSING_FAILED)
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub assembler: AnalysisAssembler,
    pub intake: Arc<dyn BlobIntake>,
    pub identity: Arc<dyn IdentityResolver>,
}

pub async fn create_app(config: &ServiceConfig) -> anyhow::Result<Router> {
    let app_state = create_app_state(config).await?;
    Ok(build_router(app_state, config))
}

async fn create_app_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let store = create_record_store(config.database_url.as_deref()).await;
    let intake: Arc<dyn BlobIntake> = Arc::new(LocalUploadIntake::new(
        config.upload_dir.clone(),
        config.public_base_url.clone(),
    ));
    let interpreter = InterpretationClient::from_config(&config.completion)?;

    Ok(AppState {
        assembler: AnalysisAssembler::new(intake.clone(), interpreter, store),
        intake,
        identity: Arc::new(JwtIdentityResolver::new(&config.jwt_secret)),
    })
}

async fn create_record_store(database_url: Option<&str>) -> Arc<dyn RecordStore> {
    match database_url {
        Some(database_url) => {
            info!("Using PostgreSQL record store");
            match PostgresRecordStore::connect(database_url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!(
                        "Failed to connect to PostgreSQL: {}. Falling back to in-memory storage.",
                        e
                    );
                    Arc::new(InMemoryRecordStore::new())
                }
            }
        }
        None => {
            info!("Using in-memory record store (set DATABASE_URL to use PostgreSQL)");
            Arc::new(InMemoryRecordStore::new())
        }
    }
}

pub fn build_router(app_state: AppState, config: &ServiceConfig) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/api/analysis", post(submit_analysis))
        .route("/api/analysis/with-files", post(submit_analysis_with_files))
        .route("/api/analysis/{id}", get(get_analysis))
        .route("/api/upload", post(upload_files))
        .route("/api/me/analyses", get(recent_analyses))
        .nest_service("/uploads", ServeDir::new(&config.upload_dir))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Tag every request with a correlation id and run it inside a span carrying it
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Lab Analysis Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "AI-assisted interpretation of lab results, vitals and medical images",
        "endpoints": {
            "POST /api/analysis": "Submit an analysis (JSON)",
            "POST /api/analysis/with-files": "Submit an analysis with files (multipart: payload + file)",
            "GET /api/analysis/{id}": "Fetch an analysis with measurements and files",
            "POST /api/upload": "Upload files (multipart: file)",
            "GET /api/me/analyses": "Recent analyses of the signed-in user",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// The `token` cookie wins over an `Authorization: Bearer` header
fn credential_from_headers(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == "token" && !value.is_empty())
        .map(|(_, value)| value.to_string());

    from_cookie.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    })
}

fn caller_identity(state: &AppState, headers: &HeaderMap) -> Option<Identity> {
    credential_from_headers(headers).and_then(|credential| state.identity.resolve(&credential))
}

async fn submit_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SubmitAnalysisRequest>, JsonRejection>,
) -> ApiResult<AnalysisResponse> {
    let Json(payload) = payload.map_err(|e| bad_request_error(&e.body_text()))?;
    run_pipeline(&state, &headers, payload, Vec::new()).await
}

async fn submit_analysis_with_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<AnalysisResponse> {
    let form = read_multipart(multipart).await?;

    let payload = match form.payload {
        Some(text) => serde_json::from_str::<SubmitAnalysisRequest>(&text)
            .map_err(|e| bad_request_error(&format!("Invalid payload: {}", e)))?,
        None => SubmitAnalysisRequest::default(),
    };

    run_pipeline(&state, &headers, payload, form.blobs).await
}

async fn run_pipeline(
    state: &AppState,
    headers: &HeaderMap,
    payload: SubmitAnalysisRequest,
    blobs: Vec<UploadBlob>,
) -> ApiResult<AnalysisResponse> {
    let request = payload
        .into_analysis_request()
        .map_err(PipelineError::Validation)
        .map_err(pipeline_error)?;
    let owner = caller_identity(state, headers);

    info!(
        domain_type = %request.domain_type,
        files = blobs.len() + request.uploaded_files.len(),
        authenticated = owner.is_some(),
        "Received analysis submission"
    );

    let analysis = state
        .assembler
        .assemble(request, blobs, owner.as_ref())
        .await
        .map_err(pipeline_error)?;

    Ok(Json(AnalysisResponse { ok: true, analysis }))
}

struct MultipartForm {
    payload: Option<String>,
    blobs: Vec<UploadBlob>,
}

/// Collect the `payload` text field and every file field
async fn read_multipart(mut multipart: Multipart) -> Result<MultipartForm, ApiError> {
    let mut form = MultipartForm {
        payload: None,
        blobs: Vec::new(),
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);

        match (name.as_str(), filename) {
            ("payload", None) => {
                form.payload = Some(field.text().await.map_err(multipart_error)?);
            }
            (_, Some(filename)) => {
                let bytes = field.bytes().await.map_err(multipart_error)?;
                form.blobs.push(UploadBlob {
                    filename,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            (other, None) => {
                warn!(field = %other, "Ignoring unexpected multipart field");
            }
        }
    }

    Ok(form)
}

async fn upload_files(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<UploadResponse> {
    let form = read_multipart(multipart).await?;
    if form.blobs.is_empty() {
        return Err(bad_request_error("No files provided"));
    }

    let files = state.intake.ingest(form.blobs).await.map_err(|e| {
        error!("Upload failed: {}", e);
        internal_error("Failed to upload files")
    })?;

    info!(count = files.len(), "Files uploaded");
    Ok(Json(UploadResponse {
        ok: true,
        files: files.into_iter().map(UploadedFile::from).collect(),
    }))
}

async fn get_analysis(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
) -> ApiResult<AnalysisResponse> {
    let Ok(id) = Uuid::parse_str(&analysis_id) else {
        return Err(not_found_error("Analysis not found"));
    };

    match state.assembler.fetch(id).await {
        Ok(Some(analysis)) => Ok(Json(AnalysisResponse { ok: true, analysis })),
        Ok(None) => Err(not_found_error("Analysis not found")),
        Err(e) => {
            error!(analysis_id = %id, "Failed to load analysis: {}", e);
            Err(internal_error("Failed to load the analysis"))
        }
    }
}

async fn recent_analyses(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<AnalysisListResponse> {
    let owner = caller_identity(&state, &headers).ok_or_else(unauthorized_error)?;

    let analyses = state
        .assembler
        .recent_for_owner(&owner, RECENT_ANALYSES_LIMIT)
        .await
        .map_err(|e| {
            error!(user_id = %owner.user_id, "Failed to list analyses: {}", e);
            internal_error("Failed to load analyses")
        })?;

    Ok(Json(AnalysisListResponse { ok: true, analyses }))
}
