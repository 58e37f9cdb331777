use thiserror::Error;
use uuid::Uuid;

/// Errors raised while storing uploaded blobs
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Failed to prepare upload storage")]
    StorageUnavailable(#[source] std::io::Error),

    #[error("Failed to store upload '{filename}'")]
    WriteFailed {
        filename: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a configured interpretation service
#[derive(Error, Debug)]
pub enum InterpretationError {
    #[error("Completion request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Completion request timed out")]
    Timeout,

    #[error("Completion service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response format from completion service: {0}")]
    MalformedResponse(String),
}

impl InterpretationError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            InterpretationError::Timeout => true,
            InterpretationError::Request(e) => e.is_timeout() || e.is_connect(),
            InterpretationError::Status { status, .. } => *status == 429 || *status >= 500,
            InterpretationError::MalformedResponse(_) => false,
        }
    }
}

/// Errors raised by a record store
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Analysis {0} does not exist")]
    MissingParent(Uuid),
}

/// Top-level error of one pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Interpretation(#[from] InterpretationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
