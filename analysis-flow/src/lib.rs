//! Ingestion and interpretation pipeline for lab analysis submissions.
//!
//! A submission flows through four stages:
//!
//! 1. [`intake`] stores uploaded blobs and hands back [`FileRef`]s,
//! 2. [`interpretation`] asks an external completion service (or the offline template),
//! 3. [`normalizer`] splits the completion into a summary and [`Findings`],
//! 4. [`assembler`] persists the [`Analysis`] aggregate through a [`RecordStore`].

pub mod assembler;
pub mod error;
pub mod identity;
pub mod intake;
pub mod interpretation;
pub mod models;
pub mod normalizer;
pub mod storage;
pub mod storage_postgres;

// Re-export commonly used types
pub use assembler::{AnalysisAssembler, derive_measurements};
pub use error::{IngestionError, InterpretationError, PersistenceError, PipelineError, Result};
pub use identity::{Identity, IdentityResolver, JwtIdentityResolver};
pub use intake::{BlobIntake, LocalUploadIntake, image_references};
pub use interpretation::{
    CompletionBackend, CompletionConfig, CompletionService, InterpretationClient,
    OpenRouterBackend, RawReply,
};
pub use models::{
    Analysis, AnalysisDraft, AnalysisRequest, DomainType, FileRef, Findings,
    InterpretationReply, Measurement, MeasurementStatus, UploadBlob,
};
pub use normalizer::normalize;
pub use storage::{InMemoryRecordStore, RecordStore};
pub use storage_postgres::PostgresRecordStore;
