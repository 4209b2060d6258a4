//! Pipeline error taxonomy.
//!
//! Every failure that crosses the library boundary is one of these variants.
//! Ingestion and store errors abort the current run; per-document inference
//! failures never show up here (they are recorded as distillation results).

use thiserror::Error;

use crate::models::{JobStatus, ReconcileCounts};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("provider rejected request: {0}")]
    ProviderRejected(String),
    #[error("preset not found: {0}")]
    PresetNotFound(String),
    #[error("invalid version tag: {0} (expected 'latest' or YYYY-MM-DD)")]
    InvalidVersionTag(String),
    #[error("preset '{0}' matched no documents")]
    NoContentForPreset(String),
    #[error("timed out after {waited_secs}s waiting for {what}")]
    Timeout { what: String, waited_secs: u64 },
    #[error("distillation job {job_id} cannot move to '{to}'")]
    InvalidJobTransition { job_id: i64, to: JobStatus },
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Config/caller errors, as opposed to infrastructure failures.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            PipelineError::PresetNotFound(_)
                | PipelineError::InvalidVersionTag(_)
                | PipelineError::NoContentForPreset(_)
                | PipelineError::Config(_)
        )
    }
}

impl From<globset::Error> for PipelineError {
    fn from(e: globset::Error) -> Self {
        PipelineError::Config(format!("invalid glob: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A reconciliation that stopped partway. Chunks written before the failure
/// stay written; `counts` reports what was applied.
#[derive(Error, Debug)]
#[error("reconciliation of {source_key} failed after {counts}: {error}")]
pub struct ReconcileError {
    pub source_key: String,
    pub counts: ReconcileCounts,
    #[source]
    pub error: PipelineError,
}
