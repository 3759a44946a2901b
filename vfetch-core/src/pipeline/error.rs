use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::acquire::AcquireError;
use crate::artifact::ArtifactError;
use crate::process::ProcessError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no rendition satisfies the request for source {source_id}")]
    PlanNotFound { source_id: String },
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },
    #[error("catalog lookup for {source_id} still failing after {attempts} attempts: {reason}")]
    LookupExhausted {
        source_id: String,
        attempts: u32,
        reason: String,
    },
    #[error("stream fetch timed out after {0:?}")]
    FetchTimeout(Duration),
    #[error("stream fetch failed: {0}")]
    FetchFailed(String),
    #[error("processing timed out after {0:?}")]
    ProcessingTimeout(Duration),
    #[error("processing failed: {0}")]
    ProcessingFailed(String),
    #[error("failed to finalize artifact at {path}: {source}")]
    Finalize {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl PipelineError {
    /// Stable machine-readable class, used by the JSON output mode.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::PlanNotFound { .. } => "plan_not_found",
            PipelineError::SourceUnavailable { .. } => "source_unavailable",
            PipelineError::LookupExhausted { .. } => "lookup_exhausted",
            PipelineError::FetchTimeout(_) => "fetch_timeout",
            PipelineError::FetchFailed(_) => "fetch_failed",
            PipelineError::ProcessingTimeout(_) => "processing_timeout",
            PipelineError::ProcessingFailed(_) => "processing_failed",
            PipelineError::Finalize { .. } => "finalize_failed",
        }
    }
}

impl From<AcquireError> for PipelineError {
    fn from(error: AcquireError) -> Self {
        match error {
            AcquireError::Timeout(limit) => PipelineError::FetchTimeout(limit),
            other => PipelineError::FetchFailed(other.to_string()),
        }
    }
}

impl From<ProcessError> for PipelineError {
    fn from(error: ProcessError) -> Self {
        match error {
            ProcessError::Timeout(limit) => PipelineError::ProcessingTimeout(limit),
            other => PipelineError::ProcessingFailed(other.to_string()),
        }
    }
}

impl From<ArtifactError> for PipelineError {
    fn from(error: ArtifactError) -> Self {
        match error {
            ArtifactError::Io { source, path } => PipelineError::Finalize { source, path },
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
