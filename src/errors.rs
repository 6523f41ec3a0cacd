//! Error taxonomy shared by every component (store, lookup client, ingestion,
//! send engine). Each variant maps to exactly one row of the error table in
//! the design doc; callers branch on the variant, not on a string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("window contended")]
    WindowContended,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent remote failure: {0}")]
    PermanentRemote(String),

    #[error("not resolvable: {0}")]
    NotResolvable(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cli invocation failed: {0}")]
    CliFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Short machine-stable tag, used in per-record ingestion errors and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::NotFound => "not_found",
            PipelineError::AlreadyExists => "already_exists",
            PipelineError::WindowContended => "window_contended",
            PipelineError::Transient(_) => "transient",
            PipelineError::PermanentRemote(_) => "permanent_remote",
            PipelineError::NotResolvable(_) => "not_resolvable",
            PipelineError::Decode(_) => "decode_error",
            PipelineError::CliFailure(_) => "cli_failure",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Fatal(_) => "fatal",
        }
    }
}
