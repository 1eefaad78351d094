//! Error types for the generation pipeline and account administration.
//!
//! Startup and configuration paths use `anyhow`; these enums cover the
//! recoverable per-job and per-command failures.

use thiserror::Error;

/// Failure of a single generation job. The `Display` text is what the
/// job's originator is told.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Non-success response from the generation service.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Every account in a full rotation sweep was below the per-image cost.
    #[error("all accounts are out of points")]
    QuotaExhausted,

    /// The poll budget ran out before the service reported a result.
    #[error("image generation timed out")]
    Timeout,

    /// The service reported completion but returned no image URL.
    #[error("the service returned no image")]
    NoImages,

    #[error("no accounts are configured")]
    NoAccounts,
}

/// Failure of an account-management operation.
#[derive(Error, Debug)]
pub enum AccountError {
    #[error("token or user id already exists")]
    Duplicate,

    #[error("no matching account")]
    NotFound,

    #[error("accounts file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("accounts file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A generation request rejected before it reaches the queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("guidance scale {0} is outside 1.0..=10.0")]
    GuidanceScale(f64),

    #[error("seed {0} is outside -1..=2147483647")]
    Seed(i64),
}
