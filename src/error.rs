//! Error types for the research discovery client.
//!
//! Every error is `Clone` so a step failure can be stored inside an
//! immutable session snapshot.

use std::time::Duration;

use crate::workflow::state::{Stage, WorkflowStep};

/// Top-level error type for the workflow client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Malformed response: {0}")]
    Malformed(#[from] MalformedResponse),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

impl Error {
    /// Whether this error was raised locally, before anything reached the network.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Selection(_) | Self::Workflow(_) | Self::Config(_)
        )
    }
}

/// Configuration-related errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Client-side input validation, caught before any network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    EmptyField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("At least one topic must be selected")]
    NoTopics,

    #[error("Unsupported file type: {file_name} (only PDF files are allowed)")]
    UnsupportedFileType { file_name: String },

    #[error("File is {size} bytes, maximum is {max}")]
    FileTooLarge { size: u64, max: u64 },

    #[error("File is empty")]
    EmptyFile,
}

/// Idea selection errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("At most {limit} ideas can be selected")]
    LimitExceeded { limit: usize },

    #[error("Invalid selection: {reason}")]
    InvalidSelection { reason: String },
}

/// Transport-level failures at the API boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("{operation} request failed: {reason}")]
    Transport { operation: String, reason: String },

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{operation} response could not be decoded: {reason}")]
    Decode { operation: String, reason: String },
}

/// A required field was missing or unusable in an API payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{step} response is missing or has an invalid `{field}`")]
pub struct MalformedResponse {
    pub step: Stage,
    pub field: String,
}

impl MalformedResponse {
    pub fn new(step: Stage, field: impl Into<String>) -> Self {
        Self {
            step,
            field: field.into(),
        }
    }
}

/// Long-running job errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Job {job_id} did not finish within {elapsed:?}")]
    Timeout { job_id: String, elapsed: Duration },

    #[error("Polling job {job_id} failed after {attempts} attempts: {reason}")]
    PollFailed {
        job_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Job {job_id} failed: {reason}")]
    Failed { job_id: String, reason: String },

    #[error("Watching job {job_id} was cancelled")]
    Cancelled { job_id: String },
}

/// Workflow sequencing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("Cannot {operation} while the session is at step {current}")]
    WrongStep {
        operation: String,
        current: WorkflowStep,
    },
}

/// Result type alias for the workflow client.
pub type Result<T> = std::result::Result<T, Error>;
