//! Analysis API boundary.
//!
//! The workflow only sees the `ResearchApi` trait. Responses come back as
//! raw JSON; `ResultAggregator` turns them into typed records.

pub mod http;

pub use http::HttpResearchApi;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ApiError;
use crate::workflow::model::{PaperUpload, ProfileRequest};

/// Remote analysis service.
///
/// Implementations do no retrying; every failure is reported as an
/// `ApiError` and the caller decides what to do with it.
#[async_trait]
pub trait ResearchApi: Send + Sync {
    /// `{userId, experienceLevel, researchAreas[], researchStyle}`
    async fn create_profile(&self, request: &ProfileRequest) -> Result<Value, ApiError>;

    /// `{jobId, detectedTopics[]}`
    async fn upload_paper(&self, paper: &PaperUpload, user_id: &str) -> Result<Value, ApiError>;

    /// `{summary, concepts[], ideas[{title, description}]}`
    async fn submit_quick_read(&self, job_id: &str, topics: &[String]) -> Result<Value, ApiError>;

    /// `{jobId}` of the deep research job, which runs asynchronously.
    async fn submit_deep_research(
        &self,
        job_id: &str,
        idea_indices: &[usize],
    ) -> Result<Value, ApiError>;

    /// `{status, progress?, error?, result?}`
    async fn job_status(&self, job_id: &str) -> Result<Value, ApiError>;
}
