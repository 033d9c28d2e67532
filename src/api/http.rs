//! HTTP implementation of `ResearchApi` over reqwest.
//!
//! The analysis server answers `/api/analyze/search` only once the deep
//! research is done and keeps the ranked ideas under `/api/results/<id>`.
//! The adapter starts the search in the background, reports it through the
//! same status endpoint as every other job, and reshapes the stored ideas
//! into `result.topIdeas` once the job is complete.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use super::ResearchApi;
use crate::aggregator::MAX_REFERENCES;
use crate::config::DiscoveryConfig;
use crate::error::ApiError;
use crate::workflow::model::{JobStatus, PaperUpload, ProfileRequest};

/// Outcome of a search request that has not been reported yet.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Search {
    Running,
    Failed(String),
}

/// Talks to the analysis server's REST endpoints.
pub struct HttpResearchApi {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
    search_timeout: Duration,
    searches: Arc<Mutex<HashMap<String, Search>>>,
}

impl HttpResearchApi {
    pub fn new(config: &DiscoveryConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Transport {
                operation: "build_client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            client,
            search_timeout: config.search_timeout,
            searches: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Value, ApiError> {
        send_json(operation, self.authorize(builder)).await
    }

    fn searches(&self) -> MutexGuard<'_, HashMap<String, Search>> {
        lock(&self.searches)
    }

    /// Failure reason of a background search for `job_id`, consumed once.
    fn take_failed_search(&self, job_id: &str) -> Option<String> {
        let mut searches = self.searches();
        if !matches!(searches.get(job_id), Some(Search::Failed(_))) {
            return None;
        }
        match searches.remove(job_id) {
            Some(Search::Failed(reason)) => Some(reason),
            _ => None,
        }
    }
}

fn lock(searches: &Mutex<HashMap<String, Search>>) -> MutexGuard<'_, HashMap<String, Search>> {
    searches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Send a request and decode a JSON body from a success response.
async fn send_json(operation: &str, builder: RequestBuilder) -> Result<Value, ApiError> {
    let resp = builder.send().await.map_err(|e| ApiError::Transport {
        operation: operation.to_string(),
        reason: e.to_string(),
    })?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(operation, status = status.as_u16(), "Analysis API returned an error");
        return Err(ApiError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
            body: error_message(&body),
        });
    }

    resp.json::<Value>().await.map_err(|e| ApiError::Decode {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

/// Request body for profile creation.
fn profile_body(request: &ProfileRequest) -> Value {
    match request {
        ProfileRequest::Manual {
            description,
            experience_level,
        } => json!({
            "method": "manual",
            "description": description.trim(),
            "experience_level": experience_level.to_string(),
        }),
        ProfileRequest::Scholar { scholar_url } => json!({
            "method": "scholar",
            "google_scholar_url": scholar_url.trim(),
        }),
    }
}

/// Pull `{"error": "..."}` out of an error body, else return it as is.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.to_string())
}

/// The server detects no topics on upload; report an empty list so the
/// user supplies them.
fn with_detected_topics(mut payload: Value) -> Value {
    if let Some(obj) = payload.as_object_mut() {
        if !obj.contains_key("detectedTopics") && !obj.contains_key("detected_topics") {
            obj.insert("detectedTopics".to_string(), json!([]));
        }
    }
    payload
}

/// Status of a finished job with the stored results attached as
/// `result.topIdeas`.
fn completed_status(status: &Value, results: &Value) -> Value {
    let ideas = results
        .get("ideas")
        .or_else(|| results.get("top_ideas"))
        .and_then(Value::as_array);
    json!({
        "job_id": status.get("job_id"),
        "status": "completed",
        "progress": status.get("progress"),
        "result": ideas.map(|ideas| json!({ "topIdeas": contract_top_ideas(ideas) })),
    })
}

/// Reshape the searcher's stored ideas. They arrive best first without a
/// rank, with the idea text under `idea`, scores inside the assessments
/// and up to eight papers each.
fn contract_top_ideas(ideas: &[Value]) -> Vec<Value> {
    ideas
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let idea = entry.get("idea").filter(|v| v.is_object()).unwrap_or(entry);
            let text = |key: &str| idea.get(key).or_else(|| entry.get(key));
            let score = |assessment: &str, key: &str| {
                entry
                    .get(key)
                    .filter(|v| !v.is_null())
                    .or_else(|| entry.get(assessment).and_then(|a| a.get(key)))
            };
            let references: Vec<Value> = entry
                .get("papers")
                .or_else(|| entry.get("references"))
                .and_then(Value::as_array)
                .map(|papers| {
                    papers
                        .iter()
                        .take(MAX_REFERENCES)
                        .map(|paper| {
                            json!({
                                "title": paper.get("title"),
                                "year": paper.get("year"),
                                "citationCount": paper
                                    .get("citations")
                                    .or_else(|| paper.get("citationCount")),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            json!({
                "rank": entry.get("rank").cloned().unwrap_or_else(|| json!(i + 1)),
                "title": text("title"),
                "description": text("description"),
                "rationale": text("rationale"),
                "scores": {
                    "novelty": score("novelty_assessment", "novelty_score"),
                    "doability": score("doability_assessment", "doability_score"),
                    "composite": entry.get("composite_score"),
                },
                "references": references,
            })
        })
        .collect()
}

#[async_trait]
impl ResearchApi for HttpResearchApi {
    async fn create_profile(&self, request: &ProfileRequest) -> Result<Value, ApiError> {
        let builder = self
            .client
            .post(self.api_url("users/profile"))
            .json(&profile_body(request));
        self.send("create_profile", builder).await
    }

    async fn upload_paper(&self, paper: &PaperUpload, user_id: &str) -> Result<Value, ApiError> {
        let part = Part::bytes(paper.bytes.clone())
            .file_name(paper.file_name.clone())
            .mime_str("application/pdf")
            .map_err(|e| ApiError::Transport {
                operation: "upload_paper".to_string(),
                reason: e.to_string(),
            })?;
        let form = Form::new()
            .text("user_id", user_id.to_string())
            .part("file", part);

        let builder = self.client.post(self.api_url("upload")).multipart(form);
        self.send("upload_paper", builder).await.map(with_detected_topics)
    }

    async fn submit_quick_read(&self, job_id: &str, topics: &[String]) -> Result<Value, ApiError> {
        let builder = self
            .client
            .post(self.api_url("analyze/read"))
            .json(&json!({ "job_id": job_id, "topics": topics }));
        self.send("submit_quick_read", builder).await
    }

    /// Start the search and return at once; the analysis id doubles as the
    /// job id. A rejected search surfaces as a failed status on the next
    /// poll.
    async fn submit_deep_research(
        &self,
        job_id: &str,
        idea_indices: &[usize],
    ) -> Result<Value, ApiError> {
        let builder = self.authorize(
            self.client
                .post(self.api_url("analyze/search"))
                .timeout(self.search_timeout)
                .json(&json!({ "job_id": job_id, "selected_ideas": idea_indices })),
        );
        self.searches().insert(job_id.to_string(), Search::Running);
        tracing::info!(job_id, "Deep research search started");

        let searches = Arc::clone(&self.searches);
        let id = job_id.to_string();
        tokio::spawn(async move {
            match send_json("submit_deep_research", builder).await {
                Ok(_) => {
                    lock(&searches).remove(&id);
                    tracing::info!(job_id = %id, "Deep research search finished");
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Deep research search failed");
                    lock(&searches).insert(id, Search::Failed(e.to_string()));
                }
            }
        });

        Ok(json!({ "jobId": job_id }))
    }

    async fn job_status(&self, job_id: &str) -> Result<Value, ApiError> {
        if let Some(reason) = self.take_failed_search(job_id) {
            return Ok(json!({ "job_id": job_id, "status": "failed", "error": reason }));
        }

        let builder = self.client.get(self.api_url(&format!("status/{job_id}")));
        let status = self.send("job_status", builder).await?;
        let completed = status
            .get("status")
            .and_then(Value::as_str)
            .and_then(JobStatus::parse)
            == Some(JobStatus::Completed);
        if !completed || status.get("result").is_some_and(|r| !r.is_null()) {
            return Ok(status);
        }

        let builder = self.client.get(self.api_url(&format!("results/{job_id}")));
        let results = self.send("job_results", builder).await?;
        Ok(completed_status(&status, &results))
    }
}
