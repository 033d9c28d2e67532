//! End-to-end workflow tests against a scripted analysis API.
//!
//! Time is paused in every test, so polling schedules and slow replies run
//! instantly and deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use serde_json::{Value, json};

use research_discovery::error::{
    ApiError, Error, JobError, SelectionError, ValidationError, WorkflowError,
};
use research_discovery::workflow::model::{ExperienceLevel, JobStatus, PaperUpload, ProfileRequest};
use research_discovery::workflow::{SessionStatus, Stage};
use research_discovery::{DiscoveryConfig, Transition, WorkflowController, WorkflowStep};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Profile,
    Upload { user_id: String },
    QuickRead { job_id: String, topics: Vec<String> },
    DeepResearch { job_id: String, ideas: Vec<usize> },
    Status { job_id: String },
}

struct Reply {
    after: Duration,
    result: Result<Value, ApiError>,
}

/// Analysis API stub: per-operation reply queues, an optional fallback
/// reply once a queue runs dry, and a log of every call.
#[derive(Default)]
struct ScriptedApi {
    replies: Mutex<HashMap<&'static str, VecDeque<Reply>>>,
    fallback: Mutex<HashMap<&'static str, Value>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedApi {
    fn then(&self, op: &'static str, result: Result<Value, ApiError>) -> &Self {
        self.then_after(op, Duration::ZERO, result)
    }

    fn then_after(&self, op: &'static str, after: Duration, result: Result<Value, ApiError>) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(Reply { after, result });
        self
    }

    fn otherwise(&self, op: &'static str, value: Value) -> &Self {
        self.fallback.lock().unwrap().insert(op, value);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().into_iter().filter(|c| pred(c)).count()
    }

    async fn reply(&self, op: &'static str, call: Call) -> Result<Value, ApiError> {
        self.calls.lock().unwrap().push(call);
        let next = self.replies.lock().unwrap().get_mut(op).and_then(|q| q.pop_front());
        if let Some(reply) = next {
            if !reply.after.is_zero() {
                tokio::time::sleep(reply.after).await;
            }
            return reply.result;
        }
        let fallback = self.fallback.lock().unwrap().get(op).cloned();
        match fallback {
            Some(value) => Ok(value),
            None => panic!("no scripted reply for {op}"),
        }
    }
}

#[async_trait]
impl research_discovery::ResearchApi for ScriptedApi {
    async fn create_profile(&self, _request: &ProfileRequest) -> Result<Value, ApiError> {
        self.reply("profile", Call::Profile).await
    }

    async fn upload_paper(&self, _paper: &PaperUpload, user_id: &str) -> Result<Value, ApiError> {
        self.reply(
            "upload",
            Call::Upload {
                user_id: user_id.to_string(),
            },
        )
        .await
    }

    async fn submit_quick_read(&self, job_id: &str, topics: &[String]) -> Result<Value, ApiError> {
        self.reply(
            "quick_read",
            Call::QuickRead {
                job_id: job_id.to_string(),
                topics: topics.to_vec(),
            },
        )
        .await
    }

    async fn submit_deep_research(&self, job_id: &str, ideas: &[usize]) -> Result<Value, ApiError> {
        self.reply(
            "deep_research",
            Call::DeepResearch {
                job_id: job_id.to_string(),
                ideas: ideas.to_vec(),
            },
        )
        .await
    }

    async fn job_status(&self, job_id: &str) -> Result<Value, ApiError> {
        self.reply(
            "status",
            Call::Status {
                job_id: job_id.to_string(),
            },
        )
        .await
    }
}

// ── Fixtures ────────────────────────────────────────────────────────────

fn profile_payload() -> Value {
    json!({
        "userId": "user-42",
        "experienceLevel": "intermediate",
        "researchAreas": ["graph databases", "query optimisation"],
        "researchStyle": "empirical"
    })
}

fn upload_payload(topics: &[&str]) -> Value {
    json!({ "jobId": "paper-7", "detectedTopics": topics })
}

fn quick_read_payload(ideas: usize) -> Value {
    let ideas: Vec<Value> = (0..ideas)
        .map(|i| json!({ "title": format!("Idea {i}"), "description": format!("Explore direction {i}") }))
        .collect();
    json!({
        "summary": "The paper benchmarks join ordering heuristics.",
        "concepts": ["join ordering", "cardinality estimation"],
        "ideas": ideas
    })
}

fn ranked(rank: u8, title: &str, composite: f64) -> Value {
    json!({
        "rank": rank,
        "idea": { "title": title, "description": "refined" },
        "rationale": "Under-explored and feasible with public datasets.",
        "scores": { "novelty": 80, "doability": 65.5, "composite": composite },
        "references": [
            { "title": "Learned Cardinalities", "year": 2019, "citationCount": 412 },
            { "title": "How Good Are Query Optimizers", "year": 2015 },
            { "title": "Neo: A Learned Query Optimizer" }
        ]
    })
}

fn final_payload() -> Value {
    json!({
        "topIdeas": [
            ranked(2, "Idea 1", 71.25),
            ranked(1, "Idea 3", 88.0),
            ranked(3, "Idea 5", 60.5),
        ]
    })
}

fn transport(operation: &str) -> ApiError {
    ApiError::Transport {
        operation: operation.to_string(),
        reason: "connection refused".to_string(),
    }
}

fn profile_request() -> ProfileRequest {
    ProfileRequest::manual("I work on query optimisation for graph stores", ExperienceLevel::Intermediate)
}

fn paper() -> PaperUpload {
    PaperUpload::new("join-ordering.pdf", b"%PDF-1.7 test".to_vec())
}

fn controller(api: &Arc<ScriptedApi>, config: &DiscoveryConfig) -> Arc<WorkflowController> {
    Arc::new(WorkflowController::new(api.clone(), config))
}

/// Script and drive a session up to `IdeasSelected` with ideas 1, 3 and 5.
async fn ideas_selected(api: &Arc<ScriptedApi>, config: &DiscoveryConfig) -> Arc<WorkflowController> {
    api.then("profile", Ok(profile_payload()))
        .then("upload", Ok(upload_payload(&["join ordering"])))
        .then("quick_read", Ok(quick_read_payload(6)));

    let controller = controller(api, config);
    controller.submit_profile(profile_request()).await.unwrap();
    controller.upload_paper(paper()).await.unwrap();
    controller.request_quick_read().await.unwrap();
    for index in [1, 3, 5] {
        controller.toggle_idea(index).unwrap();
    }
    controller.confirm_selection().unwrap();
    assert_eq!(controller.snapshot().step, WorkflowStep::IdeasSelected);
    controller
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn happy_path_reaches_final_ranking() {
    let api = Arc::new(ScriptedApi::default());
    let config = DiscoveryConfig::default();
    let controller = ideas_selected(&api, &config).await;

    api.then("deep_research", Ok(json!({ "jobId": "deep-9" })))
        .then("status", Ok(json!({ "status": "queued" })))
        .then("status", Ok(json!({ "status": "running", "progress": 40 })))
        .then("status", Ok(json!({ "status": "completed", "progress": 100, "result": final_payload() })));

    let outcome = controller.run_deep_research().await.unwrap();
    let session = outcome.session().expect("applied").clone();

    assert_eq!(session.step, WorkflowStep::FinalReady);
    assert!(session.job.is_none());
    assert!(session.last_error.is_none());

    let result = session.final_result.as_ref().unwrap();
    assert_eq!(result.job_id, "deep-9");
    let titles: Vec<&str> = result.rankings.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(titles, ["Idea 3", "Idea 1", "Idea 5"]);
    let best = result.best().unwrap();
    assert_eq!(best.idea_index, Some(3));
    assert_eq!(best.scores.composite, dec!(88.0));
    assert_eq!(best.scores.doability, dec!(65.5));
    assert_eq!(best.references.len(), 3);
    assert!(result.to_markdown().contains("## 1. Idea 3"));

    let calls = api.calls();
    assert!(calls.contains(&Call::Upload {
        user_id: "user-42".into()
    }));
    assert!(calls.contains(&Call::QuickRead {
        job_id: "paper-7".into(),
        topics: vec!["join ordering".into()],
    }));
    assert!(calls.contains(&Call::DeepResearch {
        job_id: "paper-7".into(),
        ideas: vec![1, 3, 5],
    }));
    assert_eq!(api.count(|c| matches!(c, Call::Status { job_id } if job_id == "deep-9")), 3);

    // Progress snapshots were published while the job ran.
    let progress: Vec<(JobStatus, Option<u8>)> = controller
        .history()
        .iter()
        .filter(|s| s.step == WorkflowStep::DeepResearchRunning)
        .filter_map(|s| s.job.as_ref().map(|j| (j.status, j.progress)))
        .collect();
    assert!(progress.contains(&(JobStatus::Running, Some(40))));
    assert!(progress.contains(&(JobStatus::Completed, Some(100))));
}

#[tokio::test(start_paused = true)]
async fn out_of_range_selection_is_rejected_at_confirm() {
    let api = Arc::new(ScriptedApi::default());
    api.then("profile", Ok(profile_payload()))
        .then("upload", Ok(upload_payload(&["join ordering"])))
        .then("quick_read", Ok(quick_read_payload(6)));
    let controller = controller(&api, &DiscoveryConfig::default());
    controller.submit_profile(profile_request()).await.unwrap();
    controller.upload_paper(paper()).await.unwrap();
    controller.request_quick_read().await.unwrap();

    for index in [1, 3, 7] {
        controller.toggle_idea(index).unwrap();
    }
    let err = controller.confirm_selection().unwrap_err();
    assert!(matches!(err, Error::Selection(SelectionError::InvalidSelection { .. })));
    assert_eq!(controller.snapshot().step, WorkflowStep::QuickReadReady);

    // Deep research cannot be started from here either.
    let err = controller.run_deep_research().await.unwrap_err();
    assert!(matches!(err, Error::Workflow(WorkflowError::WrongStep { .. })));
    assert_eq!(api.count(|c| matches!(c, Call::DeepResearch { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn fourth_selection_is_refused_and_state_kept() {
    let api = Arc::new(ScriptedApi::default());
    let controller = ideas_selected(&api, &DiscoveryConfig::default()).await;

    let err = controller.toggle_idea(0).unwrap_err();
    assert!(matches!(err, Error::Selection(SelectionError::LimitExceeded { limit: 3 })));
    let session = controller.snapshot();
    assert_eq!(session.step, WorkflowStep::IdeasSelected);
    assert_eq!(session.selection.iter().copied().collect::<Vec<_>>(), [1, 3, 5]);

    // Deselecting reopens the selection.
    controller.toggle_idea(3).unwrap();
    let session = controller.snapshot();
    assert_eq!(session.step, WorkflowStep::QuickReadReady);
    assert_eq!(session.selected_ideas().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn deep_research_timeout_keeps_ideas_and_can_be_retried() {
    let api = Arc::new(ScriptedApi::default());
    let mut config = DiscoveryConfig::default();
    config.poll.timeout = Duration::from_secs(60);
    let controller = ideas_selected(&api, &config).await;

    api.then("deep_research", Ok(json!({ "jobId": "deep-1" })))
        .otherwise("status", json!({ "status": "running" }));

    let started = tokio::time::Instant::now();
    let err = controller.run_deep_research().await.unwrap_err();
    assert!(matches!(err, Error::Job(JobError::Timeout { ref job_id, .. }) if job_id == "deep-1"));
    assert_eq!(started.elapsed(), Duration::from_secs(60));

    let session = controller.snapshot();
    assert_eq!(
        session.status(),
        SessionStatus::Failed {
            stage: Stage::DeepResearch,
            last_good: WorkflowStep::IdeasSelected,
        }
    );
    assert!(session.job.is_none());
    assert_eq!(session.ideas().len(), 6);
    assert_eq!(session.selection.len(), 3);
    assert!(controller.in_flight().is_none());

    // A second attempt starts from IdeasSelected again.
    api.then("deep_research", Ok(json!({ "jobId": "deep-2" })))
        .then("status", Ok(json!({ "status": "completed", "result": final_payload() })));
    let outcome = controller.run_deep_research().await.unwrap();
    assert_eq!(outcome.session().unwrap().step, WorkflowStep::FinalReady);
}

#[tokio::test(start_paused = true)]
async fn transport_error_on_profile_is_retryable() {
    let api = Arc::new(ScriptedApi::default());
    api.then("profile", Err(transport("create_profile")))
        .then("profile", Ok(profile_payload()));
    let controller = controller(&api, &DiscoveryConfig::default());

    let err = controller.submit_profile(profile_request()).await.unwrap_err();
    assert!(matches!(err, Error::Api(ApiError::Transport { .. })));
    let session = controller.snapshot();
    assert_eq!(session.step, WorkflowStep::Idle);
    assert_eq!(session.last_error.as_ref().map(|f| f.stage), Some(Stage::Profile));

    let outcome = controller.submit_profile(profile_request()).await.unwrap();
    let session = outcome.session().unwrap();
    assert_eq!(session.step, WorkflowStep::ProfileReady);
    assert!(session.last_error.is_none());
    assert_eq!(session.profile.as_ref().unwrap().user_id, "user-42");
}

#[tokio::test(start_paused = true)]
async fn failed_job_reports_server_reason() {
    let api = Arc::new(ScriptedApi::default());
    let controller = ideas_selected(&api, &DiscoveryConfig::default()).await;
    api.then("deep_research", Ok(json!({ "jobId": "deep-3" })))
        .then("status", Ok(json!({ "status": "error", "error": "search backend unavailable" })));

    let err = controller.run_deep_research().await.unwrap_err();
    assert!(
        matches!(err, Error::Job(JobError::Failed { ref reason, .. }) if reason == "search backend unavailable")
    );
    assert_eq!(controller.snapshot().step, WorkflowStep::IdeasSelected);
}

// ── Stale responses and re-entrancy ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn late_response_after_cancel_is_discarded() {
    let api = Arc::new(ScriptedApi::default());
    api.then_after("profile", Duration::from_secs(10), Ok(profile_payload()));
    let controller = controller(&api, &DiscoveryConfig::default());

    let pending = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.submit_profile(profile_request()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(controller.in_flight(), Some(Stage::Profile));

    let revision = controller.cancel().revision;
    assert!(controller.in_flight().is_none());

    let outcome = pending.await.unwrap().unwrap();
    assert!(matches!(outcome, Transition::Discarded));
    let session = controller.snapshot();
    assert_eq!(session.step, WorkflowStep::Idle);
    assert_eq!(session.revision, revision);
    assert!(session.profile.is_none());
}

#[tokio::test(start_paused = true)]
async fn late_response_after_reset_does_not_touch_new_session() {
    let api = Arc::new(ScriptedApi::default());
    let controller = ideas_selected(&api, &DiscoveryConfig::default()).await;
    api.then_after("deep_research", Duration::from_secs(10), Ok(json!({ "jobId": "deep-4" })));

    let pending = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run_deep_research().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    let fresh = controller.reset();

    assert!(matches!(pending.await.unwrap().unwrap(), Transition::Discarded));
    let session = controller.snapshot();
    assert_eq!(session.session_id, fresh.session_id);
    assert_eq!(session.step, WorkflowStep::Idle);
    assert!(controller.history().is_empty());
    assert_eq!(api.count(|c| matches!(c, Call::Status { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_triggers_are_ignored_while_in_flight() {
    let api = Arc::new(ScriptedApi::default());
    let controller = ideas_selected(&api, &DiscoveryConfig::default()).await;
    api.then("deep_research", Ok(json!({ "jobId": "deep-5" })))
        .otherwise("status", json!({ "status": "running" }));

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run_deep_research().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(controller.snapshot().step, WorkflowStep::DeepResearchRunning);

    let again = controller.run_deep_research().await.unwrap();
    assert!(matches!(again, Transition::InFlight(Stage::DeepResearch)));
    assert!(matches!(controller.toggle_idea(2).unwrap(), Transition::InFlight(_)));
    assert_eq!(api.count(|c| matches!(c, Call::DeepResearch { .. })), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let session = controller.cancel();
    assert_eq!(session.step, WorkflowStep::IdeasSelected);
    assert!(session.job.is_none());
    assert!(matches!(running.await.unwrap().unwrap(), Transition::Discarded));

    // No polling once cancelled.
    let polls = api.count(|c| matches!(c, Call::Status { .. }));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(api.count(|c| matches!(c, Call::Status { .. })), polls);
}

#[tokio::test(start_paused = true)]
async fn trigger_for_another_stage_reports_the_busy_stage() {
    let api = Arc::new(ScriptedApi::default());
    api.then("profile", Ok(profile_payload()))
        .then_after("upload", Duration::from_secs(10), Ok(upload_payload(&["indexing"])));
    let controller = controller(&api, &DiscoveryConfig::default());
    controller.submit_profile(profile_request()).await.unwrap();

    let uploading = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.upload_paper(paper()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(controller.in_flight(), Some(Stage::Upload));

    let profile = controller.submit_profile(profile_request()).await.unwrap();
    assert!(matches!(profile, Transition::InFlight(Stage::Upload)));
    let quick_read = controller.request_quick_read().await.unwrap();
    assert!(matches!(quick_read, Transition::InFlight(Stage::Upload)));
    assert_eq!(api.count(|c| matches!(c, Call::Profile)), 1);

    assert!(matches!(uploading.await.unwrap().unwrap(), Transition::Applied(_)));
    assert_eq!(controller.snapshot().step, WorkflowStep::PaperUploaded);
}

#[tokio::test(start_paused = true)]
async fn dropped_run_restores_last_good_step() {
    let api = Arc::new(ScriptedApi::default());
    let controller = ideas_selected(&api, &DiscoveryConfig::default()).await;
    api.then("deep_research", Ok(json!({ "jobId": "deep-6" })))
        .otherwise("status", json!({ "status": "running" }));

    let gave_up = tokio::time::timeout(Duration::from_secs(20), controller.run_deep_research()).await;
    assert!(gave_up.is_err());

    let session = controller.snapshot();
    assert_eq!(session.step, WorkflowStep::IdeasSelected);
    assert!(session.job.is_none());
    assert!(controller.in_flight().is_none());
}

// ── Failures attributed to a step ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn malformed_quick_read_is_a_step_failure() {
    let api = Arc::new(ScriptedApi::default());
    api.then("profile", Ok(profile_payload()))
        .then("upload", Ok(upload_payload(&["join ordering"])))
        .then("quick_read", Ok(quick_read_payload(2)));
    let controller = controller(&api, &DiscoveryConfig::default());
    controller.submit_profile(profile_request()).await.unwrap();
    controller.upload_paper(paper()).await.unwrap();

    let err = controller.request_quick_read().await.unwrap_err();
    match err {
        Error::Malformed(m) => {
            assert_eq!(m.step, Stage::QuickRead);
            assert_eq!(m.field, "ideas");
        }
        other => panic!("expected malformed response, got {other:?}"),
    }
    let session = controller.snapshot();
    assert_eq!(session.step, WorkflowStep::PaperUploaded);
    assert!(session.quick_read.is_none());
    assert!(session.job.is_none());
    assert_eq!(session.last_error.as_ref().map(|f| f.stage), Some(Stage::QuickRead));
}

#[tokio::test(start_paused = true)]
async fn quick_read_needs_topics() {
    let api = Arc::new(ScriptedApi::default());
    api.then("profile", Ok(profile_payload()))
        .then("upload", Ok(upload_payload(&[])))
        .then("quick_read", Ok(quick_read_payload(5)));
    let controller = controller(&api, &DiscoveryConfig::default());
    controller.submit_profile(profile_request()).await.unwrap();
    controller.upload_paper(paper()).await.unwrap();

    let err = controller.request_quick_read().await.unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::NoTopics)));
    assert_eq!(api.count(|c| matches!(c, Call::QuickRead { .. })), 0);

    controller
        .set_manual_topics(vec!["  Graph Partitioning ".into(), "".into()])
        .unwrap();
    controller.request_quick_read().await.unwrap();
    assert!(api.calls().contains(&Call::QuickRead {
        job_id: "paper-7".into(),
        topics: vec!["Graph Partitioning".into()],
    }));
    assert_eq!(controller.snapshot().step, WorkflowStep::QuickReadReady);
}

#[tokio::test(start_paused = true)]
async fn detected_and_manual_topics_are_merged_for_the_quick_read() {
    let api = Arc::new(ScriptedApi::default());
    api.then("profile", Ok(profile_payload()))
        .then("upload", Ok(upload_payload(&["graph databases", "indexing"])))
        .then("quick_read", Ok(quick_read_payload(6)));
    let controller = controller(&api, &DiscoveryConfig::default());

    let request = ProfileRequest::manual("studies graph databases", ExperienceLevel::Intermediate);
    controller.submit_profile(request).await.unwrap();
    controller.upload_paper(paper()).await.unwrap();
    controller
        .set_manual_topics(vec!["Indexing".into(), "query planning".into()])
        .unwrap();
    controller.request_quick_read().await.unwrap();

    let merged = vec![
        "graph databases".to_string(),
        "indexing".to_string(),
        "query planning".to_string(),
    ];
    assert!(api.calls().contains(&Call::QuickRead {
        job_id: "paper-7".into(),
        topics: merged.clone(),
    }));
    let session = controller.snapshot();
    assert_eq!(session.step, WorkflowStep::QuickReadReady);
    assert_eq!(
        session.profile.as_ref().and_then(|p| p.description.as_deref()),
        Some("studies graph databases")
    );
    assert_eq!(session.quick_read.as_ref().map(|qr| qr.topics.clone()), Some(merged));
}

#[tokio::test(start_paused = true)]
async fn local_validation_never_reaches_the_network() {
    let api = Arc::new(ScriptedApi::default());
    let controller = controller(&api, &DiscoveryConfig::default());

    let err = controller
        .submit_profile(ProfileRequest::manual("   ", ExperienceLevel::Beginner))
        .await
        .unwrap_err();
    assert!(err.is_local());

    let err = controller
        .submit_profile(ProfileRequest::scholar("https://example.com/me"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = controller.upload_paper(paper()).await.unwrap_err();
    assert!(matches!(err, Error::Workflow(WorkflowError::WrongStep { current: WorkflowStep::Idle, .. })));

    assert!(api.calls().is_empty());
    assert_eq!(controller.snapshot().revision, 0);
}

#[tokio::test(start_paused = true)]
async fn non_pdf_upload_is_rejected() {
    let api = Arc::new(ScriptedApi::default());
    api.then("profile", Ok(profile_payload()));
    let controller = controller(&api, &DiscoveryConfig::default());
    controller.submit_profile(profile_request()).await.unwrap();

    let err = controller
        .upload_paper(PaperUpload::new("notes.docx", b"PK..".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::UnsupportedFileType { .. })));
    assert_eq!(controller.snapshot().step, WorkflowStep::ProfileReady);
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_each_step() {
    let api = Arc::new(ScriptedApi::default());
    api.then("profile", Ok(profile_payload()));
    let controller = controller(&api, &DiscoveryConfig::default());
    let mut rx = controller.subscribe();

    controller.submit_profile(profile_request()).await.unwrap();
    assert!(rx.has_changed().unwrap());
    let seen = rx.borrow_and_update().clone();
    assert_eq!(seen.step, WorkflowStep::ProfileReady);
    assert_eq!(seen.revision, 1);

    // The earlier snapshot is unchanged and kept in history.
    let history = controller.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].step, WorkflowStep::Idle);
    assert_eq!(history[0].revision, 0);
}
