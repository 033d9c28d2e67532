//! WorkflowController: sequences one discovery session.
//!
//! Owns the session snapshot and is its only writer. Every change publishes
//! a new `Arc<WorkflowSession>` on a watch channel; the previous one moves
//! into a bounded history.
//!
//! Network-backed transitions follow the same shape:
//! 1. `begin` checks the step, marks the stage in flight and hands out the
//!    current epoch as a token.
//! 2. The request runs without any lock held.
//! 3. `commit` applies the result only if the epoch still equals the token.
//!    `cancel`, `reset` and every finished transition bump the epoch, so a
//!    late response for an abandoned step is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::ResultAggregator;
use crate::api::ResearchApi;
use crate::config::DiscoveryConfig;
use crate::error::{Error, JobError, ValidationError, WorkflowError};
use crate::poller::JobPoller;
use crate::selection::SelectionGuard;

use super::model::{
    AnalysisJob, JobInput, JobKind, JobStatus, PaperUpload, ProfileRequest,
};
use super::state::{Stage, WorkflowSession, WorkflowStep};

/// Outcome of a trigger that did not fail.
#[derive(Debug, Clone)]
pub enum Transition {
    /// A new snapshot was published.
    Applied(Arc<WorkflowSession>),
    /// The named stage was in flight; nothing was done.
    InFlight(Stage),
    /// The operation finished after the session moved on; its result was
    /// dropped.
    Discarded,
}

impl Transition {
    pub fn session(&self) -> Option<&Arc<WorkflowSession>> {
        match self {
            Self::Applied(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

struct Inner {
    epoch: u64,
    in_flight: Option<Stage>,
    cancel: CancellationToken,
    history: VecDeque<Arc<WorkflowSession>>,
}

/// Handed out by `begin`; identifies one network-backed attempt.
struct Ticket {
    token: u64,
    cancel: CancellationToken,
    session: Arc<WorkflowSession>,
}

enum Attempt {
    Started(Ticket),
    Busy(Stage),
}

/// Restores the last good state if an attempt is dropped before it
/// finishes.
struct AttemptGuard<'a> {
    controller: &'a WorkflowController,
    token: u64,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.controller.abandon(self.token);
    }
}

/// Drives a session through profile → upload → quick read → selection →
/// deep research → final ranking.
pub struct WorkflowController {
    api: Arc<dyn ResearchApi>,
    poller: JobPoller,
    history_limit: usize,
    tx: watch::Sender<Arc<WorkflowSession>>,
    inner: Mutex<Inner>,
}

impl WorkflowController {
    pub fn new(api: Arc<dyn ResearchApi>, config: &DiscoveryConfig) -> Self {
        let poller = JobPoller::new(Arc::clone(&api), config.poll.clone());
        let (tx, _rx) = watch::channel(Arc::new(WorkflowSession::new()));
        Self {
            api,
            poller,
            history_limit: config.history_limit,
            tx,
            inner: Mutex::new(Inner {
                epoch: 0,
                in_flight: None,
                cancel: CancellationToken::new(),
                history: VecDeque::new(),
            }),
        }
    }

    // ── Observation ─────────────────────────────────────────────────

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<WorkflowSession> {
        Arc::clone(&self.tx.borrow())
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<WorkflowSession>> {
        self.tx.subscribe()
    }

    /// Stream of snapshots, starting with the current one.
    pub fn snapshots(&self) -> WatchStream<Arc<WorkflowSession>> {
        WatchStream::new(self.tx.subscribe())
    }

    /// Earlier snapshots, oldest first.
    pub fn history(&self) -> Vec<Arc<WorkflowSession>> {
        self.lock().history.iter().cloned().collect()
    }

    /// Stage currently waiting on the network, if any.
    pub fn in_flight(&self) -> Option<Stage> {
        self.lock().in_flight
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Idle → ProfileReady.
    pub async fn submit_profile(&self, request: ProfileRequest) -> Result<Transition, Error> {
        request.validate()?;
        let ticket = match self.begin(Stage::Profile, "submit a profile")? {
            Attempt::Started(ticket) => ticket,
            Attempt::Busy(busy) => return Ok(Transition::InFlight(busy)),
        };
        let _guard = self.guard(ticket.token);
        info!(session_id = %ticket.session.session_id, method = %request.method(), "Creating profile");

        let profile = match self.api.create_profile(&request).await {
            Ok(payload) => ResultAggregator::profile(&request, &payload).map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        let profile = match profile {
            Ok(profile) => profile,
            Err(e) => return self.fail(ticket.token, Stage::Profile, e, |_| {}),
        };

        let user_id = profile.user_id.clone();
        Ok(self.finish(ticket.token, |s| {
            s.succeed(|next| {
                next.step = WorkflowStep::ProfileReady;
                next.profile = Some(profile);
            })
        }, || info!(user_id = %user_id, "Profile ready")))
    }

    /// ProfileReady → PaperUploaded.
    pub async fn upload_paper(&self, upload: PaperUpload) -> Result<Transition, Error> {
        upload.validate()?;
        let ticket = match self.begin(Stage::Upload, "upload a paper")? {
            Attempt::Started(ticket) => ticket,
            Attempt::Busy(busy) => return Ok(Transition::InFlight(busy)),
        };
        let _guard = self.guard(ticket.token);

        let Some(user_id) = ticket.session.profile.as_ref().map(|p| p.user_id.clone()) else {
            self.abandon(ticket.token);
            return Err(wrong_step("upload a paper", ticket.session.step));
        };
        info!(user_id = %user_id, file = %upload.file_name, bytes = upload.bytes.len(), "Uploading paper");

        let paper = match self.api.upload_paper(&upload, &user_id).await {
            Ok(payload) => ResultAggregator::upload(&upload, &user_id, &payload).map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        let paper = match paper {
            Ok(paper) => paper,
            Err(e) => return self.fail(ticket.token, Stage::Upload, e, |_| {}),
        };

        let job_id = paper.job_id.clone();
        let topics = paper.detected_topics.len();
        Ok(self.finish(ticket.token, |s| {
            s.succeed(|next| {
                next.step = WorkflowStep::PaperUploaded;
                next.paper = Some(paper);
            })
        }, || info!(job_id = %job_id, detected_topics = topics, "Paper uploaded")))
    }

    /// Replace the user-supplied topics merged into the quick read.
    /// Local; allowed only at PaperUploaded.
    pub fn set_manual_topics(&self, topics: Vec<String>) -> Result<Transition, Error> {
        self.local("edit topics", &[WorkflowStep::PaperUploaded], |s| {
            let paper = s
                .paper
                .as_ref()
                .ok_or_else(|| wrong_step("edit topics", s.step))?
                .with_manual_topics(topics);
            Ok(s.succeed(|next| next.paper = Some(paper)))
        })
    }

    /// PaperUploaded → QuickReadReady. The quick read is awaited directly.
    pub async fn request_quick_read(&self) -> Result<Transition, Error> {
        let ticket = match self.begin(Stage::QuickRead, "request a quick read")? {
            Attempt::Started(ticket) => ticket,
            Attempt::Busy(busy) => return Ok(Transition::InFlight(busy)),
        };
        let _guard = self.guard(ticket.token);

        let Some(paper) = ticket.session.paper.clone() else {
            self.abandon(ticket.token);
            return Err(wrong_step("request a quick read", ticket.session.step));
        };
        let topics = paper.merged_topics();
        if topics.is_empty() {
            self.abandon(ticket.token);
            return Err(ValidationError::NoTopics.into());
        }

        let mut job = AnalysisJob::submitted(&paper.job_id, JobKind::QuickRead, JobInput::Topics(topics.clone()));
        job.status = JobStatus::Running;
        self.commit(ticket.token, false, |s| s.succeed(|next| next.job = Some(job)));
        info!(job_id = %paper.job_id, topics = ?topics, "Requesting quick read");

        let result = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => return Ok(Transition::Discarded),
            r = self.api.submit_quick_read(&paper.job_id, &topics) => r,
        };
        let quick_read = match result {
            Ok(payload) => match reported_failure(&paper.job_id, &payload) {
                Some(e) => Err(e),
                None => ResultAggregator::quick_read(&paper.job_id, &topics, &payload).map_err(Error::from),
            },
            Err(e) => Err(e.into()),
        };
        let quick_read = match quick_read {
            Ok(qr) => qr,
            Err(e) => {
                return self.fail(ticket.token, Stage::QuickRead, e, |s| s.job = None);
            }
        };

        let ideas = quick_read.ideas.len();
        Ok(self.finish(ticket.token, |s| {
            s.succeed(|next| {
                next.step = WorkflowStep::QuickReadReady;
                next.quick_read = Some(quick_read);
                // Indices from an earlier quick read mean nothing now.
                next.selection.clear();
                next.job = None;
            })
        }, || info!(job_id = %paper.job_id, ideas, "Quick read ready")))
    }

    /// Select or deselect an idea. A fourth selection is rejected. Toggling
    /// after confirming reopens the selection.
    pub fn toggle_idea(&self, index: usize) -> Result<Transition, Error> {
        self.local(
            "change the idea selection",
            &[WorkflowStep::QuickReadReady, WorkflowStep::IdeasSelected],
            |s| {
                let selection = SelectionGuard::toggle(&s.selection, index)?;
                debug!(index, selected = ?selection, "Selection changed");
                Ok(s.succeed(|next| {
                    next.selection = selection;
                    next.step = WorkflowStep::QuickReadReady;
                }))
            },
        )
    }

    /// QuickReadReady → IdeasSelected. Requires exactly three ideas from the
    /// current quick read.
    pub fn confirm_selection(&self) -> Result<Transition, Error> {
        self.local("confirm the selection", &[WorkflowStep::QuickReadReady], |s| {
            let available = s.quick_read.as_ref().map(|qr| qr.indices()).unwrap_or_default();
            SelectionGuard::validate_for_submission(&s.selection, &available)?;
            debug_assert!(s.step.can_transition_to(WorkflowStep::IdeasSelected));
            info!(selected = ?s.selection, "Selection confirmed");
            Ok(s.succeed(|next| next.step = WorkflowStep::IdeasSelected))
        })
    }

    /// IdeasSelected → DeepResearchRunning → FinalReady.
    ///
    /// Submits the job and watches it until it settles. On failure or
    /// timeout the session returns to IdeasSelected with the failure
    /// attached, ready for another attempt.
    pub async fn run_deep_research(&self) -> Result<Transition, Error> {
        let ticket = match self.begin(Stage::DeepResearch, "start deep research")? {
            Attempt::Started(ticket) => ticket,
            Attempt::Busy(busy) => return Ok(Transition::InFlight(busy)),
        };
        let _guard = self.guard(ticket.token);
        let session = Arc::clone(&ticket.session);

        let (Some(paper), Some(quick_read)) = (session.paper.as_ref(), session.quick_read.as_ref()) else {
            self.abandon(ticket.token);
            return Err(wrong_step("start deep research", session.step));
        };
        if let Err(e) = SelectionGuard::validate_for_submission(&session.selection, &quick_read.indices()) {
            self.abandon(ticket.token);
            return Err(e.into());
        }
        let indices: Vec<usize> = session.selection.iter().copied().collect();
        let selected = session.selected_ideas();
        info!(job_id = %paper.job_id, ideas = ?indices, "Submitting deep research");

        let submitted = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => return Ok(Transition::Discarded),
            r = self.api.submit_deep_research(&paper.job_id, &indices) => r,
        };
        let job_id = match submitted {
            Ok(payload) => ResultAggregator::deep_research_job(&payload).map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        let job_id = match job_id {
            Ok(id) => id,
            Err(e) => return self.fail(ticket.token, Stage::DeepResearch, e, restore_selection),
        };

        let job = AnalysisJob::submitted(&job_id, JobKind::DeepResearch, JobInput::Ideas(indices));
        if self
            .commit(ticket.token, false, |s| {
                debug_assert!(s.step.can_transition_to(WorkflowStep::DeepResearchRunning));
                s.succeed(|next| {
                    next.step = WorkflowStep::DeepResearchRunning;
                    next.job = Some(job);
                })
            })
            .is_none()
        {
            return Ok(Transition::Discarded);
        }
        info!(job_id = %job_id, "Deep research running");

        let outcome = self
            .poller
            .wait(&job_id, ticket.cancel.clone(), |update| {
                self.commit(ticket.token, false, |s| {
                    s.succeed(|next| {
                        if let Some(job) = next.job.take() {
                            next.job = Some(job.observe(update));
                        }
                    })
                });
            })
            .await;

        let completed = match outcome {
            Ok(update) => update,
            Err(Error::Job(JobError::Cancelled { .. })) => return Ok(Transition::Discarded),
            Err(e) => return self.fail(ticket.token, Stage::DeepResearch, e, restore_selection),
        };

        let payload = completed.result.unwrap_or(serde_json::Value::Null);
        let final_result = match ResultAggregator::final_result(&job_id, &payload, &selected) {
            Ok(result) => result,
            Err(e) => {
                return self.fail(ticket.token, Stage::DeepResearch, e.into(), restore_selection);
            }
        };

        Ok(self.finish(ticket.token, |s| {
            s.succeed(|next| {
                next.step = WorkflowStep::FinalReady;
                next.final_result = Some(final_result);
                next.job = None;
            })
        }, || info!(job_id = %job_id, "Final ranking ready")))
    }

    /// Stop whatever is in flight and fall back to the last good step.
    /// Responses still on their way are discarded when they arrive.
    pub fn cancel(&self) -> Arc<WorkflowSession> {
        let mut inner = self.lock();
        inner.epoch += 1;
        if let Some(stage) = inner.in_flight.take() {
            info!(stage = %stage, "Cancelling in-flight operation");
        }
        inner.cancel.cancel();
        inner.cancel = CancellationToken::new();

        let current = self.snapshot();
        match last_good(&current) {
            Some(restored) => self.publish(&mut inner, restored),
            None => current,
        }
    }

    /// Cancel and start a fresh session.
    pub fn reset(&self) -> Arc<WorkflowSession> {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.in_flight = None;
        inner.cancel.cancel();
        inner.cancel = CancellationToken::new();
        inner.history.clear();

        let fresh = Arc::new(WorkflowSession::new());
        self.tx.send_replace(Arc::clone(&fresh));
        info!(session_id = %fresh.session_id, "Session reset");
        fresh
    }

    // ── Internals ───────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn guard(&self, token: u64) -> AttemptGuard<'_> {
        AttemptGuard {
            controller: self,
            token,
        }
    }

    /// Publish `next` and move the previous snapshot into history.
    fn publish(&self, inner: &mut Inner, next: WorkflowSession) -> Arc<WorkflowSession> {
        let next = Arc::new(next);
        let previous = self.tx.send_replace(Arc::clone(&next));
        inner.history.push_back(previous);
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }
        next
    }

    /// Start a network-backed stage, unless some stage is already in flight.
    fn begin(&self, stage: Stage, operation: &str) -> Result<Attempt, Error> {
        let mut inner = self.lock();
        if let Some(busy) = inner.in_flight {
            debug!(requested = %stage, in_flight = %busy, "Ignoring trigger while busy");
            return Ok(Attempt::Busy(busy));
        }
        let session = self.snapshot();
        if session.step != stage.prerequisite() {
            return Err(wrong_step(operation, session.step));
        }
        inner.in_flight = Some(stage);
        Ok(Attempt::Started(Ticket {
            token: inner.epoch,
            cancel: inner.cancel.clone(),
            session,
        }))
    }

    /// Apply `f` if `token` is still current. `done` ends the attempt.
    fn commit<F>(&self, token: u64, done: bool, f: F) -> Option<Arc<WorkflowSession>>
    where
        F: FnOnce(&WorkflowSession) -> WorkflowSession,
    {
        let mut inner = self.lock();
        if inner.epoch != token {
            warn!(token, epoch = inner.epoch, "Discarding stale response");
            return None;
        }
        let next = f(&self.snapshot());
        let published = self.publish(&mut inner, next);
        if done {
            inner.epoch += 1;
            inner.in_flight = None;
        }
        Some(published)
    }

    fn finish<F, L>(&self, token: u64, f: F, log: L) -> Transition
    where
        F: FnOnce(&WorkflowSession) -> WorkflowSession,
        L: FnOnce(),
    {
        match self.commit(token, true, f) {
            Some(session) => {
                log();
                Transition::Applied(session)
            }
            None => Transition::Discarded,
        }
    }

    /// Record a failed attempt. The session keeps its last good step; a
    /// stale failure is dropped like any other stale response.
    fn fail<R>(&self, token: u64, stage: Stage, err: Error, restore: R) -> Result<Transition, Error>
    where
        R: FnOnce(&mut WorkflowSession),
    {
        let failure = super::state::StepFailure::new(stage, err.clone());
        let applied = self.commit(token, true, |s| {
            let mut next = s.fail(failure);
            restore(&mut next);
            next
        });
        match applied {
            Some(session) => {
                error!(session_id = %session.session_id, stage = %stage, "Step failed: {err}");
                Err(err)
            }
            None => Ok(Transition::Discarded),
        }
    }

    /// End an attempt that never finished. No-op once it has.
    fn abandon(&self, token: u64) {
        let mut inner = self.lock();
        if inner.epoch != token {
            return;
        }
        inner.epoch += 1;
        inner.in_flight = None;
        inner.cancel.cancel();
        inner.cancel = CancellationToken::new();
        if let Some(restored) = last_good(&self.snapshot()) {
            debug!("Attempt abandoned, restoring last good state");
            self.publish(&mut inner, restored);
        }
    }

    /// Run a local, synchronous edit of the session.
    fn local<F>(&self, operation: &str, allowed: &[WorkflowStep], f: F) -> Result<Transition, Error>
    where
        F: FnOnce(&WorkflowSession) -> Result<WorkflowSession, Error>,
    {
        let mut inner = self.lock();
        if let Some(busy) = inner.in_flight {
            debug!(operation, in_flight = %busy, "Ignoring local edit while busy");
            return Ok(Transition::InFlight(busy));
        }
        let current = self.snapshot();
        if !allowed.contains(&current.step) {
            return Err(wrong_step(operation, current.step));
        }
        let next = f(&current)?;
        Ok(Transition::Applied(self.publish(&mut inner, next)))
    }
}

fn wrong_step(operation: &str, current: WorkflowStep) -> Error {
    WorkflowError::WrongStep {
        operation: operation.to_string(),
        current,
    }
    .into()
}

fn restore_selection(session: &mut WorkflowSession) {
    session.step = WorkflowStep::IdeasSelected;
    session.job = None;
}

/// Snapshot with any half-finished job removed, or `None` if there is
/// nothing to undo.
fn last_good(session: &WorkflowSession) -> Option<WorkflowSession> {
    if session.step != WorkflowStep::DeepResearchRunning && session.job.is_none() {
        return None;
    }
    Some(session.succeed(|next| {
        if next.step == WorkflowStep::DeepResearchRunning {
            next.step = WorkflowStep::IdeasSelected;
        }
        next.job = None;
    }))
}

/// A synchronous analysis call may answer 2xx with a failed status.
fn reported_failure(job_id: &str, payload: &serde_json::Value) -> Option<Error> {
    let status = payload.get("status").and_then(|s| s.as_str())?;
    match JobStatus::parse(status) {
        Some(JobStatus::Failed) => Some(
            JobError::Failed {
                job_id: job_id.to_string(),
                reason: payload
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("analysis failed")
                    .to_string(),
            }
            .into(),
        ),
        _ => None,
    }
}
