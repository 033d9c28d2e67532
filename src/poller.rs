//! JobPoller: watches a long-running remote job until it settles.
//!
//! `watch` returns a lazy stream of status snapshots. Each tick sleeps,
//! then issues exactly one `job_status` request and waits for it before the
//! next sleep starts, so requests never pile up behind a slow server. Both
//! the sleep and the request race the deadline and the cancellation token.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::ResultAggregator;
use crate::api::ResearchApi;
use crate::config::PollConfig;
use crate::error::{Error, JobError};
use crate::workflow::model::{JobStatus, JobStatusUpdate};
use crate::workflow::state::Stage;

/// One item of a job watch. Everything but a non-terminal `Status` ends
/// the stream.
#[derive(Debug, Clone)]
pub enum PollEvent {
    /// A status report. Statuses never go backwards within one watch.
    Status(JobStatusUpdate),
    /// No terminal status before the deadline. The remote job is untouched.
    TimedOut { elapsed: Duration },
    /// The watch was cancelled.
    Cancelled,
    /// Polling itself failed: repeated transport errors or an unreadable
    /// status payload.
    Error(Error),
}

impl PollEvent {
    pub fn is_final(&self) -> bool {
        match self {
            Self::Status(update) => update.status.is_terminal(),
            _ => true,
        }
    }
}

enum Wake {
    Ready,
    Deadline,
    Cancelled,
}

enum Reply<T> {
    Done(T),
    Deadline,
    Cancelled,
}

/// Watches remote jobs through a `ResearchApi`.
#[derive(Clone)]
pub struct JobPoller {
    api: Arc<dyn ResearchApi>,
    config: PollConfig,
}

impl JobPoller {
    pub fn new(api: Arc<dyn ResearchApi>, config: PollConfig) -> Self {
        Self { api, config }
    }

    /// Watch `job_id` until it completes, fails, times out or `cancel` fires.
    ///
    /// Nothing is requested until the stream is polled.
    pub fn watch(
        &self,
        job_id: &str,
        cancel: CancellationToken,
    ) -> impl Stream<Item = PollEvent> + Send + 'static {
        let api = Arc::clone(&self.api);
        let config = self.config.clone();
        let job_id = job_id.to_string();

        async_stream::stream! {
            let started = Instant::now();
            let deadline = started + config.timeout;
            let mut delay = config.initial_delay;
            let mut interval = config.poll_interval;
            let mut failures: u32 = 0;
            let mut last_order: u8 = 0;

            debug!(job_id = %job_id, timeout = ?config.timeout, "Watching job");

            loop {
                let wake = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Wake::Cancelled,
                    _ = sleep_until(deadline) => Wake::Deadline,
                    _ = sleep(delay) => Wake::Ready,
                };
                match wake {
                    Wake::Ready => {}
                    Wake::Deadline => {
                        warn!(job_id = %job_id, "Gave up watching job after timeout");
                        yield PollEvent::TimedOut { elapsed: started.elapsed() };
                        return;
                    }
                    Wake::Cancelled => {
                        info!(job_id = %job_id, "Job watch cancelled");
                        yield PollEvent::Cancelled;
                        return;
                    }
                }

                let reply = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Reply::Cancelled,
                    _ = sleep_until(deadline) => Reply::Deadline,
                    r = api.job_status(&job_id) => Reply::Done(r),
                };
                let response = match reply {
                    Reply::Done(r) => r,
                    Reply::Deadline => {
                        warn!(job_id = %job_id, "Gave up watching job after timeout");
                        yield PollEvent::TimedOut { elapsed: started.elapsed() };
                        return;
                    }
                    Reply::Cancelled => {
                        info!(job_id = %job_id, "Job watch cancelled");
                        yield PollEvent::Cancelled;
                        return;
                    }
                };

                match response {
                    Err(e) => {
                        failures += 1;
                        if failures > config.max_transient_errors {
                            yield PollEvent::Error(
                                JobError::PollFailed {
                                    job_id: job_id.clone(),
                                    attempts: failures,
                                    reason: e.to_string(),
                                }
                                .into(),
                            );
                            return;
                        }
                        warn!(
                            job_id = %job_id,
                            attempt = failures,
                            max = config.max_transient_errors,
                            "Status poll failed, retrying: {e}"
                        );
                    }
                    Ok(payload) => {
                        failures = 0;
                        let update = match ResultAggregator::job_status(Stage::DeepResearch, &payload) {
                            Ok(update) => update,
                            Err(malformed) => {
                                yield PollEvent::Error(malformed.into());
                                return;
                            }
                        };
                        if update.status.order() < last_order {
                            debug!(job_id = %job_id, status = %update.status, "Ignoring status regression");
                        } else {
                            last_order = update.status.order();
                            let terminal = update.status.is_terminal();
                            debug!(job_id = %job_id, status = %update.status, progress = ?update.progress, "Job status");
                            yield PollEvent::Status(update);
                            if terminal {
                                return;
                            }
                        }
                    }
                }

                delay = interval;
                interval = config.next_interval(interval);
            }
        }
    }

    /// Drive a watch to its end. `on_status` sees every status report,
    /// including the terminal one.
    ///
    /// Returns the completed status, or the reason the job did not complete.
    pub async fn wait<F>(
        &self,
        job_id: &str,
        cancel: CancellationToken,
        mut on_status: F,
    ) -> Result<JobStatusUpdate, Error>
    where
        F: FnMut(&JobStatusUpdate),
    {
        let events = self.watch(job_id, cancel);
        futures::pin_mut!(events);

        while let Some(event) = events.next().await {
            match event {
                PollEvent::Status(update) => {
                    on_status(&update);
                    match update.status {
                        JobStatus::Completed => return Ok(update),
                        JobStatus::Failed => {
                            return Err(JobError::Failed {
                                job_id: job_id.to_string(),
                                reason: update
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| "job reported failure".to_string()),
                            }
                            .into());
                        }
                        JobStatus::Queued | JobStatus::Running => {}
                    }
                }
                PollEvent::TimedOut { elapsed } => {
                    return Err(JobError::Timeout {
                        job_id: job_id.to_string(),
                        elapsed,
                    }
                    .into());
                }
                PollEvent::Cancelled => break,
                PollEvent::Error(e) => return Err(e),
            }
        }

        Err(JobError::Cancelled {
            job_id: job_id.to_string(),
        }
        .into())
    }
}
