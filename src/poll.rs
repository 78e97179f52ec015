//! Waiting for a submitted job to reach a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::clock::{CancelToken, Clock};
use crate::error::StageError;
use crate::job::JobStatus;
use crate::remote::{JobHandle, RemoteApi, RemoteArtifact};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollConfig {
    /// Delay between status queries while the job is pending.
    pub backoff: BackoffPolicy,
    /// Total time to wait for a terminal state before giving up.
    pub max_wait: Duration,
    /// Consecutive failed status queries tolerated.
    pub retry_budget: u32,
    /// Delay between failed status queries.
    pub retry_backoff: BackoffPolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(120),
                multiplier: 1.5,
                jitter: 0.1,
            },
            max_wait: Duration::from_secs(6 * 60 * 60),
            retry_budget: 5,
            retry_backoff: BackoffPolicy {
                initial: Duration::from_secs(2),
                max: Duration::from_secs(60),
                multiplier: 2.0,
                jitter: 0.2,
            },
        }
    }
}

/// Drives the [`JobStatus`] state machine of one job from remote observations.
#[derive(Clone)]
pub struct Poller {
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    config: PollConfig,
}

impl Poller {
    pub fn new(remote: Arc<dyn RemoteApi>, clock: Arc<dyn Clock>, config: PollConfig) -> Self {
        Self {
            remote,
            clock,
            config,
        }
    }

    /// Polls until the job completes and returns where its result lives.
    ///
    /// `Failed` and `Expired` become [`StageError::JobFailed`] and
    /// [`StageError::JobExpired`]. Running out of `max_wait` is
    /// [`StageError::Timeout`]; running out of `retry_budget` is
    /// [`StageError::PollingUnavailable`]. On cancellation the remote job is
    /// asked to stop and [`StageError::Cancelled`] is returned.
    pub fn wait(&self, job: &JobHandle, cancel: &CancelToken) -> Result<RemoteArtifact, StageError> {
        let started = self.clock.now();
        let mut state = JobStatus::Queued;
        let mut delays = Backoff::new(self.config.backoff);
        let mut retries = Backoff::new(self.config.retry_backoff);
        let budget = self.config.retry_budget.max(1);
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(self.abandon(job));
            }

            let delay = match self.remote.status(job) {
                Ok(observation) => {
                    if failures > 0 {
                        debug!(job_id = %job.id, failures, "status observable again");
                        failures = 0;
                        retries.reset();
                    }

                    let next = state.observe(observation.status).map_err(|e| {
                        StageError::RemoteRejected(format!("job {}: {e}", job.id))
                    })?;
                    if next != state {
                        info!(job_id = %job.id, from = %state, to = %next, "job status changed");
                        state = next;
                    }

                    match state {
                        JobStatus::Completed => {
                            return observation.artifact.ok_or_else(|| {
                                StageError::RemoteRejected(format!(
                                    "job {} completed without a result location",
                                    job.id
                                ))
                            });
                        }
                        JobStatus::Failed => {
                            return Err(StageError::JobFailed {
                                job_id: job.id.clone(),
                                reason: observation
                                    .message
                                    .unwrap_or_else(|| "no reason given".to_string()),
                            });
                        }
                        JobStatus::Expired => {
                            return Err(StageError::JobExpired {
                                job_id: job.id.clone(),
                            });
                        }
                        JobStatus::Queued | JobStatus::Running => delays.next_delay(),
                    }
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures >= budget {
                        return Err(StageError::PollingUnavailable {
                            job_id: job.id.clone(),
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = retries.next_delay();
                    warn!(
                        job_id = %job.id,
                        error = %e,
                        failures,
                        budget,
                        retry_in = ?delay,
                        "status query failed"
                    );
                    delay
                }
                Err(e) => return Err(e),
            };

            let waited = self.clock.now().saturating_duration_since(started);
            if waited >= self.config.max_wait {
                warn!(job_id = %job.id, ?waited, last_status = %state, "giving up on job");
                return Err(StageError::Timeout {
                    job_id: job.id.clone(),
                    waited,
                });
            }

            // One last look exactly at the deadline rather than sleeping past it.
            let delay = delay.min(self.config.max_wait - waited);
            if !self.clock.sleep(delay, cancel) {
                return Err(self.abandon(job));
            }
        }
    }

    fn abandon(&self, job: &JobHandle) -> StageError {
        info!(job_id = %job.id, "cancelling job");
        if let Err(e) = self.remote.cancel(job) {
            warn!(job_id = %job.id, error = %e, "remote cancellation failed");
        }
        StageError::Cancelled {
            job_id: job.id.clone(),
        }
    }
}
