use std::sync::Arc;

use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::clock::{CancelToken, Clock};
use crate::error::StageError;
use crate::remote::{JobHandle, RemoteApi};
use crate::request::RequestDescriptor;

/// Submits requests, retrying queue rejections and network blips.
#[derive(Clone)]
pub struct SubmissionClient {
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
    max_attempts: u32,
}

impl SubmissionClient {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
        policy: BackoffPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            remote,
            clock,
            policy,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Returns the remote job handle. Only retryable errors are retried; the
    /// last one surfaces once `max_attempts` is spent.
    pub fn submit(
        &self,
        request: &RequestDescriptor,
        cancel: &CancelToken,
    ) -> Result<JobHandle, StageError> {
        let mut backoff = Backoff::new(self.policy);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled {
                    job_id: format!("unsubmitted:{}", request.key().short()),
                });
            }

            attempt += 1;
            match self.remote.submit(request) {
                Ok(handle) => {
                    debug!(job_id = %handle.id, attempt, "request accepted");
                    return Ok(handle);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.max_attempts,
                        retry_in = ?delay,
                        "submission refused, retrying"
                    );
                    if !self.clock.sleep(delay, cancel) {
                        return Err(StageError::Cancelled {
                            job_id: format!("unsubmitted:{}", request.key().short()),
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Read;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::catalog::{Catalog, DatasetDefinition, Domain};
    use crate::clock::ManualClock;
    use crate::remote::{RemoteArtifact, RemoteStatus};
    use crate::request::{DataFormat, DatasetSpec, RequestBuilder};

    struct ScriptedSubmit {
        replies: Mutex<VecDeque<Result<JobHandle, StageError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSubmit {
        fn new(replies: Vec<Result<JobHandle, StageError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }
    }

    impl RemoteApi for ScriptedSubmit {
        fn submit(&self, _: &RequestDescriptor) -> Result<JobHandle, StageError> {
            *self.calls.lock() += 1;
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(StageError::RemoteRejected("script exhausted".into())))
        }

        fn status(&self, _: &JobHandle) -> Result<RemoteStatus, StageError> {
            unreachable!()
        }

        fn open(&self, _: &RemoteArtifact) -> Result<Box<dyn Read + Send>, StageError> {
            unreachable!()
        }

        fn cancel(&self, _: &JobHandle) -> Result<(), StageError> {
            Ok(())
        }
    }

    fn descriptor() -> RequestDescriptor {
        let catalog = Catalog::empty().with_dataset(
            DatasetDefinition::new("toy")
                .required("year", Domain::Integer { min: 1940, max: 2100 }, false)
                .formats(&[DataFormat::Netcdf]),
        );
        RequestBuilder::new(&catalog)
            .build(&DatasetSpec::new("toy", "netcdf").param("year", json!(2020)))
            .unwrap()
    }

    fn client(remote: Arc<ScriptedSubmit>, clock: Arc<ManualClock>, max: u32) -> SubmissionClient {
        SubmissionClient::new(remote, clock, BackoffPolicy::fixed(Duration::from_secs(5)), max)
    }

    #[test]
    fn rate_limits_are_absorbed() {
        let remote = Arc::new(ScriptedSubmit::new(vec![
            Err(StageError::RateLimited("queue full".into())),
            Err(StageError::RateLimited("queue full".into())),
            Err(StageError::TransientNetwork("reset".into())),
            Ok(JobHandle::new("job-1")),
        ]));
        let clock = Arc::new(ManualClock::new());
        let handle = client(remote.clone(), clock.clone(), 5)
            .submit(&descriptor(), &CancelToken::new())
            .unwrap();

        assert_eq!(handle.id, "job-1");
        assert_eq!(*remote.calls.lock(), 4);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5); 3]);
    }

    #[test]
    fn auth_failure_is_not_retried() {
        let remote = Arc::new(ScriptedSubmit::new(vec![Err(StageError::Authentication(
            "bad key".into(),
        ))]));
        let err = client(remote.clone(), Arc::new(ManualClock::new()), 5)
            .submit(&descriptor(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StageError::Authentication(_)));
        assert_eq!(*remote.calls.lock(), 1);
    }

    #[test]
    fn budget_exhaustion_surfaces_last_error() {
        let remote = Arc::new(ScriptedSubmit::new(vec![
            Err(StageError::RateLimited("1".into())),
            Err(StageError::RateLimited("2".into())),
        ]));
        let err = client(remote.clone(), Arc::new(ManualClock::new()), 2)
            .submit(&descriptor(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StageError::RateLimited(ref m) if m == "2"));
    }

    #[test]
    fn cancelled_before_submission() {
        let remote = Arc::new(ScriptedSubmit::new(vec![Ok(JobHandle::new("never"))]));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = client(remote.clone(), Arc::new(ManualClock::new()), 3)
            .submit(&descriptor(), &cancel)
            .unwrap_err();
        assert!(matches!(err, StageError::Cancelled { .. }));
        assert_eq!(*remote.calls.lock(), 0);
    }
}
