//! Request → cache lookup → submit → poll → stage → index.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{info, info_span, warn};

use crate::cache::{CacheIndex, StagedArtifact};
use crate::catalog::Catalog;
use crate::clock::{CancelToken, Clock, SystemClock};
use crate::error::{ErrorKind, StageError};
use crate::poll::Poller;
use crate::remote::RemoteApi;
use crate::request::{DatasetSpec, RequestBuilder, RequestDescriptor};
use crate::settings::PipelineConfig;
use crate::stage::StageManager;
use crate::submit::SubmissionClient;

/// How a successful run obtained its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Already staged by an earlier run; nothing was submitted.
    CacheHit(StagedArtifact),
    Staged(StagedArtifact),
}

impl Outcome {
    pub fn artifact(&self) -> &StagedArtifact {
        match self {
            Outcome::CacheHit(a) | Outcome::Staged(a) => a,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        matches!(self, Outcome::CacheHit(_))
    }
}

/// A failed run, with whatever was known about the request.
#[derive(Debug)]
pub struct PipelineFailure {
    pub spec: DatasetSpec,
    /// `None` when the specification itself was invalid.
    pub request: Option<RequestDescriptor>,
    pub error: StageError,
}

impl PipelineFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// The request summary if it was built, otherwise the dataset name.
    pub fn describe(&self) -> String {
        match &self.request {
            Some(request) => request.summary(),
            None => format!("{} [{}]", self.spec.dataset, self.spec.format),
        }
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.describe(), self.error)
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Result of one job of [`Pipeline::run_all`].
#[derive(Debug)]
pub struct JobReport {
    /// Position of the job in the input.
    pub position: usize,
    pub result: Result<Outcome, PipelineFailure>,
}

/// A job running on its own thread.
#[derive(Debug)]
pub struct TrackedJob {
    cancel: CancelToken,
    handle: JoinHandle<Result<Outcome, PipelineFailure>>,
}

impl TrackedJob {
    /// Stops local waiting and asks the remote to drop the job. The remote
    /// may finish it anyway.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<Outcome, PipelineFailure> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// The staging pipeline. Cheap to clone; clones share the cache index.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Catalog,
    index: CacheIndex,
    submitter: SubmissionClient,
    poller: Poller,
    stager: StageManager,
    max_jobs: usize,
}

impl Pipeline {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        catalog: Catalog,
        config: &PipelineConfig,
    ) -> Result<Self, StageError> {
        Self::with_clock(remote, catalog, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        remote: Arc<dyn RemoteApi>,
        catalog: Catalog,
        config: &PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StageError> {
        config.validate()?;
        let index = CacheIndex::open(&config.cache_dir, config.max_cache_bytes)?;
        let stager = StageManager::new(remote.clone(), clock.clone(), index.staging_dir(), config.stage);

        Ok(Self {
            inner: Arc::new(Inner {
                catalog,
                submitter: SubmissionClient::new(
                    remote.clone(),
                    clock.clone(),
                    config.submit_backoff,
                    config.submit_retry_max,
                ),
                poller: Poller::new(remote, clock, config.poll),
                stager,
                index,
                max_jobs: config.max_concurrent_jobs.max(1),
            }),
        })
    }

    pub fn index(&self) -> &CacheIndex {
        &self.inner.index
    }

    pub fn cache_dir(&self) -> &Path {
        self.inner.index.root()
    }

    /// Validates `spec` and returns its descriptor without touching the remote.
    pub fn describe(&self, spec: &DatasetSpec) -> Result<RequestDescriptor, StageError> {
        RequestBuilder::new(&self.inner.catalog).build(spec)
    }

    /// Produces the staged artifact for `spec`, from the cache when possible.
    pub fn run(&self, spec: &DatasetSpec, cancel: &CancelToken) -> Result<Outcome, PipelineFailure> {
        let request = self.describe(spec).map_err(|error| PipelineFailure {
            spec: spec.clone(),
            request: None,
            error,
        })?;

        let span = info_span!("job", dataset = %request.dataset(), key = %request.key().short());
        let _entered = span.enter();

        self.stage(&request, spec.refresh, cancel).map_err(|error| {
            warn!(kind = %error.kind(), %error, "job failed");
            PipelineFailure {
                spec: spec.clone(),
                request: Some(request.clone()),
                error,
            }
        })
    }

    fn stage(
        &self,
        request: &RequestDescriptor,
        refresh: bool,
        cancel: &CancelToken,
    ) -> Result<Outcome, StageError> {
        let inner = &self.inner;
        match inner.index.lookup(request.key()) {
            Some(artifact) if !refresh => {
                info!(path = %artifact.path.display(), "cache hit");
                return Ok(Outcome::CacheHit(artifact));
            }
            Some(artifact) => info!(path = %artifact.path.display(), "refreshing cached artifact"),
            None => {}
        }

        let job = inner.submitter.submit(request, cancel)?;
        info!(job_id = %job.id, "job submitted");

        let remote = inner.poller.wait(&job, cancel)?;
        let download = inner.stager.download(request.format(), &remote, cancel)?;
        let artifact = if refresh {
            inner.index.replace(request.key(), request.dataset(), download)?
        } else {
            inner.index.admit(request.key(), request.dataset(), download)?
        };
        Ok(Outcome::Staged(artifact))
    }

    /// Runs `spec` on a new thread.
    pub fn spawn(&self, spec: DatasetSpec) -> TrackedJob {
        let cancel = CancelToken::new();
        let pipeline = self.clone();
        let token = cancel.clone();
        let handle = thread::spawn(move || pipeline.run(&spec, &token));
        TrackedJob { cancel, handle }
    }

    /// Runs every spec with at most `max_concurrent_jobs` in flight.
    /// Reports come back in input order.
    pub fn run_all(&self, specs: Vec<DatasetSpec>, cancel: &CancelToken) -> Vec<JobReport> {
        let total = specs.len();
        if total == 0 {
            return Vec::new();
        }

        let queue = Mutex::new(specs.into_iter().enumerate().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::channel::<JobReport>();
        let workers = self.inner.max_jobs.min(total);
        info!(jobs = total, workers, "starting jobs");

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    loop {
                        let next = queue.lock().pop_front();
                        let Some((position, spec)) = next else {
                            break;
                        };
                        let result = self.run(&spec, cancel);
                        if tx.send(JobReport { position, result }).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut reports: Vec<JobReport> = rx.into_iter().collect();
        reports.sort_by_key(|r| r.position);
        reports
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("cache_dir", &self.inner.index.root())
            .field("max_jobs", &self.inner.max_jobs)
            .finish_non_exhaustive()
    }
}
