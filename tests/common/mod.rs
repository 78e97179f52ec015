#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use cdsstage::{
    BackoffPolicy, Catalog, DataFormat, DatasetDefinition, Domain, JobHandle, JobStatus,
    PipelineConfig, PollConfig, RemoteApi, RemoteArtifact, RemoteStatus, RequestDescriptor,
    StageConfig, StageError,
};

pub const NETCDF_BODY: &[u8] = b"CDF\x01\x00\x00\x00\x00fake netcdf payload";

/// How a fake job ends once its pending polls are used up.
#[derive(Debug, Clone)]
pub enum Terminal {
    Complete,
    Fail(String),
    Expire,
    /// Completes, but the download location is already gone.
    ExpireOnDownload,
    /// Stays `Running` forever.
    Never,
}

struct State {
    submit_errors: VecDeque<StageError>,
    status_errors: VecDeque<StageError>,
    pending_polls: u32,
    terminal: Terminal,
    body: Vec<u8>,
    checksum: Option<String>,
    polls: HashMap<String, u32>,
    submitted: Vec<RequestDescriptor>,
    submit_calls: u32,
    status_calls: u32,
    opens: u32,
    cancels: Vec<String>,
}

/// In-memory queue service driven by a fixed script.
pub struct FakeRemote {
    state: Mutex<State>,
}

impl FakeRemote {
    pub fn new(body: &[u8]) -> Self {
        Self {
            state: Mutex::new(State {
                submit_errors: VecDeque::new(),
                status_errors: VecDeque::new(),
                pending_polls: 0,
                terminal: Terminal::Complete,
                body: body.to_vec(),
                checksum: None,
                polls: HashMap::new(),
                submitted: Vec::new(),
                submit_calls: 0,
                status_calls: 0,
                opens: 0,
                cancels: Vec::new(),
            }),
        }
    }

    /// Number of `Running` observations before the terminal one.
    pub fn running_for(self, polls: u32) -> Self {
        self.state.lock().pending_polls = polls;
        self
    }

    pub fn ending(self, terminal: Terminal) -> Self {
        self.state.lock().terminal = terminal;
        self
    }

    pub fn failing_submissions(self, errors: Vec<StageError>) -> Self {
        self.state.lock().submit_errors = errors.into();
        self
    }

    pub fn failing_polls(self, errors: Vec<StageError>) -> Self {
        self.state.lock().status_errors = errors.into();
        self
    }

    pub fn declaring_checksum(self, checksum: &str) -> Self {
        self.state.lock().checksum = Some(checksum.to_string());
        self
    }

    /// Accepted submissions.
    pub fn submissions(&self) -> usize {
        self.state.lock().submitted.len()
    }

    pub fn submit_calls(&self) -> u32 {
        self.state.lock().submit_calls
    }

    pub fn status_calls(&self) -> u32 {
        self.state.lock().status_calls
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().opens
    }

    pub fn cancels(&self) -> Vec<String> {
        self.state.lock().cancels.clone()
    }
}

impl RemoteApi for FakeRemote {
    fn submit(&self, request: &RequestDescriptor) -> Result<JobHandle, StageError> {
        let mut state = self.state.lock();
        state.submit_calls += 1;
        if let Some(err) = state.submit_errors.pop_front() {
            return Err(err);
        }
        state.submitted.push(request.clone());
        Ok(JobHandle::new(format!("job-{}", state.submitted.len())))
    }

    fn status(&self, job: &JobHandle) -> Result<RemoteStatus, StageError> {
        let mut state = self.state.lock();
        state.status_calls += 1;
        if let Some(err) = state.status_errors.pop_front() {
            return Err(err);
        }

        let seen = state.polls.entry(job.id.clone()).or_insert(0);
        *seen += 1;
        let seen = *seen;
        if seen == 1 && state.pending_polls > 0 {
            return Ok(RemoteStatus::pending(JobStatus::Queued));
        }
        if seen <= state.pending_polls {
            return Ok(RemoteStatus::pending(JobStatus::Running));
        }

        Ok(match &state.terminal {
            Terminal::Complete | Terminal::ExpireOnDownload => RemoteStatus::completed(RemoteArtifact {
                job_id: job.id.clone(),
                location: format!("https://fake.invalid/{}/data", job.id),
                size: Some(state.body.len() as u64),
                checksum: state.checksum.clone(),
                content_type: None,
            }),
            Terminal::Fail(reason) => RemoteStatus {
                status: JobStatus::Failed,
                message: Some(reason.clone()),
                artifact: None,
            },
            Terminal::Expire => RemoteStatus::pending(JobStatus::Expired),
            Terminal::Never => RemoteStatus::pending(JobStatus::Running),
        })
    }

    fn open(&self, artifact: &RemoteArtifact) -> Result<Box<dyn Read + Send>, StageError> {
        let mut state = self.state.lock();
        state.opens += 1;
        if matches!(state.terminal, Terminal::ExpireOnDownload) {
            return Err(StageError::JobExpired {
                job_id: artifact.job_id.clone(),
            });
        }
        Ok(Box::new(Cursor::new(state.body.clone())))
    }

    fn cancel(&self, job: &JobHandle) -> Result<(), StageError> {
        self.state.lock().cancels.push(job.id.clone());
        Ok(())
    }
}

/// A single toy dataset: `var` (text choice) and `year`, NetCDF or GRIB.
pub fn toy_catalog() -> Catalog {
    Catalog::empty().with_dataset(
        DatasetDefinition::new("toy-reanalysis")
            .required(
                "var",
                Domain::Choice(vec!["temperature".into(), "precipitation".into()]),
                false,
            )
            .required("year", Domain::Integer { min: 1940, max: 2100 }, false)
            .optional("area", Domain::Area, false)
            .formats(&[DataFormat::Netcdf, DataFormat::Grib]),
    )
}

pub fn test_config(cache_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        cache_dir: cache_dir.to_path_buf(),
        poll: PollConfig {
            backoff: BackoffPolicy {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: 0.25,
            },
            max_wait: Duration::from_secs(3600),
            retry_budget: 3,
            retry_backoff: BackoffPolicy::fixed(Duration::from_secs(5)),
        },
        submit_backoff: BackoffPolicy::fixed(Duration::from_secs(10)),
        submit_retry_max: 5,
        stage: StageConfig {
            retry_max: 2,
            retry_backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
            progress: false,
        },
        max_cache_bytes: None,
        max_concurrent_jobs: 3,
    }
}

pub fn shared(remote: FakeRemote) -> Arc<FakeRemote> {
    Arc::new(remote)
}
