//! The boundary between the pipeline and a queue-based retrieval service.

use std::io::Read;

use crate::error::StageError;
use crate::job::JobStatus;
use crate::request::RequestDescriptor;

/// Identifies a submitted job and how to reach it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub(crate) route: JobRoute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobRoute {
    /// No transport details; the implementation derives them from the id.
    Opaque,
    /// Retrieve API job, polled at its `monitor` link.
    Processes { monitor_url: String },
    /// Legacy API task under the base URL that accepted it.
    Legacy { base_url: String },
}

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            route: JobRoute::Opaque,
        }
    }

    pub(crate) fn with_route(id: impl Into<String>, route: JobRoute) -> Self {
        Self {
            id: id.into(),
            route,
        }
    }
}

/// Where a completed job's result can be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub job_id: String,
    /// Download URL.
    pub location: String,
    /// Expected content length (bytes), when the remote declares one.
    pub size: Option<u64>,
    /// Remote-declared content checksum, in whatever notation it used.
    pub checksum: Option<String>,
    pub content_type: Option<String>,
}

/// One status observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub status: JobStatus,
    /// Failure reason or other human-readable detail.
    pub message: Option<String>,
    /// Present once the job is `Completed`.
    pub artifact: Option<RemoteArtifact>,
}

impl RemoteStatus {
    pub fn pending(status: JobStatus) -> Self {
        Self {
            status,
            message: None,
            artifact: None,
        }
    }

    pub fn completed(artifact: RemoteArtifact) -> Self {
        Self {
            status: JobStatus::Completed,
            message: None,
            artifact: Some(artifact),
        }
    }
}

/// Submit/poll/retrieve protocol. Each call is a single attempt; retry policy
/// belongs to the caller.
pub trait RemoteApi: Send + Sync {
    fn submit(&self, request: &RequestDescriptor) -> Result<JobHandle, StageError>;

    fn status(&self, job: &JobHandle) -> Result<RemoteStatus, StageError>;

    fn open(&self, artifact: &RemoteArtifact) -> Result<Box<dyn Read + Send>, StageError>;

    /// Best effort; the remote job may keep running.
    fn cancel(&self, job: &JobHandle) -> Result<(), StageError>;
}
