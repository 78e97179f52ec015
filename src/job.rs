use std::fmt;

/// Lifecycle of a remote job as last observed by polling.
///
/// ```text
/// Queued ──▶ Running ──▶ Completed | Failed | Expired
///   ▲           │
///   └───────────┘ (remote requeue)
/// ```
///
/// Only observations move the state; nothing is inferred locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Expired,
}

/// A terminal job was observed to change state again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job status cannot change from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Expired)
    }

    /// Applies a remote observation to the current state.
    pub fn observe(self, observed: JobStatus) -> Result<JobStatus, InvalidTransition> {
        if self.is_terminal() && observed != self {
            return Err(InvalidTransition {
                from: self,
                to: observed,
            });
        }
        Ok(observed)
    }

    /// Maps the status vocabulary of both CDS APIs.
    ///
    /// Retrieve API (OGC Processes): `accepted`, `running`, `successful`,
    /// `failed`, `rejected`, `dismissed`, `deleted`.
    /// Legacy API: `queued`, `running`, `completed`, `failed`.
    pub fn from_remote(status: &str) -> Option<JobStatus> {
        match status.trim().to_ascii_lowercase().as_str() {
            "accepted" | "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "successful" | "completed" => Some(JobStatus::Completed),
            "failed" | "rejected" => Some(JobStatus::Failed),
            "dismissed" | "deleted" | "expired" => Some(JobStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
