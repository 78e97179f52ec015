use serde_json::Value;

use crate::error::StageError;
use crate::job::JobStatus;
use crate::remote::{RemoteArtifact, RemoteStatus};
use crate::util::urljoin;

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ApiReply {
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) request_id: Option<String>,

    #[serde(default)]
    pub(crate) location: Option<String>,
    #[serde(default, alias = "contentLength", alias = "content_length")]
    pub(crate) content_length: Option<u64>,
    #[serde(default, alias = "contentType", alias = "content_type")]
    pub(crate) content_type: Option<String>,

    #[serde(default)]
    pub(crate) result: Option<Value>,

    #[serde(default)]
    pub(crate) error: Option<ApiError>,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ApiResultLocation {
    location: String,
    #[serde(default, alias = "contentLength", alias = "content_length")]
    content_length: Option<u64>,
    #[serde(default, alias = "contentType", alias = "content_type")]
    content_type: Option<String>,
}

impl ApiReply {
    /// Interprets a task reply as a status observation.
    pub(crate) fn to_status(&self, job_id: &str, base_url: &str) -> Result<RemoteStatus, StageError> {
        let status = JobStatus::from_remote(&self.state).ok_or_else(|| {
            StageError::RemoteRejected(format!("unknown API state [{}]", self.state))
        })?;

        match status {
            JobStatus::Completed => Ok(RemoteStatus::completed(self.remote_artifact(job_id, base_url)?)),
            JobStatus::Failed => Ok(RemoteStatus {
                status,
                message: Some(self.failure_message()),
                artifact: None,
            }),
            other => Ok(RemoteStatus::pending(other)),
        }
    }

    fn failure_message(&self) -> String {
        let msg = self
            .error
            .as_ref()
            .and_then(|e| e.message.as_deref())
            .unwrap_or("request failed");
        match self.error.as_ref().and_then(|e| e.reason.as_deref()) {
            Some(reason) if !reason.is_empty() => format!("{msg}. {reason}"),
            _ => msg.to_string(),
        }
    }

    fn remote_artifact(&self, job_id: &str, base_url: &str) -> Result<RemoteArtifact, StageError> {
        // Nested under `result` on most deployments.
        if let Some(result) = &self.result {
            if let Ok(r) = serde_json::from_value::<ApiResultLocation>(result.clone()) {
                return Ok(RemoteArtifact {
                    job_id: job_id.to_string(),
                    location: urljoin(base_url, &r.location),
                    size: r.content_length,
                    checksum: None,
                    content_type: r.content_type,
                });
            }
        }

        if let Some(location) = &self.location {
            return Ok(RemoteArtifact {
                job_id: job_id.to_string(),
                location: urljoin(base_url, location),
                size: self.content_length,
                checksum: None,
                content_type: self.content_type.clone(),
            });
        }

        Err(StageError::RemoteRejected(format!(
            "job {job_id} completed without download info"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_result_location() {
        let reply: ApiReply = serde_json::from_str(
            r#"{"state":"completed","request_id":"r1","result":{"location":"https://dl/x.nc","contentLength":10}}"#,
        )
        .unwrap();
        let status = reply.to_status("r1", "https://cds/api/v2").unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        let artifact = status.artifact.unwrap();
        assert_eq!(artifact.location, "https://dl/x.nc");
        assert_eq!(artifact.size, Some(10));
    }

    #[test]
    fn failed_reply_keeps_reason() {
        let reply: ApiReply = serde_json::from_str(
            r#"{"state":"failed","request_id":"r1","error":{"message":"MARS error","reason":"no data"}}"#,
        )
        .unwrap();
        let status = reply.to_status("r1", "https://cds/api/v2").unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.message.as_deref(), Some("MARS error. no data"));
    }

    #[test]
    fn queued_reply_is_pending() {
        let reply: ApiReply = serde_json::from_str(r#"{"state":"queued","request_id":"r1"}"#).unwrap();
        assert_eq!(
            reply.to_status("r1", "https://cds/api").unwrap(),
            RemoteStatus::pending(JobStatus::Queued)
        );
    }
}
