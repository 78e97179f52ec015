use crate::error::StageError;
use crate::job::JobStatus;
use crate::remote::RemoteArtifact;
use crate::util::urljoin;

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProcessingLink {
    #[serde(default)]
    rel: Option<String>,
    href: String,
}

fn find_link(links: &[ProcessingLink], rel: &str) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref() == Some(rel))
        .map(|l| l.href.clone())
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProcessingJob {
    #[serde(default, alias = "jobID")]
    pub(crate) job_id: Option<String>,
    #[serde(default)]
    links: Vec<ProcessingLink>,
}

impl ProcessingJob {
    pub(crate) fn monitor_url(&self) -> Option<String> {
        find_link(&self.links, "monitor")
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProcessingJobStatus {
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    links: Vec<ProcessingLink>,
}

impl ProcessingJobStatus {
    pub(crate) fn results_url(&self) -> Option<String> {
        find_link(&self.links, "results")
    }

    pub(crate) fn job_status(&self) -> Result<JobStatus, StageError> {
        JobStatus::from_remote(&self.status).ok_or_else(|| {
            StageError::RemoteRejected(format!("unknown processing status [{}]", self.status))
        })
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProcessingResults {
    asset: ProcessingAsset,
}

#[derive(Debug, serde::Deserialize)]
struct ProcessingAsset {
    value: ProcessingAssetValue,
}

#[derive(Debug, serde::Deserialize)]
struct ProcessingAssetValue {
    href: String,
    #[serde(default, rename = "file:size")]
    file_size: Option<u64>,
    #[serde(default, rename = "file:checksum")]
    file_checksum: Option<String>,
    #[serde(default, rename = "type")]
    content_type: Option<String>,
}

impl ProcessingResults {
    pub(crate) fn to_remote_artifact(
        &self,
        job_id: &str,
        results_url: &str,
    ) -> Result<RemoteArtifact, StageError> {
        let value = &self.asset.value;
        let href = value.href.trim();
        if href.is_empty() {
            return Err(StageError::RemoteRejected(format!(
                "job {job_id} completed without a result asset href"
            )));
        }

        Ok(RemoteArtifact {
            job_id: job_id.to_string(),
            location: urljoin(results_url, href),
            size: value.file_size,
            checksum: value.file_checksum.clone(),
            content_type: value.content_type.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_reply_exposes_monitor_link() {
        let job: ProcessingJob = serde_json::from_str(
            r#"{"jobID":"1f0e","status":"accepted","links":[{"rel":"self","href":"https://h/api/retrieve/v1/processes/x/execution"},{"rel":"monitor","href":"https://h/api/retrieve/v1/jobs/1f0e"}]}"#,
        )
        .unwrap();
        assert_eq!(job.job_id.as_deref(), Some("1f0e"));
        assert_eq!(job.monitor_url().as_deref(), Some("https://h/api/retrieve/v1/jobs/1f0e"));
    }

    #[test]
    fn status_and_results_parse() {
        let status: ProcessingJobStatus = serde_json::from_str(
            r#"{"status":"successful","links":[{"rel":"results","href":"https://h/api/retrieve/v1/jobs/1f0e/results"}]}"#,
        )
        .unwrap();
        assert_eq!(status.job_status().unwrap(), JobStatus::Completed);
        let results_url = status.results_url().unwrap();

        let results: ProcessingResults = serde_json::from_str(
            r#"{"asset":{"value":{"href":"https://object-store/x/data.grib","file:size":2048,"file:checksum":"1220abcd","type":"application/x-grib"}}}"#,
        )
        .unwrap();
        let artifact = results.to_remote_artifact("1f0e", &results_url).unwrap();
        assert_eq!(artifact.location, "https://object-store/x/data.grib");
        assert_eq!(artifact.size, Some(2048));
        assert_eq!(artifact.checksum.as_deref(), Some("1220abcd"));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let status: ProcessingJobStatus = serde_json::from_str(r#"{"status":"paused"}"#).unwrap();
        assert!(status.job_status().is_err());
    }
}
