use std::fmt;
use std::io::Read;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::{AuthScheme, Credentials};
use crate::error::{StageError, classify_cds_failure};
use crate::job::JobStatus;
use crate::legacy::ApiReply;
use crate::processing::{ProcessingJob, ProcessingJobStatus, ProcessingResults};
use crate::remote::{JobHandle, JobRoute, RemoteApi, RemoteArtifact, RemoteStatus};
use crate::request::RequestDescriptor;
use crate::util::api_v2_variant;

/// HTTP client for the Copernicus Climate Data Store.
///
/// Token-only keys talk to the Retrieve API (OGC API Processes):
/// `POST {url}/retrieve/v1/processes/{dataset}/execution`, then the job's
/// `monitor` and `results` links. Legacy `<UID>:<KEY>` keys use
/// `POST {url}/resources/{dataset}` and `{url}/tasks/{id}`.
#[derive(Clone)]
pub struct CdsClient {
    url: String,
    auth: AuthScheme,
    http: HttpClient,
}

impl fmt::Debug for CdsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdsClient").field("url", &self.url).finish_non_exhaustive()
    }
}

impl CdsClient {
    pub fn new(credentials: &Credentials) -> Result<Self, StageError> {
        Self::with_timeout(credentials, Duration::from_secs(60))
    }

    pub fn with_timeout(credentials: &Credentials, timeout: Duration) -> Result<Self, StageError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("cdsstage/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("cdsstage")),
        );

        let mut builder = HttpClient::builder()
            .default_headers(default_headers)
            .timeout(timeout);

        if !credentials.verify_tls() {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| StageError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: credentials.url().to_string(),
            auth: credentials.auth_scheme(),
            http,
        })
    }

    fn retrieve_base(&self) -> String {
        format!("{}/retrieve/v1", self.url)
    }

    fn apply_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            AuthScheme::Basic { user, password } => req.basic_auth(user, Some(password)),
            // Modern APIs use a custom header.
            AuthScheme::Token(token) => req.header("PRIVATE-TOKEN", token.trim()),
        }
    }

    fn execute(&self, req: RequestBuilder) -> Result<(StatusCode, String), StageError> {
        let resp = self.apply_auth(req).send()?;
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        Ok((status, text))
    }

    fn api_json<T: DeserializeOwned>(&self, req: RequestBuilder, url: &str) -> Result<T, StageError> {
        let (status, text) = self.execute(req)?;
        if !status.is_success() {
            return Err(classify_cds_failure(status, url, &text));
        }
        parse_json(url, status, &text)
    }

    /// Like [`CdsClient::api_json`], but a vanished resource is `Ok(None)`.
    fn poll_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, StageError> {
        let (status, text) = self.execute(self.http.get(url))?;
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_cds_failure(status, url, &text));
        }
        parse_json(url, status, &text).map(Some)
    }

    fn submit_processing(&self, request: &RequestDescriptor) -> Result<JobHandle, StageError> {
        let retrieve_base = self.retrieve_base();
        let exec_url = format!("{}/processes/{}/execution", retrieve_base, request.dataset());
        let body = serde_json::json!({ "inputs": request.to_request_json() });

        let job: ProcessingJob = self.api_json(self.http.post(&exec_url).json(&body), &exec_url)?;

        let monitor_url = job
            .monitor_url()
            .or_else(|| {
                job.job_id
                    .as_deref()
                    .map(|id| format!("{}/jobs/{}", retrieve_base, id))
            })
            .ok_or_else(|| {
                StageError::RemoteRejected("missing monitor link in job submission response".into())
            })?;
        let id = job
            .job_id
            .clone()
            .or_else(|| monitor_url.rsplit('/').next().map(str::to_string))
            .unwrap_or_default();

        Ok(JobHandle::with_route(id, JobRoute::Processes { monitor_url }))
    }

    fn submit_legacy(&self, request: &RequestDescriptor) -> Result<JobHandle, StageError> {
        let body = request.to_request_json();
        let mut base = self.url.clone();
        let mut url = format!("{}/resources/{}", base, request.dataset());
        let (mut status, mut text) = self.execute(self.http.post(&url).json(&body))?;

        // CDS has historically been available under both `/api` and `/api/v2`.
        // Some environments now require `/api/v2`, so we auto-fallback on 404.
        if status == StatusCode::NOT_FOUND {
            if let Some(alt) = api_v2_variant(&base) {
                debug!(alt_base = %alt, "retrying submission against /api/v2");
                url = format!("{}/resources/{}", alt, request.dataset());
                (status, text) = self.execute(self.http.post(&url).json(&body))?;
                base = alt;
            }
        }

        if !status.is_success() {
            return Err(classify_cds_failure(status, &url, &text));
        }
        let reply: ApiReply = parse_json(&url, status, &text)?;

        let id = reply.request_id.clone().ok_or_else(|| {
            StageError::RemoteRejected(format!("missing request_id while state={}", reply.state))
        })?;
        Ok(JobHandle::with_route(id, JobRoute::Legacy { base_url: base }))
    }

    fn processing_status(&self, job_id: &str, monitor_url: &str) -> Result<RemoteStatus, StageError> {
        let Some(job_status) = self.poll_json::<ProcessingJobStatus>(monitor_url)? else {
            return Ok(vanished());
        };

        let status = job_status.job_status()?;
        match status {
            JobStatus::Completed => {
                let results_url = job_status
                    .results_url()
                    .unwrap_or_else(|| format!("{}/results", monitor_url.trim_end_matches('/')));
                match self.poll_json::<ProcessingResults>(&results_url)? {
                    Some(results) => Ok(RemoteStatus::completed(
                        results.to_remote_artifact(job_id, &results_url)?,
                    )),
                    None => Ok(vanished()),
                }
            }
            JobStatus::Failed => Ok(RemoteStatus {
                status,
                message: Some(
                    job_status
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("processing failed with status {}", job_status.status)),
                ),
                artifact: None,
            }),
            other => Ok(RemoteStatus::pending(other)),
        }
    }

    fn legacy_status(&self, job_id: &str, base_url: &str) -> Result<RemoteStatus, StageError> {
        let task_url = format!("{}/tasks/{}", base_url.trim_end_matches('/'), job_id);
        match self.poll_json::<ApiReply>(&task_url)? {
            Some(reply) => reply.to_status(job_id, base_url),
            None => Ok(vanished()),
        }
    }

    fn job_url(&self, job: &JobHandle) -> String {
        match &job.route {
            JobRoute::Processes { monitor_url } => monitor_url.clone(),
            JobRoute::Legacy { base_url } => {
                format!("{}/tasks/{}", base_url.trim_end_matches('/'), job.id)
            }
            JobRoute::Opaque => format!("{}/jobs/{}", self.retrieve_base(), job.id),
        }
    }
}

impl RemoteApi for CdsClient {
    fn submit(&self, request: &RequestDescriptor) -> Result<JobHandle, StageError> {
        match self.auth {
            AuthScheme::Basic { .. } => self.submit_legacy(request),
            AuthScheme::Token(_) => self.submit_processing(request),
        }
    }

    fn status(&self, job: &JobHandle) -> Result<RemoteStatus, StageError> {
        match &job.route {
            JobRoute::Legacy { base_url } => self.legacy_status(&job.id, base_url),
            JobRoute::Processes { .. } | JobRoute::Opaque => {
                self.processing_status(&job.id, &self.job_url(job))
            }
        }
    }

    fn open(&self, artifact: &RemoteArtifact) -> Result<Box<dyn Read + Send>, StageError> {
        let resp = self.apply_auth(self.http.get(&artifact.location)).send()?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(StageError::JobExpired {
                job_id: artifact.job_id.clone(),
            });
        }
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(classify_cds_failure(status, &artifact.location, &text));
        }
        Ok(Box::new(resp))
    }

    fn cancel(&self, job: &JobHandle) -> Result<(), StageError> {
        let url = self.job_url(job);
        let (status, text) = self.execute(self.http.delete(&url))?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(classify_cds_failure(status, &url, &text))
    }
}

fn vanished() -> RemoteStatus {
    RemoteStatus {
        status: JobStatus::Expired,
        message: Some("job no longer exists on the remote".to_string()),
        artifact: None,
    }
}

fn parse_json<T: DeserializeOwned>(url: &str, status: StatusCode, text: &str) -> Result<T, StageError> {
    serde_json::from_str::<T>(text).map_err(|e| {
        StageError::RemoteRejected(format!(
            "failed to parse API JSON (url={url}, status={status}): {e}"
        ))
    })
}
