use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Everything that can go wrong between reading a dataset specification and
/// indexing a staged artifact.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid dataset specification: {0}")]
    InvalidSpecification(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited by the remote queue: {0}")]
    RateLimited(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("remote rejected the request: {0}")]
    RemoteRejected(String),

    #[error("requested data is not available yet: {0}")]
    NotYetAvailable(String),

    #[error("status of job {job_id} unobservable after {attempts} consecutive failure(s): {last_error}")]
    PollingUnavailable {
        job_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("job {job_id} did not reach a terminal state within {waited:?}")]
    Timeout { job_id: String, waited: Duration },

    #[error("job {job_id} failed remotely: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("job {job_id} expired before its result could be retrieved")]
    JobExpired { job_id: String },

    #[error("job {job_id} was cancelled")]
    Cancelled { job_id: String },

    #[error("integrity check failed for {location}: {reason}")]
    Integrity { location: String, reason: String },

    #[error("download of {location} failed after {attempts} attempt(s): {reason}")]
    DownloadFailed {
        location: String,
        attempts: u32,
        reason: String,
    },

    #[error("cache key {key} already maps to a different artifact")]
    CacheKeyConflict { key: String },

    #[error("cache i/o error at '{0}'")]
    CacheIo(PathBuf, #[source] std::io::Error),
}

/// Flat classification of [`StageError`], used for reporting and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidSpecification,
    Configuration,
    Authentication,
    RateLimited,
    TransientNetwork,
    RemoteRejected,
    NotYetAvailable,
    PollingUnavailable,
    Timeout,
    JobFailed,
    JobExpired,
    Cancelled,
    Integrity,
    DownloadFailed,
    CacheKeyConflict,
    CacheIo,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidSpecification => "InvalidSpecification",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::TransientNetwork => "TransientNetworkError",
            ErrorKind::RemoteRejected => "RemoteRejected",
            ErrorKind::NotYetAvailable => "NotYetAvailable",
            ErrorKind::PollingUnavailable => "PollingUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::JobFailed => "JobFailed",
            ErrorKind::JobExpired => "JobExpired",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Integrity => "IntegrityError",
            ErrorKind::DownloadFailed => "DownloadFailed",
            ErrorKind::CacheKeyConflict => "CacheKeyConflict",
            ErrorKind::CacheIo => "CacheIo",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::InvalidSpecification(_) => ErrorKind::InvalidSpecification,
            StageError::Configuration(_) => ErrorKind::Configuration,
            StageError::Authentication(_) => ErrorKind::Authentication,
            StageError::RateLimited(_) => ErrorKind::RateLimited,
            StageError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            StageError::RemoteRejected(_) => ErrorKind::RemoteRejected,
            StageError::NotYetAvailable(_) => ErrorKind::NotYetAvailable,
            StageError::PollingUnavailable { .. } => ErrorKind::PollingUnavailable,
            StageError::Timeout { .. } => ErrorKind::Timeout,
            StageError::JobFailed { .. } => ErrorKind::JobFailed,
            StageError::JobExpired { .. } => ErrorKind::JobExpired,
            StageError::Cancelled { .. } => ErrorKind::Cancelled,
            StageError::Integrity { .. } => ErrorKind::Integrity,
            StageError::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            StageError::CacheKeyConflict { .. } => ErrorKind::CacheKeyConflict,
            StageError::CacheIo(..) => ErrorKind::CacheIo,
        }
    }

    /// Only queue rejections and connectivity failures are worth retrying locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::TransientNetwork
        )
    }
}

impl From<reqwest::Error> for StageError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return classify_status(status, &err.to_string());
        }
        if err.is_decode() {
            return StageError::RemoteRejected(format!("unreadable response: {err}"));
        }
        if err.is_builder() {
            return StageError::Configuration(format!("invalid request: {err}"));
        }
        StageError::TransientNetwork(err.to_string())
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct CdsErrorResponse {
    #[serde(default, rename = "type")]
    pub(crate) kind: Option<String>,
    #[serde(default)]
    pub(crate) title: Option<String>,
    #[serde(default)]
    pub(crate) status: Option<u16>,
    #[serde(default)]
    pub(crate) detail: Option<String>,
    #[serde(default)]
    pub(crate) trace_id: Option<String>,
    // Some endpoints respond with {"message":...,"detail":...}
    #[serde(default)]
    pub(crate) message: Option<String>,
}

const NOT_AVAILABLE_YET: &str = "none of the data you have requested is available yet";

/// Maps a failed CDS response onto the error taxonomy.
pub(crate) fn classify_cds_failure(status: StatusCode, url: &str, body: &str) -> StageError {
    let parsed = serde_json::from_str::<CdsErrorResponse>(body);
    let raw_body = if parsed.is_ok() { "" } else { body.trim() };
    let e = parsed.unwrap_or_default();

    let title = e.title.as_deref().or(e.message.as_deref()).unwrap_or("");
    let detail = e.detail.as_deref().unwrap_or(raw_body);
    let trace = e.trace_id.as_deref().unwrap_or("(none)");
    let kind = e.kind.as_deref().unwrap_or("");
    let status_in_body = e.status.unwrap_or(status.as_u16());

    // Licence not accepted is extremely common; provide explicit remediation.
    let looks_like_licence = status == StatusCode::FORBIDDEN
        && (title.to_lowercase().contains("required licences")
            || detail.to_lowercase().contains("required licence")
            || detail.to_lowercase().contains("manage-licences"));
    if looks_like_licence {
        let link = detail
            .find("https://")
            .and_then(|idx| detail[idx..].split_whitespace().next())
            .unwrap_or("https://cds.climate.copernicus.eu/how-to-api");

        return StageError::Authentication(format!(
            "required dataset licence(s) have not been accepted; sign in at {link}, accept the licence(s) and re-run (server message: {title}, trace_id: {trace})"
        ));
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return StageError::Authentication(format!(
            "HTTP {status_in_body} from {url}: {title} {detail} (kind: {kind}, trace_id: {trace}); check that the key is a valid, unexpired Personal Access Token"
        ));
    }

    if status == StatusCode::BAD_REQUEST && detail.to_lowercase().contains(NOT_AVAILABLE_YET) {
        return StageError::NotYetAvailable(detail.trim().to_string());
    }

    let message = format!("HTTP {status_in_body} from {url}: {title} {detail}");
    classify_status(status, message.trim())
}

pub(crate) fn classify_status(status: StatusCode, message: &str) -> StageError {
    match status.as_u16() {
        401 | 403 => StageError::Authentication(message.to_string()),
        429 => StageError::RateLimited(message.to_string()),
        408 | 500 | 502 | 503 | 504 => StageError::TransientNetwork(message.to_string()),
        _ => StageError::RemoteRejected(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn licence_errors_carry_remediation_link() {
        let body = r#"{"title":"required licences not accepted","detail":"accept at https://cds.climate.copernicus.eu/datasets/x?tab=download#manage-licences please","trace_id":"abc"}"#;
        let err = classify_cds_failure(StatusCode::FORBIDDEN, "https://x/api", body);
        assert_eq!(err.kind(), ErrorKind::Authentication);
        let msg = err.to_string();
        assert!(msg.contains("https://cds.climate.copernicus.eu/datasets/x?tab=download#manage-licences"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn queue_pressure_and_outages_are_retryable() {
        let rl = classify_cds_failure(StatusCode::TOO_MANY_REQUESTS, "u", "{}");
        assert_eq!(rl.kind(), ErrorKind::RateLimited);
        assert!(rl.is_retryable());

        let down = classify_cds_failure(StatusCode::BAD_GATEWAY, "u", "<html>oops</html>");
        assert_eq!(down.kind(), ErrorKind::TransientNetwork);
        assert!(down.is_retryable());
    }

    #[test]
    fn data_not_yet_published_is_its_own_kind() {
        let body = r#"{"title":"bad request","detail":"None of the data you have requested is available yet, please revise the period requested."}"#;
        let err = classify_cds_failure(StatusCode::BAD_REQUEST, "u", body);
        assert_eq!(err.kind(), ErrorKind::NotYetAvailable);
        assert!(!err.is_retryable());
    }

    #[test]
    fn unknown_dataset_is_rejected_not_retried() {
        let body = r#"{"title":"not found","detail":"process id 'nope' not found"}"#;
        let err = classify_cds_failure(StatusCode::NOT_FOUND, "u", body);
        assert_eq!(err.kind(), ErrorKind::RemoteRejected);
        assert!(!err.is_retryable());
    }

    #[test]
    fn unauthorized_is_authentication() {
        let err = classify_cds_failure(StatusCode::UNAUTHORIZED, "u", r#"{"message":"bad token"}"#);
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(err.to_string().contains("bad token"));
    }
}
