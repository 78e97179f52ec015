//! Streaming completed results into the staging area and verifying them.

use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::clock::{CancelToken, Clock};
use crate::error::StageError;
use crate::remote::{RemoteApi, RemoteArtifact};
use crate::request::OutputFormat;
use crate::util::{HashingWriter, normalize_sha256};

/// Name prefix of in-progress downloads inside the staging directory.
pub(crate) const STAGING_PREFIX: &str = ".dl-";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageConfig {
    /// Whole-download attempts before giving up with `DownloadFailed`.
    pub retry_max: u32,
    pub retry_backoff: BackoffPolicy,
    /// Show a progress bar per download.
    pub progress: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            retry_max: 3,
            retry_backoff: BackoffPolicy {
                initial: std::time::Duration::from_secs(2),
                max: std::time::Duration::from_secs(30),
                multiplier: 2.0,
                jitter: 0.2,
            },
            progress: false,
        }
    }
}

/// A fully written, checked download still sitting in the staging directory.
///
/// Dropping it deletes the file.
#[derive(Debug)]
pub struct VerifiedDownload {
    pub(crate) file: NamedTempFile,
    pub(crate) format: OutputFormat,
    pub size: u64,
    /// Lowercase hex SHA-256 of the content.
    pub checksum: String,
}

impl VerifiedDownload {
    pub fn format(&self) -> OutputFormat {
        self.format
    }
}

pub struct StageManager {
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    staging_dir: PathBuf,
    config: StageConfig,
    bars: Option<MultiProgress>,
}

impl StageManager {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
        staging_dir: impl Into<PathBuf>,
        config: StageConfig,
    ) -> Self {
        Self {
            remote,
            clock,
            staging_dir: staging_dir.into(),
            bars: config.progress.then(MultiProgress::new),
            config,
        }
    }

    /// Downloads `artifact` and checks it against `format`.
    ///
    /// Interrupted transfers, transient HTTP failures and short reads restart
    /// the download from scratch. Integrity failures and expired results do not.
    pub fn download(
        &self,
        format: OutputFormat,
        artifact: &RemoteArtifact,
        cancel: &CancelToken,
    ) -> Result<VerifiedDownload, StageError> {
        let max_attempts = self.config.retry_max.max(1);
        let mut backoff = Backoff::new(self.config.retry_backoff);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.fetch_once(format, artifact, cancel) {
                Ok(download) => {
                    debug!(
                        job_id = %artifact.job_id,
                        size = download.size,
                        sha256 = %download.checksum,
                        "download verified"
                    );
                    return Ok(download);
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if attempt >= max_attempts {
                return Err(StageError::DownloadFailed {
                    location: artifact.location.clone(),
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            let delay = backoff.next_delay();
            warn!(
                job_id = %artifact.job_id,
                error = %err,
                attempt,
                max_attempts,
                retry_in = ?delay,
                "download failed, restarting"
            );
            if !self.clock.sleep(delay, cancel) {
                return Err(StageError::Cancelled {
                    job_id: artifact.job_id.clone(),
                });
            }
        }
    }

    fn fetch_once(
        &self,
        format: OutputFormat,
        artifact: &RemoteArtifact,
        cancel: &CancelToken,
    ) -> Result<VerifiedDownload, StageError> {
        let mut reader = self.remote.open(artifact)?;

        let file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(".part")
            .tempfile_in(&self.staging_dir)
            .map_err(|e| StageError::CacheIo(self.staging_dir.clone(), e))?;
        let path = file.path().to_path_buf();

        let bar = self.progress_bar(artifact);
        let mut head = Vec::with_capacity(OutputFormat::HEADER_LEN);
        let mut out = HashingWriter::new(BufWriter::new(file));
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled {
                    job_id: artifact.job_id.clone(),
                });
            }
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(StageError::TransientNetwork(format!(
                        "download interrupted after {} bytes: {e}",
                        out.written()
                    )));
                }
            };
            if head.len() < OutputFormat::HEADER_LEN {
                let take = (OutputFormat::HEADER_LEN - head.len()).min(n);
                head.extend_from_slice(&buf[..take]);
            }
            out.write_all(&buf[..n])
                .map_err(|e| StageError::CacheIo(path.clone(), e))?;
            if let Some(bar) = &bar {
                bar.inc(n as u64);
            }
        }

        let (buffered, checksum, size) = out.finish();
        let file = buffered
            .into_inner()
            .map_err(|e| StageError::CacheIo(path.clone(), e.into_error()))?;
        file.as_file()
            .sync_all()
            .map_err(|e| StageError::CacheIo(path.clone(), e))?;
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        check_integrity(format, artifact, &head, size, &checksum)?;

        Ok(VerifiedDownload {
            file,
            format,
            size,
            checksum,
        })
    }

    fn progress_bar(&self, artifact: &RemoteArtifact) -> Option<ProgressBar> {
        let bars = self.bars.as_ref()?;
        let bar = match artifact.size {
            Some(total) => {
                let bar = ProgressBar::new(total);
                if let Ok(style) = ProgressStyle::with_template(
                    "{spinner:.green} {prefix} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
                ) {
                    bar.set_style(style.progress_chars("=>-"));
                }
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                if let Ok(style) =
                    ProgressStyle::with_template("{spinner:.green} {prefix} {bytes} ({bytes_per_sec})")
                {
                    bar.set_style(style);
                }
                bar
            }
        };
        bar.set_prefix(artifact.job_id.clone());
        Some(bars.add(bar))
    }
}

fn check_integrity(
    format: OutputFormat,
    artifact: &RemoteArtifact,
    head: &[u8],
    size: u64,
    checksum: &str,
) -> Result<(), StageError> {
    let integrity = |reason: String| StageError::Integrity {
        location: artifact.location.clone(),
        reason,
    };

    if let Some(expected) = artifact.size {
        if size < expected {
            return Err(StageError::TransientNetwork(format!(
                "short read: got {size} of {expected} bytes"
            )));
        }
        if size > expected {
            return Err(integrity(format!("received {size} bytes, remote declared {expected}")));
        }
    }

    if let Some(declared) = artifact.checksum.as_deref() {
        match normalize_sha256(declared) {
            Some(expected) if expected == checksum => return Ok(()),
            Some(expected) => {
                return Err(integrity(format!(
                    "sha256 mismatch: remote declared {expected}, content is {checksum}"
                )));
            }
            None => debug!(declared, "ignoring checksum in an unsupported notation"),
        }
    }

    if size == 0 {
        return Err(integrity("empty file".to_string()));
    }
    if !format.matches_header(head) {
        return Err(integrity(format!(
            "content does not start with a {} header",
            format.extension()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::{JobHandle, RemoteStatus};
    use crate::request::{DataFormat, Packaging, RequestDescriptor};
    use crate::util::sha256_hex;

    const NETCDF: OutputFormat = OutputFormat {
        data: DataFormat::Netcdf,
        packaging: Packaging::Unarchived,
    };

    /// Serves `body`, optionally cut short on the first `truncated` opens.
    struct Body {
        body: Vec<u8>,
        truncated: Mutex<u32>,
        opens: Mutex<u32>,
    }

    impl RemoteApi for Body {
        fn submit(&self, _: &RequestDescriptor) -> Result<JobHandle, StageError> {
            unreachable!()
        }

        fn status(&self, _: &JobHandle) -> Result<RemoteStatus, StageError> {
            unreachable!()
        }

        fn open(&self, _: &RemoteArtifact) -> Result<Box<dyn Read + Send>, StageError> {
            *self.opens.lock() += 1;
            let mut truncated = self.truncated.lock();
            if *truncated > 0 {
                *truncated -= 1;
                let half = self.body[..self.body.len() / 2].to_vec();
                return Ok(Box::new(io::Cursor::new(half)));
            }
            Ok(Box::new(io::Cursor::new(self.body.clone())))
        }

        fn cancel(&self, _: &JobHandle) -> Result<(), StageError> {
            Ok(())
        }
    }

    fn setup(body: &[u8], truncated: u32) -> (Arc<Body>, StageManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(Body {
            body: body.to_vec(),
            truncated: Mutex::new(truncated),
            opens: Mutex::new(0),
        });
        let config = StageConfig {
            retry_max: 3,
            retry_backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
            progress: false,
        };
        let manager = StageManager::new(remote.clone(), Arc::new(ManualClock::new()), dir.path(), config);
        (remote, manager, dir)
    }

    fn artifact(size: Option<u64>, checksum: Option<String>) -> RemoteArtifact {
        RemoteArtifact {
            job_id: "job-1".into(),
            location: "https://dl/x.nc".into(),
            size,
            checksum,
            content_type: None,
        }
    }

    fn staged_files(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[test]
    fn netcdf_header_passes_without_checksum() {
        let body = b"CDF\x01rest-of-the-file".to_vec();
        let (_, manager, dir) = setup(&body, 0);
        let download = manager
            .download(NETCDF, &artifact(None, None), &CancelToken::new())
            .unwrap();
        assert_eq!(download.size, body.len() as u64);
        assert_eq!(download.checksum, sha256_hex(&body));
        assert_eq!(std::fs::read(download.file.path()).unwrap(), body);
        drop(download);
        assert_eq!(staged_files(&dir), 0);
    }

    #[test]
    fn wrong_header_is_rejected() {
        let (_, manager, dir) = setup(b"<html>error page</html>", 0);
        let err = manager
            .download(NETCDF, &artifact(None, None), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StageError::Integrity { .. }));
        assert_eq!(staged_files(&dir), 0);
    }

    #[test]
    fn declared_checksum_must_match() {
        let body = b"\x89HDF\r\n\x1a\npayload".to_vec();
        let (remote, manager, dir) = setup(&body, 0);
        let wrong = format!("sha256:{}", "0".repeat(64));
        let err = manager
            .download(NETCDF, &artifact(None, Some(wrong)), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StageError::Integrity { .. }));
        assert_eq!(*remote.opens.lock(), 1);
        assert_eq!(staged_files(&dir), 0);

        let right = format!("1220{}", sha256_hex(&body));
        assert!(
            manager
                .download(NETCDF, &artifact(None, Some(right)), &CancelToken::new())
                .is_ok()
        );
    }

    #[test]
    fn short_reads_are_retried() {
        let body = b"CDF\x02 some netcdf bytes".to_vec();
        let (remote, manager, _dir) = setup(&body, 2);
        let download = manager
            .download(NETCDF, &artifact(Some(body.len() as u64), None), &CancelToken::new())
            .unwrap();
        assert_eq!(download.size, body.len() as u64);
        assert_eq!(*remote.opens.lock(), 3);
    }

    #[test]
    fn persistent_short_reads_fail_the_download() {
        let body = b"CDF\x02 some netcdf bytes".to_vec();
        let (_, manager, dir) = setup(&body, 10);
        let err = manager
            .download(NETCDF, &artifact(Some(body.len() as u64), None), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StageError::DownloadFailed { attempts: 3, .. }));
        assert_eq!(staged_files(&dir), 0);
    }
}
