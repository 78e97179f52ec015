use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::StageError;
use crate::poll::PollConfig;
use crate::stage::StageConfig;

/// Everything the pipeline needs to know besides credentials. Built once,
/// then handed to each component.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub cache_dir: PathBuf,
    pub poll: PollConfig,
    pub submit_backoff: BackoffPolicy,
    /// Attempts per submission, counting the first.
    pub submit_retry_max: u32,
    pub stage: StageConfig,
    /// Evict the oldest artifacts once the cache grows past this.
    pub max_cache_bytes: Option<u64>,
    pub max_concurrent_jobs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            poll: PollConfig::default(),
            submit_backoff: BackoffPolicy {
                initial: Duration::from_secs(5),
                max: Duration::from_secs(300),
                multiplier: 2.0,
                jitter: 0.2,
            },
            submit_retry_max: 5,
            stage: StageConfig::default(),
            max_cache_bytes: None,
            max_concurrent_jobs: 4,
        }
    }
}

/// Upper bound for any single wait the pipeline will schedule.
pub const LONGEST_WAIT: Duration = Duration::from_secs(30 * 24 * 3600);

impl PipelineConfig {
    /// Defaults overridden by `CDSSTAGE_*` environment variables.
    pub fn from_env() -> Result<Self, StageError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(env: F) -> Result<Self, StageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = env("CDSSTAGE_CACHE_DIR").filter(|d| !d.trim().is_empty()) {
            config.cache_dir = PathBuf::from(dir.trim());
        }
        if let Some(secs) = parse::<u64, _>(&env, "CDSSTAGE_MAX_WAIT_SECS")? {
            config.poll.max_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&env, "CDSSTAGE_POLL_MIN_SECS")? {
            config.poll.backoff.initial = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&env, "CDSSTAGE_POLL_MAX_SECS")? {
            config.poll.backoff.max = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&env, "CDSSTAGE_POLL_RETRY_BUDGET")? {
            config.poll.retry_budget = n;
        }
        if let Some(n) = parse(&env, "CDSSTAGE_SUBMIT_RETRY_MAX")? {
            config.submit_retry_max = n;
        }
        if let Some(n) = parse(&env, "CDSSTAGE_DOWNLOAD_RETRY_MAX")? {
            config.stage.retry_max = n;
        }
        if let Some(bytes) = parse(&env, "CDSSTAGE_MAX_CACHE_BYTES")? {
            config.max_cache_bytes = Some(bytes);
        }
        if let Some(n) = parse(&env, "CDSSTAGE_MAX_JOBS")? {
            config.max_concurrent_jobs = n;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StageError> {
        if self.poll.backoff.initial > self.poll.backoff.max {
            return Err(StageError::Configuration(format!(
                "poll delay minimum ({:?}) exceeds maximum ({:?})",
                self.poll.backoff.initial, self.poll.backoff.max
            )));
        }
        if self.poll.backoff.initial.is_zero() {
            return Err(StageError::Configuration("poll delay minimum must be positive".into()));
        }
        if self.poll.max_wait > LONGEST_WAIT {
            return Err(StageError::Configuration(format!(
                "wait budget ({:?}) exceeds {:?}",
                self.poll.max_wait, LONGEST_WAIT
            )));
        }
        for (what, policy) in [
            ("poll", &self.poll.backoff),
            ("poll retry", &self.poll.retry_backoff),
            ("submit", &self.submit_backoff),
            ("download retry", &self.stage.retry_backoff),
        ] {
            check_backoff(what, policy)?;
        }
        if self.max_concurrent_jobs == 0 {
            return Err(StageError::Configuration("max concurrent jobs must be at least 1".into()));
        }
        Ok(())
    }
}

fn check_backoff(what: &str, policy: &BackoffPolicy) -> Result<(), StageError> {
    if policy.max > LONGEST_WAIT {
        return Err(StageError::Configuration(format!(
            "{what} delay maximum ({:?}) exceeds {:?}",
            policy.max, LONGEST_WAIT
        )));
    }
    if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
        return Err(StageError::Configuration(format!(
            "{what} backoff multiplier must be a finite number >= 1, got {}",
            policy.multiplier
        )));
    }
    if !(0.0..=1.0).contains(&policy.jitter) {
        return Err(StageError::Configuration(format!(
            "{what} backoff jitter must lie within 0..=1, got {}",
            policy.jitter
        )));
    }
    Ok(())
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cdsstage")
}

fn parse<T, F>(env: &F, name: &str) -> Result<Option<T>, StageError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|e| StageError::Configuration(format!("{name}={raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert!(config.cache_dir.ends_with("cdsstage"));
    }

    #[test]
    fn environment_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("CDSSTAGE_CACHE_DIR", "/data/cds"),
            ("CDSSTAGE_MAX_WAIT_SECS", "7200"),
            ("CDSSTAGE_POLL_MIN_SECS", "2"),
            ("CDSSTAGE_POLL_MAX_SECS", "60"),
            ("CDSSTAGE_POLL_RETRY_BUDGET", "9"),
            ("CDSSTAGE_SUBMIT_RETRY_MAX", "3"),
            ("CDSSTAGE_DOWNLOAD_RETRY_MAX", "4"),
            ("CDSSTAGE_MAX_CACHE_BYTES", "1000000"),
            ("CDSSTAGE_MAX_JOBS", "2"),
        ]))
        .unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("/data/cds"));
        assert_eq!(config.poll.max_wait, Duration::from_secs(7200));
        assert_eq!(config.poll.backoff.initial, Duration::from_secs(2));
        assert_eq!(config.poll.backoff.max, Duration::from_secs(60));
        assert_eq!(config.poll.retry_budget, 9);
        assert_eq!(config.submit_retry_max, 3);
        assert_eq!(config.stage.retry_max, 4);
        assert_eq!(config.max_cache_bytes, Some(1_000_000));
        assert_eq!(config.max_concurrent_jobs, 2);
    }

    #[test]
    fn garbage_is_a_configuration_error() {
        let err = PipelineConfig::from_lookup(lookup(&[("CDSSTAGE_MAX_JOBS", "many")])).unwrap_err();
        assert!(matches!(err, StageError::Configuration(ref m) if m.contains("CDSSTAGE_MAX_JOBS")));
    }

    #[test]
    fn inverted_poll_bounds_are_rejected() {
        let err = PipelineConfig::from_lookup(lookup(&[
            ("CDSSTAGE_POLL_MIN_SECS", "90"),
            ("CDSSTAGE_POLL_MAX_SECS", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, StageError::Configuration(_)));
    }

    #[test]
    fn unbounded_waits_are_rejected() {
        for var in ["CDSSTAGE_MAX_WAIT_SECS", "CDSSTAGE_POLL_MAX_SECS"] {
            let err = PipelineConfig::from_lookup(lookup(&[(var, "18446744073709551615")])).unwrap_err();
            assert!(matches!(err, StageError::Configuration(_)), "{var}: {err}");
        }

        let mut config = PipelineConfig::default();
        config.submit_backoff.multiplier = f64::INFINITY;
        assert!(config.validate().is_err());
        config.submit_backoff.multiplier = 2.0;
        config.stage.retry_backoff.jitter = -0.5;
        assert!(config.validate().is_err());
    }
}
