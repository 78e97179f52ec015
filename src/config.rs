use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::StageError;
use crate::util::split_key_basic;

/// Credentials for the CDS API, resolved once at startup and shared read-only.
#[derive(Clone)]
pub struct Credentials {
    url: String,
    key: String,
    verify: bool,
}

/// How requests are authenticated; decided by the shape of the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// Legacy `<UID>:<APIKEY>` keys, sent as HTTP basic auth.
    Basic { user: String, password: String },
    /// Personal access tokens, sent in the `PRIVATE-TOKEN` header.
    Token(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .field("verify", &self.verify)
            .finish()
    }
}

impl Credentials {
    /// Builds credentials from already known values, validating their shape.
    pub fn new(url: impl Into<String>, key: impl Into<String>, verify: bool) -> Result<Self, StageError> {
        let url = url.into().trim().to_string();
        let key = key.into().trim().to_string();

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StageError::Configuration(format!(
                "url must start with http:// or https:// (got `{url}`)"
            )));
        }
        if key.is_empty() {
            return Err(StageError::Configuration("key is empty".to_string()));
        }

        Ok(Self { url, key, verify })
    }

    /// Resolves credentials from the process environment and `.cdsapirc` files.
    pub fn from_env() -> Result<Self, StageError> {
        Self::load(&CredentialOverrides::default(), |name| std::env::var(name).ok())
    }

    /// Resolves credentials using (in order of precedence):
    /// - explicit overrides
    /// - `CDSAPI_URL` / `CDSAPI_KEY`
    /// - an rc file: the override path, `CDSAPI_RC`, `./.cdsapirc`, `~/.cdsapirc`
    ///
    /// `env` is the variable lookup, so callers can resolve against something
    /// other than the real process environment.
    pub fn load<F>(overrides: &CredentialOverrides, env: F) -> Result<Self, StageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut url = overrides.url.clone().or_else(|| env("CDSAPI_URL"));
        let mut key = overrides.key.clone().or_else(|| env("CDSAPI_KEY"));
        let mut verify = overrides.verify;

        let explicit_rc = overrides
            .rc_file
            .clone()
            .or_else(|| env("CDSAPI_RC").map(PathBuf::from));
        let candidates = match &explicit_rc {
            Some(path) => vec![path.clone()],
            None => default_rc_candidates(),
        };

        if url.is_none() || key.is_none() || verify.is_none() {
            if let Some(path) = &explicit_rc {
                if !path.exists() {
                    return Err(StageError::Configuration(format!(
                        "credentials file {} does not exist",
                        path.display()
                    )));
                }
            }

            if let Some(rc_path) = candidates.iter().find(|p| p.exists()) {
                let cfg = read_rc(rc_path)?;
                url = url.or(cfg.url);
                key = key.or(cfg.key);
                verify = verify.or(cfg.verify);
            }
        }

        let searched = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let url = url.ok_or_else(|| {
            StageError::Configuration(format!(
                "missing url (set CDSAPI_URL or put `url:` in one of: {searched})"
            ))
        })?;
        let key = key.ok_or_else(|| {
            StageError::Configuration(format!(
                "missing key (set CDSAPI_KEY or put `key:` in one of: {searched})"
            ))
        })?;

        Self::new(url, key, verify.unwrap_or(true))
    }

    /// Base API URL without a trailing slash.
    pub fn url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub fn verify_tls(&self) -> bool {
        self.verify
    }

    pub fn auth_scheme(&self) -> AuthScheme {
        match split_key_basic(&self.key) {
            Some((user, password)) => AuthScheme::Basic { user, password },
            None => AuthScheme::Token(self.key.clone()),
        }
    }
}

/// Values that take precedence over the environment and rc files.
#[derive(Debug, Clone, Default)]
pub struct CredentialOverrides {
    pub url: Option<String>,
    pub key: Option<String>,
    pub verify: Option<bool>,
    pub rc_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct RcConfig {
    url: Option<String>,
    key: Option<String>,
    verify: Option<bool>,
}

fn read_rc(path: &Path) -> Result<RcConfig, StageError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        StageError::Configuration(format!("failed to read credentials file {}: {e}", path.display()))
    })?;
    parse_rc(&text).map_err(|reason| {
        StageError::Configuration(format!("malformed credentials file {}: {reason}", path.display()))
    })
}

fn parse_rc(text: &str) -> Result<RcConfig, String> {
    let mut cfg = RcConfig::default();

    // Support formatting where `key:` is on one line and the token is on the next line.
    let mut pending_key: Option<&str> = None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(pk) = pending_key.take() {
            if !line.contains(':') {
                let v = strip_quotes(line).to_string();
                match pk {
                    "url" => cfg.url = Some(v),
                    _ => cfg.key = Some(v),
                }
                continue;
            }
        }

        let Some((k, v)) = line.split_once(':') else {
            return Err(format!("line {}: expected `name: value`", lineno + 1));
        };
        let v = strip_quotes(v.trim());
        match k.trim() {
            "url" if v.is_empty() => pending_key = Some("url"),
            "url" => cfg.url = Some(v.to_string()),
            "key" if v.is_empty() => pending_key = Some("key"),
            "key" => cfg.key = Some(v.to_string()),
            "verify" if !v.is_empty() => cfg.verify = Some(v != "0"),
            _ => {}
        }
    }

    Ok(cfg)
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn default_rc_candidates() -> Vec<PathBuf> {
    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(".cdsapirc"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".cdsapirc"));
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a HashMap<&'a str, String>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn parses_key_on_continuation_line() {
        let cfg = parse_rc("url: https://cds.climate.copernicus.eu/api\nkey:\n  'abcd-1234'\nverify: 0\n").unwrap();
        assert_eq!(cfg.url.as_deref(), Some("https://cds.climate.copernicus.eu/api"));
        assert_eq!(cfg.key.as_deref(), Some("abcd-1234"));
        assert_eq!(cfg.verify, Some(false));
    }

    #[test]
    fn rejects_lines_without_separator() {
        let err = parse_rc("url: https://x/api\nthis is not a setting\n").unwrap_err();
        assert!(err.contains("line 2"));
    }

    #[test]
    fn env_wins_over_rc_file() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join("rc");
        std::fs::write(&rc, "url: https://file.example/api\nkey: file-token\n").unwrap();

        let mut vars = HashMap::new();
        vars.insert("CDSAPI_RC", rc.display().to_string());
        vars.insert("CDSAPI_KEY", "env-token".to_string());

        let creds = Credentials::load(&CredentialOverrides::default(), lookup(&vars)).unwrap();
        assert_eq!(creds.url(), "https://file.example/api");
        assert_eq!(creds.auth_scheme(), AuthScheme::Token("env-token".to_string()));
        assert!(creds.verify_tls());
    }

    #[test]
    fn missing_explicit_rc_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = CredentialOverrides {
            rc_file: Some(dir.path().join("absent")),
            ..Default::default()
        };
        let err = Credentials::load(&overrides, |_| None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn url_scheme_is_validated() {
        let err = Credentials::new("cds.climate.copernicus.eu/api", "k", true).unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[test]
    fn legacy_keys_use_basic_auth_and_debug_hides_secret() {
        let creds = Credentials::new("https://x/api/v2", "12345:secret", true).unwrap();
        assert_eq!(
            creds.auth_scheme(),
            AuthScheme::Basic {
                user: "12345".to_string(),
                password: "secret".to_string()
            }
        );
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
