//! Typed backend configuration.
//!
//! Loaded from environment variables (the CLI calls `dotenvy::dotenv()`
//! first). Nothing here touches the network; `validate_backend_config` is a
//! pure function suitable for diagnostics.

use std::{fmt, str::FromStr, time::Duration};

use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::error::{BackendError, Result};

pub const ENV_MODE: &str = "HOOKWATCH_BACKEND";
pub const ENV_SERVER_URL: &str = "HOOKWATCH_SERVER_URL";
pub const ENV_SOCKET_URL: &str = "HOOKWATCH_SOCKET_URL";
pub const ENV_CLOUD_URL: &str = "HOOKWATCH_CLOUD_URL";
pub const ENV_CLOUD_KEY: &str = "HOOKWATCH_CLOUD_KEY";
pub const ENV_RETRY_ATTEMPTS: &str = "HOOKWATCH_RETRY_ATTEMPTS";
pub const ENV_RETRY_DELAY_MS: &str = "HOOKWATCH_RETRY_DELAY_MS";
pub const ENV_TIMEOUT_MS: &str = "HOOKWATCH_TIMEOUT_MS";
pub const ENV_HEALTH_CHECK_INTERVAL_MS: &str = "HOOKWATCH_HEALTH_CHECK_INTERVAL_MS";

/// Which backend implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Self-hosted HTTP + socket server.
    Local,
    /// Managed push-subscription backend.
    Managed,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Managed => write!(f, "managed"),
        }
    }
}

impl FromStr for BackendMode {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "managed" => Ok(Self::Managed),
            other => Err(BackendError::Validation(format!(
                "unsupported backend mode '{other}' (expected 'local' or 'managed')"
            ))),
        }
    }
}

/// Shared retry/timeout tuning block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tuning {
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_delay: Duration::from_millis(2000),
            timeout: Duration::from_millis(10_000),
            health_check_interval: Duration::from_millis(60_000),
        }
    }
}

/// Partial tuning; unset fields fall through to the layer below.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TuningOverrides {
    pub retry_attempts: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub health_check_interval: Option<Duration>,
}

impl TuningOverrides {
    /// Layer `other` on top of `self`.
    #[must_use]
    pub fn or(self, other: &Self) -> Self {
        Self {
            retry_attempts: other.retry_attempts.or(self.retry_attempts),
            retry_delay: other.retry_delay.or(self.retry_delay),
            timeout: other.timeout.or(self.timeout),
            health_check_interval: other.health_check_interval.or(self.health_check_interval),
        }
    }
}

impl Tuning {
    #[must_use]
    pub fn merged(self, overrides: &TuningOverrides) -> Self {
        Self {
            retry_attempts: overrides.retry_attempts.unwrap_or(self.retry_attempts),
            retry_delay: overrides.retry_delay.unwrap_or(self.retry_delay),
            timeout: overrides.timeout.unwrap_or(self.timeout),
            health_check_interval: overrides
                .health_check_interval
                .unwrap_or(self.health_check_interval),
        }
    }
}

/// Raw configuration as read from the environment.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub mode: Option<String>,
    pub server_url: Option<String>,
    pub socket_url: Option<String>,
    pub cloud_url: Option<String>,
    pub cloud_key: Option<SecretString>,
    pub tuning: TuningOverrides,
}

/// Validated settings for the self-hosted backend.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub server_url: Url,
    pub socket_url: Url,
    pub tuning: Tuning,
}

/// Validated settings for the managed backend.
#[derive(Debug, Clone)]
pub struct ManagedSettings {
    pub url: Url,
    pub api_key: SecretString,
    pub tuning: Tuning,
}

/// Per-mode settings ready for construction.
#[derive(Debug, Clone)]
pub enum ResolvedConfig {
    Local(LocalSettings),
    Managed(ManagedSettings),
}

impl ResolvedConfig {
    #[must_use]
    pub const fn mode(&self) -> BackendMode {
        match self {
            Self::Local(_) => BackendMode::Local,
            Self::Managed(_) => BackendMode::Managed,
        }
    }

    #[must_use]
    pub const fn tuning(&self) -> &Tuning {
        match self {
            Self::Local(s) => &s.tuning,
            Self::Managed(s) => &s.tuning,
        }
    }
}

/// Outcome of a configuration check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl BackendConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns a validation error if a tuning variable is not a number.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns a validation error if a tuning variable is not a number.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |name: &str| -> Result<Option<u64>> {
            var(name)
                .map(|v| {
                    v.parse::<u64>().map_err(|_| {
                        BackendError::Validation(format!("{name} must be a whole number, got '{v}'"))
                    })
                })
                .transpose()
        };

        let retry_attempts = number(ENV_RETRY_ATTEMPTS)?
            .map(|n| {
                u32::try_from(n).map_err(|_| {
                    BackendError::Validation(format!("{ENV_RETRY_ATTEMPTS} is out of range"))
                })
            })
            .transpose()?;

        Ok(Self {
            mode: var(ENV_MODE),
            server_url: var(ENV_SERVER_URL),
            socket_url: var(ENV_SOCKET_URL),
            cloud_url: var(ENV_CLOUD_URL),
            cloud_key: var(ENV_CLOUD_KEY).map(SecretString::from),
            tuning: TuningOverrides {
                retry_attempts,
                retry_delay: number(ENV_RETRY_DELAY_MS)?.map(Duration::from_millis),
                timeout: number(ENV_TIMEOUT_MS)?.map(Duration::from_millis),
                health_check_interval: number(ENV_HEALTH_CHECK_INTERVAL_MS)?
                    .map(Duration::from_millis),
            },
        })
    }

    /// Self-hosted configuration.
    #[must_use]
    pub fn local(server_url: impl Into<String>) -> Self {
        Self {
            mode: Some(BackendMode::Local.to_string()),
            server_url: Some(server_url.into()),
            ..Self::default()
        }
    }

    /// Managed configuration.
    #[must_use]
    pub fn managed(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            mode: Some(BackendMode::Managed.to_string()),
            cloud_url: Some(url.into()),
            cloud_key: Some(SecretString::from(api_key.into())),
            ..Self::default()
        }
    }

    /// Parsed mode selector.
    ///
    /// # Errors
    /// Returns a validation error for a missing or unsupported mode.
    pub fn mode(&self) -> Result<BackendMode> {
        self.mode
            .as_deref()
            .ok_or_else(|| BackendError::Validation(format!("{ENV_MODE} is not set")))?
            .parse()
    }

    /// Validate and resolve into per-mode settings, applying defaults, then
    /// the configured tuning, then `overrides`.
    ///
    /// # Errors
    /// Returns a validation error describing every defect found.
    pub fn resolve(&self, overrides: &TuningOverrides) -> Result<ResolvedConfig> {
        let report = validate_backend_config(self);
        if !report.is_valid {
            return Err(BackendError::Validation(report.errors.join("; ")));
        }

        let tuning = Tuning::default().merged(&self.tuning.or(overrides));
        check_tuning(&tuning).map_err(BackendError::Validation)?;

        match self.mode()? {
            BackendMode::Local => {
                let server_url = parse_http_url(self.server_url.as_deref(), ENV_SERVER_URL)
                    .map_err(BackendError::Validation)?;
                let socket_url = match self.socket_url.as_deref() {
                    Some(raw) => parse_socket_url(raw).map_err(BackendError::Validation)?,
                    None => derive_socket_url(&server_url, "ws")?,
                };
                Ok(ResolvedConfig::Local(LocalSettings {
                    server_url,
                    socket_url,
                    tuning,
                }))
            }
            BackendMode::Managed => {
                let url = parse_http_url(self.cloud_url.as_deref(), ENV_CLOUD_URL)
                    .map_err(BackendError::Validation)?;
                let api_key = self
                    .cloud_key
                    .clone()
                    .ok_or_else(|| BackendError::Validation(format!("{ENV_CLOUD_KEY} is not set")))?;
                Ok(ResolvedConfig::Managed(ManagedSettings {
                    url,
                    api_key,
                    tuning,
                }))
            }
        }
    }
}

/// Check a configuration without side effects.
#[must_use]
pub fn validate_backend_config(config: &BackendConfig) -> ValidationReport {
    let mut errors = Vec::new();

    match config.mode() {
        Err(BackendError::Validation(message)) => errors.push(message),
        Err(other) => errors.push(other.to_string()),
        Ok(BackendMode::Local) => {
            if let Err(e) = parse_http_url(config.server_url.as_deref(), ENV_SERVER_URL) {
                errors.push(e);
            }
            if let Some(raw) = config.socket_url.as_deref() {
                if let Err(e) = parse_socket_url(raw) {
                    errors.push(e);
                }
            }
        }
        Ok(BackendMode::Managed) => {
            if let Err(e) = parse_http_url(config.cloud_url.as_deref(), ENV_CLOUD_URL) {
                errors.push(e);
            }
            let key_missing = config
                .cloud_key
                .as_ref()
                .is_none_or(|k| k.expose_secret().trim().is_empty());
            if key_missing {
                errors.push(format!("{ENV_CLOUD_KEY} is not set"));
            }
        }
    }

    if let Err(e) = check_tuning(&Tuning::default().merged(&config.tuning)) {
        errors.push(e);
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
    }
}

fn check_tuning(tuning: &Tuning) -> std::result::Result<(), String> {
    if tuning.timeout.is_zero() {
        return Err("timeout must be greater than 0".to_string());
    }
    if tuning.retry_delay.is_zero() {
        return Err("retry delay must be greater than 0".to_string());
    }
    if tuning.health_check_interval.is_zero() {
        return Err("health check interval must be greater than 0".to_string());
    }
    Ok(())
}

fn parse_http_url(raw: Option<&str>, name: &str) -> std::result::Result<Url, String> {
    let raw = raw.ok_or_else(|| format!("{name} is not set"))?;
    let url = Url::parse(raw).map_err(|e| format!("{name} is not a valid URL: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(format!("{name} must use http or https, got '{scheme}'")),
    }
}

fn parse_socket_url(raw: &str) -> std::result::Result<Url, String> {
    let url =
        Url::parse(raw).map_err(|e| format!("{ENV_SOCKET_URL} is not a valid URL: {e}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(format!("{ENV_SOCKET_URL} must use ws or wss, got '{scheme}'")),
    }
}

/// Turn an http(s) base URL into the ws(s) URL at `path` below it.
///
/// # Errors
/// Returns a validation error if the scheme cannot be converted.
pub fn derive_socket_url(base: &Url, path: &str) -> Result<Url> {
    let mut url = base.clone();
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| BackendError::Validation(format!("cannot derive socket URL from {base}")))?;
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(None);
    Ok(url)
}

/// `base` joined with `path`, without doubling slashes.
#[must_use]
pub fn endpoint(base: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn loads_local_mode_from_variables() {
        let config = BackendConfig::from_lookup(lookup(&[
            (ENV_MODE, " Local "),
            (ENV_SERVER_URL, "http://localhost:4000"),
            (ENV_TIMEOUT_MS, "2500"),
        ]))
        .unwrap();

        assert_eq!(config.mode().unwrap(), BackendMode::Local);
        let ResolvedConfig::Local(settings) = config.resolve(&TuningOverrides::default()).unwrap()
        else {
            panic!("expected local settings");
        };
        assert_eq!(settings.socket_url.as_str(), "ws://localhost:4000/ws");
        assert_eq!(settings.tuning.timeout, Duration::from_millis(2500));
        assert_eq!(settings.tuning.retry_attempts, 5);
    }

    #[test]
    fn rejects_non_numeric_tuning() {
        let result = BackendConfig::from_lookup(lookup(&[(ENV_RETRY_DELAY_MS, "soon")]));
        assert!(matches!(result, Err(BackendError::Validation(_))));
    }

    #[test]
    fn overrides_win_over_environment_and_defaults() {
        let mut config = BackendConfig::local("http://localhost:4000");
        config.tuning.retry_attempts = Some(3);
        let overrides = TuningOverrides {
            retry_attempts: Some(9),
            timeout: Some(Duration::from_secs(1)),
            ..TuningOverrides::default()
        };

        let resolved = config.resolve(&overrides).unwrap();
        let tuning = resolved.tuning();
        assert_eq!(tuning.retry_attempts, 9);
        assert_eq!(tuning.timeout, Duration::from_secs(1));
        assert_eq!(tuning.retry_delay, Duration::from_millis(2000));
        assert_eq!(tuning.health_check_interval, Duration::from_millis(60_000));
    }

    #[test]
    fn validation_reports_every_problem() {
        let report = validate_backend_config(&BackendConfig::default());
        assert!(!report.is_valid);
        assert!(report.errors[0].contains(ENV_MODE));

        let report = validate_backend_config(&BackendConfig {
            mode: Some("cloud".into()),
            ..BackendConfig::default()
        });
        assert!(report.errors[0].contains("unsupported backend mode"));

        let report = validate_backend_config(&BackendConfig {
            mode: Some("managed".into()),
            cloud_url: Some("ftp://example.com".into()),
            ..BackendConfig::default()
        });
        assert_eq!(report.errors.len(), 2);

        let report = validate_backend_config(&BackendConfig::managed("https://x.example.co", "k"));
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn secure_servers_get_secure_sockets() {
        let base = Url::parse("https://monitor.example.com/base/").unwrap();
        let socket = derive_socket_url(&base, "/realtime/v1/websocket").unwrap();
        assert_eq!(
            socket.as_str(),
            "wss://monitor.example.com/base/realtime/v1/websocket"
        );
        assert_eq!(
            endpoint(&base, "/api/events"),
            "https://monitor.example.com/base/api/events"
        );
    }
}
