//! Runtime configuration for the cookie manager and the reconcilor.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::backoff::BackoffPolicy;

pub const DEFAULT_GAIA_URL: &str = "https://accounts.google.com";
pub const DEFAULT_SESSION_COOKIE_NAME: &str = "APISID";
pub const DEFAULT_MAX_RETRIES: u32 = 8;
pub const DEFAULT_EXTERNAL_CC_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_UBERTOKEN_MAX_AGE_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid gaia_url {url:?}: {reason}")]
    InvalidGaiaUrl { url: String, reason: String },

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// On-disk shape of the config file. Every field is optional; missing values
/// fall back to the defaults above.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigToml {
    /// Origin of the remote identity service.
    pub gaia_url: Option<String>,

    /// `source=` value attached to every remote call.
    pub source: Option<String>,

    /// Name of the cookie whose changes invalidate the cached account list.
    pub session_cookie_name: Option<String>,

    pub max_retries: Option<u32>,
    pub external_cc_timeout_ms: Option<u64>,
    pub ubertoken_max_age_secs: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub reconcile_on_startup: Option<bool>,

    #[serde(default)]
    pub backoff: BackoffToml,

    /// Locally known accounts, used when no real token store is wired in.
    #[serde(default)]
    pub profile: ProfileToml,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackoffToml {
    pub initial_delay_ms: Option<u64>,
    pub multiply_factor: Option<f64>,
    pub jitter_factor: Option<f64>,
    pub maximum_backoff_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProfileToml {
    pub primary_account: Option<String>,
    #[serde(default)]
    pub accounts: Vec<ProfileAccountToml>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProfileAccountToml {
    pub id: String,
    pub credential: String,
}

impl ConfigToml {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Resolved, validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilorConfig {
    pub gaia_url: Url,
    /// Host of `gaia_url`; the domain whose cookie settings gate every
    /// session mutation.
    pub cookie_domain: String,
    pub source: String,
    pub session_cookie_name: String,
    pub max_retries: u32,
    pub external_cc_timeout: Duration,
    /// A phase-1 token older than this is not reused for a retried merge.
    pub ubertoken_max_age: Duration,
    pub request_timeout: Duration,
    pub reconcile_on_startup: bool,
    pub backoff: BackoffPolicy,
}

impl ReconcilorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(ConfigToml::from_path(path)?)
    }

    pub fn from_toml(cfg: ConfigToml) -> Result<Self, ConfigError> {
        let raw_url = cfg
            .gaia_url
            .unwrap_or_else(|| DEFAULT_GAIA_URL.to_string());
        let gaia_url = Url::parse(&raw_url).map_err(|err| ConfigError::InvalidGaiaUrl {
            url: raw_url.clone(),
            reason: err.to_string(),
        })?;
        let cookie_domain = match gaia_url.host_str() {
            Some(host) => host.to_string(),
            None => {
                return Err(ConfigError::InvalidGaiaUrl {
                    url: raw_url,
                    reason: "url has no host".to_string(),
                });
            }
        };

        let defaults = BackoffPolicy::default();
        let backoff = BackoffPolicy {
            initial_delay: cfg
                .backoff
                .initial_delay_ms
                .map_or(defaults.initial_delay, Duration::from_millis),
            multiply_factor: cfg
                .backoff
                .multiply_factor
                .unwrap_or(defaults.multiply_factor),
            jitter_factor: cfg.backoff.jitter_factor.unwrap_or(defaults.jitter_factor),
            maximum_backoff: cfg
                .backoff
                .maximum_backoff_ms
                .map_or(defaults.maximum_backoff, Duration::from_millis),
        };
        validate_backoff(&backoff)?;

        let source = cfg
            .source
            .unwrap_or_else(|| reconcilor_gaia_api::DEFAULT_SOURCE.to_string());
        if source.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "source",
                reason: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            gaia_url,
            cookie_domain,
            source,
            session_cookie_name: cfg
                .session_cookie_name
                .unwrap_or_else(|| DEFAULT_SESSION_COOKIE_NAME.to_string()),
            max_retries: cfg.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            external_cc_timeout: Duration::from_millis(
                cfg.external_cc_timeout_ms
                    .unwrap_or(DEFAULT_EXTERNAL_CC_TIMEOUT_MS),
            ),
            ubertoken_max_age: Duration::from_secs(
                cfg.ubertoken_max_age_secs
                    .unwrap_or(DEFAULT_UBERTOKEN_MAX_AGE_SECS),
            ),
            request_timeout: Duration::from_millis(
                cfg.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            reconcile_on_startup: cfg.reconcile_on_startup.unwrap_or(true),
            backoff,
        })
    }
}

fn validate_backoff(policy: &BackoffPolicy) -> Result<(), ConfigError> {
    if !(policy.multiply_factor >= 1.0) {
        return Err(ConfigError::InvalidValue {
            field: "backoff.multiply_factor",
            reason: format!("must be at least 1, got {}", policy.multiply_factor),
        });
    }
    if !(0.0..1.0).contains(&policy.jitter_factor) {
        return Err(ConfigError::InvalidValue {
            field: "backoff.jitter_factor",
            reason: format!("must be in [0, 1), got {}", policy.jitter_factor),
        });
    }
    // The longest jittered delay after n failures must not exceed the
    // shortest one after n + 1.
    if policy.multiply_factor * (1.0 - policy.jitter_factor) < 1.0 {
        return Err(ConfigError::InvalidValue {
            field: "backoff.jitter_factor",
            reason: format!(
                "jitter {} can make a later delay shorter than an earlier one with multiply_factor {}",
                policy.jitter_factor, policy.multiply_factor
            ),
        });
    }
    if policy.initial_delay > policy.maximum_backoff {
        return Err(ConfigError::InvalidValue {
            field: "backoff.initial_delay_ms",
            reason: "must not exceed backoff.maximum_backoff_ms".to_string(),
        });
    }
    Ok(())
}
