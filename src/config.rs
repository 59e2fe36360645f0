//! Client configuration loaded from YAML.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::CookieNames;
use crate::classify::ClassifierRules;
use crate::error::{Error, Result};
use crate::request::{default_profiles, OutputConstraints, CLIENT_VERSION, UI_VERSION};
use crate::transport::DEFAULT_TIMEOUT;

/// Default local validity window for negotiated keys (10 hours).
pub const DEFAULT_KEY_TTL_SECS: u64 = 36_000;

/// Handshake retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total handshake attempts, including the first.
    pub attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service endpoint URL.
    pub endpoint: String,
    /// Device serial number presented in entity authentication.
    pub esn: String,
    /// PEM file holding the device RSA key; generated on first use.
    pub device_key_path: Option<PathBuf>,
    /// Session key cache file. `None` keeps keys in memory only.
    pub cache_path: Option<PathBuf>,
    pub key_ttl_secs: u64,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
    pub languages: Vec<String>,
    /// Profile tokens requested when the caller supplies none.
    pub profiles: Vec<String>,
    pub cookie_names: CookieNames,
    pub output: OutputConstraints,
    /// Gzip request payloads.
    pub compress_requests: bool,
    pub client_version: String,
    pub ui_version: String,
    pub rules: ClassifierRules,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://www.netflix.com/nq/msl_v1/cadmium/pbo_manifests/%5E1.0.0/router".to_string(),
            esn: String::new(),
            device_key_path: None,
            cache_path: None,
            key_ttl_secs: DEFAULT_KEY_TTL_SECS,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            retry: RetryPolicy::default(),
            languages: vec!["en-US".to_string()],
            profiles: default_profiles(),
            cookie_names: CookieNames::default(),
            output: OutputConstraints::default(),
            compress_requests: false,
            client_version: CLIENT_VERSION.to_string(),
            ui_version: UI_VERSION.to_string(),
            rules: ClassifierRules::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::Config(format!("Invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file. Relative paths inside it resolve against the
    /// file's directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let mut config = Self::from_yaml_str(&text)?;
        if let Some(base) = path.parent() {
            config.device_key_path = config.device_key_path.map(|p| resolve(base, p));
            config.cache_path = config.cache_path.map(|p| resolve(base, p));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("endpoint must not be empty".to_string()));
        }
        if self.esn.trim().is_empty() {
            return Err(Error::Config("esn must not be empty".to_string()));
        }
        if self.key_ttl_secs == 0 {
            return Err(Error::Config("key_ttl_secs must be positive".to_string()));
        }
        if self.retry.attempts == 0 {
            return Err(Error::Config("retry.attempts must be at least 1".to_string()));
        }
        if self.languages.is_empty() {
            return Err(Error::Config("languages must not be empty".to_string()));
        }
        if self.cookie_names.identity.is_empty() || self.cookie_names.secure_identity.is_empty() {
            return Err(Error::Config("cookie_names must list at least one name each".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
