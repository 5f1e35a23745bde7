//! Configuration for acmevault
//!
//! Configuration is written in KDL:
//!
//! ```kdl
//! vault {
//!     storage "/var/lib/acmevault"
//!     ca "letsencrypt-staging"
//!     open-attempts 3
//!     open-retry-ms 200
//! }
//! authorization {
//!     max-attempts 3
//!     interval-ms 2000
//! }
//! issuance {
//!     max-attempts 5
//!     interval-ms 3000
//! }
//! ```
//!
//! Every block and every entry is optional; omitted values fall back to the
//! defaults in [`acmevault_common::poll`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use acmevault_common::poll::{self, PollPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use validator::{Validate, ValidationError};

mod kdl;

/// Name of the production Let's Encrypt endpoint
pub const WELL_KNOWN_LETSENCRYPT: &str = "letsencrypt";

/// Name of the staging Let's Encrypt endpoint
pub const WELL_KNOWN_LETSENCRYPT_STAGING: &str = "letsencrypt-staging";

/// Well-known CA base URIs, by short name
pub const WELL_KNOWN_BASE_SERVICES: &[(&str, &str)] = &[
    (WELL_KNOWN_LETSENCRYPT, "https://acme-v01.api.letsencrypt.org/"),
    (
        WELL_KNOWN_LETSENCRYPT_STAGING,
        "https://acme-staging.api.letsencrypt.org/",
    ),
];

/// Default vault storage location
pub const DEFAULT_STORAGE_PATH: &str = "/var/lib/acmevault";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("unknown certificate authority '{0}' (expected a well-known name or an https URL)")]
    UnknownAuthority(String),
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Vault storage and CA selection
    #[validate(nested)]
    #[serde(default)]
    pub vault: VaultConfig,

    /// Authorization completion polling
    #[validate(nested)]
    #[serde(default = "PollConfig::authorization")]
    pub authorization: PollConfig,

    /// Certificate issuance polling
    #[validate(nested)]
    #[serde(default = "PollConfig::issuance")]
    pub issuance: PollConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault: VaultConfig::default(),
            authorization: PollConfig::authorization(),
            issuance: PollConfig::issuance(),
        }
    }
}

/// Vault storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct VaultConfig {
    /// Root directory of the vault store
    #[validate(custom(function = "validate_storage_path"))]
    pub storage: PathBuf,

    /// CA to use when a new vault is initialized (well-known name or URL)
    #[validate(custom(function = "validate_authority"))]
    pub ca: String,

    /// Attempts to open storage while it is transiently locked
    #[validate(range(min = 1, max = 20))]
    pub open_attempts: u32,

    /// Delay between open attempts in milliseconds
    #[validate(range(min = 10, max = 10_000))]
    pub open_retry_ms: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            storage: PathBuf::from(DEFAULT_STORAGE_PATH),
            ca: WELL_KNOWN_LETSENCRYPT_STAGING.to_string(),
            open_attempts: poll::DEFAULT_OPEN_ATTEMPTS,
            open_retry_ms: poll::DEFAULT_OPEN_RETRY_DELAY.as_millis() as u64,
        }
    }
}

impl VaultConfig {
    /// Resolve the configured CA to a base URI
    pub fn base_uri(&self) -> Result<String, ConfigError> {
        resolve_authority(&self.ca)
    }

    /// Retry policy for opening vault storage
    pub fn open_policy(&self) -> PollPolicy {
        PollPolicy::new(self.open_attempts, Duration::from_millis(self.open_retry_ms))
    }
}

/// Bounded polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PollConfig {
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,

    #[validate(range(min = 100, max = 600_000))]
    pub interval_ms: u64,
}

impl PollConfig {
    pub fn authorization() -> Self {
        Self::from(PollPolicy::authorization())
    }

    pub fn issuance() -> Self {
        Self::from(PollPolicy::issuance())
    }

    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(self.max_attempts, Duration::from_millis(self.interval_ms))
    }
}

impl From<PollPolicy> for PollConfig {
    fn from(policy: PollPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            interval_ms: policy.interval.as_millis() as u64,
        }
    }
}

impl Config {
    /// Load and validate configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "Loading configuration");
        Self::from_kdl(&content)
    }

    /// Parse and validate configuration from KDL text
    pub fn from_kdl(content: &str) -> Result<Self, ConfigError> {
        let config =
            crate::kdl::parse_config(content).map_err(|e| ConfigError::Parse(format!("{e:#}")))?;
        config.validate()?;

        debug!(
            storage = %config.vault.storage.display(),
            ca = %config.vault.ca,
            authorization_attempts = config.authorization.max_attempts,
            issuance_attempts = config.issuance.max_attempts,
            "Parsed configuration"
        );

        Ok(config)
    }
}

/// Map a well-known CA name or explicit URL to a base URI
pub fn resolve_authority(ca: &str) -> Result<String, ConfigError> {
    if let Some((_, uri)) = WELL_KNOWN_BASE_SERVICES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(ca))
    {
        return Ok((*uri).to_string());
    }

    match url::Url::parse(ca) {
        Ok(url) if url.scheme() == "https" || url.scheme() == "http" => Ok(url.to_string()),
        _ => Err(ConfigError::UnknownAuthority(ca.to_string())),
    }
}

fn validate_storage_path(path: &Path) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::new("empty_storage_path"));
    }
    Ok(())
}

fn validate_authority(ca: &str) -> Result<(), ValidationError> {
    resolve_authority(ca)
        .map(|_| ())
        .map_err(|_| ValidationError::new("unknown_authority"))
}
