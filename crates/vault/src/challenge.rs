//! ACME challenge material
//!
//! Decodes the CA's challenge entries into what a challenge-answer
//! publisher needs: a file to serve for HTTP-01, a TXT record for DNS-01,
//! or the key authorization and iteration count for TLS-SNI-01.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::account::AccountKey;
use crate::error::Result;
use crate::transport::AuthorizationChallenge;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// DNS-01 record label
pub const DNS_CHALLENGE_LABEL: &str = "_acme-challenge";

/// Iteration count used when the CA omits `n` on a TLS-SNI challenge
pub const DEFAULT_TLS_SNI_ITERATIONS: u32 = 1;

/// Supported challenge types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-sni-01")]
    TlsSni01,
}

impl ChallengeType {
    pub const ALL: [ChallengeType; 3] = [Self::Http01, Self::Dns01, Self::TlsSni01];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsSni01 => "tls-sni-01",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unsupported challenge type '{0}'")]
pub struct ParseChallengeTypeError(String);

impl FromStr for ChallengeType {
    type Err = ParseChallengeTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseChallengeTypeError(s.to_string()))
    }
}

/// Type-specific challenge data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChallengeDetail {
    #[serde(rename = "http-01")]
    Http {
        /// Path relative to the site root
        file_path: String,
        /// Full URL the CA will fetch
        file_url: String,
        file_content: String,
    },
    #[serde(rename = "dns-01")]
    Dns {
        record_name: String,
        record_value: String,
    },
    #[serde(rename = "tls-sni-01")]
    TlsSni {
        key_authorization: String,
        iteration_count: u32,
    },
}

/// Decoded challenge, cached on its identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub token: String,
    /// CA location used to submit the answer
    pub uri: String,
    pub key_authorization: String,
    pub detail: ChallengeDetail,
    pub decoded_at: DateTime<Utc>,
}

impl Challenge {
    /// Decode the CA's challenge entry for `dns` using the account key
    pub fn decode(dns: &str, ca: &AuthorizationChallenge, key: &AccountKey) -> Result<Self> {
        let key_authorization = key.key_authorization(&ca.token)?;

        let detail = match ca.challenge_type {
            ChallengeType::Http01 => {
                let prefix = ACME_CHALLENGE_PREFIX.trim_start_matches('/');
                let file_path = format!("{}{}", prefix, ca.token);
                ChallengeDetail::Http {
                    file_url: format!("http://{}/{}", dns, file_path),
                    file_path,
                    file_content: key_authorization.clone(),
                }
            }
            ChallengeType::Dns01 => ChallengeDetail::Dns {
                record_name: format!("{}.{}", DNS_CHALLENGE_LABEL, dns),
                record_value: URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes())),
            },
            ChallengeType::TlsSni01 => ChallengeDetail::TlsSni {
                key_authorization: key_authorization.clone(),
                iteration_count: ca.iterations.unwrap_or(DEFAULT_TLS_SNI_ITERATIONS),
            },
        };

        debug!(
            dns = %dns,
            challenge_type = %ca.challenge_type,
            token = %ca.token,
            "Decoded challenge material"
        );

        Ok(Self {
            token: ca.token.clone(),
            uri: ca.uri.clone(),
            key_authorization,
            detail,
            decoded_at: Utc::now(),
        })
    }

    pub fn challenge_type(&self) -> ChallengeType {
        match self.detail {
            ChallengeDetail::Http { .. } => ChallengeType::Http01,
            ChallengeDetail::Dns { .. } => ChallengeType::Dns01,
            ChallengeDetail::TlsSni { .. } => ChallengeType::TlsSni01,
        }
    }

    /// Flattened view handed to a challenge-answer publisher
    pub fn payload(&self) -> ChallengePayload {
        let mut payload = ChallengePayload {
            challenge_type: self.challenge_type(),
            token: self.token.clone(),
            key: self.token.clone(),
            value: String::new(),
            resource_path: None,
            resource_uri: None,
            iteration_count: None,
        };

        match &self.detail {
            ChallengeDetail::Http {
                file_path,
                file_url,
                file_content,
            } => {
                payload.value = file_content.clone();
                payload.resource_path = Some(file_path.clone());
                payload.resource_uri = Some(file_url.clone());
            }
            ChallengeDetail::Dns {
                record_name,
                record_value,
            } => {
                payload.key = record_name.clone();
                payload.value = record_value.clone();
            }
            ChallengeDetail::TlsSni {
                key_authorization,
                iteration_count,
            } => {
                payload.value = key_authorization.clone();
                payload.iteration_count = Some(*iteration_count);
            }
        }

        payload
    }
}

/// What a challenge-answer publisher must make visible to the CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub challenge_type: ChallengeType,
    pub token: String,
    /// Token for HTTP/TLS-SNI, record name for DNS
    pub key: String,
    /// File content, record value, or key authorization
    pub value: String,
    pub resource_path: Option<String>,
    pub resource_uri: Option<String>,
    pub iteration_count: Option<u32>,
}
