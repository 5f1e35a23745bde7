//! Error types for the ACME vault workflow.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

/// Result type for vault workflow operations.
pub type Result<T> = std::result::Result<T, AcmeVaultError>;

/// Structured problem document returned by the CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// Problem type URN, e.g. `urn:acme:error:rateLimited`
    #[serde(rename = "type")]
    pub problem_type: String,
    /// Human readable detail
    pub detail: String,
    /// HTTP status that carried the problem
    #[serde(default)]
    pub status: Option<u16>,
    /// Original response body
    #[serde(default)]
    pub raw: Option<String>,
}

impl Problem {
    pub fn new(problem_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            problem_type: problem_type.into(),
            detail: detail.into(),
            status: None,
            raw: None,
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.detail, self.problem_type)
    }
}

/// Kinds of vault entities, used in reference errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Registration,
    Identifier,
    Certificate,
    IssuerCertificate,
    Challenge,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Registration => "registration",
            Self::Identifier => "identifier",
            Self::Certificate => "certificate",
            Self::IssuerCertificate => "issuer certificate",
            Self::Challenge => "challenge",
        };
        f.write_str(name)
    }
}

/// Vault storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Storage stayed locked for every open attempt
    #[error("vault storage at {path} still busy after {attempts} attempts: {source}")]
    Busy {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// No vault document exists at the storage root
    #[error("no vault initialized at {0}")]
    NotInitialized(PathBuf),

    /// Referenced asset file does not exist
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    /// Asset creation collided with an existing file
    #[error("asset already exists: {0}")]
    AssetExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vault document is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by workflow operations.
///
/// Every variant is a terminal failure for the call that produced it.
/// Transient conditions (locked storage, pending CA state) are retried
/// internally and only show up here once their bounds are exhausted.
#[derive(Debug, Error)]
pub enum AcmeVaultError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// CA rejected or failed a protocol step
    #[error("{operation} failed: {message}")]
    Protocol {
        operation: &'static str,
        problem: Option<Problem>,
        message: String,
    },

    /// New authorization could not be created for a domain
    #[error("authorization for {domain} failed: {message}")]
    Authorization {
        domain: String,
        problem: Option<Problem>,
        message: String,
    },

    /// Certificate request was rejected or could not be submitted
    #[error("issuance of {certificate} failed: {message}")]
    Issuance {
        certificate: String,
        problem: Option<Problem>,
        message: String,
    },

    /// Operation attempted in the wrong authorization/certificate state
    #[error("invalid state: {0}")]
    State(String),

    /// Referenced entity does not exist
    #[error("{kind} not found: {reference}")]
    NotFound { kind: EntityKind, reference: String },

    /// Export requested before a prerequisite asset was produced
    #[error("cannot export {certificate}: missing {missing}")]
    Export { certificate: String, missing: String },

    #[error("invalid domain name '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
}

impl AcmeVaultError {
    pub fn not_found(kind: EntityKind, reference: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            reference: reference.into(),
        }
    }

    pub fn export(certificate: impl Into<String>, missing: impl Into<String>) -> Self {
        Self::Export {
            certificate: certificate.into(),
            missing: missing.into(),
        }
    }

    pub(crate) fn protocol(operation: &'static str, err: TransportError) -> Self {
        let (problem, message) = err.into_parts();
        Self::Protocol {
            operation,
            problem,
            message,
        }
    }

    pub(crate) fn authorization(domain: &str, err: TransportError) -> Self {
        let (problem, message) = err.into_parts();
        Self::Authorization {
            domain: domain.to_string(),
            problem,
            message,
        }
    }

    pub(crate) fn issuance(certificate: &str, err: TransportError) -> Self {
        let (problem, message) = err.into_parts();
        Self::Issuance {
            certificate: certificate.to_string(),
            problem,
            message,
        }
    }

    /// Structured CA problem, if the failure carried one
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Self::Protocol { problem, .. }
            | Self::Authorization { problem, .. }
            | Self::Issuance { problem, .. } => problem.as_ref(),
            _ => None,
        }
    }
}

impl From<rcgen::Error> for AcmeVaultError {
    fn from(err: rcgen::Error) -> Self {
        Self::Crypto(err.to_string())
    }
}

impl From<pem::PemError> for AcmeVaultError {
    fn from(err: pem::PemError) -> Self {
        Self::Crypto(format!("invalid PEM: {err}"))
    }
}
