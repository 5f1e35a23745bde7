//! ACME transport seam
//!
//! The workflow never talks HTTP itself. Everything that crosses the wire
//! goes through [`AcmeTransport`], which receives the account signing
//! context and returns the CA's objects. Those objects are persisted in
//! the vault verbatim, so they derive `Serialize`/`Deserialize`.
//!
//! Directory discovery, nonce handling and JWS signing belong to the
//! transport implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::AccountKey;
use crate::challenge::ChallengeType;
use crate::error::Problem;

/// Link relation pointing at the issuer certificate
pub const LINK_REL_UP: &str = "up";

/// Transport-level failures
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// CA answered with a structured problem document
    #[error("{0}")]
    Problem(Problem),

    /// Anything else: connection failures, malformed responses
    #[error("{0}")]
    Network(String),
}

impl TransportError {
    /// Split into the optional problem and a message for error reporting
    pub fn into_parts(self) -> (Option<Problem>, String) {
        match self {
            Self::Problem(problem) => {
                let message = problem.to_string();
                (Some(problem), message)
            }
            Self::Network(message) => (None, message),
        }
    }
}

/// CA service directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDirectory {
    pub new_registration: String,
    pub new_authorization: String,
    pub new_certificate: String,
    pub revoke_certificate: String,
    #[serde(default)]
    pub terms_of_service: Option<String>,
}

/// Account registration object as returned by the CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationObject {
    /// Registration location
    pub uri: String,
    pub contacts: Vec<String>,
    /// Terms-of-service URI the account has agreed to, if any
    #[serde(default)]
    pub agreement: Option<String>,
    /// Terms-of-service link offered by the CA
    #[serde(default)]
    pub terms_of_service: Option<String>,
}

/// Authorization status as reported by the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
}

impl AuthorizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One challenge inside an authorization, as the CA describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationChallenge {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub uri: String,
    pub token: String,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub error: Option<Problem>,
    /// TLS-SNI hash iteration count (`n`)
    #[serde(default)]
    pub iterations: Option<u32>,
}

/// Authorization object for one DNS identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationState {
    /// DNS name the CA authorized (ASCII form)
    pub identifier: String,
    /// Authorization location, used for refreshes
    pub uri: String,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub challenges: Vec<AuthorizationChallenge>,
}

impl AuthorizationState {
    pub fn is_pending(&self) -> bool {
        self.status == AuthorizationStatus::Pending
    }

    /// CA-side challenge entry for a challenge type
    pub fn challenge(&self, challenge_type: ChallengeType) -> Option<&AuthorizationChallenge> {
        self.challenges
            .iter()
            .find(|c| c.challenge_type == challenge_type)
    }

    /// First challenge error reported by the CA
    pub fn first_challenge_error(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }

    /// Whether any challenge has already been marked invalid
    pub fn has_invalid_challenge(&self) -> bool {
        self.challenges
            .iter()
            .any(|c| c.status == AuthorizationStatus::Invalid)
    }
}

/// Typed link header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub uri: String,
}

/// Certificate request handle returned by the CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    /// Location to refresh the request from
    pub uri: String,
    /// Issued certificate (DER), once available
    #[serde(default, with = "base64_der")]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
}

impl CertificateRequest {
    pub fn has_content(&self) -> bool {
        self.content.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Issuer certificate location (`rel="up"`)
    pub fn issuer_link(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel == LINK_REL_UP)
            .map(|l| l.uri.as_str())
    }
}

/// Signing context handed to every transport call
#[derive(Debug, Clone, Copy)]
pub struct AccountContext<'a> {
    pub base_uri: &'a str,
    pub directory: &'a ServerDirectory,
    pub key: &'a AccountKey,
    /// `None` only while registering
    pub registration: Option<&'a RegistrationObject>,
}

/// The ACME protocol operations the workflow relies on
#[async_trait]
pub trait AcmeTransport: Send + Sync {
    /// Fetch the CA's service directory
    async fn directory(&self, base_uri: &str) -> Result<ServerDirectory, TransportError>;

    /// Register a new account for the context key
    async fn new_registration(
        &self,
        account: AccountContext<'_>,
        contacts: &[String],
    ) -> Result<RegistrationObject, TransportError>;

    /// Agree to the CA's current terms of service
    async fn agree_to_terms(
        &self,
        account: AccountContext<'_>,
        terms_uri: &str,
    ) -> Result<RegistrationObject, TransportError>;

    /// Request a new authorization for an ASCII DNS name
    async fn new_authorization(
        &self,
        account: AccountContext<'_>,
        dns: &str,
    ) -> Result<AuthorizationState, TransportError>;

    /// Re-read an authorization's current state
    async fn refresh_authorization(
        &self,
        account: AccountContext<'_>,
        authorization_uri: &str,
    ) -> Result<AuthorizationState, TransportError>;

    /// Tell the CA the challenge answer is published
    async fn answer_challenge(
        &self,
        account: AccountContext<'_>,
        challenge_uri: &str,
        key_authorization: &str,
    ) -> Result<AuthorizationChallenge, TransportError>;

    /// Submit a base64url-encoded DER CSR
    async fn request_certificate(
        &self,
        account: AccountContext<'_>,
        csr_der_b64url: &str,
    ) -> Result<CertificateRequest, TransportError>;

    /// Re-read a certificate request
    async fn refresh_certificate(
        &self,
        account: AccountContext<'_>,
        request: &CertificateRequest,
    ) -> Result<CertificateRequest, TransportError>;

    /// Download a certificate referenced by a link (DER)
    async fn fetch_issuer(&self, link: &str) -> Result<Vec<u8>, TransportError>;

    /// Revoke a base64url-encoded DER certificate
    async fn revoke_certificate(
        &self,
        account: AccountContext<'_>,
        certificate_der_b64url: &str,
    ) -> Result<(), TransportError>;
}

/// Transport for offline maintenance: every network call fails
///
/// Lets vault inspection, export and cleanup run through [`VaultManager`]
/// without a CA connection.
///
/// [`VaultManager`]: crate::manager::VaultManager
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineTransport;

impl OfflineTransport {
    fn unavailable<T>(operation: &str) -> Result<T, TransportError> {
        Err(TransportError::Network(format!("{operation} needs a CA connection (offline)")))
    }
}

#[async_trait]
impl AcmeTransport for OfflineTransport {
    async fn directory(&self, _base_uri: &str) -> Result<ServerDirectory, TransportError> {
        Self::unavailable("directory")
    }

    async fn new_registration(
        &self,
        _account: AccountContext<'_>,
        _contacts: &[String],
    ) -> Result<RegistrationObject, TransportError> {
        Self::unavailable("new-registration")
    }

    async fn agree_to_terms(
        &self,
        _account: AccountContext<'_>,
        _terms_uri: &str,
    ) -> Result<RegistrationObject, TransportError> {
        Self::unavailable("agree-to-terms")
    }

    async fn new_authorization(
        &self,
        _account: AccountContext<'_>,
        _dns: &str,
    ) -> Result<AuthorizationState, TransportError> {
        Self::unavailable("new-authorization")
    }

    async fn refresh_authorization(
        &self,
        _account: AccountContext<'_>,
        _authorization_uri: &str,
    ) -> Result<AuthorizationState, TransportError> {
        Self::unavailable("refresh-authorization")
    }

    async fn answer_challenge(
        &self,
        _account: AccountContext<'_>,
        _challenge_uri: &str,
        _key_authorization: &str,
    ) -> Result<AuthorizationChallenge, TransportError> {
        Self::unavailable("answer-challenge")
    }

    async fn request_certificate(
        &self,
        _account: AccountContext<'_>,
        _csr_der_b64url: &str,
    ) -> Result<CertificateRequest, TransportError> {
        Self::unavailable("new-certificate")
    }

    async fn refresh_certificate(
        &self,
        _account: AccountContext<'_>,
        _request: &CertificateRequest,
    ) -> Result<CertificateRequest, TransportError> {
        Self::unavailable("refresh-certificate")
    }

    async fn fetch_issuer(&self, _link: &str) -> Result<Vec<u8>, TransportError> {
        Self::unavailable("fetch-issuer")
    }

    async fn revoke_certificate(
        &self,
        _account: AccountContext<'_>,
        _certificate_der_b64url: &str,
    ) -> Result<(), TransportError> {
        Self::unavailable("revoke-certificate")
    }
}

mod base64_der {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
