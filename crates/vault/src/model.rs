//! Vault entity graph
//!
//! The whole graph is one aggregate: [`Vault`] is loaded, mutated and saved
//! as a unit by [`crate::store::VaultStore`]. Cross-entity references are
//! typed ids, never pointers.

use std::collections::BTreeMap;
use std::fmt;

use acmevault_common::{CertificateId, IdentifierId, RegistrationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::challenge::{Challenge, ChallengeType};
use crate::transport::{AuthorizationState, CertificateRequest, RegistrationObject, ServerDirectory};

/// Root aggregate of the vault store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    pub id: Uuid,
    /// CA base URI the vault was initialized against
    pub base_uri: String,
    /// Cached CA directory
    #[serde(default)]
    pub directory: Option<ServerDirectory>,
    pub created: DateTime<Utc>,
    /// Index 0 is the current registration
    #[serde(default)]
    pub registrations: Vec<Registration>,
    #[serde(default)]
    pub identifiers: BTreeMap<IdentifierId, Identifier>,
    #[serde(default)]
    pub certificates: BTreeMap<CertificateId, Certificate>,
    /// Keyed by serial number
    #[serde(default)]
    pub issuer_certificates: BTreeMap<String, IssuerCertificate>,
    #[serde(default)]
    pub provider_profiles: BTreeMap<Uuid, ProviderProfile>,
}

impl Vault {
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            base_uri: base_uri.into(),
            directory: None,
            created: Utc::now(),
            registrations: Vec::new(),
            identifiers: BTreeMap::new(),
            certificates: BTreeMap::new(),
            issuer_certificates: BTreeMap::new(),
            provider_profiles: BTreeMap::new(),
        }
    }

    pub fn current_registration(&self) -> Option<&Registration> {
        self.registrations.first()
    }

    pub fn registration(&self, id: RegistrationId) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.id == id)
    }

    /// Find an identifier by id, alias or DNS name
    pub fn find_identifier(&self, reference: &str) -> Option<&Identifier> {
        trace!(reference = %reference, "Looking up identifier");
        if let Ok(id) = reference.parse::<IdentifierId>() {
            if let Some(identifier) = self.identifiers.get(&id) {
                return Some(identifier);
            }
        }
        self.identifiers
            .values()
            .find(|i| i.alias.eq_ignore_ascii_case(reference))
            .or_else(|| {
                self.identifiers
                    .values()
                    .find(|i| i.dns.eq_ignore_ascii_case(reference))
            })
    }

    pub fn find_identifier_mut(&mut self, reference: &str) -> Option<&mut Identifier> {
        let id = self.find_identifier(reference)?.id;
        self.identifiers.get_mut(&id)
    }

    /// Find a certificate by id or alias
    pub fn find_certificate(&self, reference: &str) -> Option<&Certificate> {
        trace!(reference = %reference, "Looking up certificate");
        if let Ok(id) = reference.parse::<CertificateId>() {
            if let Some(certificate) = self.certificates.get(&id) {
                return Some(certificate);
            }
        }
        self.certificates
            .values()
            .find(|c| c.alias.eq_ignore_ascii_case(reference))
    }

    /// Remove every identifier for a DNS name, returning what was removed
    pub fn remove_identifiers_by_dns(&mut self, dns: &str) -> Vec<Identifier> {
        let ids: Vec<IdentifierId> = self
            .identifiers
            .values()
            .filter(|i| i.dns.eq_ignore_ascii_case(dns))
            .map(|i| i.id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.identifiers.remove(&id))
            .collect()
    }

    /// Whether any certificate references the identifier
    pub fn is_identifier_referenced(&self, id: IdentifierId) -> bool {
        self.certificates.values().any(|c| c.references(id))
    }

    /// Issuer certificate previously fetched from a link
    pub fn issuer_by_source(&self, source_uri: &str) -> Option<&IssuerCertificate> {
        self.issuer_certificates
            .values()
            .find(|i| i.source_uri.as_deref() == Some(source_uri))
    }
}

/// ACME account registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: RegistrationId,
    #[serde(default)]
    pub alias: Option<String>,
    pub contacts: Vec<String>,
    /// Registration object as the CA returned it
    pub registration: RegistrationObject,
    pub signer_provider: String,
    /// Base64 PKCS#8 signing key
    pub signer_state: String,
    pub created: DateTime<Utc>,
}

impl Registration {
    pub fn has_agreed_to_terms(&self) -> bool {
        self.registration.agreement.is_some()
    }
}

/// One DNS name under authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub id: IdentifierId,
    pub alias: String,
    pub registration: RegistrationId,
    /// ASCII form of the DNS name
    pub dns: String,
    pub authorization: AuthorizationState,
    #[serde(default)]
    pub challenges: BTreeMap<ChallengeType, Challenge>,
    #[serde(default)]
    pub challenge_completed: BTreeMap<ChallengeType, DateTime<Utc>>,
    #[serde(default)]
    pub challenge_cleaned_up: BTreeMap<ChallengeType, DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

impl Identifier {
    /// Pending and not past its expiry
    pub fn is_pending_at(&self, now: DateTime<Utc>) -> bool {
        self.authorization.is_pending() && self.authorization.expires.is_none_or(|e| e > now)
    }

    pub fn is_valid(&self) -> bool {
        self.authorization.status == crate::transport::AuthorizationStatus::Valid
    }
}

/// Certificate workflow record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: CertificateId,
    pub alias: String,
    pub identifier: IdentifierId,
    #[serde(default)]
    pub alternative_identifiers: Vec<IdentifierId>,

    #[serde(default)]
    pub csr_details_file: Option<String>,
    #[serde(default)]
    pub key_gen_file: Option<String>,
    #[serde(default)]
    pub key_pem_file: Option<String>,
    #[serde(default)]
    pub csr_gen_file: Option<String>,
    #[serde(default)]
    pub csr_pem_file: Option<String>,

    /// CA request handle, once submitted
    #[serde(default)]
    pub request: Option<CertificateRequest>,

    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub thumbprint: Option<String>,
    #[serde(default)]
    pub signature_algorithm: Option<String>,
    #[serde(default)]
    pub signature_hash: Option<String>,
    /// Hex signature value of the issued certificate
    #[serde(default)]
    pub raw_signature: Option<String>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub issuer_serial_number: Option<String>,
    #[serde(default)]
    pub crt_der_file: Option<String>,
    #[serde(default)]
    pub crt_pem_file: Option<String>,
    #[serde(default)]
    pub revoked: Option<DateTime<Utc>>,

    pub created: DateTime<Utc>,
}

impl Certificate {
    pub fn new(
        alias: String,
        identifier: IdentifierId,
        alternative_identifiers: Vec<IdentifierId>,
    ) -> Self {
        Self {
            id: CertificateId::new(),
            alias,
            identifier,
            alternative_identifiers,
            csr_details_file: None,
            key_gen_file: None,
            key_pem_file: None,
            csr_gen_file: None,
            csr_pem_file: None,
            request: None,
            serial_number: None,
            thumbprint: None,
            signature_algorithm: None,
            signature_hash: None,
            raw_signature: None,
            not_after: None,
            issuer_serial_number: None,
            crt_der_file: None,
            crt_pem_file: None,
            revoked: None,
            created: Utc::now(),
        }
    }

    /// Primary or alternative reference to the identifier
    pub fn references(&self, id: IdentifierId) -> bool {
        self.identifier == id || self.alternative_identifiers.contains(&id)
    }

    pub fn is_issued(&self) -> bool {
        self.crt_der_file.is_some()
    }

    pub fn has_issuer(&self) -> bool {
        self.issuer_serial_number
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }

    /// Every asset file the certificate owns
    pub fn assets(&self) -> Vec<Asset> {
        [
            (AssetType::CsrDetails, &self.csr_details_file),
            (AssetType::KeyGen, &self.key_gen_file),
            (AssetType::KeyPem, &self.key_pem_file),
            (AssetType::CsrGen, &self.csr_gen_file),
            (AssetType::CsrPem, &self.csr_pem_file),
            (AssetType::CrtDer, &self.crt_der_file),
            (AssetType::CrtPem, &self.crt_pem_file),
        ]
        .into_iter()
        .filter_map(|(asset_type, name)| name.as_ref().map(|n| Asset::new(asset_type, n.clone())))
        .collect()
    }
}

/// Certificate of the CA that signed an issued certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerCertificate {
    pub serial_number: String,
    /// "up" link the certificate was downloaded from
    #[serde(default)]
    pub source_uri: Option<String>,
    pub thumbprint: String,
    pub signature_algorithm: String,
    pub signature_hash: String,
    pub crt_der_file: String,
    pub crt_pem_file: String,
}

/// Named provider configuration (challenge handlers, installers)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: Uuid,
    pub alias: String,
    pub provider_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Typed asset folders under the vault root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    KeyGen,
    KeyPem,
    CsrDetails,
    CsrGen,
    CsrPem,
    CrtDer,
    CrtPem,
    IssuerDer,
    IssuerPem,
    Asset,
}

impl AssetType {
    pub const ALL: [AssetType; 10] = [
        Self::KeyGen,
        Self::KeyPem,
        Self::CsrDetails,
        Self::CsrGen,
        Self::CsrPem,
        Self::CrtDer,
        Self::CrtPem,
        Self::IssuerDer,
        Self::IssuerPem,
        Self::Asset,
    ];

    pub fn folder(&self) -> &'static str {
        match self {
            Self::KeyGen => "00-KEYGEN",
            Self::KeyPem => "10-KEYPM",
            Self::CsrDetails => "15-CSRDT",
            Self::CsrGen => "20-CSRGN",
            Self::CsrPem => "30-CSRPM",
            Self::CrtDer => "40-CRTDR",
            Self::CrtPem => "45-CRTPM",
            Self::IssuerDer => "50-ISUDR",
            Self::IssuerPem => "55-ISUPM",
            Self::Asset => "99-ASSET",
        }
    }

    /// Holds private key material
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::KeyGen | Self::KeyPem | Self::Asset)
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder())
    }
}

/// Asset file reference, resolved against the vault root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    pub asset_type: AssetType,
    pub name: String,
}

impl Asset {
    pub fn new(asset_type: AssetType, name: impl Into<String>) -> Self {
        Self {
            asset_type,
            name: name.into(),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.asset_type.folder(), self.name)
    }
}

/// Asset file names by entity id
pub mod asset_names {
    use std::fmt::Display;

    pub fn key_gen(id: impl Display) -> String {
        format!("{id}-gen-key.json")
    }

    pub fn key_pem(id: impl Display) -> String {
        format!("{id}-key.pem")
    }

    pub fn csr_details(id: impl Display) -> String {
        format!("{id}-csr-details.json")
    }

    pub fn csr_gen(id: impl Display) -> String {
        format!("{id}-gen-csr.json")
    }

    pub fn csr_pem(id: impl Display) -> String {
        format!("{id}-csr.pem")
    }

    pub fn crt_der(id: impl Display) -> String {
        format!("{id}-crt.der")
    }

    pub fn crt_pem(id: impl Display) -> String {
        format!("{id}-crt.pem")
    }

    pub fn issuer_der(serial: &str) -> String {
        format!("ca-{serial}-crt.der")
    }

    pub fn issuer_pem(serial: &str) -> String {
        format!("ca-{serial}-crt.pem")
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::transport::AuthorizationStatus;

    pub fn authorization(dns: &str, status: AuthorizationStatus) -> AuthorizationState {
        AuthorizationState {
            identifier: dns.to_string(),
            uri: format!("https://ca.test/authz/{dns}"),
            status,
            expires: None,
            challenges: Vec::new(),
        }
    }

    pub fn identifier(dns: &str, status: AuthorizationStatus) -> Identifier {
        let id = IdentifierId::new();
        Identifier {
            id,
            alias: format!("ident{}", &id.to_string()[..8]),
            registration: RegistrationId::new(),
            dns: dns.to_string(),
            authorization: authorization(dns, status),
            challenges: BTreeMap::new(),
            challenge_completed: BTreeMap::new(),
            challenge_cleaned_up: BTreeMap::new(),
            created: Utc::now(),
        }
    }

    pub fn certificate(identifier: IdentifierId, issuer: Option<&str>) -> Certificate {
        let mut cert = Certificate::new(format!("cert_{identifier}"), identifier, Vec::new());
        cert.issuer_serial_number = issuer.map(str::to_string);
        cert
    }
}
