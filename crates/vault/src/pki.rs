//! Keys, CSRs and certificate inspection

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use pem::{EncodeConfig, LineEnding, Pem};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::certification_request::X509CertificationRequest;

use crate::error::{AcmeVaultError, Result};

pub const PEM_TAG_CERTIFICATE: &str = "CERTIFICATE";
pub const PEM_TAG_CSR: &str = "CERTIFICATE REQUEST";
pub const PEM_TAG_PRIVATE_KEY: &str = "PRIVATE KEY";

/// Key algorithm used for generated certificate keys
pub const KEY_ALGORITHM: &str = "ECDSA_P256_SHA256";

/// Signature algorithm OIDs with their conventional display names
const SIGNATURE_ALGORITHMS: &[(&str, &str)] = &[
    ("1.2.840.113549.1.1.5", "sha1RSA"),
    ("1.2.840.113549.1.1.11", "sha256RSA"),
    ("1.2.840.113549.1.1.12", "sha384RSA"),
    ("1.2.840.113549.1.1.13", "sha512RSA"),
    ("1.2.840.10045.4.3.2", "sha256ECDSA"),
    ("1.2.840.10045.4.3.3", "sha384ECDSA"),
    ("1.2.840.10045.4.3.4", "sha512ECDSA"),
    ("1.3.101.112", "Ed25519"),
];

/// Subject and names a CSR is generated for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrDetails {
    pub common_name: String,
    #[serde(default)]
    pub alternative_names: Vec<String>,
}

impl CsrDetails {
    /// Common name first, then alternatives, without duplicates
    pub fn all_names(&self) -> Vec<String> {
        let mut names = vec![self.common_name.clone()];
        for name in &self.alternative_names {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// Record of how a private key was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenRecord {
    pub algorithm: String,
    /// `false` when the caller supplied the key
    pub generated: bool,
    pub created: DateTime<Utc>,
}

/// Record of how a CSR was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrGenRecord {
    pub names: Vec<String>,
    pub generated: bool,
    /// Base64 DER
    pub der: String,
    pub created: DateTime<Utc>,
}

/// Private key and CSR ready to be stored
#[derive(Debug, Clone)]
pub struct KeyAndCsr {
    pub key_pem: String,
    pub csr_pem: String,
    pub csr_der: Vec<u8>,
    pub key_gen: KeyGenRecord,
    pub csr_gen: CsrGenRecord,
}

/// Generate a P-256 key and a CSR for the details' names
pub fn generate_key_and_csr(details: &CsrDetails) -> Result<KeyAndCsr> {
    let names = details.all_names();
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::new(names.clone())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, details.common_name.as_str());
    params.distinguished_name = dn;

    let csr = params.serialize_request(&key_pair)?;
    let csr_der = csr.der().to_vec();
    let now = Utc::now();

    debug!(
        common_name = %details.common_name,
        names = names.len(),
        "Generated key and CSR"
    );

    Ok(KeyAndCsr {
        key_pem: key_pair.serialize_pem(),
        csr_pem: csr.pem()?,
        key_gen: KeyGenRecord {
            algorithm: KEY_ALGORITHM.to_string(),
            generated: true,
            created: now,
        },
        csr_gen: CsrGenRecord {
            names,
            generated: true,
            der: STANDARD.encode(&csr_der),
            created: now,
        },
        csr_der,
    })
}

/// Accept a caller-supplied key and CSR after checking both parse
pub fn import_key_and_csr(key_pem: &str, csr_pem: &str) -> Result<KeyAndCsr> {
    let key_pair = KeyPair::from_pem(key_pem)?;
    let csr_der = pem_to_der(csr_pem, PEM_TAG_CSR)?;

    let (_, request) = X509CertificationRequest::from_der(&csr_der)
        .map_err(|e| AcmeVaultError::Crypto(format!("invalid CSR: {e}")))?;
    let names: Vec<String> = request
        .certification_request_info
        .subject
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok().map(str::to_string))
        .collect();
    let now = Utc::now();

    Ok(KeyAndCsr {
        key_pem: key_pair.serialize_pem(),
        csr_pem: csr_pem.to_string(),
        key_gen: KeyGenRecord {
            algorithm: format!("{:?}", key_pair.algorithm()),
            generated: false,
            created: now,
        },
        csr_gen: CsrGenRecord {
            names,
            generated: false,
            der: STANDARD.encode(&csr_der),
            created: now,
        },
        csr_der,
    })
}

/// Decode a single PEM block, checking its tag
pub fn pem_to_der(pem_text: &str, expected_tag: &str) -> Result<Vec<u8>> {
    let block = pem::parse(pem_text)?;
    if block.tag() != expected_tag {
        return Err(AcmeVaultError::Crypto(format!(
            "expected PEM block '{}', found '{}'",
            expected_tag,
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

/// Encode DER as a PEM block with LF line endings
pub fn der_to_pem(tag: &str, der: &[u8]) -> String {
    pem::encode_config(
        &Pem::new(tag, der.to_vec()),
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    )
}

/// Identity data extracted from an issued certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    /// Upper-case hex
    pub serial_number: String,
    /// Upper-case hex SHA-1 of the DER
    pub thumbprint: String,
    pub signature_algorithm: String,
    /// Hex SHA-256 of the DER
    pub signature_hash: String,
    /// Upper-case hex of the signature bits
    pub raw_signature: String,
    pub subject: String,
    pub issuer: String,
    pub not_after: Option<DateTime<Utc>>,
}

impl CertificateDetails {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| AcmeVaultError::Crypto(format!("invalid certificate: {e}")))?;

        let oid = cert.signature_algorithm.algorithm.to_id_string();
        let signature_algorithm = SIGNATURE_ALGORITHMS
            .iter()
            .find(|(id, _)| *id == oid)
            .map(|(_, name)| (*name).to_string())
            .unwrap_or(oid);

        Ok(Self {
            serial_number: hex::encode_upper(cert.tbs_certificate.raw_serial()),
            thumbprint: hex::encode_upper(Sha1::digest(der)),
            signature_algorithm,
            signature_hash: hex::encode(Sha256::digest(der)),
            raw_signature: hex::encode_upper(&cert.signature_value.data),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_after: DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0),
        })
    }
}
