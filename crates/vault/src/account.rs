//! Account signing key
//!
//! The account key signs every protocol message. It is persisted on the
//! registration as base64 PKCS#8 so a later process can rebuild the same
//! signing identity without registering again.

use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rcgen::KeyPair;
use sha2::{Digest, Sha256};

use crate::error::{AcmeVaultError, Result};

/// Signer provider name recorded on registrations
pub const SIGNER_PROVIDER_ES256: &str = "ES256";

/// Uncompressed P-256 point: 0x04 || x (32 bytes) || y (32 bytes)
const P256_POINT_LEN: usize = 65;

/// ECDSA P-256 account key
pub struct AccountKey {
    key_pair: KeyPair,
}

impl AccountKey {
    /// Generate a fresh account key
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        Ok(Self { key_pair })
    }

    /// Rebuild a key from its persisted signer state
    pub fn from_state(state: &str) -> Result<Self> {
        let der = STANDARD
            .decode(state.trim())
            .map_err(|e| AcmeVaultError::Crypto(format!("signer state is not base64: {e}")))?;
        let key_pair = KeyPair::try_from(der.as_slice())?;
        Ok(Self { key_pair })
    }

    /// Signer state for persistence (base64 PKCS#8 DER)
    pub fn to_state(&self) -> String {
        STANDARD.encode(self.key_pair.serialize_der())
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Public JWK members in RFC 7638 canonical order
    pub fn jwk(&self) -> Result<String> {
        let raw = self.key_pair.public_key_raw();
        if raw.len() != P256_POINT_LEN || raw[0] != 0x04 {
            return Err(AcmeVaultError::Crypto(
                "account key is not an uncompressed P-256 point".to_string(),
            ));
        }

        let x = URL_SAFE_NO_PAD.encode(&raw[1..33]);
        let y = URL_SAFE_NO_PAD.encode(&raw[33..65]);
        Ok(format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#))
    }

    /// JWK thumbprint (base64url SHA-256 of the canonical JWK)
    pub fn thumbprint(&self) -> Result<String> {
        let digest = Sha256::digest(self.jwk()?.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(digest))
    }

    /// Key authorization for a challenge token
    pub fn key_authorization(&self, token: &str) -> Result<String> {
        Ok(format!("{}.{}", token, self.thumbprint()?))
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("provider", &SIGNER_PROVIDER_ES256)
            .finish_non_exhaustive()
    }
}
