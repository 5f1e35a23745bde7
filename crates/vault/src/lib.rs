//! acmevault - vault-backed ACME certificate workflow engine
//!
//! Drives a certificate from account registration to exported key material,
//! persisting every step in a local vault so a workflow can be resumed from
//! any point:
//!
//! - **Registration**: account key pair, contacts, terms of service
//! - **Authorization**: per-domain identifiers, challenge decoding, bounded
//!   completion polling
//! - **Issuance**: key/CSR generation or import, submission, bounded
//!   issuance polling, issuer resolution, revocation
//! - **Export**: key, CSR, certificate, issuer, full chain and PKCS#12
//! - **Cleanup**: orphaned identifiers and certificates
//!
//! The CA is reached through the [`AcmeTransport`] trait; this crate ships no
//! HTTP implementation of it.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use acmevault::{ChallengeType, CsrSource, VaultManager};
//!
//! let manager = VaultManager::from_config(&config, Arc::new(transport))?;
//! manager.new_registration(&["mailto:admin@example.com".into()], true).await?;
//!
//! let start = manager.begin_authorization("www.example.com", ChallengeType::Http01).await?;
//! // publish start.challenges[0] ...
//! manager.submit_challenge(&start.identifier.alias, ChallengeType::Http01, false).await?;
//! manager.complete_authorization(&start.identifier.alias).await?;
//!
//! let requested = manager.request_certificate(&start.identifier.alias, &[], None).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod account;
pub mod authorization;
pub mod challenge;
pub mod cleanup;
pub mod error;
pub mod export;
pub mod issuance;
pub mod manager;
pub mod model;
pub mod pki;
mod registration;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_support;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Facade
pub use manager::VaultManager;

// Errors
pub use error::{AcmeVaultError, EntityKind, Problem, Result, StorageError};

// Workflow results
pub use authorization::{AuthorizationOutcome, AuthorizationStart};
pub use cleanup::{CleanupPolicy, CleanupReport};
pub use export::ExportFormat;
pub use issuance::{CsrSource, IssuanceOutcome, RequestedCertificate};

// Vault model
pub use challenge::{Challenge, ChallengeDetail, ChallengePayload, ChallengeType};
pub use model::{Asset, AssetType, Certificate, Identifier, IssuerCertificate, Registration, Vault};
pub use store::{OpenMode, VaultStore};

// Transport seam
pub use transport::{AcmeTransport, OfflineTransport, TransportError};

// Shared types
pub use acmevault_common::{CertificateId, IdentifierId, PollPolicy, RegistrationId};
