//! Vault cleanup
//!
//! A single pass that first drops identifiers (those nothing refers to, or
//! one named target), then certificates that never received an issuer or
//! whose identifier is gone. An identifier orphaned by the second step is
//! left for the next pass.

use std::collections::HashSet;

use acmevault_common::{CertificateId, IdentifierId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::manager::VaultManager;
use crate::model::{Asset, Vault};

/// What a cleanup pass may touch
#[derive(Debug, Clone, Default)]
pub struct CleanupPolicy {
    /// Identifiers never removed
    pub exempt: HashSet<IdentifierId>,
    /// Remove exactly this identifier, referenced or not
    pub target: Option<IdentifierId>,
}

impl CleanupPolicy {
    pub fn targeting(id: IdentifierId) -> Self {
        Self {
            exempt: HashSet::new(),
            target: Some(id),
        }
    }

    pub fn with_exempt(mut self, ids: impl IntoIterator<Item = IdentifierId>) -> Self {
        self.exempt.extend(ids);
        self
    }
}

/// What a cleanup pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_identifiers: Vec<IdentifierId>,
    pub removed_certificates: Vec<CertificateId>,
    pub deleted_assets: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.removed_identifiers.is_empty() && self.removed_certificates.is_empty()
    }
}

/// Apply one cleanup pass to a vault, returning the assets of removed certificates
pub(crate) fn apply_cleanup(
    vault: &mut Vault,
    policy: &CleanupPolicy,
    now: DateTime<Utc>,
) -> (CleanupReport, Vec<Asset>) {
    let mut report = CleanupReport::default();

    let doomed: Vec<IdentifierId> = match policy.target {
        Some(target) => vec![target],
        None => vault
            .identifiers
            .values()
            .filter(|i| !policy.exempt.contains(&i.id))
            .filter(|i| !i.is_pending_at(now))
            .filter(|i| !vault.is_identifier_referenced(i.id))
            .map(|i| i.id)
            .collect(),
    };

    for id in doomed {
        if let Some(identifier) = vault.identifiers.remove(&id) {
            debug!(
                identifier = %identifier.alias,
                domain = %identifier.dns,
                "Removing identifier"
            );
            report.removed_identifiers.push(id);
        }
    }

    let orphaned: Vec<CertificateId> = vault
        .certificates
        .values()
        .filter(|c| !c.has_issuer() || !vault.identifiers.contains_key(&c.identifier))
        .map(|c| c.id)
        .collect();

    let mut assets = Vec::new();
    for id in orphaned {
        if let Some(certificate) = vault.certificates.remove(&id) {
            debug!(certificate = %certificate.alias, "Removing orphaned certificate");
            assets.extend(certificate.assets());
            report.removed_certificates.push(id);
        }
    }

    (report, assets)
}

impl VaultManager {
    /// Remove orphaned identifiers and certificates in one pass
    pub fn cleanup(&self, policy: &CleanupPolicy) -> Result<CleanupReport> {
        let now = Utc::now();
        let (mut report, assets) = self
            .store
            .update(|vault| -> Result<_> { Ok(apply_cleanup(vault, policy, now)) })?;

        for asset in &assets {
            match self.store.delete_asset(asset) {
                Ok(true) => report.deleted_assets += 1,
                Ok(false) => {}
                Err(e) => warn!(asset = %asset, error = %e, "Failed to delete asset"),
            }
        }

        info!(
            identifiers = report.removed_identifiers.len(),
            certificates = report.removed_certificates.len(),
            assets = report.deleted_assets,
            "Vault cleanup complete"
        );
        Ok(report)
    }
}
