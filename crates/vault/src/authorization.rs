//! Domain identifier authorization
//!
//! An identifier moves `NotStarted -> PendingAuthorization -> {Valid | Invalid}`.
//! Beginning validation for a DNS name replaces any identifier already in
//! the vault for that name, in the same locked cycle that stores the new
//! one, so there is never more than one identifier per DNS name.

use acmevault_common::{IdentifierId, RegistrationId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::account::AccountKey;
use crate::challenge::{Challenge, ChallengePayload, ChallengeType};
use crate::error::{AcmeVaultError, EntityKind, Problem, Result};
use crate::manager::VaultManager;
use crate::model::Identifier;
use crate::transport::AuthorizationStatus;

/// Prefix of generated identifier aliases
pub const IDENTIFIER_ALIAS_PREFIX: &str = "ident";

/// Result of beginning validation for a domain
#[derive(Debug, Clone)]
pub struct AuthorizationStart {
    pub identifier: Identifier,
    /// Empty when the CA did not leave the authorization pending
    pub challenges: Vec<ChallengePayload>,
}

/// Where an authorization stands after bounded polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthorizationOutcome {
    Valid,
    Invalid { error: Option<Problem> },
    /// Still pending once the poll bound was reached
    Pending {
        attempts: u32,
        status: AuthorizationStatus,
    },
}

/// Convert a domain name to its ASCII (punycode) form
pub fn normalize_dns(domain: &str) -> Result<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(AcmeVaultError::InvalidDomain {
            domain: domain.to_string(),
            reason: "empty name".to_string(),
        });
    }

    idna::domain_to_ascii(trimmed).map_err(|e| AcmeVaultError::InvalidDomain {
        domain: domain.to_string(),
        reason: e.to_string(),
    })
}

/// New identifier alias: `ident` followed by 8 hex characters
pub fn compute_identifier_alias() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}{}", IDENTIFIER_ALIAS_PREFIX, &id[..8])
}

impl VaultManager {
    /// Begin validating a domain
    ///
    /// Replaces any identifier already held for the same DNS name. When the
    /// CA leaves the authorization pending, the challenge of the requested
    /// type is decoded and returned for publishing.
    pub async fn begin_authorization(
        &self,
        domain: &str,
        challenge_type: ChallengeType,
    ) -> Result<AuthorizationStart> {
        let dns = normalize_dns(domain)?;
        let account = self.account().await?;

        info!(domain = %dns, challenge_type = %challenge_type, "Requesting authorization");
        let authorization = self
            .transport
            .new_authorization(account.context(), &dns)
            .await
            .map_err(|e| {
                warn!(domain = %dns, error = %e, "Authorization request failed");
                AcmeVaultError::authorization(&dns, e)
            })?;

        let mut identifier = Identifier {
            id: IdentifierId::new(),
            alias: compute_identifier_alias(),
            registration: account.registration.id,
            dns: dns.clone(),
            authorization,
            challenges: Default::default(),
            challenge_completed: Default::default(),
            challenge_cleaned_up: Default::default(),
            created: Utc::now(),
        };

        if identifier.authorization.is_pending() {
            let ca_challenge = identifier.authorization.challenge(challenge_type).ok_or_else(|| {
                AcmeVaultError::State(format!("CA offered no {challenge_type} challenge for {dns}"))
            })?;
            let challenge = Challenge::decode(&dns, ca_challenge, &account.key)?;
            identifier.challenges.insert(challenge_type, challenge);
        }

        let stored = identifier.clone();
        let replaced = self.store.update(|vault| -> Result<usize> {
            let replaced = vault.remove_identifiers_by_dns(&stored.dns).len();
            vault.identifiers.insert(stored.id, stored);
            Ok(replaced)
        })?;

        if replaced > 0 {
            debug!(domain = %dns, replaced, "Replaced existing identifiers");
        }
        info!(
            domain = %dns,
            identifier = %identifier.alias,
            status = %identifier.authorization.status,
            "Authorization started"
        );

        let challenges = if identifier.authorization.is_pending() {
            identifier.challenges.values().map(Challenge::payload).collect()
        } else {
            Vec::new()
        };

        Ok(AuthorizationStart { identifier, challenges })
    }

    /// Decoded challenge material, from cache unless `regenerate`
    pub fn prepare_challenge(
        &self,
        identifier_ref: &str,
        challenge_type: ChallengeType,
        regenerate: bool,
    ) -> Result<ChallengePayload> {
        self.ensure_challenge(identifier_ref, challenge_type, regenerate)
            .map(|challenge| challenge.payload())
    }

    fn ensure_challenge(
        &self,
        identifier_ref: &str,
        challenge_type: ChallengeType,
        regenerate: bool,
    ) -> Result<Challenge> {
        let identifier = self.get_identifier(identifier_ref)?;
        if !regenerate {
            if let Some(challenge) = identifier.challenges.get(&challenge_type) {
                return Ok(challenge.clone());
            }
        }

        let key = self.signing_key(identifier.registration)?;
        let ca_challenge = identifier.authorization.challenge(challenge_type).ok_or_else(|| {
            let reference = format!("{} {}", identifier.dns, challenge_type);
            AcmeVaultError::not_found(EntityKind::Challenge, reference)
        })?;
        let challenge = Challenge::decode(&identifier.dns, ca_challenge, &key)?;

        let stored = challenge.clone();
        self.store.update(|vault| -> Result<()> {
            let entry = vault
                .identifiers
                .get_mut(&identifier.id)
                .ok_or_else(|| {
                    AcmeVaultError::not_found(EntityKind::Identifier, identifier.id.to_string())
                })?;
            entry.challenges.insert(challenge_type, stored);
            Ok(())
        })?;

        debug!(
            identifier = %identifier.alias,
            challenge_type = %challenge_type,
            regenerate,
            "Prepared challenge"
        );
        Ok(challenge)
    }

    /// Tell the CA the challenge answer has been published
    ///
    /// Refused while the authorization already carries an invalid
    /// challenge, unless `force` is set.
    pub async fn submit_challenge(
        &self,
        identifier_ref: &str,
        challenge_type: ChallengeType,
        force: bool,
    ) -> Result<Identifier> {
        let identifier = self.get_identifier(identifier_ref)?;
        if !force && identifier.authorization.has_invalid_challenge() {
            return Err(AcmeVaultError::State(format!(
                "authorization for {} already has an invalid challenge",
                identifier.dns
            )));
        }

        let challenge = self.ensure_challenge(identifier_ref, challenge_type, false)?;
        let account = self.account_for(identifier.registration).await?;

        let answered = self
            .transport
            .answer_challenge(account.context(), &challenge.uri, &challenge.key_authorization)
            .await
            .map_err(|e| AcmeVaultError::authorization(&identifier.dns, e))?;

        let updated = self.store.update(|vault| -> Result<_> {
            let entry = vault
                .identifiers
                .get_mut(&identifier.id)
                .ok_or_else(|| {
                    AcmeVaultError::not_found(EntityKind::Identifier, identifier.id.to_string())
                })?;
            entry.challenge_completed.insert(challenge_type, Utc::now());
            match entry
                .authorization
                .challenges
                .iter_mut()
                .find(|c| c.challenge_type == challenge_type)
            {
                Some(existing) => *existing = answered,
                None => entry.authorization.challenges.push(answered),
            }
            Ok(entry.clone())
        })?;

        info!(
            domain = %updated.dns,
            identifier = %updated.alias,
            challenge_type = %challenge_type,
            "Submitted challenge answer"
        );
        Ok(updated)
    }

    /// Refresh an identifier's authorization from the CA
    pub async fn update_identifier(&self, identifier_ref: &str) -> Result<Identifier> {
        let identifier = self.get_identifier(identifier_ref)?;
        let account = self.account_for(identifier.registration).await?;

        let authorization = self
            .transport
            .refresh_authorization(account.context(), &identifier.authorization.uri)
            .await
            .map_err(|e| AcmeVaultError::protocol("refresh-authorization", e))?;

        let updated = self.store.update(|vault| -> Result<_> {
            let entry = vault
                .identifiers
                .get_mut(&identifier.id)
                .ok_or_else(|| {
                    AcmeVaultError::not_found(EntityKind::Identifier, identifier.id.to_string())
                })?;
            entry.authorization = authorization;
            Ok(entry.clone())
        })?;

        debug!(
            domain = %updated.dns,
            status = %updated.authorization.status,
            "Refreshed authorization"
        );
        Ok(updated)
    }

    /// Poll the authorization until it leaves `pending` or the bound is hit
    pub async fn complete_authorization(
        &self,
        identifier_ref: &str,
    ) -> Result<AuthorizationOutcome> {
        let mut identifier = self.update_identifier(identifier_ref).await?;
        let reference = identifier.id.to_string();
        let policy = self.authorization_policy;
        let mut attempts = 0;

        while identifier.authorization.is_pending() && policy.allows(attempts) {
            tokio::time::sleep(policy.interval).await;
            identifier = self.update_identifier(&reference).await?;
            attempts += 1;
        }

        let outcome = match identifier.authorization.status {
            AuthorizationStatus::Valid => AuthorizationOutcome::Valid,
            AuthorizationStatus::Invalid => AuthorizationOutcome::Invalid {
                error: identifier.authorization.first_challenge_error().cloned(),
            },
            status @ AuthorizationStatus::Pending => {
                AuthorizationOutcome::Pending { attempts, status }
            }
        };

        match &outcome {
            AuthorizationOutcome::Valid => {
                info!(
                    domain = %identifier.dns,
                    identifier = %identifier.alias,
                    "Authorization valid"
                );
            }
            AuthorizationOutcome::Invalid { error } => {
                warn!(
                    domain = %identifier.dns,
                    identifier = %identifier.alias,
                    error = ?error.as_ref().map(ToString::to_string),
                    "Authorization invalid"
                );
            }
            AuthorizationOutcome::Pending { attempts, .. } => {
                info!(
                    domain = %identifier.dns,
                    identifier = %identifier.alias,
                    attempts,
                    "Authorization still pending"
                );
            }
        }

        Ok(outcome)
    }

    /// Look up an identifier by alias, DNS name or id
    pub fn get_identifier(&self, reference: &str) -> Result<Identifier> {
        self.store
            .read(|vault| vault.find_identifier(reference).cloned())?
            .ok_or_else(|| AcmeVaultError::not_found(EntityKind::Identifier, reference))
    }

    pub fn identifiers(&self) -> Result<Vec<Identifier>> {
        Ok(self.store.read(|vault| vault.identifiers.values().cloned().collect())?)
    }

    /// Record that the published challenge answer has been withdrawn
    pub fn mark_challenge_cleaned_up(
        &self,
        identifier_ref: &str,
        challenge_type: ChallengeType,
    ) -> Result<()> {
        self.store.update(|vault| -> Result<()> {
            let entry = vault
                .find_identifier_mut(identifier_ref)
                .ok_or_else(|| AcmeVaultError::not_found(EntityKind::Identifier, identifier_ref))?;
            entry.challenge_cleaned_up.insert(challenge_type, Utc::now());
            debug!(
                identifier = %entry.alias,
                challenge_type = %challenge_type,
                "Challenge cleaned up"
            );
            Ok(())
        })
    }

    fn signing_key(&self, registration_id: RegistrationId) -> Result<AccountKey> {
        let state = self
            .store
            .read(|vault| vault.registration(registration_id).map(|r| r.signer_state.clone()))?
            .ok_or_else(|| {
                AcmeVaultError::not_found(EntityKind::Registration, registration_id.to_string())
            })?;
        AccountKey::from_state(&state)
    }
}
