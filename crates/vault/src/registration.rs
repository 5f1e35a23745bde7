//! Account registration

use acmevault_common::RegistrationId;
use chrono::Utc;
use tracing::{info, warn};

use crate::account::{AccountKey, SIGNER_PROVIDER_ES256};
use crate::error::{AcmeVaultError, EntityKind, Result};
use crate::manager::VaultManager;
use crate::model::Registration;
use crate::transport::AccountContext;

impl VaultManager {
    /// Register a new account and make it the current registration
    ///
    /// With `accept_tos`, the CA's terms of service are agreed to as part
    /// of registering. Earlier registrations are kept behind the new one.
    pub async fn new_registration(
        &self,
        contacts: &[String],
        accept_tos: bool,
    ) -> Result<Registration> {
        let key = AccountKey::generate()?;
        let (base_uri, directory) = self.directory().await?;

        let context = AccountContext {
            base_uri: &base_uri,
            directory: &directory,
            key: &key,
            registration: None,
        };

        let mut registration_object = self
            .transport
            .new_registration(context, contacts)
            .await
            .map_err(|e| AcmeVaultError::protocol("new-registration", e))?;

        if accept_tos {
            let terms = registration_object
                .terms_of_service
                .clone()
                .or_else(|| directory.terms_of_service.clone());
            match terms {
                Some(terms) => {
                    let context = AccountContext {
                        registration: Some(&registration_object),
                        ..context
                    };
                    let agreed = self
                        .transport
                        .agree_to_terms(context, &terms)
                        .await
                        .map_err(|e| AcmeVaultError::protocol("agree-tos", e))?;
                    registration_object = agreed;
                }
                None => warn!("CA offered no terms of service to agree to"),
            }
        }

        let registration = Registration {
            id: RegistrationId::new(),
            alias: None,
            contacts: contacts.to_vec(),
            registration: registration_object,
            signer_provider: SIGNER_PROVIDER_ES256.to_string(),
            signer_state: key.to_state(),
            created: Utc::now(),
        };

        let stored = registration.clone();
        self.store.update(|vault| -> Result<()> {
            vault.registrations.insert(0, stored);
            Ok(())
        })?;

        info!(
            registration = %registration.id,
            uri = %registration.registration.uri,
            contacts = ?registration.contacts,
            "Registered ACME account"
        );
        Ok(registration)
    }

    /// Whether any registration exists
    pub fn has_contacts(&self) -> Result<bool> {
        Ok(self.store.read(|vault| !vault.registrations.is_empty())?)
    }

    pub fn current_registration(&self) -> Result<Registration> {
        self.store
            .read(|vault| vault.current_registration().cloned())?
            .ok_or_else(|| AcmeVaultError::not_found(EntityKind::Registration, "current"))
    }

    /// Agree to the CA's terms of service for an existing registration
    pub async fn accept_terms_of_service(
        &self,
        registration_id: RegistrationId,
    ) -> Result<Registration> {
        let account = self.account_for(registration_id).await?;
        let terms = account
            .registration
            .registration
            .terms_of_service
            .clone()
            .or_else(|| account.directory.terms_of_service.clone())
            .ok_or_else(|| AcmeVaultError::State("CA offers no terms of service".to_string()))?;

        let updated = self
            .transport
            .agree_to_terms(account.context(), &terms)
            .await
            .map_err(|e| AcmeVaultError::protocol("agree-tos", e))?;

        let registration = self.store.update(|vault| -> Result<_> {
            let entry = vault
                .registrations
                .iter_mut()
                .find(|r| r.id == registration_id)
                .ok_or_else(|| {
                    AcmeVaultError::not_found(EntityKind::Registration, registration_id.to_string())
                })?;
            entry.registration = updated;
            Ok(entry.clone())
        })?;

        info!(registration = %registration_id, terms = %terms, "Agreed to terms of service");
        Ok(registration)
    }

    /// Remove a registration from the vault
    ///
    /// The account is not deactivated at the CA.
    pub fn delete_registration(&self, registration_id: RegistrationId) -> Result<Registration> {
        let removed = self.store.update(|vault| -> Result<_> {
            let index = vault
                .registrations
                .iter()
                .position(|r| r.id == registration_id)
                .ok_or_else(|| {
                    AcmeVaultError::not_found(EntityKind::Registration, registration_id.to_string())
                })?;
            Ok(vault.registrations.remove(index))
        })?;

        info!(registration = %registration_id, "Deleted registration");
        Ok(removed)
    }
}
