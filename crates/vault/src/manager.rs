//! Workflow facade
//!
//! [`VaultManager`] owns the store, the transport and the poll policies.
//! The workflow operations live in their own modules as further
//! `impl VaultManager` blocks.

use std::sync::Arc;

use acmevault_common::{PollPolicy, RegistrationId};
use acmevault_config::Config;
use tracing::{debug, info};

use crate::account::AccountKey;
use crate::error::{AcmeVaultError, EntityKind, Result};
use crate::model::Registration;
use crate::store::{OpenMode, VaultStore};
use crate::transport::{AccountContext, AcmeTransport, ServerDirectory};

/// Entry point for every vault workflow operation
#[derive(Clone)]
pub struct VaultManager {
    pub(crate) store: VaultStore,
    pub(crate) transport: Arc<dyn AcmeTransport>,
    pub(crate) authorization_policy: PollPolicy,
    pub(crate) issuance_policy: PollPolicy,
}

impl std::fmt::Debug for VaultManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultManager")
            .field("root", &self.store.root())
            .field("authorization_policy", &self.authorization_policy)
            .field("issuance_policy", &self.issuance_policy)
            .finish_non_exhaustive()
    }
}

impl VaultManager {
    pub fn new(store: VaultStore, transport: Arc<dyn AcmeTransport>) -> Self {
        Self {
            store,
            transport,
            authorization_policy: PollPolicy::authorization(),
            issuance_policy: PollPolicy::issuance(),
        }
    }

    /// Open (and if needed initialize) the configured vault
    pub fn from_config(config: &Config, transport: Arc<dyn AcmeTransport>) -> Result<Self> {
        let base_uri = config
            .vault
            .base_uri()
            .map_err(|e| AcmeVaultError::State(e.to_string()))?;
        let store = VaultStore::open(
            &config.vault.storage,
            OpenMode::InitIfMissing,
            config.vault.open_policy(),
        )?;
        if store.init_vault(&base_uri)? {
            info!(storage = %config.vault.storage.display(), "Created new vault");
        }

        Ok(Self::new(store, transport)
            .with_authorization_policy(config.authorization.policy())
            .with_issuance_policy(config.issuance.policy()))
    }

    pub fn with_authorization_policy(mut self, policy: PollPolicy) -> Self {
        self.authorization_policy = policy;
        self
    }

    pub fn with_issuance_policy(mut self, policy: PollPolicy) -> Self {
        self.issuance_policy = policy;
        self
    }

    pub fn store(&self) -> &VaultStore {
        &self.store
    }

    /// Base URI and cached directory, fetching the directory on first use
    pub(crate) async fn directory(&self) -> Result<(String, ServerDirectory)> {
        let (base_uri, cached) = self
            .store
            .read(|vault| (vault.base_uri.clone(), vault.directory.clone()))?;
        if let Some(directory) = cached {
            return Ok((base_uri, directory));
        }

        debug!(base_uri = %base_uri, "Fetching CA directory");
        let directory = self
            .transport
            .directory(&base_uri)
            .await
            .map_err(|e| AcmeVaultError::protocol("directory", e))?;

        let stored = directory.clone();
        self.store.update(|vault| -> Result<()> {
            vault.directory = Some(stored);
            Ok(())
        })?;

        Ok((base_uri, directory))
    }

    /// Signing material of the current registration
    pub(crate) async fn account(&self) -> Result<Account> {
        let registration = self
            .store
            .read(|vault| vault.current_registration().cloned())?
            .ok_or_else(|| AcmeVaultError::not_found(EntityKind::Registration, "current"))?;
        self.account_with(registration).await
    }

    /// Signing material of a specific registration
    pub(crate) async fn account_for(&self, registration_id: RegistrationId) -> Result<Account> {
        let registration = self
            .store
            .read(|vault| vault.registration(registration_id).cloned())?
            .ok_or_else(|| {
                AcmeVaultError::not_found(EntityKind::Registration, registration_id.to_string())
            })?;
        self.account_with(registration).await
    }

    async fn account_with(&self, registration: Registration) -> Result<Account> {
        let key = AccountKey::from_state(&registration.signer_state)?;
        let (base_uri, directory) = self.directory().await?;

        Ok(Account {
            base_uri,
            directory,
            key,
            registration,
        })
    }
}

/// Owned signing context for one workflow call
#[derive(Debug)]
pub(crate) struct Account {
    pub base_uri: String,
    pub directory: ServerDirectory,
    pub key: AccountKey,
    pub registration: Registration,
}

impl Account {
    pub fn context(&self) -> AccountContext<'_> {
        AccountContext {
            base_uri: &self.base_uri,
            directory: &self.directory,
            key: &self.key,
            registration: Some(&self.registration.registration),
        }
    }
}
