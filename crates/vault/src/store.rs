//! Filesystem vault store
//!
//! # Directory Structure
//!
//! ```text
//! <root>/
//! ├── vault.json        # Entity graph (registrations, identifiers, certificates)
//! ├── 00-KEYGEN/        # Key generation records
//! ├── 10-KEYPM/         # Private keys (PEM)
//! ├── 15-CSRDT/         # CSR details
//! ├── 20-CSRGN/         # CSR generation records
//! ├── 30-CSRPM/         # CSRs (PEM)
//! ├── 40-CRTDR/         # Issued certificates (DER)
//! ├── 45-CRTPM/         # Issued certificates (PEM)
//! ├── 50-ISUDR/         # Issuer certificates (DER)
//! ├── 55-ISUPM/         # Issuer certificates (PEM)
//! └── 99-ASSET/         # Exported bundles
//! ```
//!
//! Every load-mutate-save cycle runs under one process-wide lock. The lock
//! is synchronous and the closures passed to [`VaultStore::update`] and
//! [`VaultStore::read`] cannot await, so it is never held across a CA call.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use acmevault_common::PollPolicy;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::StorageError;
use crate::model::{Asset, AssetType, Vault};

/// Vault document file name
pub const VAULT_FILE: &str = "vault.json";

static VAULT_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// How to treat a missing store root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// The root must already exist
    Existing,
    /// Create the root and asset folders if missing
    InitIfMissing,
}

/// Handle to a vault rooted at a directory
#[derive(Debug, Clone)]
pub struct VaultStore {
    root: PathBuf,
}

impl VaultStore {
    /// Open the store, retrying transient I/O failures
    ///
    /// `retry.max_attempts` bounds the total number of open attempts,
    /// unlike the CA pollers where it counts re-checks after the first call.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotInitialized`] if the root is missing in
    /// [`OpenMode::Existing`], [`StorageError::Busy`] once every attempt
    /// has failed.
    pub fn open(
        root: impl AsRef<Path>,
        mode: OpenMode,
        retry: PollPolicy,
    ) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match Self::prepare(&root, mode) {
                Ok(()) => {
                    debug!(root = %root.display(), attempt, "Opened vault store");
                    return Ok(Self { root });
                }
                Err(e) if mode == OpenMode::Existing && e.kind() == io::ErrorKind::NotFound => {
                    return Err(StorageError::NotInitialized(root));
                }
                Err(e) if retry.allows(attempt) => {
                    warn!(
                        root = %root.display(),
                        attempt,
                        error = %e,
                        "Vault storage unavailable, retrying"
                    );
                    std::thread::sleep(retry.interval);
                }
                Err(source) => {
                    return Err(StorageError::Busy {
                        path: root,
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    fn prepare(root: &Path, mode: OpenMode) -> io::Result<()> {
        match mode {
            OpenMode::Existing => {
                let meta = fs::metadata(root)?;
                if !meta.is_dir() {
                    return Err(io::Error::other(format!("{} is not a directory", root.display())));
                }
                Ok(())
            }
            OpenMode::InitIfMissing => Self::create_layout(root),
        }
    }

    fn create_layout(root: &Path) -> io::Result<()> {
        fs::create_dir_all(root)?;
        for asset_type in AssetType::ALL {
            fs::create_dir_all(root.join(asset_type.folder()))?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(root, fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vault_path(&self) -> PathBuf {
        self.root.join(VAULT_FILE)
    }

    pub fn vault_exists(&self) -> bool {
        self.vault_path().exists()
    }

    /// Create the vault document if absent
    ///
    /// Returns `true` if a new vault was written.
    pub fn init_vault(&self, base_uri: &str) -> Result<bool, StorageError> {
        let _guard = VAULT_LOCK.lock();
        if self.vault_exists() {
            trace!(root = %self.root.display(), "Vault already initialized");
            return Ok(false);
        }

        Self::create_layout(&self.root)?;
        let vault = Vault::new(base_uri);
        self.write_vault(&vault)?;

        info!(
            root = %self.root.display(),
            vault_id = %vault.id,
            base_uri = %base_uri,
            "Initialized vault"
        );
        Ok(true)
    }

    /// Load the full vault graph
    pub fn load(&self) -> Result<Vault, StorageError> {
        let _guard = VAULT_LOCK.lock();
        self.read_vault()
    }

    /// Persist the full vault graph
    pub fn save(&self, vault: &Vault) -> Result<(), StorageError> {
        let _guard = VAULT_LOCK.lock();
        self.write_vault(vault)
    }

    /// Load, mutate and save under the vault lock
    ///
    /// Nothing is saved if the closure fails.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut Vault) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let _guard = VAULT_LOCK.lock();
        let mut vault = self.read_vault()?;
        let value = f(&mut vault)?;
        self.write_vault(&vault)?;
        Ok(value)
    }

    /// Load and inspect under the vault lock
    pub fn read<T>(&self, f: impl FnOnce(&Vault) -> T) -> Result<T, StorageError> {
        let _guard = VAULT_LOCK.lock();
        let vault = self.read_vault()?;
        Ok(f(&vault))
    }

    fn read_vault(&self) -> Result<Vault, StorageError> {
        let path = self.vault_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotInitialized(self.root.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let vault: Vault = serde_json::from_str(&content)?;
        trace!(
            vault_id = %vault.id,
            identifiers = vault.identifiers.len(),
            certificates = vault.certificates.len(),
            "Loaded vault"
        );
        Ok(vault)
    }

    fn write_vault(&self, vault: &Vault) -> Result<(), StorageError> {
        let path = self.vault_path();
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(vault)?;

        write_file(&tmp, &content, true)?;
        fs::rename(&tmp, &path)?;

        trace!(vault_id = %vault.id, "Saved vault");
        Ok(())
    }

    // =========================================================================
    // Asset Operations
    // =========================================================================

    pub fn asset_path(&self, asset: &Asset) -> PathBuf {
        self.root.join(asset.asset_type.folder()).join(&asset.name)
    }

    /// Reserve a new, empty asset file
    pub fn create_asset(&self, asset_type: AssetType, name: &str) -> Result<Asset, StorageError> {
        let asset = Asset::new(asset_type, name);
        let path = self.asset_path(&asset);

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        if asset_type.is_sensitive() {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        match options.open(&path) {
            Ok(_) => {
                debug!(asset = %asset, "Created asset");
                Ok(asset)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::AssetExists(asset.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reference an existing asset file
    pub fn get_asset(&self, asset_type: AssetType, name: &str) -> Result<Asset, StorageError> {
        let asset = Asset::new(asset_type, name);
        if !self.asset_path(&asset).is_file() {
            return Err(StorageError::AssetNotFound(asset.to_string()));
        }
        Ok(asset)
    }

    pub fn load_asset(&self, asset: &Asset) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.asset_path(asset)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::AssetNotFound(asset.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write asset content, creating or overwriting the file
    pub fn save_asset(&self, asset: &Asset, content: &[u8]) -> Result<(), StorageError> {
        let path = self.asset_path(asset);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_file(&path, content, asset.asset_type.is_sensitive())?;
        debug!(asset = %asset, bytes = content.len(), "Saved asset");
        Ok(())
    }

    pub fn save_json_asset<T: Serialize>(
        &self,
        asset: &Asset,
        value: &T,
    ) -> Result<(), StorageError> {
        self.save_asset(asset, &serde_json::to_vec_pretty(value)?)
    }

    /// Delete an asset file, returning whether it existed
    pub fn delete_asset(&self, asset: &Asset) -> Result<bool, StorageError> {
        match fs::remove_file(self.asset_path(asset)) {
            Ok(()) => {
                debug!(asset = %asset, "Deleted asset");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(asset = %asset, "Asset to delete not found");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Write a file, restricting it to the owner on Unix when sensitive
pub(crate) fn write_file(path: &Path, content: &[u8], sensitive: bool) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if sensitive {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()?;

    // mode() only applies on creation
    #[cfg(unix)]
    if sensitive {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = sensitive;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::fixtures;
    use crate::transport::AuthorizationStatus;
    use tempfile::TempDir;

    fn fast_retry() -> PollPolicy {
        PollPolicy::new(3, Duration::from_millis(10))
    }

    fn setup_store() -> (TempDir, VaultStore) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("vault");
        let store = VaultStore::open(root, OpenMode::InitIfMissing, fast_retry()).unwrap();
        store.init_vault("https://ca.test/").unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_open_creates_layout() {
        let (_temp_dir, store) = setup_store();
        for asset_type in AssetType::ALL {
            assert!(store.root().join(asset_type.folder()).is_dir());
        }
        assert!(store.vault_exists());
    }

    #[test]
    fn test_open_existing_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("missing");
        let err = VaultStore::open(root, OpenMode::Existing, fast_retry()).unwrap_err();
        assert!(matches!(err, StorageError::NotInitialized(_)));
    }

    #[test]
    fn test_open_gives_up_after_bounded_attempts() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        let err = VaultStore::open(&blocker, OpenMode::InitIfMissing, fast_retry()).unwrap_err();
        match err {
            // The budget counts the first open attempt
            StorageError::Busy { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn test_init_vault_is_idempotent() {
        let (_temp_dir, store) = setup_store();
        let first = store.load().unwrap();
        assert!(!store.init_vault("https://other.test/").unwrap());
        assert_eq!(store.load().unwrap().id, first.id);
        assert_eq!(first.base_uri, "https://ca.test/");
    }

    #[test]
    fn test_load_uninitialized() {
        let temp_dir = TempDir::new().unwrap();
        let store =
            VaultStore::open(temp_dir.path(), OpenMode::InitIfMissing, fast_retry()).unwrap();
        assert!(matches!(store.load().unwrap_err(), StorageError::NotInitialized(_)));
    }

    #[test]
    fn test_populated_vault_round_trip() {
        use crate::account::{AccountKey, SIGNER_PROVIDER_ES256};
        use crate::challenge::{Challenge, ChallengeType};
        use crate::model::{IssuerCertificate, ProviderProfile, Registration};
        use crate::transport::{
            AuthorizationChallenge, CertificateRequest, Link, RegistrationObject,
        };
        use acmevault_common::RegistrationId;

        let (_temp_dir, store) = setup_store();
        let key = AccountKey::generate().unwrap();

        let registration = Registration {
            id: RegistrationId::new(),
            alias: Some("primary".to_string()),
            contacts: vec!["mailto:admin@example.com".to_string()],
            registration: RegistrationObject {
                uri: "https://ca.test/acme/reg/1".to_string(),
                contacts: vec!["mailto:admin@example.com".to_string()],
                agreement: Some("https://ca.test/terms".to_string()),
                terms_of_service: Some("https://ca.test/terms".to_string()),
            },
            signer_provider: SIGNER_PROVIDER_ES256.to_string(),
            signer_state: key.to_state(),
            created: chrono::Utc::now(),
        };

        let mut ident = fixtures::identifier("www.example.com", AuthorizationStatus::Valid);
        ident.registration = registration.id;
        let offered = [(ChallengeType::Http01, None), (ChallengeType::TlsSni01, Some(2))];
        for (challenge_type, iterations) in offered {
            let ca_challenge = AuthorizationChallenge {
                challenge_type,
                uri: format!("https://ca.test/chall/{challenge_type}"),
                token: "tok-abc".to_string(),
                status: AuthorizationStatus::Valid,
                error: None,
                iterations,
            };
            ident.authorization.challenges.push(ca_challenge.clone());
            let decoded = Challenge::decode(&ident.dns, &ca_challenge, &key).unwrap();
            ident.challenges.insert(challenge_type, decoded);
        }
        ident.challenge_completed.insert(ChallengeType::Http01, chrono::Utc::now());

        let mut cert = fixtures::certificate(ident.id, Some("0A1B"));
        cert.serial_number = Some("CAFE".to_string());
        cert.raw_signature = Some("3045022100AB".to_string());
        cert.request = Some(CertificateRequest {
            uri: "https://ca.test/acme/cert/1".to_string(),
            content: Some(vec![0x30, 0x82, 0x01, 0x00, 0xff, 0x00, 0x7f]),
            links: vec![Link {
                rel: "up".to_string(),
                uri: "https://ca.test/acme/issuer-cert".to_string(),
            }],
            retry_after: None,
        });

        let issuer = IssuerCertificate {
            serial_number: "0A1B".to_string(),
            source_uri: Some("https://ca.test/acme/issuer-cert".to_string()),
            thumbprint: "AB".repeat(20),
            signature_algorithm: "1.2.840.10045.4.3.2".to_string(),
            signature_hash: "CD".repeat(32),
            crt_der_file: "0A1B-crt.der".to_string(),
            crt_pem_file: "0A1B-crt.pem".to_string(),
        };

        let profile = ProviderProfile {
            id: uuid::Uuid::new_v4(),
            alias: "web-root".to_string(),
            provider_name: "manual".to_string(),
            parameters: [
                ("root".to_string(), serde_json::json!("/var/www")),
                ("ttl".to_string(), serde_json::json!(300)),
            ]
            .into_iter()
            .collect(),
        };

        let mut vault = store.load().unwrap();
        vault.registrations.push(registration);
        vault.identifiers.insert(ident.id, ident);
        vault.certificates.insert(cert.id, cert);
        vault.issuer_certificates.insert(issuer.serial_number.clone(), issuer);
        vault.provider_profiles.insert(profile.id, profile);
        store.save(&vault).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, vault);
        let request = loaded.certificates.values().next().unwrap().request.as_ref().unwrap();
        assert_eq!(
            request.content.as_deref(),
            Some(&[0x30, 0x82, 0x01, 0x00, 0xff, 0x00, 0x7f][..])
        );
    }

    #[test]
    fn test_update_discards_on_error() {
        let (_temp_dir, store) = setup_store();

        let result: Result<(), crate::error::AcmeVaultError> = store.update(|vault| {
            let ident = fixtures::identifier("example.com", AuthorizationStatus::Pending);
            vault.identifiers.insert(ident.id, ident);
            Err(crate::error::AcmeVaultError::State("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(store.read(|v| v.identifiers.is_empty()).unwrap());
    }

    #[test]
    fn test_asset_lifecycle() {
        let (_temp_dir, store) = setup_store();

        let asset = store.create_asset(AssetType::KeyPem, "abc-key.pem").unwrap();
        assert!(matches!(
            store.create_asset(AssetType::KeyPem, "abc-key.pem"),
            Err(StorageError::AssetExists(_))
        ));

        store.save_asset(&asset, b"secret").unwrap();
        assert_eq!(store.load_asset(&asset).unwrap(), b"secret");
        assert_eq!(store.get_asset(AssetType::KeyPem, "abc-key.pem").unwrap(), asset);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.asset_path(&asset)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(store.delete_asset(&asset).unwrap());
        assert!(!store.delete_asset(&asset).unwrap());
        assert!(matches!(
            store.get_asset(AssetType::KeyPem, "abc-key.pem"),
            Err(StorageError::AssetNotFound(_))
        ));
    }
}
