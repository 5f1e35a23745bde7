//! Certificate issuance
//!
//! A certificate is begun (key, CSR and their records written as assets),
//! submitted to the CA, then refreshed until the CA returns content. The
//! issuer certificate behind the "up" link is downloaded once and shared by
//! every certificate it signed.

use std::path::PathBuf;

use acmevault_common::CertificateId;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{AcmeVaultError, EntityKind, Result};
use crate::export::ExportFormat;
use crate::manager::{Account, VaultManager};
use crate::model::{asset_names, Asset, AssetType, Certificate, IssuerCertificate};
use crate::pki::{self, CertificateDetails, CsrDetails, KeyAndCsr, PEM_TAG_CERTIFICATE, PEM_TAG_CSR};
use crate::transport::CertificateRequest;

/// Prefix of certificate aliases, followed by the identifier alias
pub const CERTIFICATE_ALIAS_PREFIX: &str = "cert_";

/// Where the private key and CSR come from
#[derive(Debug, Clone, Default)]
pub enum CsrSource {
    /// Generate a fresh P-256 key and CSR
    #[default]
    Generate,
    /// Use a caller-supplied key and CSR
    Provided { key_pem: String, csr_pem: String },
}

/// Where a certificate stands after bounded polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuanceOutcome {
    Issued(Box<Certificate>),
    /// No issued content (or issuer) once the poll bound was reached
    NotYetIssued { attempts: u32 },
}

/// Result of the one-call request workflow
#[derive(Debug, Clone)]
pub struct RequestedCertificate {
    pub certificate: CertificateId,
    pub alias: String,
    pub outcome: IssuanceOutcome,
    /// PKCS#12 bundle written when a password was given and the certificate issued
    pub pkcs12: Option<PathBuf>,
}

impl VaultManager {
    /// Create a certificate record with its key and CSR
    pub fn begin_certificate(
        &self,
        identifier_ref: &str,
        alternative_refs: &[String],
        source: CsrSource,
    ) -> Result<Certificate> {
        let (primary, alternatives, taken) = self.store.read(|vault| -> Result<_> {
            let primary = vault
                .find_identifier(identifier_ref)
                .cloned()
                .ok_or_else(|| AcmeVaultError::not_found(EntityKind::Identifier, identifier_ref))?;
            let alternatives = alternative_refs
                .iter()
                .map(|r| {
                    vault
                        .find_identifier(r)
                        .cloned()
                        .ok_or_else(|| {
                            AcmeVaultError::not_found(EntityKind::Identifier, r.as_str())
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            let base_alias = format!("{}{}", CERTIFICATE_ALIAS_PREFIX, primary.alias);
            let taken = vault.find_certificate(&base_alias).is_some();
            Ok((primary, alternatives, taken))
        })??;

        let details = CsrDetails {
            common_name: primary.dns.clone(),
            alternative_names: alternatives.iter().map(|i| i.dns.clone()).collect(),
        };
        let key_and_csr = match source {
            CsrSource::Generate => pki::generate_key_and_csr(&details)?,
            CsrSource::Provided { key_pem, csr_pem } => {
                pki::import_key_and_csr(&key_pem, &csr_pem)?
            }
        };

        let mut certificate = Certificate::new(
            String::new(),
            primary.id,
            alternatives.iter().map(|i| i.id).collect(),
        );
        certificate.alias = if taken {
            format!(
                "{}{}_{}",
                CERTIFICATE_ALIAS_PREFIX,
                primary.alias,
                &certificate.id.as_uuid().simple().to_string()[..8]
            )
        } else {
            format!("{}{}", CERTIFICATE_ALIAS_PREFIX, primary.alias)
        };

        self.persist_new_certificate(&mut certificate, &details, &key_and_csr)?;

        info!(
            certificate = %certificate.alias,
            domain = %primary.dns,
            alternatives = alternatives.len(),
            "Began certificate"
        );
        Ok(certificate)
    }

    /// Write the key and CSR assets and insert the certificate
    ///
    /// Assets already written are deleted again if either step fails.
    fn persist_new_certificate(
        &self,
        certificate: &mut Certificate,
        details: &CsrDetails,
        generated: &KeyAndCsr,
    ) -> Result<()> {
        let inserted = self.write_csr_assets(certificate, details, generated).and_then(|()| {
            let stored = certificate.clone();
            self.store.update(|vault| -> Result<_> {
                let referenced = std::iter::once(stored.identifier)
                    .chain(stored.alternative_identifiers.iter().copied());
                for id in referenced {
                    if !vault.identifiers.contains_key(&id) {
                        let reference = id.to_string();
                        return Err(AcmeVaultError::not_found(EntityKind::Identifier, reference));
                    }
                }
                vault.certificates.insert(stored.id, stored);
                Ok(())
            })
        });

        if let Err(e) = inserted {
            for asset in certificate.assets() {
                if let Err(delete_err) = self.store.delete_asset(&asset) {
                    warn!(asset = %asset, error = %delete_err, "Failed to remove orphaned asset");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn write_csr_assets(
        &self,
        certificate: &mut Certificate,
        details: &CsrDetails,
        generated: &KeyAndCsr,
    ) -> Result<()> {
        let id = certificate.id;

        let asset = self.store.create_asset(AssetType::CsrDetails, &asset_names::csr_details(id))?;
        self.store.save_json_asset(&asset, details)?;
        certificate.csr_details_file = Some(asset.name);

        let asset = self.store.create_asset(AssetType::KeyGen, &asset_names::key_gen(id))?;
        self.store.save_json_asset(&asset, &generated.key_gen)?;
        certificate.key_gen_file = Some(asset.name);

        let asset = self.store.create_asset(AssetType::KeyPem, &asset_names::key_pem(id))?;
        self.store.save_asset(&asset, generated.key_pem.as_bytes())?;
        certificate.key_pem_file = Some(asset.name);

        let asset = self.store.create_asset(AssetType::CsrGen, &asset_names::csr_gen(id))?;
        self.store.save_json_asset(&asset, &generated.csr_gen)?;
        certificate.csr_gen_file = Some(asset.name);

        let asset = self.store.create_asset(AssetType::CsrPem, &asset_names::csr_pem(id))?;
        self.store.save_asset(&asset, generated.csr_pem.as_bytes())?;
        certificate.csr_pem_file = Some(asset.name);

        debug!(certificate = %id, "Wrote key and CSR assets");
        Ok(())
    }

    /// Submit the certificate's CSR to the CA
    ///
    /// Content the CA returns immediately is stored right away. A rejected
    /// request is not retried.
    pub async fn submit_certificate(&self, certificate_ref: &str) -> Result<Certificate> {
        let certificate = self.get_certificate(certificate_ref)?;
        if certificate.request.is_some() {
            return Err(AcmeVaultError::State(format!(
                "certificate {} was already submitted",
                certificate.alias
            )));
        }

        let csr_name = certificate
            .csr_pem_file
            .as_deref()
            .ok_or_else(|| {
                AcmeVaultError::State(format!("certificate {} has no CSR", certificate.alias))
            })?;
        let csr_pem = self
            .store
            .load_asset(&self.store.get_asset(AssetType::CsrPem, csr_name)?)?;
        let csr_pem = String::from_utf8_lossy(&csr_pem);
        let csr_der = pki::pem_to_der(&csr_pem, PEM_TAG_CSR)?;

        let account = self.certificate_account(&certificate).await?;
        info!(certificate = %certificate.alias, "Submitting certificate request");
        let request = self
            .transport
            .request_certificate(account.context(), &URL_SAFE_NO_PAD.encode(&csr_der))
            .await
            .map_err(|e| {
                warn!(certificate = %certificate.alias, error = %e, "Certificate request rejected");
                AcmeVaultError::issuance(&certificate.alias, e)
            })?;

        self.apply_request(certificate.id, request).await
    }

    /// Refresh a submitted certificate request from the CA
    pub async fn update_certificate(&self, certificate_ref: &str) -> Result<Certificate> {
        let certificate = self.get_certificate(certificate_ref)?;
        let request = certificate.request.as_ref().ok_or_else(|| {
            let alias = &certificate.alias;
            AcmeVaultError::State(format!("certificate {alias} has not been submitted"))
        })?;

        let account = self.certificate_account(&certificate).await?;
        let refreshed = self
            .transport
            .refresh_certificate(account.context(), request)
            .await
            .map_err(|e| AcmeVaultError::protocol("refresh-certificate", e))?;

        self.apply_request(certificate.id, refreshed).await
    }

    /// Poll until the certificate and its issuer are available
    pub async fn poll_issuance(&self, certificate_ref: &str) -> Result<IssuanceOutcome> {
        let mut certificate = self.get_certificate(certificate_ref)?;
        let reference = certificate.id.to_string();
        let policy = self.issuance_policy;
        let mut attempts = 0;

        loop {
            if certificate.has_issuer() {
                info!(
                    certificate = %certificate.alias,
                    serial = ?certificate.serial_number,
                    attempts,
                    "Certificate issued"
                );
                return Ok(IssuanceOutcome::Issued(Box::new(certificate)));
            }
            if !policy.allows(attempts) {
                info!(certificate = %certificate.alias, attempts, "Certificate not yet issued");
                return Ok(IssuanceOutcome::NotYetIssued { attempts });
            }

            tokio::time::sleep(policy.interval).await;
            certificate = self.update_certificate(&reference).await?;
            attempts += 1;
        }
    }

    /// Begin, submit and poll a certificate in one call
    ///
    /// With a password, an issued certificate is also exported as PKCS#12
    /// to its default location.
    pub async fn request_certificate(
        &self,
        identifier_ref: &str,
        alternative_refs: &[String],
        pkcs12_password: Option<&str>,
    ) -> Result<RequestedCertificate> {
        let certificate =
            self.begin_certificate(identifier_ref, alternative_refs, CsrSource::Generate)?;
        let reference = certificate.id.to_string();

        self.submit_certificate(&reference).await?;
        let outcome = self.poll_issuance(&reference).await?;

        let pkcs12 = match (&outcome, pkcs12_password) {
            (IssuanceOutcome::Issued(_), Some(password)) => {
                let format = ExportFormat::Pkcs12;
                Some(self.export_certificate(&reference, format, None, Some(password))?)
            }
            _ => None,
        };

        Ok(RequestedCertificate {
            certificate: certificate.id,
            alias: certificate.alias,
            outcome,
            pkcs12,
        })
    }

    /// Ask the CA to revoke an issued certificate
    pub async fn revoke_certificate(&self, certificate_ref: &str) -> Result<Certificate> {
        let certificate = self.get_certificate(certificate_ref)?;
        let der_name = certificate.crt_der_file.as_deref().ok_or_else(|| {
            AcmeVaultError::State(format!("certificate {} has not been issued", certificate.alias))
        })?;
        let der = self
            .store
            .load_asset(&self.store.get_asset(AssetType::CrtDer, der_name)?)?;

        let account = self.certificate_account(&certificate).await?;
        self.transport
            .revoke_certificate(account.context(), &URL_SAFE_NO_PAD.encode(&der))
            .await
            .map_err(|e| AcmeVaultError::protocol("revoke-certificate", e))?;

        let revoked = self.store.update(|vault| -> Result<_> {
            let entry = vault
                .certificates
                .get_mut(&certificate.id)
                .ok_or_else(|| {
                    AcmeVaultError::not_found(EntityKind::Certificate, certificate.id.to_string())
                })?;
            entry.revoked = Some(Utc::now());
            Ok(entry.clone())
        })?;

        info!(certificate = %revoked.alias, serial = ?revoked.serial_number, "Revoked certificate");
        Ok(revoked)
    }

    /// Look up a certificate by alias or id
    pub fn get_certificate(&self, reference: &str) -> Result<Certificate> {
        self.store
            .read(|vault| vault.find_certificate(reference).cloned())?
            .ok_or_else(|| AcmeVaultError::not_found(EntityKind::Certificate, reference))
    }

    pub fn certificates(&self) -> Result<Vec<Certificate>> {
        Ok(self.store.read(|vault| vault.certificates.values().cloned().collect())?)
    }

    /// Whether any certificate was begun for the identifier
    pub fn cert_exists(&self, identifier_ref: &str) -> Result<bool> {
        Ok(self.store.read(|vault| {
            vault
                .find_identifier(identifier_ref)
                .is_some_and(|identifier| vault.is_identifier_referenced(identifier.id))
        })?)
    }

    pub fn issuer_certificates(&self) -> Result<Vec<IssuerCertificate>> {
        Ok(self
            .store
            .read(|vault| vault.issuer_certificates.values().cloned().collect())?)
    }

    async fn certificate_account(&self, certificate: &Certificate) -> Result<Account> {
        let registration = self
            .store
            .read(|vault| vault.identifiers.get(&certificate.identifier).map(|i| i.registration))?
            .ok_or_else(|| {
                let reference = certificate.identifier.to_string();
                AcmeVaultError::not_found(EntityKind::Identifier, reference)
            })?;
        self.account_for(registration).await
    }

    /// Record a CA request handle, storing any issued content
    ///
    /// The request and leaf are saved before the issuer is fetched.
    async fn apply_request(
        &self,
        certificate_id: CertificateId,
        request: CertificateRequest,
    ) -> Result<Certificate> {
        let issuer_link = request.issuer_link().map(str::to_string);
        let leaf = match request.content.as_deref() {
            Some(der) if request.has_content() => Some(self.write_leaf(certificate_id, der)),
            _ => None,
        };

        let (certificate, leaf_error) = self.store.update(|vault| -> Result<_> {
            let entry = vault
                .certificates
                .get_mut(&certificate_id)
                .ok_or_else(|| {
                    AcmeVaultError::not_found(EntityKind::Certificate, certificate_id.to_string())
                })?;
            entry.request = Some(request);

            let leaf_error = match leaf {
                Some(Ok((details, der_file, pem_file))) => {
                    entry.serial_number = Some(details.serial_number);
                    entry.thumbprint = Some(details.thumbprint);
                    entry.signature_algorithm = Some(details.signature_algorithm);
                    entry.signature_hash = Some(details.signature_hash);
                    entry.raw_signature = Some(details.raw_signature);
                    entry.not_after = details.not_after;
                    entry.crt_der_file = Some(der_file);
                    entry.crt_pem_file = Some(pem_file);
                    None
                }
                Some(Err(e)) => Some(e),
                None => None,
            };

            debug!(
                certificate = %entry.alias,
                issued = entry.is_issued(),
                "Recorded certificate request"
            );
            Ok((entry.clone(), leaf_error))
        })?;

        if let Some(e) = leaf_error {
            warn!(
                certificate = %certificate.alias,
                error = %e,
                "Issued content could not be stored"
            );
            return Err(e);
        }
        if !certificate.is_issued() || certificate.has_issuer() {
            return Ok(certificate);
        }

        let Some(link) = issuer_link else {
            warn!(certificate = %certificate.alias, "Issued certificate has no issuer link");
            return Ok(certificate);
        };
        let serial = self.resolve_issuer(&link).await?;

        self.store.update(|vault| -> Result<_> {
            let entry = vault
                .certificates
                .get_mut(&certificate_id)
                .ok_or_else(|| {
                    AcmeVaultError::not_found(EntityKind::Certificate, certificate_id.to_string())
                })?;
            entry.issuer_serial_number = Some(serial);
            debug!(
                certificate = %entry.alias,
                issuer = ?entry.issuer_serial_number,
                "Linked issuer"
            );
            Ok(entry.clone())
        })
    }

    /// Parse issued content and write its DER and PEM assets
    fn write_leaf(
        &self,
        certificate_id: CertificateId,
        der: &[u8],
    ) -> Result<(CertificateDetails, String, String)> {
        let details = CertificateDetails::from_der(der)?;
        let der_asset = Asset::new(AssetType::CrtDer, asset_names::crt_der(certificate_id));
        let pem_asset = Asset::new(AssetType::CrtPem, asset_names::crt_pem(certificate_id));
        self.store.save_asset(&der_asset, der)?;
        self.store
            .save_asset(&pem_asset, pki::der_to_pem(PEM_TAG_CERTIFICATE, der).as_bytes())?;
        Ok((details, der_asset.name, pem_asset.name))
    }

    /// Serial of the issuer behind `link`, downloading it on first sight
    async fn resolve_issuer(&self, link: &str) -> Result<String> {
        if let Some(serial) = self
            .store
            .read(|vault| vault.issuer_by_source(link).map(|i| i.serial_number.clone()))?
        {
            debug!(link = %link, serial = %serial, "Issuer already cached");
            return Ok(serial);
        }

        let der = self
            .transport
            .fetch_issuer(link)
            .await
            .map_err(|e| AcmeVaultError::protocol("fetch-issuer", e))?;
        let details = CertificateDetails::from_der(&der)?;
        let serial = details.serial_number.clone();

        let known = self
            .store
            .read(|vault| vault.issuer_certificates.contains_key(&serial))?;
        let der_file = asset_names::issuer_der(&serial);
        let pem_file = asset_names::issuer_pem(&serial);
        if !known {
            self.store
                .save_asset(&Asset::new(AssetType::IssuerDer, der_file.as_str()), &der)?;
            self.store.save_asset(
                &Asset::new(AssetType::IssuerPem, pem_file.as_str()),
                pki::der_to_pem(PEM_TAG_CERTIFICATE, &der).as_bytes(),
            )?;
        }

        let source = link.to_string();
        self.store.update(|vault| -> Result<()> {
            let issuer = vault
                .issuer_certificates
                .entry(details.serial_number.clone())
                .or_insert_with(|| IssuerCertificate {
                    serial_number: details.serial_number,
                    source_uri: None,
                    thumbprint: details.thumbprint,
                    signature_algorithm: details.signature_algorithm,
                    signature_hash: details.signature_hash,
                    crt_der_file: der_file,
                    crt_pem_file: pem_file,
                });
            issuer.source_uri.get_or_insert(source);
            Ok(())
        })?;

        info!(link = %link, serial = %serial, "Stored issuer certificate");
        Ok(serial)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use acmevault_common::{IdentifierId, PollPolicy};

    use super::*;
    use crate::test_support::{authorized_manager, FakeCa};

    #[tokio::test]
    async fn test_begin_certificate_writes_assets() {
        let ca = FakeCa::new();
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;

        let certificate = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();
        assert_eq!(certificate.alias, format!("cert_{alias}"));
        for asset in certificate.assets() {
            assert!(manager.store().asset_path(&asset).is_file(), "missing {asset}");
        }
        assert!(manager.cert_exists(&alias).unwrap());

        // Second certificate for the same identifier gets a distinct alias
        let second = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();
        assert_ne!(second.alias, certificate.alias);
        assert_eq!(manager.certificates().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_begin_certificate_unknown_alternative() {
        let ca = FakeCa::new();
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;

        let err = manager
            .begin_certificate(&alias, &["missing.example.com".to_string()], CsrSource::Generate)
            .unwrap_err();
        assert!(matches!(
            err,
            AcmeVaultError::NotFound {
                kind: EntityKind::Identifier,
                ..
            }
        ));
        assert!(manager.certificates().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_insert_removes_written_assets() {
        let ca = FakeCa::new();
        let (_temp_dir, manager, _alias) = authorized_manager(&ca, "www.example.com").await;
        let details = CsrDetails {
            common_name: "gone.example.com".to_string(),
            alternative_names: Vec::new(),
        };
        let generated = pki::generate_key_and_csr(&details).unwrap();

        // Identifier removed between lookup and insert
        let mut certificate =
            Certificate::new("cert_gone".to_string(), IdentifierId::new(), Vec::new());
        let err = manager
            .persist_new_certificate(&mut certificate, &details, &generated)
            .unwrap_err();
        assert!(matches!(
            err,
            AcmeVaultError::NotFound {
                kind: EntityKind::Identifier,
                ..
            }
        ));

        let written = certificate.assets();
        assert_eq!(written.len(), 5);
        for asset in written {
            assert!(!manager.store().asset_path(&asset).exists(), "left behind {asset}");
        }
        assert!(manager.certificates().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_begin_certificate_with_provided_csr() {
        let ca = FakeCa::new();
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;
        let generated = pki::generate_key_and_csr(&CsrDetails {
            common_name: "www.example.com".to_string(),
            alternative_names: Vec::new(),
        })
        .unwrap();

        let certificate = manager
            .begin_certificate(
                &alias,
                &[],
                CsrSource::Provided {
                    key_pem: generated.key_pem.clone(),
                    csr_pem: generated.csr_pem.clone(),
                },
            )
            .unwrap();
        let asset = manager
            .store()
            .get_asset(AssetType::CsrPem, certificate.csr_pem_file.as_deref().unwrap())
            .unwrap();
        assert_eq!(manager.store().load_asset(&asset).unwrap(), generated.csr_pem.as_bytes());
    }

    #[tokio::test]
    async fn test_submit_with_immediate_content() {
        let ca = FakeCa::new();
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;
        let certificate = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();

        let submitted = manager.submit_certificate(&certificate.alias).await.unwrap();
        assert!(submitted.is_issued());
        assert!(submitted.has_issuer());
        assert_eq!(submitted.thumbprint.as_ref().unwrap().len(), 40);
        assert_eq!(submitted.signature_algorithm.as_deref(), Some("sha256ECDSA"));
        assert!(submitted.raw_signature.as_deref().is_some_and(|s| s.starts_with("30")));

        let again = manager.submit_certificate(&certificate.alias).await.unwrap_err();
        assert!(matches!(again, AcmeVaultError::State(_)));
    }

    #[tokio::test]
    async fn test_submit_rejected() {
        let ca = FakeCa::new();
        ca.fail_issuance("urn:acme:error:unauthorized", "Authorizations for these names not found");
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;
        let certificate = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();

        let err = manager.submit_certificate(&certificate.alias).await.unwrap_err();
        match err {
            AcmeVaultError::Issuance { certificate: alias, problem, .. } => {
                assert_eq!(alias, certificate.alias);
                assert_eq!(problem.unwrap().problem_type, "urn:acme:error:unauthorized");
            }
            other => panic!("expected issuance error, got {other:?}"),
        }
        assert!(manager.get_certificate(&certificate.alias).unwrap().request.is_none());
    }

    #[tokio::test]
    async fn test_issuer_is_fetched_once() {
        let ca = FakeCa::new();
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;

        for _ in 0..2 {
            let certificate = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();
            manager.submit_certificate(&certificate.alias).await.unwrap();
            manager.update_certificate(&certificate.alias).await.unwrap();
        }

        assert_eq!(ca.issuer_fetches(), 1);
        let issuers = manager.issuer_certificates().unwrap();
        assert_eq!(issuers.len(), 1);
        assert_eq!(issuers[0].serial_number, FakeCa::ISSUER_SERIAL);

        let certificates = manager.certificates().unwrap();
        assert!(certificates
            .iter()
            .all(|c| c.issuer_serial_number.as_deref() == Some(FakeCa::ISSUER_SERIAL)));
    }

    #[tokio::test]
    async fn test_issuer_failure_keeps_request() {
        let ca = FakeCa::new();
        ca.fail_issuer_fetches(1);
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;
        let certificate = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();

        let err = manager.submit_certificate(&certificate.alias).await.unwrap_err();
        assert!(matches!(
            err,
            AcmeVaultError::Protocol {
                operation: "fetch-issuer",
                ..
            }
        ));

        let stored = manager.get_certificate(&certificate.alias).unwrap();
        assert!(stored.request.is_some());
        assert!(stored.is_issued());
        assert!(!stored.has_issuer());
        assert!(stored.serial_number.is_some());

        // The CA request is resumed rather than resubmitted
        match manager.poll_issuance(&certificate.alias).await.unwrap() {
            IssuanceOutcome::Issued(issued) => {
                assert_eq!(issued.issuer_serial_number.as_deref(), Some(FakeCa::ISSUER_SERIAL));
            }
            other => panic!("expected issued, got {other:?}"),
        }
        assert_eq!(ca.issuer_fetches(), 2);
        assert_eq!(ca.certificate_refreshes(), 1);
    }

    #[tokio::test]
    async fn test_poll_issuance_after_delay() {
        let ca = FakeCa::new();
        ca.set_issue_after(Some(2));
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;
        let certificate = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();

        let submitted = manager.submit_certificate(&certificate.alias).await.unwrap();
        assert!(!submitted.is_issued());

        match manager.poll_issuance(&certificate.alias).await.unwrap() {
            IssuanceOutcome::Issued(issued) => assert!(issued.serial_number.is_some()),
            other => panic!("expected issued, got {other:?}"),
        }
        assert_eq!(ca.certificate_refreshes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_issuance_is_bounded() {
        let ca = FakeCa::new();
        ca.set_issue_after(None);
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;
        let manager = manager.with_issuance_policy(PollPolicy::issuance());
        let certificate = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();
        manager.submit_certificate(&certificate.alias).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = manager.poll_issuance(&certificate.alias).await.unwrap();

        assert_eq!(outcome, IssuanceOutcome::NotYetIssued { attempts: 5 });
        assert_eq!(ca.certificate_refreshes(), 5);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_request_certificate_writes_pkcs12() {
        let ca = FakeCa::new();
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;

        let requested = manager.request_certificate(&alias, &[], Some("secret")).await.unwrap();
        assert!(matches!(requested.outcome, IssuanceOutcome::Issued(_)));
        let pfx_path = requested.pkcs12.unwrap();
        let pfx = p12::PFX::parse(&std::fs::read(&pfx_path).unwrap()).unwrap();
        assert!(pfx.verify_mac("secret"));
    }

    #[tokio::test]
    async fn test_revoke_certificate() {
        let ca = FakeCa::new();
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;
        let certificate = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();

        assert!(matches!(
            manager.revoke_certificate(&certificate.alias).await.unwrap_err(),
            AcmeVaultError::State(_)
        ));

        manager.submit_certificate(&certificate.alias).await.unwrap();
        let revoked = manager.revoke_certificate(&certificate.alias).await.unwrap();
        assert!(revoked.revoked.is_some());
        assert_eq!(ca.revocations(), 1);
    }

    #[tokio::test]
    async fn test_update_before_submit() {
        let ca = FakeCa::new();
        let (_temp_dir, manager, alias) = authorized_manager(&ca, "www.example.com").await;
        let certificate = manager.begin_certificate(&alias, &[], CsrSource::Generate).unwrap();
        assert!(matches!(
            manager.update_certificate(&certificate.alias).await.unwrap_err(),
            AcmeVaultError::State(_)
        ));
    }
}
