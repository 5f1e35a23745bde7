//! Certificate asset export
//!
//! Every prerequisite of a format is loaded before anything is written, so
//! a failed export never leaves a partial file behind.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use acmevault_common::CertificateId;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{AcmeVaultError, Result, StorageError};
use crate::manager::VaultManager;
use crate::model::{Asset, AssetType, Certificate, IssuerCertificate};
use crate::pki::{self, PEM_TAG_PRIVATE_KEY};
use crate::store::write_file;

/// Exportable shapes of a certificate's assets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    KeyPem,
    CsrPem,
    CrtPem,
    CrtDer,
    IssuerPem,
    IssuerDer,
    /// Private key, leaf certificate and issuer, in that order
    PemFull,
    Pkcs12,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 8] = [
        Self::KeyPem,
        Self::CsrPem,
        Self::CrtPem,
        Self::CrtDer,
        Self::IssuerPem,
        Self::IssuerDer,
        Self::PemFull,
        Self::Pkcs12,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyPem => "key-pem",
            Self::CsrPem => "csr-pem",
            Self::CrtPem => "crt-pem",
            Self::CrtDer => "crt-der",
            Self::IssuerPem => "issuer-pem",
            Self::IssuerDer => "issuer-der",
            Self::PemFull => "pem-full",
            Self::Pkcs12 => "pkcs12",
        }
    }

    /// Default file name for a certificate's export
    pub fn file_name(&self, id: CertificateId) -> String {
        let suffix = match self {
            Self::KeyPem => "key.pem",
            Self::CsrPem => "csr.pem",
            Self::CrtPem => "crt.pem",
            Self::CrtDer => "crt.der",
            Self::IssuerPem => "issuer.pem",
            Self::IssuerDer => "issuer.der",
            Self::PemFull => "full.pem",
            Self::Pkcs12 => "all.pfx",
        };
        format!("{id}-{suffix}")
    }

    /// Output contains private key material
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::KeyPem | Self::PemFull | Self::Pkcs12)
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown export format '{0}'")]
pub struct ParseExportFormatError(String);

impl FromStr for ExportFormat {
    type Err = ParseExportFormatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseExportFormatError(s.to_string()))
    }
}

impl VaultManager {
    /// Export one shape of a certificate's assets
    ///
    /// Without a destination the file lands in the vault's asset folder as
    /// `{certId}-{kind}.{ext}`. Returns the written path.
    pub fn export_certificate(
        &self,
        certificate_ref: &str,
        format: ExportFormat,
        destination: Option<&Path>,
        password: Option<&str>,
    ) -> Result<PathBuf> {
        let (certificate, issuer) = self.export_source(certificate_ref)?;
        let content = self.render(&certificate, issuer.as_ref(), format, password)?;

        let path = match destination {
            Some(path) => path.to_path_buf(),
            None => self
                .store
                .asset_path(&Asset::new(AssetType::Asset, format.file_name(certificate.id))),
        };
        write_file(&path, &content, format.is_sensitive()).map_err(StorageError::from)?;

        info!(
            certificate = %certificate.alias,
            format = %format,
            path = %path.display(),
            "Exported certificate asset"
        );
        Ok(path)
    }

    /// Export every shape whose prerequisites exist
    ///
    /// PKCS#12 is only produced when a password is given. Files go to
    /// `directory`, or the vault's asset folder.
    pub fn export_all(
        &self,
        certificate_ref: &str,
        directory: Option<&Path>,
        password: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        let (certificate, issuer) = self.export_source(certificate_ref)?;
        let mut written = Vec::new();

        for format in ExportFormat::ALL {
            if format == ExportFormat::Pkcs12 && password.is_none() {
                continue;
            }
            let content = match self.render(&certificate, issuer.as_ref(), format, password) {
                Ok(content) => content,
                Err(AcmeVaultError::Export { missing, .. }) => {
                    debug!(
                        certificate = %certificate.alias,
                        format = %format,
                        missing = %missing,
                        "Skipping export"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let file_name = format.file_name(certificate.id);
            let path = match directory {
                Some(dir) => dir.join(file_name),
                None => self.store.asset_path(&Asset::new(AssetType::Asset, file_name)),
            };
            write_file(&path, &content, format.is_sensitive()).map_err(StorageError::from)?;
            written.push(path);
        }

        info!(
            certificate = %certificate.alias,
            files = written.len(),
            "Exported certificate assets"
        );
        Ok(written)
    }

    fn export_source(
        &self,
        certificate_ref: &str,
    ) -> Result<(Certificate, Option<IssuerCertificate>)> {
        let certificate = self.get_certificate(certificate_ref)?;
        let issuer = self.store.read(|vault| {
            certificate
                .issuer_serial_number
                .as_ref()
                .and_then(|serial| vault.issuer_certificates.get(serial).cloned())
        })?;
        Ok((certificate, issuer))
    }

    /// Build the export bytes, loading every prerequisite first
    fn render(
        &self,
        certificate: &Certificate,
        issuer: Option<&IssuerCertificate>,
        format: ExportFormat,
        password: Option<&str>,
    ) -> Result<Vec<u8>> {
        let own = |asset_type, name: &Option<String>, what| {
            self.prerequisite(certificate, asset_type, name.as_deref(), what)
        };
        let key = || own(AssetType::KeyPem, &certificate.key_pem_file, "private key");
        let csr = || own(AssetType::CsrPem, &certificate.csr_pem_file, "CSR");
        let crt_pem = || own(AssetType::CrtPem, &certificate.crt_pem_file, "issued certificate");
        let crt_der = || own(AssetType::CrtDer, &certificate.crt_der_file, "issued certificate");
        let issuer_pem = || {
            self.prerequisite(
                certificate,
                AssetType::IssuerPem,
                issuer.map(|i| i.crt_pem_file.as_str()),
                "issuer certificate",
            )
        };
        let issuer_der = || {
            self.prerequisite(
                certificate,
                AssetType::IssuerDer,
                issuer.map(|i| i.crt_der_file.as_str()),
                "issuer certificate",
            )
        };

        match format {
            ExportFormat::KeyPem => key(),
            ExportFormat::CsrPem => csr(),
            ExportFormat::CrtPem => crt_pem(),
            ExportFormat::CrtDer => crt_der(),
            ExportFormat::IssuerPem => issuer_pem(),
            ExportFormat::IssuerDer => issuer_der(),
            ExportFormat::PemFull => {
                let parts = [key()?, crt_pem()?, issuer_pem()?];
                let mut full = Vec::new();
                for part in parts {
                    full.extend_from_slice(&part);
                    if !part.ends_with(b"\n") {
                        full.push(b'\n');
                    }
                }
                Ok(full)
            }
            ExportFormat::Pkcs12 => {
                let key_pem = key()?;
                let key_pem = String::from_utf8_lossy(&key_pem);
                let key_der = pki::pem_to_der(&key_pem, PEM_TAG_PRIVATE_KEY)?;
                let crt_der = crt_der()?;
                let issuer_der = issuer_der()?;
                let password = password
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        AcmeVaultError::export(&certificate.alias, "PKCS#12 password")
                    })?;

                let pfx = p12::PFX::new(
                    &crt_der,
                    &key_der,
                    Some(issuer_der.as_slice()),
                    password,
                    &certificate.alias,
                )
                .ok_or_else(|| {
                    AcmeVaultError::Crypto("failed to build PKCS#12 bundle".to_string())
                })?;
                Ok(pfx.to_der())
            }
        }
    }

    fn prerequisite(
        &self,
        certificate: &Certificate,
        asset_type: AssetType,
        name: Option<&str>,
        what: &str,
    ) -> Result<Vec<u8>> {
        let name = name.ok_or_else(|| AcmeVaultError::export(&certificate.alias, what))?;
        match self.store.load_asset(&Asset::new(asset_type, name)) {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::AssetNotFound(asset)) => {
                Err(AcmeVaultError::export(&certificate.alias, format!("{what} ({asset})")))
            }
            Err(e) => Err(e.into()),
        }
    }
}
