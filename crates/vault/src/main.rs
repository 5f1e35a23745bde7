//! acmevault - offline vault maintenance
//!
//! Inspects, exports from and cleans up an existing vault. Steps that talk
//! to a CA are library APIs and need an [`acmevault::AcmeTransport`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use acmevault::{CleanupPolicy, ExportFormat, OfflineTransport, OpenMode, VaultManager, VaultStore};
use acmevault_config::Config;

/// acmevault - vault-backed ACME certificate workflow
#[derive(Parser, Debug)]
#[command(name = "acmevault")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "ACMEVAULT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Vault storage root, overriding the configuration
    #[arg(short = 's', long = "storage", env = "ACMEVAULT_STORAGE", global = true)]
    storage: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test,
    /// Create the vault if it does not exist yet
    Init,
    /// Print a summary of the vault
    Show,
    /// Export certificate material
    Export {
        /// Certificate alias or id
        #[arg(long = "cert")]
        cert: String,

        /// Export format, or `all`
        #[arg(short = 'f', long = "format", default_value = "all")]
        format: String,

        /// Destination file (single format) or directory (`all`)
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,

        /// PKCS#12 password
        #[arg(long = "password", env = "ACMEVAULT_PFX_PASSWORD")]
        password: Option<String>,
    },
    /// Remove orphaned identifiers and certificates
    Cleanup {
        /// Identifier (alias, DNS name or id) never to remove
        #[arg(long = "exempt")]
        exempt: Vec<String>,

        /// Only consider this identifier
        #[arg(long = "target")]
        target: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(storage) = cli.storage {
        config.vault.storage = storage;
    }

    match cli.command {
        Commands::Test => test_config(&config, cli.config.as_deref()),
        Commands::Init => init_vault(&config),
        Commands::Show => show_vault(&open_manager(&config)?),
        Commands::Export {
            cert,
            format,
            out,
            password,
        } => export(&open_manager(&config)?, &cert, &format, out, password.as_deref()),
        Commands::Cleanup { exempt, target } => {
            cleanup(&open_manager(&config)?, &exempt, target.as_deref())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::from_file(path).context("Failed to load configuration file")
        }
        None => {
            info!("No configuration specified, using defaults");
            Ok(Config::default())
        }
    }
}

/// Test configuration file and exit
fn test_config(config: &Config, path: Option<&std::path::Path>) -> Result<()> {
    let base_uri = config.vault.base_uri().context("Failed to resolve certificate authority")?;

    info!("Configuration test successful:");
    info!("  - storage: {}", config.vault.storage.display());
    info!("  - CA: {}", base_uri);
    info!(
        "  - authorization: {} attempt(s) every {}ms",
        config.authorization.max_attempts, config.authorization.interval_ms
    );
    info!(
        "  - issuance: {} attempt(s) every {}ms",
        config.issuance.max_attempts, config.issuance.interval_ms
    );

    println!(
        "acmevault: configuration file {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}

fn init_vault(config: &Config) -> Result<()> {
    let manager = VaultManager::from_config(config, Arc::new(OfflineTransport))
        .context("Failed to initialize vault")?;
    let vault = manager.store().load().context("Failed to read vault")?;
    println!(
        "acmevault: vault {} at {} (CA {})",
        vault.id,
        manager.store().root().display(),
        vault.base_uri
    );
    Ok(())
}

fn open_manager(config: &Config) -> Result<VaultManager> {
    let store = VaultStore::open(
        &config.vault.storage,
        OpenMode::Existing,
        config.vault.open_policy(),
    )
    .with_context(|| format!("Failed to open vault at {}", config.vault.storage.display()))?;
    Ok(VaultManager::new(store, Arc::new(OfflineTransport))
        .with_authorization_policy(config.authorization.policy())
        .with_issuance_policy(config.issuance.policy()))
}

fn show_vault(manager: &VaultManager) -> Result<()> {
    let vault = manager.store().load().context("Failed to read vault")?;

    let summary = json!({
        "id": vault.id,
        "base_uri": vault.base_uri,
        "created": vault.created,
        "registrations": vault.registrations.iter().map(|r| json!({
            "id": r.id,
            "contacts": r.contacts,
            "agreed_to_terms": r.has_agreed_to_terms(),
        })).collect::<Vec<_>>(),
        "identifiers": vault.identifiers.values().map(|i| json!({
            "id": i.id,
            "alias": i.alias,
            "dns": i.dns,
            "status": i.authorization.status,
            "expires": i.authorization.expires,
        })).collect::<Vec<_>>(),
        "certificates": vault.certificates.values().map(|c| json!({
            "id": c.id,
            "alias": c.alias,
            "issued": c.is_issued(),
            "serial_number": c.serial_number,
            "not_after": c.not_after,
            "issuer_serial_number": c.issuer_serial_number,
            "revoked": c.revoked,
        })).collect::<Vec<_>>(),
        "issuer_certificates": vault.issuer_certificates.keys().collect::<Vec<_>>(),
    });

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn export(
    manager: &VaultManager,
    cert: &str,
    format: &str,
    out: Option<PathBuf>,
    password: Option<&str>,
) -> Result<()> {
    let written = if format.eq_ignore_ascii_case("all") {
        if let Some(dir) = &out {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        manager
            .export_all(cert, out.as_deref(), password)
            .with_context(|| format!("Failed to export {cert}"))?
    } else {
        let format: ExportFormat = format.parse()?;
        let path = manager
            .export_certificate(cert, format, out.as_deref(), password)
            .with_context(|| format!("Failed to export {cert} as {format}"))?;
        vec![path]
    };

    if written.is_empty() {
        warn!("Nothing to export for {}", cert);
    }
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

fn cleanup(manager: &VaultManager, exempt: &[String], target: Option<&str>) -> Result<()> {
    let mut policy = match target {
        Some(reference) => {
            let identifier = manager
                .get_identifier(reference)
                .with_context(|| format!("Unknown cleanup target {reference}"))?;
            CleanupPolicy::targeting(identifier.id)
        }
        None => CleanupPolicy::default(),
    };

    for reference in exempt {
        match manager.get_identifier(reference) {
            Ok(identifier) => {
                policy.exempt.insert(identifier.id);
            }
            Err(e) => warn!("Ignoring exemption {}: {}", reference, e),
        }
    }

    let report = manager.cleanup(&policy).context("Cleanup failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
