//! KDL configuration parsing.

mod helpers;

use ::kdl::{KdlDocument, KdlNode};
use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use tracing::{trace, warn};

use crate::{Config, PollConfig, VaultConfig};

use helpers::{child_names, get_int_entry, get_string_entry};

const VAULT_KEYS: &[&str] = &["storage", "ca", "open-attempts", "open-retry-ms"];
const POLL_KEYS: &[&str] = &["max-attempts", "interval-ms"];

/// Parse a full configuration document
pub fn parse_config(content: &str) -> Result<Config> {
    let doc: KdlDocument = content
        .parse()
        .map_err(|e: ::kdl::KdlError| anyhow!("{:?}", miette::Report::new(e)))?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "vault" => config.vault = parse_vault_config(node)?,
            "authorization" => {
                config.authorization = parse_poll_config(node, PollConfig::authorization())
                    .context("in 'authorization' block")?
            }
            "issuance" => {
                config.issuance = parse_poll_config(node, PollConfig::issuance())
                    .context("in 'issuance' block")?
            }
            other => bail!("unknown configuration block '{}'", other),
        }
    }

    Ok(config)
}

/// Parse the `vault` block
fn parse_vault_config(node: &KdlNode) -> Result<VaultConfig> {
    trace!("Parsing vault configuration block");
    warn_unknown_keys(node, VAULT_KEYS);

    let defaults = VaultConfig::default();
    let config = VaultConfig {
        storage: get_string_entry(node, "storage")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage),
        ca: get_string_entry(node, "ca").unwrap_or(defaults.ca),
        open_attempts: int_entry(node, "open-attempts")?.unwrap_or(defaults.open_attempts),
        open_retry_ms: int_entry(node, "open-retry-ms")?.unwrap_or(defaults.open_retry_ms),
    };

    trace!(
        storage = %config.storage.display(),
        ca = %config.ca,
        open_attempts = config.open_attempts,
        "Parsed vault configuration"
    );

    Ok(config)
}

/// Parse an `authorization` or `issuance` polling block
fn parse_poll_config(node: &KdlNode, defaults: PollConfig) -> Result<PollConfig> {
    warn_unknown_keys(node, POLL_KEYS);

    Ok(PollConfig {
        max_attempts: int_entry(node, "max-attempts")?.unwrap_or(defaults.max_attempts),
        interval_ms: int_entry(node, "interval-ms")?.unwrap_or(defaults.interval_ms),
    })
}

fn int_entry<T: TryFrom<i128>>(node: &KdlNode, key: &str) -> Result<Option<T>> {
    match get_int_entry(node, key) {
        Some(value) => T::try_from(value)
            .map(Some)
            .map_err(|_| anyhow!("'{}' is out of range: {}", key, value)),
        None => Ok(None),
    }
}

fn warn_unknown_keys(node: &KdlNode, known: &[&str]) {
    for name in child_names(node) {
        if !known.contains(&name) {
            warn!(
                block = node.name().value(),
                key = name,
                "Ignoring unknown configuration key"
            );
        }
    }
}
