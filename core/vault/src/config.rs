//! Store daemon configuration.

use std::path::Path;

use serde::Deserialize;

use sentinel_common::{Error, Result};

/// Configuration of the `credstore` daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoreConfig {
    /// Directory holding the vault.
    pub storage_path: String,
    /// Service listen address.
    pub listen_address: String,
    /// Optional metrics listen address.
    pub metrics_listen_address: Option<String>,
    /// TLS material; required in production mode.
    pub tls: Option<TlsConfig>,
}

/// TLS certificate and key locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

impl StoreConfig {
    /// Validate invariants that depend on the run mode.
    pub fn validate(&self, production: bool) -> Result<()> {
        if self.storage_path.is_empty() {
            return Err(Error::Config("no storage path configured".to_string()));
        }

        if production && self.tls.is_none() {
            return Err(Error::Config(
                "production mode requires a Tls configuration".to_string(),
            ));
        }

        Ok(())
    }
}

/// Load the store configuration from a TOML file.
pub fn load_store_config(path: &Path) -> Result<StoreConfig> {
    let raw = std::fs::read_to_string(path)?;
    toml::from_str(&raw).map_err(|e| Error::Config(format!("toml: {e}")))
}
