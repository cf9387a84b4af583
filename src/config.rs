//! Manager configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! default_suffixes = "zip|tar"
//! buffer_pool = "temp"
//! key_retry_delay_ms = 3000
//!
//! [access]
//! create_parents = true
//! cache = true
//! grow = false
//!
//! [drivers]
//! "zip|jar" = "zip"
//! "tar" = "tar"
//! "szip" = "sealed-zip"
//! "war" = ""        # removes an inherited mapping
//! ```

use crate::core::buffer_pool::{IoBufferPool, MemoryPool, TempFilePool};
use crate::core::error::{FsError, Result};
use crate::core::key::DEFAULT_RETRY_DELAY;
use crate::core::options::AccessPreferences;
use crate::core::registry::{DriverCatalog, DriverRegistry, DriverSpec, SuffixSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BufferPoolKind {
    #[default]
    Memory,
    Temp,
}

impl BufferPoolKind {
    pub fn create(self) -> Arc<dyn IoBufferPool> {
        match self {
            BufferPoolKind::Memory => Arc::new(MemoryPool::new()),
            BufferPoolKind::Temp => Arc::new(TempFilePool::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Suffixes detected as archives, all mapped suffixes if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_suffixes: Option<String>,

    pub buffer_pool: BufferPoolKind,

    /// Minimum delay between two invalid passphrase attempts.
    pub key_retry_delay_ms: u64,

    /// Default access preferences of every operation.
    pub access: AccessPreferences,

    /// Suffix lists mapped to driver names. An empty name removes the
    /// suffixes from the parent registry.
    pub drivers: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut drivers = BTreeMap::new();
        drivers.insert("zip|jar".to_string(), "zip".to_string());
        drivers.insert("tar".to_string(), "tar".to_string());
        drivers.insert("szip".to_string(), "sealed-zip".to_string());
        Config {
            default_suffixes: None,
            buffer_pool: BufferPoolKind::Memory,
            key_retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            access: AccessPreferences::default(),
            drivers,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FsError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| FsError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| FsError::Config(e.to_string()))
    }

    pub fn key_retry_delay(&self) -> Duration {
        Duration::from_millis(self.key_retry_delay_ms)
    }

    /// Builds the driver registry described by `[drivers]`, chained to
    /// `parent`.
    pub fn registry(
        &self,
        parent: Option<Arc<DriverRegistry>>,
        catalog: Arc<DriverCatalog>,
    ) -> Result<DriverRegistry> {
        DriverRegistry::from_config(parent, catalog, self)
    }
}

impl DriverRegistry {
    /// Registry with the `[drivers]` mappings and default suffixes of
    /// `config`. Driver names must exist in `catalog`.
    pub fn from_config(
        parent: Option<Arc<DriverRegistry>>,
        catalog: Arc<DriverCatalog>,
        config: &Config,
    ) -> Result<Self> {
        let mut mappings = Vec::with_capacity(config.drivers.len());
        for (suffixes, name) in &config.drivers {
            let spec = if name.trim().is_empty() {
                DriverSpec::Remove
            } else if catalog.contains(name) {
                DriverSpec::Named(name.clone())
            } else {
                return Err(FsError::Config(format!(
                    "unknown archive driver '{}' for '{}'",
                    name, suffixes
                )));
            };
            mappings.push((suffixes.as_str(), spec));
        }
        let registry = DriverRegistry::new(parent, catalog, mappings)?;
        Ok(match &config.default_suffixes {
            Some(list) => registry.with_default_suffixes(SuffixSet::parse(list)),
            None => registry,
        })
    }
}
