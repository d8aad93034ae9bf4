use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::sensitivity::SensitivitySchema;

pub const DEFAULT_KEY_PREFIX: &str = "lesson_plan_";
pub const DEFAULT_SECURE_PREFIX: &str = "SECURE_";
pub const DEFAULT_SALT_KEY: &str = "__lesson_store_kdf_salt";
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryDefaults {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RecoveryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Namespace for every record this store owns.
    pub key_prefix: String,
    /// Sub-namespace (after `key_prefix`) for always-encrypted records.
    pub secure_prefix: String,
    /// Backend key holding the hex KDF salt. Must sit outside `key_prefix`
    /// so clearing the store keeps existing ciphertext readable.
    pub salt_key: String,
    pub encryption_enabled: bool,
    pub recovery: RecoveryDefaults,
    pub error_log_capacity: usize,
    pub sensitivity: SensitivitySchema,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            secure_prefix: DEFAULT_SECURE_PREFIX.to_string(),
            salt_key: DEFAULT_SALT_KEY.to_string(),
            encryption_enabled: true,
            recovery: RecoveryDefaults::default(),
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
            sensitivity: SensitivitySchema::default(),
        }
    }
}

impl StoreConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: StoreConfig = serde_json::from_str(&json)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`StoreConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(anyhow!("key_prefix must not be empty"));
        }
        if self.secure_prefix.is_empty() {
            return Err(anyhow!("secure_prefix must not be empty"));
        }
        if self.salt_key.starts_with(&self.key_prefix) {
            return Err(anyhow!(
                "salt_key {:?} must not live under key_prefix {:?}",
                self.salt_key,
                self.key_prefix
            ));
        }
        if self.error_log_capacity == 0 {
            return Err(anyhow!("error_log_capacity must be at least 1"));
        }
        Ok(())
    }

    /// Check that a store with this config and one with `other` can share a
    /// backend. A store owns every key starting with its prefix, so neither
    /// prefix may start the other, and no prefix may start either salt key.
    pub fn check_shared_backend(&self, other: &StoreConfig) -> Result<()> {
        if self.key_prefix.starts_with(&other.key_prefix)
            || other.key_prefix.starts_with(&self.key_prefix)
        {
            return Err(anyhow!(
                "key prefixes {:?} and {:?} overlap",
                self.key_prefix,
                other.key_prefix
            ));
        }
        for salt_key in [&self.salt_key, &other.salt_key] {
            for prefix in [&self.key_prefix, &other.key_prefix] {
                if salt_key.starts_with(prefix.as_str()) {
                    return Err(anyhow!(
                        "salt_key {salt_key:?} lives under key_prefix {prefix:?}"
                    ));
                }
            }
        }
        Ok(())
    }
}
