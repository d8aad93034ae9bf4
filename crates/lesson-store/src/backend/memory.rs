use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{BackendError, RawStore};

/// Process-lifetime map, optionally bounded by a byte quota over keys and
/// values.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(limit: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota: Some(limit),
        }
    }

    pub fn used_bytes(&self) -> usize {
        Self::usage(&self.entries.read())
    }

    fn usage(entries: &HashMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn insert(
        &self,
        entries: &mut HashMap<String, String>,
        key: &str,
        value: String,
    ) -> Result<(), BackendError> {
        if let Some(limit) = self.quota {
            let replaced = entries.get(key).map(|old| key.len() + old.len()).unwrap_or(0);
            let needed = Self::usage(entries) - replaced + key.len() + value.len();
            if needed > limit {
                return Err(BackendError::QuotaExceeded { needed, limit });
            }
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl RawStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BackendError> {
        let mut entries = self.entries.write();
        self.insert(&mut entries, key, value)
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError> {
        let entries = self.entries.read();
        Ok(keys.iter().map(|key| entries.get(key).cloned()).collect())
    }

    async fn multi_set(&self, pairs: Vec<(String, String)>) -> Result<(), BackendError> {
        let mut entries = self.entries.write();
        for (key, value) in pairs {
            self.insert(&mut entries, &key, value)?;
        }
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), BackendError> {
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}
