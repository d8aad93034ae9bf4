//! Raw persistent key/value backends.
//!
//! Backends know nothing about prefixes, encryption or JSON. They store one
//! string per key and report failures as [`BackendError`].

use async_trait::async_trait;

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("quota exceeded: {needed} bytes needed, limit is {limit}")]
    QuotaExceeded { needed: usize, limit: usize },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("backing store is corrupt: {0}")]
    Corrupt(String),
    #[error("backing store timed out")]
    Timeout,
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RawStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set(&self, key: &str, value: String) -> Result<(), BackendError>;

    /// Removing an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<(), BackendError>;

    async fn all_keys(&self) -> Result<Vec<String>, BackendError>;

    /// Results follow the order of `keys`.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Pairs are written in order; a failure leaves earlier pairs applied.
    async fn multi_set(&self, pairs: Vec<(String, String)>) -> Result<(), BackendError> {
        for (key, value) in pairs {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), BackendError> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}
