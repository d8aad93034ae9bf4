//! Prefixed key/value store over a [`RawStore`] backend.
//!
//! Callers address records by logical name. Every record lives under the
//! store's prefix; records written through the secure path additionally sit
//! under the secure sub-prefix and are always encrypted. Writing a logical
//! name through one path removes it from the other, so no name is ever held
//! in both namespaces. If that removal fails the write is rolled back.
//!
//! Ownership is by raw prefix: a store owns every backend key that starts
//! with its `key_prefix`. Stores sharing a backend must use prefixes where
//! neither starts the other, and none may start the salt key; see
//! [`StoreConfig::check_shared_backend`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, RawStore};
use crate::config::StoreConfig;
use crate::crypto::{Cipher, CryptoError};
use crate::error::{ErrorKind, RecoveryStrategy, ResultExt, StorageError};
use crate::recovery::RecoveryTarget;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Per-call options. `expiration_time` and `compress` are accepted for
/// interface compatibility and not enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    pub skip_encryption: bool,
    pub expiration_time: Option<u64>,
    pub compress: bool,
}

impl StorageOptions {
    pub fn plaintext() -> Self {
        Self {
            skip_encryption: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_size: u64,
    pub item_count: usize,
    pub keys: Vec<String>,
    pub estimated_size_mb: f64,
    pub secure_item_count: usize,
}

pub struct KeyValueStore {
    backend: Arc<dyn RawStore>,
    cipher: Cipher,
    prefix: String,
    secure_prefix: String,
    encryption_enabled: bool,
    closed: AtomicBool,
}

impl KeyValueStore {
    pub fn new(backend: Arc<dyn RawStore>, cipher: Cipher, config: &StoreConfig) -> Self {
        Self {
            backend,
            cipher,
            prefix: config.key_prefix.clone(),
            secure_prefix: config.secure_prefix.clone(),
            encryption_enabled: config.encryption_enabled,
            closed: AtomicBool::new(false),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Single-item operations ─────────────────────────────────────────────

    pub async fn set_item<T>(
        &self,
        key: &str,
        value: &T,
        options: &StorageOptions,
    ) -> Result<(), StorageError>
    where
        T: Serialize + ?Sized,
    {
        const OP: &str = "set_item";
        self.ensure_open(OP)?;
        let raw_key = self.plain_key(key, OP)?;
        let encrypt = self.encrypts(options);
        let stored = self.seal(key, value, encrypt, OP).await?;
        self.write_exclusive(key, &raw_key, stored, &self.secure_key(key), OP)
            .await?;
        debug!(key, encrypt, "item stored");
        Ok(())
    }

    pub async fn get_item<T>(
        &self,
        key: &str,
        options: &StorageOptions,
    ) -> Result<Option<T>, StorageError>
    where
        T: DeserializeOwned,
    {
        const OP: &str = "get_item";
        self.ensure_open(OP)?;
        let raw_key = self.plain_key(key, OP)?;
        let raw = self
            .backend
            .get(&raw_key)
            .await
            .map_err(|e| StorageError::from_backend(e, ErrorKind::ReadError, OP, Some(key)))?;
        match raw {
            Some(raw) => self.open_record(key, raw, self.encrypts(options), OP).await.map(Some),
            None => Ok(None),
        }
    }

    /// Removing an absent key succeeds.
    pub async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        const OP: &str = "remove_item";
        self.ensure_open(OP)?;
        let raw_key = self.plain_key(key, OP)?;
        self.backend
            .remove(&raw_key)
            .await
            .map_err(|e| StorageError::from_backend(e, ErrorKind::DeleteError, OP, Some(key)))
    }

    /// Whether a plain-namespace record exists. A failed check is an error,
    /// not `false`.
    pub async fn has_item(&self, key: &str) -> Result<bool, StorageError> {
        const OP: &str = "has_item";
        self.ensure_open(OP)?;
        let raw_key = self.plain_key(key, OP)?;
        self.backend
            .get(&raw_key)
            .await
            .map(|raw| raw.is_some())
            .map_err(|e| StorageError::from_backend(e, ErrorKind::ReadError, OP, Some(key)))
    }

    /// Logical names of every owned record; secure records keep their
    /// sub-prefix. Unordered.
    pub async fn all_keys(&self) -> Result<Vec<String>, StorageError> {
        const OP: &str = "all_keys";
        self.ensure_open(OP)?;
        let keys = self.owned_raw_keys(OP).await?;
        Ok(keys
            .iter()
            .filter_map(|raw| raw.strip_prefix(self.prefix.as_str()))
            .map(str::to_string)
            .collect())
    }

    // ── Secure namespace ───────────────────────────────────────────────────

    pub async fn set_secure<T>(&self, key: &str, value: &T) -> Result<(), StorageError>
    where
        T: Serialize + ?Sized,
    {
        const OP: &str = "set_secure";
        self.ensure_open(OP)?;
        let plain_key = self.plain_key(key, OP)?;
        let stored = self.seal(key, value, true, OP).await?;
        self.write_exclusive(key, &self.secure_key(key), stored, &plain_key, OP)
            .await?;
        debug!(key, "secure item stored");
        Ok(())
    }

    pub async fn get_secure<T>(&self, key: &str) -> Result<Option<T>, StorageError>
    where
        T: DeserializeOwned,
    {
        const OP: &str = "get_secure";
        self.ensure_open(OP)?;
        self.plain_key(key, OP)?;
        let raw = self
            .backend
            .get(&self.secure_key(key))
            .await
            .map_err(|e| StorageError::from_backend(e, ErrorKind::ReadError, OP, Some(key)))?;
        match raw {
            Some(raw) => self.open_record(key, raw, true, OP).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn remove_secure(&self, key: &str) -> Result<(), StorageError> {
        const OP: &str = "remove_secure";
        self.ensure_open(OP)?;
        self.plain_key(key, OP)?;
        self.backend
            .remove(&self.secure_key(key))
            .await
            .map_err(|e| StorageError::from_backend(e, ErrorKind::DeleteError, OP, Some(key)))
    }

    // ── Batch operations ───────────────────────────────────────────────────

    /// Any failure surfaces as one `BATCH_ERROR` carrying the recovery
    /// strategy of its cause. A failed write restores every touched record
    /// to its previous value on a best-effort basis.
    pub async fn batch_set<K, V>(
        &self,
        items: &[(K, V)],
        options: &StorageOptions,
    ) -> Result<(), StorageError>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        const OP: &str = "batch_set";
        self.ensure_open(OP)?;
        let encrypt = self.encrypts(options);
        let mut pairs = Vec::with_capacity(items.len());
        let mut counterparts = Vec::with_capacity(items.len());
        for (key, value) in items {
            let key = key.as_ref();
            let raw_key = self.plain_key(key, OP).map_err(|e| batch_error(OP, e))?;
            let stored = self
                .seal(key, value, encrypt, OP)
                .await
                .map_err(|e| batch_error(OP, e))?;
            pairs.push((raw_key, stored));
            counterparts.push(self.secure_key(key));
        }
        let count = pairs.len();
        let raw_keys: Vec<String> = pairs.iter().map(|(raw, _)| raw.clone()).collect();
        let previous = self.backend.multi_get(&raw_keys).await.map_err(|e| {
            batch_error(OP, StorageError::from_backend(e, ErrorKind::ReadError, OP, None))
        })?;
        let written = match self.backend.multi_set(pairs).await {
            Ok(()) => self.backend.multi_remove(&counterparts).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let cause = StorageError::from_backend(e, ErrorKind::WriteError, OP, None);
            let error = batch_error(OP, cause);
            self.roll_back(raw_keys.into_iter().zip(previous).collect())
                .await;
            return Err(error);
        }
        debug!(count, encrypt, "batch stored");
        Ok(())
    }

    /// Results follow the order of `keys`, with `None` for missing records.
    pub async fn batch_get<K, T>(
        &self,
        keys: &[K],
        options: &StorageOptions,
    ) -> Result<Vec<Option<T>>, StorageError>
    where
        K: AsRef<str>,
        T: DeserializeOwned,
    {
        const OP: &str = "batch_get";
        self.ensure_open(OP)?;
        let raw_keys = keys
            .iter()
            .map(|key| self.plain_key(key.as_ref(), OP))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| batch_error(OP, e))?;
        let raw_values = self
            .backend
            .multi_get(&raw_keys)
            .await
            .storage_err(ErrorKind::BatchError, OP, None)?;
        let encrypt = self.encrypts(options);
        let mut values = Vec::with_capacity(raw_values.len());
        for (key, raw) in keys.iter().zip(raw_values) {
            let value = match raw {
                Some(raw) => Some(
                    self.open_record(key.as_ref(), raw, encrypt, OP)
                        .await
                        .map_err(|e| batch_error(OP, e))?,
                ),
                None => None,
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Remove every record under this store's prefix and nothing else.
    /// Returns the number of removed records.
    pub async fn clear_all(&self) -> Result<usize, StorageError> {
        const OP: &str = "clear_all";
        self.ensure_open(OP)?;
        let keys = self.owned_raw_keys(OP).await?;
        self.backend
            .multi_remove(&keys)
            .await
            .map_err(|e| StorageError::from_backend(e, ErrorKind::DeleteError, OP, None))?;
        info!(prefix = %self.prefix, removed = keys.len(), "store cleared");
        Ok(keys.len())
    }

    /// Linear scan over every owned record. Not for hot paths.
    pub async fn storage_stats(&self) -> Result<StorageStats, StorageError> {
        const OP: &str = "storage_stats";
        self.ensure_open(OP)?;
        let mut raw_keys = self.owned_raw_keys(OP).await?;
        raw_keys.sort();
        let values = self
            .backend
            .multi_get(&raw_keys)
            .await
            .map_err(|e| StorageError::from_backend(e, ErrorKind::ReadError, OP, None))?;
        let total_size: u64 = values.iter().flatten().map(|v| v.len() as u64).sum();
        let keys: Vec<String> = raw_keys
            .iter()
            .filter_map(|raw| raw.strip_prefix(self.prefix.as_str()))
            .map(str::to_string)
            .collect();
        let secure_item_count = keys
            .iter()
            .filter(|key| key.starts_with(self.secure_prefix.as_str()))
            .count();
        Ok(StorageStats {
            total_size,
            item_count: keys.len(),
            keys,
            estimated_size_mb: total_size as f64 / BYTES_PER_MB,
            secure_item_count,
        })
    }

    // ── Backup ─────────────────────────────────────────────────────────────

    /// Encrypted snapshot of every owned record in its stored form.
    pub async fn export_backup(&self) -> Result<String, StorageError> {
        const OP: &str = "export_backup";
        self.ensure_open(OP)?;
        let mut raw_keys = self.owned_raw_keys(OP).await?;
        raw_keys.sort();
        let values = self
            .backend
            .multi_get(&raw_keys)
            .await
            .map_err(|e| StorageError::from_backend(e, ErrorKind::ReadError, OP, None))?;
        let snapshot: BTreeMap<String, String> = raw_keys
            .iter()
            .zip(values)
            .filter_map(|(raw, value)| {
                let logical = raw.strip_prefix(self.prefix.as_str())?;
                Some((logical.to_string(), value?))
            })
            .collect();
        let count = snapshot.len();
        let data = serde_json::to_value(snapshot).storage_err(ErrorKind::ValidationError, OP, None)?;
        let backup = self
            .cipher
            .create_encrypted_backup(&data)
            .await
            .storage_err(ErrorKind::EncryptionError, OP, None)?;
        info!(count, "backup exported");
        Ok(backup)
    }

    /// Write every record of a backup produced by [`KeyValueStore::export_backup`]
    /// under the same master key. Returns the number of restored records.
    pub async fn import_backup(&self, backup: &str) -> Result<usize, StorageError> {
        const OP: &str = "import_backup";
        self.ensure_open(OP)?;
        let data = self.cipher.restore_encrypted_backup(backup).await.map_err(|e| {
            let kind = match e {
                CryptoError::IntegrityCheckFailed | CryptoError::Serialization(_) => {
                    ErrorKind::CorruptionError
                }
                _ => ErrorKind::DecryptionError,
            };
            StorageError::new(kind, e.to_string(), OP).with_source(e)
        })?;
        let snapshot: BTreeMap<String, String> =
            serde_json::from_value(data).storage_err(ErrorKind::CorruptionError, OP, None)?;
        let pairs: Vec<(String, String)> = snapshot
            .into_iter()
            .map(|(logical, value)| (format!("{}{logical}", self.prefix), value))
            .collect();
        let count = pairs.len();
        self.backend
            .multi_set(pairs)
            .await
            .storage_err(ErrorKind::BatchError, OP, None)?;
        info!(count, "backup imported");
        Ok(count)
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn ensure_open(&self, operation: &str) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::new(ErrorKind::ValidationError, "store is closed", operation)
                .with_strategy(RecoveryStrategy::None));
        }
        Ok(())
    }

    /// Write `stored` under `raw_key`, then drop `counterpart`. When the drop
    /// fails, `raw_key` goes back to what it held before.
    async fn write_exclusive(
        &self,
        key: &str,
        raw_key: &str,
        stored: String,
        counterpart: &str,
        operation: &str,
    ) -> Result<(), StorageError> {
        let backend_error = |e: BackendError| {
            StorageError::from_backend(e, ErrorKind::WriteError, operation, Some(key))
        };
        let previous = self.backend.get(raw_key).await.map_err(backend_error)?;
        self.backend.set(raw_key, stored).await.map_err(backend_error)?;
        if let Err(e) = self.backend.remove(counterpart).await {
            let error = backend_error(e);
            self.roll_back(vec![(raw_key.to_string(), previous)]).await;
            return Err(error);
        }
        Ok(())
    }

    /// Put each raw key back to its previous value, removing keys that had
    /// none. Failures are logged; the caller already has an error to return.
    async fn roll_back(&self, previous: Vec<(String, Option<String>)>) {
        let (restore, absent): (Vec<_>, Vec<_>) =
            previous.into_iter().partition(|(_, value)| value.is_some());
        let absent: Vec<String> = absent.into_iter().map(|(raw, _)| raw).collect();
        let restore: Vec<(String, String)> = restore
            .into_iter()
            .filter_map(|(raw, value)| Some((raw, value?)))
            .collect();
        if !absent.is_empty() {
            if let Err(e) = self.backend.multi_remove(&absent).await {
                warn!(error = %e, keys = ?absent, "rollback could not remove new records");
            }
        }
        if !restore.is_empty() {
            let keys: Vec<String> = restore.iter().map(|(raw, _)| raw.clone()).collect();
            if let Err(e) = self.backend.multi_set(restore).await {
                warn!(error = %e, ?keys, "rollback could not restore previous records");
            }
        }
    }

    fn encrypts(&self, options: &StorageOptions) -> bool {
        self.encryption_enabled && !options.skip_encryption
    }

    fn plain_key(&self, key: &str, operation: &str) -> Result<String, StorageError> {
        if key.is_empty() {
            return Err(StorageError::new(ErrorKind::ValidationError, "empty key", operation)
                .with_strategy(RecoveryStrategy::None));
        }
        if key.starts_with(self.secure_prefix.as_str()) {
            return Err(StorageError::new(
                ErrorKind::ValidationError,
                "logical key collides with the secure namespace",
                operation,
            )
            .with_key(key)
            .with_strategy(RecoveryStrategy::None));
        }
        Ok(format!("{}{key}", self.prefix))
    }

    fn secure_key(&self, key: &str) -> String {
        format!("{}{}{key}", self.prefix, self.secure_prefix)
    }

    async fn owned_raw_keys(&self, operation: &str) -> Result<Vec<String>, StorageError> {
        let keys = self
            .backend
            .all_keys()
            .await
            .map_err(|e| StorageError::from_backend(e, ErrorKind::ReadError, operation, None))?;
        Ok(keys
            .into_iter()
            .filter(|raw| raw.starts_with(self.prefix.as_str()))
            .collect())
    }

    async fn seal<T>(
        &self,
        key: &str,
        value: &T,
        encrypt: bool,
        operation: &str,
    ) -> Result<String, StorageError>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_string(value).storage_err(
            ErrorKind::ValidationError,
            operation,
            Some(key),
        )?;
        if !encrypt {
            return Ok(json);
        }
        self.cipher
            .encrypt(&json)
            .await
            .storage_err(ErrorKind::EncryptionError, operation, Some(key))
    }

    async fn open_record<T>(
        &self,
        key: &str,
        raw: String,
        encrypted: bool,
        operation: &str,
    ) -> Result<T, StorageError>
    where
        T: DeserializeOwned,
    {
        let json = if encrypted {
            self.cipher
                .decrypt(&raw)
                .await
                .map_err(|e| decryption_error(e, operation, key))?
        } else {
            raw
        };
        serde_json::from_str(&json).storage_err(ErrorKind::CorruptionError, operation, Some(key))
    }
}

/// Decryption failures that are not a missing key are indistinguishable from
/// corruption and are routed to backup restore.
fn decryption_error(err: CryptoError, operation: &str, key: &str) -> StorageError {
    let key_unavailable = matches!(err, CryptoError::Key(_));
    let error = StorageError::new(ErrorKind::DecryptionError, err.to_string(), operation)
        .with_key(key)
        .with_source(err);
    if key_unavailable {
        error
    } else {
        error.with_strategy(RecoveryStrategy::RestoreBackup)
    }
}

fn batch_error(operation: &str, cause: StorageError) -> StorageError {
    let mut error = StorageError::new(ErrorKind::BatchError, cause.message().to_string(), operation)
        .with_strategy(cause.strategy());
    if let Some(key) = cause.context().key.clone() {
        error = error.with_key(key);
    }
    error.with_source(cause)
}

#[async_trait]
impl RecoveryTarget for KeyValueStore {
    /// Clears the logical name from both namespaces.
    async fn clear_key(&self, key: &str) -> Result<(), StorageError> {
        const OP: &str = "clear_key";
        self.ensure_open(OP)?;
        let raw_keys = vec![self.plain_key(key, OP)?, self.secure_key(key)];
        self.backend
            .multi_remove(&raw_keys)
            .await
            .map_err(|e| StorageError::from_backend(e, ErrorKind::DeleteError, OP, Some(key)))
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        KeyValueStore::clear_all(self).await.map(|_| ())
    }
}
