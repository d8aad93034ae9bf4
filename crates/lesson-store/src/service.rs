use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::backend::{FileBackend, RawStore};
use crate::config::StoreConfig;
use crate::crypto::Cipher;
use crate::error::{ErrorKind, RecoveryStrategy, StorageError};
use crate::keys::{DeviceIdentity, FileDeviceId, KeyManager};
use crate::paths;
use crate::recovery::RecoveryEngine;
use crate::store::{KeyValueStore, StorageOptions};

/// Owns one key manager, cipher, store and recovery engine.
///
/// Construct with [`StorageService::open`] and pass it by reference; call
/// [`StorageService::close`] to stop accepting operations and release key
/// material.
pub struct StorageService {
    config: StoreConfig,
    keys: Arc<KeyManager>,
    store: Arc<KeyValueStore>,
    recovery: RecoveryEngine,
}

impl StorageService {
    pub async fn open(
        config: StoreConfig,
        backend: Arc<dyn RawStore>,
        device: Arc<dyn DeviceIdentity>,
    ) -> Result<Self, StorageError> {
        config.validate().map_err(|e| {
            StorageError::new(ErrorKind::ValidationError, format!("{e:#}"), "open")
                .with_strategy(RecoveryStrategy::None)
        })?;

        let keys = Arc::new(KeyManager::new(device, backend.clone(), config.salt_key.clone()));
        keys.initialize().await.map_err(|e| {
            StorageError::new(ErrorKind::EncryptionError, e.to_string(), "open")
                .with_strategy(RecoveryStrategy::None)
                .with_source(e)
        })?;

        let cipher = Cipher::with_schema(keys.clone(), config.sensitivity.clone());
        let store = Arc::new(KeyValueStore::new(backend, cipher, &config));
        let recovery = RecoveryEngine::new(config.recovery, config.error_log_capacity);
        info!(prefix = %config.key_prefix, encryption = config.encryption_enabled, "storage service opened");
        Ok(Self {
            config,
            keys,
            store,
            recovery,
        })
    }

    /// Open with the on-disk config, record file and device id under the
    /// platform data directory.
    pub async fn open_default() -> anyhow::Result<Self> {
        let config = StoreConfig::load_or_default(paths::config_path()?)?;
        let backend = FileBackend::open(paths::store_path()?).await?;
        let device = FileDeviceId::in_data_dir()?;
        Ok(Self::open(config, Arc::new(backend), Arc::new(device)).await?)
    }

    pub async fn close(&self) {
        self.store.close();
        self.keys.close().await;
        info!("storage service closed");
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn cipher(&self) -> &Cipher {
        self.store.cipher()
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    /// Read a record and, on failure, hand the error to the recovery engine
    /// with a re-read as the recovery action.
    pub async fn get_item_or_recover<T>(
        &self,
        key: &str,
        options: &StorageOptions,
    ) -> Result<Option<T>, StorageError>
    where
        T: DeserializeOwned,
    {
        let store = self.store.as_ref();
        match store.get_item::<T>(key, options).await {
            Ok(value) => Ok(value),
            Err(error) => self
                .recovery
                .handle_error(error, store, || store.get_item::<T>(key, options))
                .await?
                .into_result(),
        }
    }

    /// Write a record and, on failure, hand the error to the recovery engine
    /// with the same write as the recovery action. A quota failure clears the
    /// key from both namespaces and writes once more.
    pub async fn set_item_or_recover<T>(
        &self,
        key: &str,
        value: &T,
        options: &StorageOptions,
    ) -> Result<(), StorageError>
    where
        T: Serialize + ?Sized,
    {
        let store = self.store.as_ref();
        match store.set_item(key, value, options).await {
            Ok(()) => Ok(()),
            Err(error) => self
                .recovery
                .handle_error(error, store, || store.set_item(key, value, options))
                .await?
                .into_result(),
        }
    }

    /// Batch counterpart of [`StorageService::set_item_or_recover`]. Batch
    /// errors carry no key, so a quota failure clears the whole store.
    pub async fn batch_set_or_recover<K, V>(
        &self,
        items: &[(K, V)],
        options: &StorageOptions,
    ) -> Result<(), StorageError>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        let store = self.store.as_ref();
        match store.batch_set(items, options).await {
            Ok(()) => Ok(()),
            Err(error) => self
                .recovery
                .handle_error(error, store, || store.batch_set(items, options))
                .await?
                .into_result(),
        }
    }
}
