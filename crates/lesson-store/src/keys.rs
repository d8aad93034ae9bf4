//! Device-scoped master key.
//!
//! The key is derived with PBKDF2-HMAC-SHA256 over the device identifier and
//! a 128-bit salt. The salt is persisted in the backend under a reserved key
//! and re-read on every initialization, so a restart on the same device
//! re-derives the same key. Key material is held only in memory, zeroized on
//! drop, and never handed out of the crate.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::ZeroizeOnDrop;

use crate::backend::{BackendError, RawStore};

pub const KDF_ITERATIONS: u32 = 10_000;
pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("device identifier unavailable")]
    DeviceUnavailable(#[source] anyhow::Error),
    #[error("salt storage failed: {0}")]
    SaltStorage(#[from] BackendError),
    #[error("persisted salt is malformed")]
    MalformedSalt,
    #[error("key material was released")]
    Released,
}

// ── Device identity ─────────────────────────────────────────────────────────

/// Supplies the identifier the master key is derived from.
#[async_trait]
pub trait DeviceIdentity: Send + Sync {
    async fn device_id(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct StaticDeviceId(String);

impl StaticDeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

#[async_trait]
impl DeviceIdentity for StaticDeviceId {
    async fn device_id(&self) -> anyhow::Result<String> {
        if self.0.is_empty() {
            anyhow::bail!("device id is empty");
        }
        Ok(self.0.clone())
    }
}

/// Random UUID persisted to a file on first use.
#[derive(Debug, Clone)]
pub struct FileDeviceId {
    path: PathBuf,
}

impl FileDeviceId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_data_dir() -> anyhow::Result<Self> {
        Ok(Self::new(crate::paths::device_id_path()?))
    }
}

#[async_trait]
impl DeviceIdentity for FileDeviceId {
    async fn device_id(&self) -> anyhow::Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let id = Uuid::new_v4().to_string();
        tokio::fs::write(&self.path, &id).await?;
        info!(path = %self.path.display(), "generated new device id");
        Ok(id)
    }
}

// ── Key manager ─────────────────────────────────────────────────────────────

#[derive(ZeroizeOnDrop)]
struct MasterKeyMaterial {
    key: [u8; KEY_LEN],
    salt: [u8; SALT_LEN],
}

pub fn derive_key(device_id: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(device_id.as_bytes(), salt, KDF_ITERATIONS, &mut key);
    key
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub struct KeyManager {
    device: Arc<dyn DeviceIdentity>,
    backend: Arc<dyn RawStore>,
    salt_key: String,
    material: RwLock<Option<MasterKeyMaterial>>,
    released: AtomicBool,
}

impl KeyManager {
    pub fn new(
        device: Arc<dyn DeviceIdentity>,
        backend: Arc<dyn RawStore>,
        salt_key: impl Into<String>,
    ) -> Self {
        Self {
            device,
            backend,
            salt_key: salt_key.into(),
            material: RwLock::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// Derive and cache key material. A no-op while material is cached. On
    /// failure nothing is cached and the next call tries again. Also lifts a
    /// previous [`KeyManager::close`].
    pub async fn initialize(&self) -> Result<(), KeyError> {
        self.released.store(false, Ordering::SeqCst);
        if self.material.read().await.is_some() {
            return Ok(());
        }
        let mut guard = self.material.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let device_id = self
            .device
            .device_id()
            .await
            .map_err(KeyError::DeviceUnavailable)?;
        let salt = self.load_or_create_salt().await?;
        let material = MasterKeyMaterial {
            key: derive_key(&device_id, &salt),
            salt,
        };
        info!(fingerprint = %fingerprint_of(&material.key), "master key derived");
        *guard = Some(material);
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.material.read().await.is_some()
    }

    pub async fn salt(&self) -> Result<[u8; SALT_LEN], KeyError> {
        self.with_material(|m| m.salt).await
    }

    /// Short hex SHA-256 fingerprint of the master key, safe to log.
    pub async fn fingerprint(&self) -> Result<String, KeyError> {
        self.with_material(|m| fingerprint_of(&m.key)).await
    }

    /// Run `f` against the master key without letting it escape.
    pub(crate) async fn with_key<R>(
        &self,
        f: impl FnOnce(&[u8; KEY_LEN]) -> R,
    ) -> Result<R, KeyError> {
        self.with_material(|m| f(&m.key)).await
    }

    async fn with_material<R>(
        &self,
        f: impl FnOnce(&MasterKeyMaterial) -> R,
    ) -> Result<R, KeyError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(KeyError::Released);
        }
        self.initialize().await?;
        let guard = self.material.read().await;
        guard.as_ref().map(f).ok_or(KeyError::Released)
    }

    /// Drop cached key material. Key use fails with [`KeyError::Released`]
    /// until [`KeyManager::initialize`] is called again.
    pub async fn close(&self) {
        self.released.store(true, Ordering::SeqCst);
        if self.material.write().await.take().is_some() {
            debug!("master key released");
        }
    }

    async fn load_or_create_salt(&self) -> Result<[u8; SALT_LEN], KeyError> {
        if let Some(stored) = self.backend.get(&self.salt_key).await? {
            let bytes = hex::decode(stored.trim()).map_err(|_| KeyError::MalformedSalt)?;
            return bytes.try_into().map_err(|_| KeyError::MalformedSalt);
        }
        let salt = generate_salt();
        self.backend.set(&self.salt_key, hex::encode(salt)).await?;
        info!(salt_key = %self.salt_key, "persisted new key derivation salt");
        Ok(salt)
    }
}

fn fingerprint_of(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..8])
}
