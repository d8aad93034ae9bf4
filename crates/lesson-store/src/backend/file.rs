use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{BackendError, RawStore};

/// A JSON document on disk holding the whole key/value map.
///
/// The map is cached in memory and rewritten after every mutation through a
/// staging file that is synced and then renamed over the target, so a crash
/// leaves either the old or the new document, never a torn one.
pub struct FileBackend {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileBackend {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Self::remove_stale_staging(&path).await;

        let entries = match fs::read_to_string(&path).await {
            Ok(json) if json.trim().is_empty() => HashMap::new(),
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| BackendError::Corrupt(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "file backend opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "store".into());
        name.push(".staging");
        path.with_file_name(name)
    }

    async fn remove_stale_staging(path: &Path) {
        let staging = Self::staging_path(path);
        match fs::remove_file(&staging).await {
            Ok(()) => warn!(path = %staging.display(), "removed stale staging file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staging.display(), error = %e, "cannot remove staging file"),
        }
    }

    async fn write_atomic(&self, entries: &HashMap<String, String>) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec(entries)
            .map_err(|e| BackendError::Corrupt(format!("cannot serialize store: {e}")))?;
        let staging = Self::staging_path(&self.path);
        {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        fs::rename(&staging, &self.path).await?;
        #[cfg(unix)]
        {
            let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(parent) = parent {
                fs::File::open(parent).await?.sync_all().await?;
            }
        }
        Ok(())
    }

    /// Apply `mutate` to a copy of the map and commit it only once it is on
    /// disk.
    async fn commit<F>(&self, mutate: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut HashMap<String, String>) + Send,
    {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        mutate(&mut next);
        self.write_atomic(&next).await?;
        *entries = next;
        Ok(())
    }
}

#[async_trait]
impl RawStore for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BackendError> {
        let key = key.to_string();
        self.commit(move |map| {
            map.insert(key, value);
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        if !self.entries.lock().await.contains_key(key) {
            return Ok(());
        }
        let key = key.to_string();
        self.commit(move |map| {
            map.remove(&key);
        })
        .await
    }

    async fn all_keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError> {
        let entries = self.entries.lock().await;
        Ok(keys.iter().map(|key| entries.get(key).cloned()).collect())
    }

    async fn multi_set(&self, pairs: Vec<(String, String)>) -> Result<(), BackendError> {
        self.commit(move |map| map.extend(pairs)).await
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), BackendError> {
        let keys = keys.to_vec();
        self.commit(move |map| {
            for key in &keys {
                map.remove(key);
            }
        })
        .await
    }
}
