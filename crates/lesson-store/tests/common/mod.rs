#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lesson_store::{
    BackendError, MemoryBackend, RawStore, StaticDeviceId, StorageService, StoreConfig,
};

pub const DEVICE_ID: &str = "test-device-0001";

pub async fn open_service(backend: Arc<dyn RawStore>) -> StorageService {
    open_service_with(StoreConfig::default(), backend).await
}

pub async fn open_service_with(config: StoreConfig, backend: Arc<dyn RawStore>) -> StorageService {
    StorageService::open(config, backend, Arc::new(StaticDeviceId::new(DEVICE_ID)))
        .await
        .unwrap()
}

pub async fn memory_service() -> (StorageService, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    (open_service(backend.clone()).await, backend)
}

/// Which backend calls a [`FlakyBackend`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Get,
    Set,
    Remove,
}

/// Memory backend that fails the next `n` calls of one kind with a chosen
/// error.
pub struct FlakyBackend {
    inner: MemoryBackend,
    fail_on: FailOn,
    remaining: AtomicU32,
    calls: AtomicU32,
    make_error: fn() -> BackendError,
}

impl FlakyBackend {
    pub fn new(fail_on: FailOn, failures: u32, make_error: fn() -> BackendError) -> Self {
        Self {
            inner: MemoryBackend::new(),
            fail_on,
            remaining: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            make_error,
        }
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Calls of the failing kind seen so far, failed or not.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn arm(&self, failures: u32) {
        self.remaining.store(failures, Ordering::SeqCst);
    }

    fn trip(&self, op: FailOn) -> Result<(), BackendError> {
        if op != self.fail_on {
            return Ok(());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let armed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            Err((self.make_error)())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RawStore for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.trip(FailOn::Get)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BackendError> {
        self.trip(FailOn::Set)?;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.trip(FailOn::Remove)?;
        self.inner.remove(key).await
    }

    async fn all_keys(&self) -> Result<Vec<String>, BackendError> {
        self.inner.all_keys().await
    }
}
