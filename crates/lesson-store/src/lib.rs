//! Local encrypted data store for the lesson planner.
//!
//! Layers, leaves first:
//! - [`backend`]: raw string key/value persistence (memory or a JSON file).
//! - [`keys`]: device-scoped master key derived with PBKDF2 from a persisted
//!   salt.
//! - [`crypto`]: AES-256-GCM records, hashing, HMAC, field encryption and
//!   encrypted backups.
//! - [`store`]: prefixed key/value store with batch and secure operations.
//! - [`error`] and [`recovery`]: failure taxonomy and recovery strategies.
//! - [`service`]: the explicitly constructed bundle callers hold on to.

pub mod backend;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod paths;
pub mod recovery;
pub mod sensitivity;
pub mod service;
pub mod store;

pub use backend::{BackendError, FileBackend, MemoryBackend, RawStore};
pub use config::{RecoveryDefaults, StoreConfig};
pub use crypto::{Cipher, CryptoError};
pub use error::{
    ErrorContext, ErrorKind, ErrorRecord, RecoveryOptions, RecoveryStrategy, ResultExt, Severity,
    StorageError,
};
pub use keys::{DeviceIdentity, FileDeviceId, KeyError, KeyManager, StaticDeviceId};
pub use recovery::{RecoveryEngine, RecoveryOutcome, RecoveryTarget};
pub use sensitivity::{KeyRule, Sensitive, SensitivitySchema};
pub use service::StorageService;
pub use store::{KeyValueStore, StorageOptions, StorageStats};
