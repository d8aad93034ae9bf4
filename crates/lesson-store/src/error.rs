//! Storage error taxonomy.
//!
//! Every failure that crosses the store boundary is a [`StorageError`]. The
//! kind decides severity and the default recovery strategy; callers may
//! override the strategy when they know better (for example, decryption
//! failures from the store are routed to backup restore).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

// ── Classification ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ReadError,
    WriteError,
    DeleteError,
    BatchError,
    EncryptionError,
    DecryptionError,
    QuotaExceeded,
    CorruptionError,
    NetworkError,
    PermissionError,
    MigrationError,
    ValidationError,
    TimeoutError,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ReadError => "READ_ERROR",
            ErrorKind::WriteError => "WRITE_ERROR",
            ErrorKind::DeleteError => "DELETE_ERROR",
            ErrorKind::BatchError => "BATCH_ERROR",
            ErrorKind::EncryptionError => "ENCRYPTION_ERROR",
            ErrorKind::DecryptionError => "DECRYPTION_ERROR",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::CorruptionError => "CORRUPTION_ERROR",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::PermissionError => "PERMISSION_ERROR",
            ErrorKind::MigrationError => "MIGRATION_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::QuotaExceeded | ErrorKind::CorruptionError | ErrorKind::PermissionError => {
                Severity::Critical
            }
            ErrorKind::EncryptionError
            | ErrorKind::DecryptionError
            | ErrorKind::MigrationError => Severity::High,
            ErrorKind::WriteError | ErrorKind::DeleteError | ErrorKind::BatchError => {
                Severity::Medium
            }
            ErrorKind::ReadError | ErrorKind::NetworkError | ErrorKind::TimeoutError => {
                Severity::Low
            }
            _ => Severity::Medium,
        }
    }

    pub fn default_strategy(&self) -> RecoveryStrategy {
        match self {
            ErrorKind::NetworkError | ErrorKind::TimeoutError => RecoveryStrategy::Retry,
            ErrorKind::QuotaExceeded => RecoveryStrategy::ClearAndRetry,
            ErrorKind::CorruptionError => RecoveryStrategy::RestoreBackup,
            ErrorKind::ReadError => RecoveryStrategy::Fallback,
            ErrorKind::PermissionError => RecoveryStrategy::ManualIntervention,
            _ => RecoveryStrategy::Retry,
        }
    }

    /// Text intended for direct display to an end user.
    pub fn display_message(&self) -> &'static str {
        match self {
            ErrorKind::QuotaExceeded => {
                "Storage space is full. Please free up space or enable cloud sync."
            }
            ErrorKind::CorruptionError => {
                "Data corruption detected. A backup restore may be required."
            }
            ErrorKind::PermissionError => "Permission denied. Please check app permissions.",
            ErrorKind::EncryptionError => {
                "Failed to encrypt data. Your information may not be secure."
            }
            ErrorKind::DecryptionError => {
                "Failed to decrypt data. This may indicate data corruption."
            }
            ErrorKind::NetworkError => "Network error occurred. Please check your connection.",
            ErrorKind::TimeoutError => "Operation timed out. Please try again.",
            _ => "An error occurred while accessing storage.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    ClearAndRetry,
    RestoreBackup,
    ManualIntervention,
    /// Surface the error unchanged.
    None,
}

/// Recovery parameters attached to an error. Unset retry fields fall back to
/// the engine's configured defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOptions {
    pub strategy: RecoveryStrategy,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub fallback_value: Option<serde_json::Value>,
}

impl RecoveryOptions {
    pub fn for_kind(kind: ErrorKind) -> Self {
        Self {
            strategy: kind.default_strategy(),
            max_retries: None,
            retry_delay: None,
            fallback_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub key: Option<String>,
    pub retry_count: u32,
}

// ── Error ───────────────────────────────────────────────────────────────────

type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StorageError {
    kind: ErrorKind,
    message: String,
    context: ErrorContext,
    recovery: RecoveryOptions,
    #[source]
    source: Option<BoxedCause>,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext {
                timestamp: Utc::now(),
                operation: operation.into(),
                key: None,
                retry_count: 0,
            },
            recovery: RecoveryOptions::for_kind(kind),
            source: None,
        }
    }

    /// Classify a backend failure. Quota, permission, timeout and corruption
    /// keep their own kind; everything else becomes `fallback_kind`.
    pub fn from_backend(
        err: BackendError,
        fallback_kind: ErrorKind,
        operation: &str,
        key: Option<&str>,
    ) -> Self {
        let kind = match &err {
            BackendError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            BackendError::PermissionDenied(_) => ErrorKind::PermissionError,
            BackendError::Timeout => ErrorKind::TimeoutError,
            BackendError::Corrupt(_) => ErrorKind::CorruptionError,
            BackendError::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::PermissionError
            }
            BackendError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                ErrorKind::TimeoutError
            }
            _ => fallback_kind,
        };
        let mut error = Self::new(kind, err.to_string(), operation).with_source(err);
        if let Some(key) = key {
            error = error.with_key(key);
        }
        error
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.context.key = Some(key.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.context.retry_count = retry_count;
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryOptions) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery.strategy = strategy;
        self
    }

    pub fn with_fallback(mut self, value: serde_json::Value) -> Self {
        self.recovery.strategy = RecoveryStrategy::Fallback;
        self.recovery.fallback_value = Some(value);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn recovery(&self) -> &RecoveryOptions {
        &self.recovery
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        self.recovery.strategy
    }

    pub fn display_message(&self) -> &'static str {
        self.kind.display_message()
    }

    /// Serializable snapshot for diagnostics.
    pub fn report(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind,
            severity: self.severity(),
            message: self.message.clone(),
            display_message: self.display_message().to_string(),
            strategy: self.recovery.strategy,
            context: self.context.clone(),
            cause: self.source.as_ref().map(|cause| cause.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub display_message: String,
    pub strategy: RecoveryStrategy,
    pub context: ErrorContext,
    pub cause: Option<String>,
}

/// Wrap any error into a [`StorageError`] of the given kind.
pub trait ResultExt<T> {
    fn storage_err(self, kind: ErrorKind, operation: &str, key: Option<&str>)
        -> Result<T, StorageError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn storage_err(
        self,
        kind: ErrorKind,
        operation: &str,
        key: Option<&str>,
    ) -> Result<T, StorageError> {
        self.map_err(|err| {
            let mut error = StorageError::new(kind, err.to_string(), operation).with_source(err);
            if let Some(key) = key {
                error = error.with_key(key);
            }
            error
        })
    }
}
