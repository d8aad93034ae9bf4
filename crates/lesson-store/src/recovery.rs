//! Recovery engine for classified storage failures.
//!
//! `handle_error` dispatches on the error's recovery strategy and either
//! resolves to a value or reports a terminal outcome. Retries are bounded;
//! there is no unbounded loop anywhere in here.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::RecoveryDefaults;
use crate::error::{ErrorKind, ErrorRecord, RecoveryStrategy, Severity, StorageError};

/// What the engine needs to clear data for CLEAR_AND_RETRY.
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    async fn clear_key(&self, key: &str) -> Result<(), StorageError>;
    async fn clear_all(&self) -> Result<(), StorageError>;
}

#[derive(Debug)]
pub enum RecoveryOutcome<T> {
    /// `on_recovery` succeeded after `attempts` calls.
    Recovered { value: T, attempts: u32 },
    /// A default or caller-supplied fallback value.
    Fallback(T),
    /// The strategy exists but has no implementation yet.
    NotYetSupported {
        strategy: RecoveryStrategy,
        error: StorageError,
    },
    /// Only a person can resolve this.
    ManualIntervention { message: String, error: StorageError },
}

impl<T> RecoveryOutcome<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            RecoveryOutcome::Recovered { .. } | RecoveryOutcome::Fallback(_)
        )
    }

    /// Collapse into a value, turning terminal outcomes into an
    /// `UNKNOWN_ERROR` that wraps the original failure.
    pub fn into_result(self) -> Result<T, StorageError> {
        match self {
            RecoveryOutcome::Recovered { value, .. } | RecoveryOutcome::Fallback(value) => Ok(value),
            RecoveryOutcome::NotYetSupported { strategy, error } => {
                let message = match strategy {
                    RecoveryStrategy::RestoreBackup => "Backup restore not implemented".to_string(),
                    other => format!("{other:?} recovery not implemented"),
                };
                Err(terminal(message, error))
            }
            RecoveryOutcome::ManualIntervention { message, error } => Err(terminal(message, error)),
        }
    }
}

fn terminal(message: String, cause: StorageError) -> StorageError {
    let context = cause.context().clone();
    let mut error = StorageError::new(ErrorKind::UnknownError, message, context.operation)
        .with_retry_count(context.retry_count)
        .with_strategy(RecoveryStrategy::None);
    if let Some(key) = context.key {
        error = error.with_key(key);
    }
    error.with_source(cause)
}

/// Default value returned by FALLBACK for a logical key.
pub fn default_fallback(key: Option<&str>) -> Value {
    match key {
        Some("lesson_plans" | "curriculum_data" | "performance_arts" | "offline_data"
        | "temp_drafts") => json!([]),
        Some("user_preferences" | "app_settings" | "accessibility_settings") => json!({}),
        _ => Value::Null,
    }
}

pub struct RecoveryEngine {
    defaults: RecoveryDefaults,
    capacity: usize,
    log: Mutex<VecDeque<ErrorRecord>>,
}

impl RecoveryEngine {
    pub fn new(defaults: RecoveryDefaults, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            defaults,
            capacity,
            log: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn defaults(&self) -> RecoveryDefaults {
        self.defaults
    }

    pub async fn handle_error<T, F, Fut>(
        &self,
        error: StorageError,
        target: &dyn RecoveryTarget,
        mut on_recovery: F,
    ) -> Result<RecoveryOutcome<T>, StorageError>
    where
        T: DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.record(&error);
        match error.strategy() {
            RecoveryStrategy::Retry => self.retry(error, &mut on_recovery).await,
            RecoveryStrategy::Fallback => self.fallback(error),
            RecoveryStrategy::ClearAndRetry => {
                self.clear_and_retry(error, target, &mut on_recovery).await
            }
            RecoveryStrategy::RestoreBackup => Ok(RecoveryOutcome::NotYetSupported {
                strategy: RecoveryStrategy::RestoreBackup,
                error,
            }),
            RecoveryStrategy::ManualIntervention => Ok(RecoveryOutcome::ManualIntervention {
                message: format!("Manual intervention required: {}", error.display_message()),
                error,
            }),
            RecoveryStrategy::None => Err(error),
        }
    }

    async fn retry<T, F, Fut>(
        &self,
        error: StorageError,
        on_recovery: &mut F,
    ) -> Result<RecoveryOutcome<T>, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_retries = error.recovery().max_retries.unwrap_or(self.defaults.max_retries);
        let base_delay = error
            .recovery()
            .retry_delay
            .unwrap_or(Duration::from_millis(self.defaults.retry_delay_ms));
        let first = error.context().retry_count;
        let mut attempt = first;
        let mut last = error;

        while attempt < max_retries {
            let delay = base_delay.saturating_mul(1u32 << attempt.min(16));
            info!(
                attempt = attempt + 1,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying storage operation"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            match on_recovery().await {
                Ok(value) => {
                    return Ok(RecoveryOutcome::Recovered {
                        value,
                        attempts: attempt - first,
                    })
                }
                Err(err) => {
                    let err = err.with_retry_count(attempt);
                    self.record(&err);
                    last = err;
                }
            }
        }

        let context = last.context().clone();
        let mut exhausted = StorageError::new(
            ErrorKind::UnknownError,
            "Max retry attempts exceeded",
            context.operation,
        )
        .with_retry_count(attempt)
        .with_strategy(RecoveryStrategy::None);
        if let Some(key) = context.key {
            exhausted = exhausted.with_key(key);
        }
        let exhausted = exhausted.with_source(last);
        self.record(&exhausted);
        Err(exhausted)
    }

    fn fallback<T>(&self, error: StorageError) -> Result<RecoveryOutcome<T>, StorageError>
    where
        T: DeserializeOwned,
    {
        let value = error
            .recovery()
            .fallback_value
            .clone()
            .unwrap_or_else(|| default_fallback(error.context().key.as_deref()));
        match serde_json::from_value(value) {
            Ok(value) => Ok(RecoveryOutcome::Fallback(value)),
            Err(e) => {
                let operation = error.context().operation.clone();
                Err(StorageError::new(
                    ErrorKind::ValidationError,
                    format!("fallback value does not fit the requested type: {e}"),
                    operation,
                )
                .with_strategy(RecoveryStrategy::None)
                .with_source(error))
            }
        }
    }

    async fn clear_and_retry<T, F, Fut>(
        &self,
        error: StorageError,
        target: &dyn RecoveryTarget,
        on_recovery: &mut F,
    ) -> Result<RecoveryOutcome<T>, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let cleared = match error.context().key.as_deref() {
            Some(key) => target.clear_key(key).await,
            None => target.clear_all().await,
        };
        if let Err(cause) = cleared {
            let clear_error = StorageError::new(
                ErrorKind::DeleteError,
                "Failed to clear storage for retry",
                error.context().operation.clone(),
            )
            .with_strategy(RecoveryStrategy::None)
            .with_source(cause);
            self.record(&clear_error);
            return Err(clear_error);
        }
        warn!(key = ?error.context().key, "cleared storage, retrying once");
        let value = on_recovery().await?;
        Ok(RecoveryOutcome::Recovered { value, attempts: 1 })
    }

    fn record(&self, error: &StorageError) {
        let record = error.report();
        match record.severity {
            Severity::Critical | Severity::High => error!(
                kind = %record.kind,
                operation = %record.context.operation,
                key = ?record.context.key,
                "{}",
                record.message
            ),
            Severity::Medium => warn!(
                kind = %record.kind,
                operation = %record.context.operation,
                key = ?record.context.key,
                "{}",
                record.message
            ),
            Severity::Low => info!(
                kind = %record.kind,
                operation = %record.context.operation,
                key = ?record.context.key,
                "{}",
                record.message
            ),
        }
        let mut log = self.log.lock();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// Handled errors, oldest first.
    pub fn error_log(&self) -> Vec<ErrorRecord> {
        self.log.lock().iter().cloned().collect()
    }

    pub fn clear_error_log(&self) {
        self.log.lock().clear();
    }
}
