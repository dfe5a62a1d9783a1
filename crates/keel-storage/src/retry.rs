use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use keel_types::blob::{BlobMetadata, PutOptions};
use keel_types::error::Result;

use crate::StorageBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Base delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(20) as u32;
        let ms = self
            .retry_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    /// `backoff` plus up to 100% random jitter.
    pub fn backoff_with_jitter(&self, attempt: usize) -> Duration {
        let base = self.backoff(attempt);
        let jitter = rand::random::<u64>() % (base.as_millis() as u64).max(1);
        base + Duration::from_millis(jitter)
    }
}

/// Run `f`, retrying transient errors with exponential backoff and jitter.
/// Permanent errors are returned immediately.
pub fn retry_op<T>(
    config: &RetryConfig,
    op_name: &str,
    label: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                warn!(
                    "{label} {op_name}: transient error (attempt {attempt}/{}), retrying: {e}",
                    config.max_retries,
                );
                std::thread::sleep(config.backoff_with_jitter(attempt));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wraps a backend so every idempotent operation is retried on transient errors.
pub struct RetryingBackend<B> {
    inner: B,
    config: RetryConfig,
}

impl<B: StorageBackend> RetryingBackend<B> {
    pub fn new(inner: B, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn retry<T>(&self, op: &str, f: impl FnMut() -> Result<T>) -> Result<T> {
        retry_op(&self.config, op, &self.inner.describe(), f)
    }
}

impl<B: StorageBackend> StorageBackend for RetryingBackend<B> {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.retry("get", || self.inner.get(id))
    }

    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.retry("get_range", || self.inner.get_range(id, offset, length))
    }

    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        self.retry("put", || self.inner.put(id, data))
    }

    fn put_with_options(&self, id: &str, data: &[u8], opts: &PutOptions) -> Result<()> {
        self.retry("put", || self.inner.put_with_options(id, data, opts))
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.retry("delete", || self.inner.delete(id))
    }

    fn exists(&self, id: &str) -> Result<bool> {
        self.retry("exists", || self.inner.exists(id))
    }

    fn list_blobs(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        // Buffer the listing so a retried attempt never replays entries
        // into the caller's callback.
        let entries = self.retry("list", || self.inner.list(prefix))?;
        for bm in entries {
            callback(bm)?;
        }
        Ok(())
    }

    fn get_metadata(&self, id: &str) -> Result<Option<BlobMetadata>> {
        self.retry("get_metadata", || self.inner.get_metadata(id))
    }

    fn extend_retention(&self, id: &str, opts: &PutOptions) -> Result<()> {
        self.retry("extend_retention", || self.inner.extend_retention(id, opts))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn describe(&self) -> String {
        format!("retrying({})", self.inner.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::error::KeelError;

    fn fast_config(max_retries: usize) -> RetryConfig {
        RetryConfig {
            max_retries,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let cfg = RetryConfig {
            max_retries: 5,
            retry_delay_ms: 100,
            retry_max_delay_ms: 350,
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(350));
        assert_eq!(cfg.backoff(60), Duration::from_millis(350));
    }

    #[test]
    fn transient_errors_are_retried() {
        let mut calls = 0;
        let result = retry_op(&fast_config(3), "get", "test", || {
            calls += 1;
            if calls < 3 {
                Err(KeelError::backend("get", "503"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = retry_op(&fast_config(3), "get", "test", || {
            calls += 1;
            Err(KeelError::Corruption("bad".into()))
        });
        assert!(result.unwrap_err().is_corruption());
        assert_eq!(calls, 1);
    }

    #[test]
    fn gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<()> = retry_op(&fast_config(2), "put", "test", || {
            calls += 1;
            Err(KeelError::backend("put", "timeout"))
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 3);
    }
}
