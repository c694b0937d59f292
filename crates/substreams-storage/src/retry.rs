//! Exponential-backoff retry around any object store.

use std::time::Duration;

use tracing::warn;

use crate::error::StorageResult;
use crate::store::ObjectStore;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Run `op`, retrying transient failures only.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(%what, attempt, error = %e, "transient storage failure, retrying");
                    std::thread::sleep(backoff);
                    backoff *= self.multiplier;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Wraps a store so every call goes through a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ObjectStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        self.policy.run(path, || self.inner.write(path, data))
    }

    fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.policy.run(path, || self.inner.read(path))
    }

    fn exists(&self, path: &str) -> StorageResult<bool> {
        self.policy.run(path, || self.inner.exists(path))
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.policy.run(prefix, || self.inner.list(prefix))
    }

    fn delete(&self, path: &str) -> StorageResult<bool> {
        self.policy.run(path, || self.inner.delete(path))
    }
}
