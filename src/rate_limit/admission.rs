//! Fixed-window admission counter shared across workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::cancel::CancelFlag;

/// Interval between slot polls in `wait_for_slot`.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Storage backend for the admission counter.
///
/// Implementations must make the check-and-increment atomic across
/// concurrent callers; two workers observing the same pre-increment count
/// would both be admitted past the cap otherwise.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Count one request against `key`'s window; true if within `max_requests`.
    async fn try_acquire(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> anyhow::Result<bool>;
}

/// In-process backend: a mutex-guarded map of window counters.
/// The default when no shared counter store is configured.
#[derive(Debug, Default)]
pub struct MemoryAdmission {
    windows: Mutex<HashMap<String, (DateTime<Utc>, u64)>>,
}

impl MemoryAdmission {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdmissionBackend for MemoryAdmission {
    async fn try_acquire(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(key.to_string()).or_insert((now, 0));

        let window_age = (now - entry.0).to_std().unwrap_or(Duration::ZERO);
        if window_age >= window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        Ok(entry.1 <= max_requests)
    }
}

/// Admission control over a pluggable backend. Advisory: infrastructure
/// errors log a warning and admit the request rather than stalling the
/// crawl.
#[derive(Clone)]
pub struct AdmissionControl {
    backend: Arc<dyn AdmissionBackend>,
}

impl AdmissionControl {
    pub fn new(backend: Arc<dyn AdmissionBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAdmission::new()))
    }

    /// One admission check; fail-open on backend errors.
    pub async fn try_acquire(&self, key: &str, max_requests: u64, window: Duration) -> bool {
        match self.backend.try_acquire(key, max_requests, window).await {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!("admission backend error for {}, failing open: {}", key, e);
                true
            }
        }
    }

    /// Poll for a slot every second until `timeout` or cancellation.
    /// Returns false if no slot opened in time.
    pub async fn wait_for_slot(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
        timeout: Duration,
        cancel: &CancelFlag,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.try_acquire(key, max_requests, window).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            if !cancel.sleep(POLL_INTERVAL).await {
                return false;
            }
        }
    }
}
