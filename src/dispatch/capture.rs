//! Passive-capture port.
//!
//! Some operations are fingerprint-blocked for direct requests and only
//! work when a real browser navigates the page while we intercept the
//! matching network response. The browser automation itself lives behind
//! this port; the dispatcher only decides *when* to start a new query
//! versus trigger the next page of the current one.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CrawlResult;

/// Upper bound a capture implementation may spend waiting for the
/// intercepted response.
pub const CAPTURE_WAIT: Duration = Duration::from_secs(15);
/// Poll interval while waiting for the intercepted response.
pub const CAPTURE_POLL: Duration = Duration::from_millis(500);

/// Browser-mediated page capture.
///
/// Implementations are stateful on the current query: a repeated
/// `start_new_query` with the same query string should be reinterpreted
/// as `continue_query`. Both capture methods are expected to poll for
/// the intercepted response every [`CAPTURE_POLL`] and fail with a
/// timeout error once [`CAPTURE_WAIT`] has elapsed, so the dispatcher's
/// own retry budget stays meaningful.
#[async_trait]
pub trait PageCapture: Send + Sync {
    /// Navigate to a fresh query and capture the first response.
    async fn start_new_query(&self, query: &str) -> CrawlResult<Value>;

    /// Trigger the in-page "load more" action for the current query and
    /// capture the next response.
    async fn continue_query(&self) -> CrawlResult<Value>;

    /// Tear down and relaunch the capture subsystem after a crash.
    async fn restart(&self) -> CrawlResult<()>;
}
