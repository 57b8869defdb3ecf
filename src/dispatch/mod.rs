//! Request dispatch: one logical upstream operation per call, routed over
//! direct transport or passive capture, with bounded retry.

pub mod capture;
pub mod user_agent;

pub use capture::{PageCapture, CAPTURE_POLL, CAPTURE_WAIT};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cancel::CancelFlag;
use crate::error::{CrawlError, CrawlResult};
use crate::models::QueryVars;
use crate::pools::{Proxy, ProxyPool, Session};
use crate::rate_limit::{AdaptiveLimiter, AdmissionControl};

/// Logical upstream operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Cursor pagination over a user's feed.
    FeedPage,
    /// Cursor pagination over search results; also the fallback-mode
    /// operation for date-anchored queries.
    SearchPage,
}

impl Operation {
    /// Rate limit key for this operation.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Operation::FeedPage => "feed",
            Operation::SearchPage => "search",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Operation::FeedPage => "api/feed",
            Operation::SearchPage => "api/search",
        }
    }
}

/// Dispatcher knobs, including which operations must go through capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub base_url: String,
    /// Operations that are fingerprint-blocked for direct requests.
    pub capture_operations: Vec<Operation>,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    /// Fixed-window admission cap shared by all workers.
    pub admission_max_requests: u64,
    pub admission_window_ms: u64,
    pub admission_wait_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.com".into(),
            capture_operations: vec![Operation::SearchPage],
            request_timeout_ms: 30_000,
            max_attempts: 3,
            initial_backoff_ms: 1_500,
            admission_max_requests: 60,
            admission_window_ms: 60_000,
            admission_wait_timeout_ms: 120_000,
        }
    }
}

/// One logical upstream fetch; the engine's only view of the network.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(
        &self,
        op: Operation,
        vars: &QueryVars,
        cursor: Option<&str>,
        session: &Session,
        proxy: Option<&Proxy>,
    ) -> CrawlResult<Value>;
}

/// Production dispatcher: admission-gated, header-throttled, retrying.
pub struct RequestDispatcher {
    config: DispatchConfig,
    admission: AdmissionControl,
    adaptive: AdaptiveLimiter,
    proxies: Arc<ProxyPool>,
    capture: Option<Arc<dyn PageCapture>>,
    /// Query currently loaded in the capture subsystem.
    capture_query: Mutex<Option<String>>,
    /// Clients cached per session/proxy pair; cookie jar and UA are
    /// session-scoped so clients cannot be shared across identities.
    clients: Mutex<HashMap<String, Client>>,
    cancel: CancelFlag,
}

impl RequestDispatcher {
    pub fn new(
        config: DispatchConfig,
        admission: AdmissionControl,
        adaptive: AdaptiveLimiter,
        proxies: Arc<ProxyPool>,
        capture: Option<Arc<dyn PageCapture>>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            config,
            admission,
            adaptive,
            proxies,
            capture,
            capture_query: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    fn uses_capture(&self, op: Operation) -> bool {
        self.config.capture_operations.contains(&op)
    }

    async fn client_for(&self, session: &Session, proxy: Option<&Proxy>) -> CrawlResult<Client> {
        let key = format!(
            "{}|{}",
            session.id,
            proxy.map(|p| p.id.as_str()).unwrap_or("direct")
        );
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .user_agent(&session.user_agent)
            .timeout(Duration::from_millis(self.config.request_timeout_ms));
        if let Some(proxy) = proxy {
            let reqwest_proxy = reqwest::Proxy::all(proxy.url())
                .map_err(|e| CrawlError::Config(format!("invalid proxy {}: {}", proxy.id, e)))?;
            builder = builder.proxy(reqwest_proxy);
        }
        let client = builder
            .build()
            .map_err(|e| CrawlError::Config(format!("failed to build HTTP client: {e}")))?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Route a capture-mode operation: new navigation for a new query,
    /// in-page continuation when the query is already loaded and we hold
    /// a cursor into it.
    async fn fetch_via_capture(&self, vars: &QueryVars, cursor: Option<&str>) -> CrawlResult<Value> {
        let capture = self.capture.as_ref().ok_or_else(|| {
            CrawlError::Config("operation requires capture mode but no capture subsystem is configured".into())
        })?;

        let query = vars.rendered();
        let mut current = self.capture_query.lock().await;
        let same_query = current.as_deref() == Some(query.as_str());

        let result = if cursor.is_some() && same_query {
            debug!("capture: continuing current query");
            capture.continue_query().await
        } else {
            debug!("capture: starting new query: {}", query);
            capture.start_new_query(&query).await
        };

        if result.is_ok() {
            *current = Some(query);
        }
        result
    }

    async fn fetch_direct(
        &self,
        op: Operation,
        vars: &QueryVars,
        cursor: Option<&str>,
        session: &Session,
        proxy: Option<&Proxy>,
    ) -> CrawlResult<Value> {
        let client = self.client_for(session, proxy).await?;
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), op.path());

        let mut request = client
            .get(&url)
            .header("Cookie", session.cookie_header())
            .query(&[("q", vars.rendered())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                // Timeouts and refused connections while a proxy is bound
                // are proxy-attributable; report before the next call so
                // the pool can retire and rebind.
                if let Some(proxy) = proxy {
                    if err.is_timeout() || err.is_connect() {
                        self.proxies
                            .mark_bad(&proxy.id, "transport failure through proxy")
                            .await;
                    }
                }
                return Err(CrawlError::from_transport(&err));
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        self.record_quota_headers(op, &headers).await;

        if status.is_success() {
            if let Some(proxy) = proxy {
                self.proxies.mark_good(&proxy.id).await;
            }
            return response
                .json::<Value>()
                .await
                .map_err(|e| CrawlError::DataExtraction(format!("invalid JSON body: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body, retry_after_secs(&headers)))
    }

    /// Persist the upstream's self-reported quota from response headers.
    async fn record_quota_headers(&self, op: Operation, headers: &reqwest::header::HeaderMap) {
        let get_u64 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        };
        let (Some(remaining), Some(reset), Some(limit)) = (
            get_u64("x-rate-limit-remaining"),
            get_u64("x-rate-limit-reset"),
            get_u64("x-rate-limit-limit"),
        ) else {
            return;
        };
        let Some(reset_at) = Utc.timestamp_opt(reset as i64, 0).single() else {
            return;
        };
        self.adaptive
            .update_from_headers(op.endpoint(), remaining, reset_at, limit)
            .await;
    }

    async fn attempt(
        &self,
        op: Operation,
        vars: &QueryVars,
        cursor: Option<&str>,
        session: &Session,
        proxy: Option<&Proxy>,
    ) -> CrawlResult<Value> {
        // Admission first, then the header-driven self-throttle. Both are
        // advisory: a saturated window logs and proceeds rather than
        // wedging the worker.
        let admitted = self
            .admission
            .wait_for_slot(
                op.endpoint(),
                self.config.admission_max_requests,
                Duration::from_millis(self.config.admission_window_ms),
                Duration::from_millis(self.config.admission_wait_timeout_ms),
                &self.cancel,
            )
            .await;
        if !admitted {
            warn!(
                "no admission slot for {} within timeout, proceeding anyway",
                op.endpoint()
            );
        }

        let delay = self.adaptive.delay_for(op.endpoint()).await;
        if !self.cancel.sleep(delay).await {
            return Err(CrawlError::Network("cancelled during throttle delay".into()));
        }

        if self.uses_capture(op) {
            self.fetch_via_capture(vars, cursor).await
        } else {
            self.fetch_direct(op, vars, cursor, session, proxy).await
        }
    }
}

#[async_trait]
impl Upstream for RequestDispatcher {
    async fn fetch(
        &self,
        op: Operation,
        vars: &QueryVars,
        cursor: Option<&str>,
        session: &Session,
        proxy: Option<&Proxy>,
    ) -> CrawlResult<Value> {
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(op, vars, cursor, session, proxy).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if matches!(err, CrawlError::BrowserCrashed(_)) {
                        if let Some(capture) = &self.capture {
                            warn!("capture subsystem crashed, restarting: {}", err);
                            if let Err(restart_err) = capture.restart().await {
                                warn!("capture restart failed: {}", restart_err);
                            }
                        }
                    }

                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.config.max_attempts {
                        return Err(err);
                    }

                    let backoff = Duration::from_millis(
                        self.config.initial_backoff_ms * 2u64.pow(attempt - 1),
                    );
                    debug!(
                        "attempt {}/{} for {} failed ({}), backing off {:?}",
                        attempt,
                        self.config.max_attempts,
                        op.endpoint(),
                        err,
                        backoff
                    );
                    if !self.cancel.sleep(backoff).await {
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// Map a non-success HTTP status to the error taxonomy.
fn classify_status(status: StatusCode, body: &str, retry_after_secs: Option<u64>) -> CrawlError {
    match status.as_u16() {
        429 => CrawlError::RateLimit { retry_after_secs },
        401 | 403 => CrawlError::Auth {
            status: status.as_u16(),
            message: truncate(body, 200),
        },
        404 => CrawlError::NotFound(truncate(body, 200)),
        _ => CrawlError::Upstream {
            status: status.as_u16(),
            body: truncate(body, 200),
        },
    }
}

fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // Back off to a char boundary; slicing mid-codepoint panics.
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pools::PoolPolicy;
    use crate::rate_limit::RateLimitConfig;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct ScriptedCapture {
        calls: StdMutex<Vec<String>>,
        crash_next: StdMutex<bool>,
    }

    #[async_trait]
    impl PageCapture for ScriptedCapture {
        async fn start_new_query(&self, query: &str) -> CrawlResult<Value> {
            if std::mem::take(&mut *self.crash_next.lock().unwrap()) {
                return Err(CrawlError::BrowserCrashed("tab died".into()));
            }
            self.calls.lock().unwrap().push(format!("start:{query}"));
            Ok(json!({"items": [], "next_cursor": "c1"}))
        }

        async fn continue_query(&self) -> CrawlResult<Value> {
            self.calls.lock().unwrap().push("continue".into());
            Ok(json!({"items": [], "next_cursor": "c2"}))
        }

        async fn restart(&self) -> CrawlResult<()> {
            self.calls.lock().unwrap().push("restart".into());
            Ok(())
        }
    }

    fn session(id: &str) -> Session {
        Session {
            id: id.into(),
            cookies: HashMap::from([("sid".into(), "tok".into())]),
            display_name: None,
            user_agent: "test-agent".into(),
            usage_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            retired: false,
        }
    }

    fn dispatcher(capture: Arc<ScriptedCapture>) -> RequestDispatcher {
        let config = DispatchConfig {
            initial_backoff_ms: 1,
            ..Default::default()
        };
        RequestDispatcher::new(
            config,
            AdmissionControl::in_memory(),
            AdaptiveLimiter::new(RateLimitConfig {
                default_delay_ms: 0,
                ..Default::default()
            }),
            Arc::new(ProxyPool::new(PoolPolicy::default())),
            Some(capture as Arc<dyn PageCapture>),
            CancelFlag::new(),
        )
    }

    fn vars(query: &str) -> QueryVars {
        QueryVars {
            query: query.into(),
            since: None,
            until: None,
        }
    }

    #[tokio::test]
    async fn new_query_starts_then_cursor_continues() {
        let capture = Arc::new(ScriptedCapture::default());
        let d = dispatcher(capture.clone());
        let s = session("a");

        d.fetch(Operation::SearchPage, &vars("rust"), None, &s, None)
            .await
            .unwrap();
        d.fetch(Operation::SearchPage, &vars("rust"), Some("c1"), &s, None)
            .await
            .unwrap();

        let calls = capture.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["start:rust", "continue"]);
    }

    #[tokio::test]
    async fn changed_query_starts_fresh_even_with_cursor() {
        let capture = Arc::new(ScriptedCapture::default());
        let d = dispatcher(capture.clone());
        let s = session("a");

        d.fetch(Operation::SearchPage, &vars("rust"), None, &s, None)
            .await
            .unwrap();
        d.fetch(Operation::SearchPage, &vars("tokio"), Some("c1"), &s, None)
            .await
            .unwrap();

        let calls = capture.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["start:rust", "start:tokio"]);
    }

    #[tokio::test]
    async fn browser_crash_restarts_and_retries() {
        let capture = Arc::new(ScriptedCapture::default());
        *capture.crash_next.lock().unwrap() = true;
        let d = dispatcher(capture.clone());
        let s = session("a");

        d.fetch(Operation::SearchPage, &vars("rust"), None, &s, None)
            .await
            .unwrap();

        let calls = capture.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["restart", "start:rust"]);
    }

    #[tokio::test]
    async fn capture_op_without_capture_is_a_config_error() {
        let config = DispatchConfig {
            ..Default::default()
        };
        let d = RequestDispatcher::new(
            config,
            AdmissionControl::in_memory(),
            AdaptiveLimiter::new(RateLimitConfig {
                default_delay_ms: 0,
                ..Default::default()
            }),
            Arc::new(ProxyPool::new(PoolPolicy::default())),
            None,
            CancelFlag::new(),
        );
        let err = d
            .fetch(Operation::SearchPage, &vars("rust"), None, &session("a"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Config(_)));
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "", Some(30)),
            CrawlError::RateLimit {
                retry_after_secs: Some(30)
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "expired", None),
            CrawlError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "", None),
            CrawlError::NotFound(_)
        ));
        let server = classify_status(StatusCode::BAD_GATEWAY, "", None);
        assert!(server.is_retryable());
        let client = classify_status(StatusCode::BAD_REQUEST, "", None);
        assert!(!client.is_retryable());
    }

    #[test]
    fn long_multibyte_bodies_classify_without_panicking() {
        // Anti-bot interstitials come back as HTML full of multibyte
        // punctuation; truncation must not split a codepoint.
        let body = "™".repeat(100);
        match classify_status(StatusCode::BAD_REQUEST, &body, None) {
            CrawlError::Upstream { status: 400, body } => {
                assert!(body.ends_with("..."));
                assert!(body.len() <= 203);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
