//! End-to-end pagination scenarios against a scripted upstream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use feedquarry::dispatch::{Operation, Upstream};
use feedquarry::error::{CrawlError, CrawlResult};
use feedquarry::models::{CrawlRequest, CrawlTarget, QueryVars, Terminal};
use feedquarry::observer::RecordingObserver;
use feedquarry::pools::{PoolPolicy, Proxy, ProxyPool, Session, SessionPool};
use feedquarry::{EnginePolicy, PaginationEngine};

/// One recorded upstream call.
#[derive(Debug, Clone)]
struct Call {
    op: Operation,
    session: String,
    cursor: Option<String>,
    until: Option<DateTime<Utc>>,
}

/// Scripted upstream keyed by operation and cursor. Sessions listed in
/// `reject_sessions` always get an auth error.
#[derive(Default)]
struct FakeUpstream {
    feed_pages: HashMap<String, Value>,
    search_pages: HashMap<String, Value>,
    reject_sessions: HashSet<String>,
    calls: Mutex<Vec<Call>>,
}

impl FakeUpstream {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

fn cursor_key(cursor: Option<&str>) -> String {
    cursor.unwrap_or("start").to_string()
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn fetch(
        &self,
        op: Operation,
        vars: &QueryVars,
        cursor: Option<&str>,
        session: &Session,
        _proxy: Option<&Proxy>,
    ) -> CrawlResult<Value> {
        self.calls.lock().unwrap().push(Call {
            op,
            session: session.id.clone(),
            cursor: cursor.map(str::to_string),
            until: vars.until,
        });

        if self.reject_sessions.contains(&session.id) {
            return Err(CrawlError::Auth {
                status: 403,
                message: "session banned".into(),
            });
        }

        let pages = match op {
            Operation::FeedPage => &self.feed_pages,
            Operation::SearchPage => &self.search_pages,
        };
        pages
            .get(&cursor_key(cursor))
            .cloned()
            .ok_or_else(|| CrawlError::NotFound(format!("no page at {:?}", cursor)))
    }
}

/// A page payload with sequential ids `prefix{start}..prefix{start+count}`.
fn page(prefix: &str, start: usize, count: usize, next: Option<&str>) -> Value {
    let items: Vec<Value> = (start..start + count)
        .map(|i| json!({"id": format!("{prefix}{i}"), "created_at": 1_700_000_000 - i as i64 * 60}))
        .collect();
    match next {
        Some(next) => json!({"items": items, "next_cursor": next}),
        None => json!({"items": items}),
    }
}

fn empty_page(next: Option<&str>) -> Value {
    match next {
        Some(next) => json!({"items": [], "next_cursor": next}),
        None => json!({"items": []}),
    }
}

async fn pool_of(ids: &[&str]) -> Arc<SessionPool> {
    let pool = SessionPool::new(PoolPolicy {
        max_error_count: 100,
        max_consecutive_failures: 100,
    });
    for id in ids {
        pool.insert(
            id.to_string(),
            HashMap::from([("sid".into(), "tok".into())]),
            None,
        )
        .await;
    }
    Arc::new(pool)
}

fn engine(sessions: Arc<SessionPool>, upstream: Arc<FakeUpstream>, policy: EnginePolicy) -> PaginationEngine {
    PaginationEngine::new(
        sessions,
        Arc::new(ProxyPool::new(PoolPolicy::default())),
        upstream,
        policy,
    )
}

fn feed_request(limit: usize) -> CrawlRequest {
    CrawlRequest::new(CrawlTarget::parse("u/alice").unwrap(), limit)
}

/// Eight full pages of 50, then the upstream stalls at the same cursor.
/// Three distinct sessions must confirm the stall before the run ends as
/// exhausted, with every collected item intact.
#[tokio::test]
async fn stalled_cursor_is_confirmed_across_sessions_before_exhaustion() {
    let mut upstream = FakeUpstream::default();
    let mut cursor = "start".to_string();
    for page_no in 0..8 {
        let next = format!("c{}", page_no + 1);
        upstream
            .feed_pages
            .insert(cursor.clone(), page("i", page_no * 50, 50, Some(&next)));
        cursor = next;
    }
    // The terminal page repeats its own cursor and has nothing in it.
    upstream
        .feed_pages
        .insert(cursor.clone(), empty_page(Some(&cursor)));
    let upstream = Arc::new(upstream);

    let sessions = pool_of(&["s1", "s2", "s3"]).await;
    let observer = Arc::new(RecordingObserver::new());
    let engine = engine(sessions, upstream.clone(), EnginePolicy::default())
        .with_observer(observer.clone());

    let outcome = engine.run(&feed_request(800)).await;

    assert_eq!(outcome.terminal, Terminal::Exhausted);
    assert!(outcome.is_success());
    assert_eq!(outcome.items.len(), 400);
    assert_eq!(outcome.sessions_used, vec!["s1", "s2", "s3"]);
    assert!(!outcome.used_fallback);
    // Two rotations: s1 -> s2 -> s3, both for empty-page confirmation.
    assert_eq!(observer.rotation_count(), 2);
}

#[tokio::test]
async fn overlapping_pages_deduplicate() {
    let mut upstream = FakeUpstream::default();
    upstream
        .feed_pages
        .insert("start".into(), page("i", 0, 10, Some("c1")));
    // The second page re-serves the last five items of the first.
    upstream
        .feed_pages
        .insert("c1".into(), page("i", 5, 10, Some("c2")));
    upstream.feed_pages.insert("c2".into(), empty_page(None));
    let upstream = Arc::new(upstream);

    let sessions = pool_of(&["s1", "s2", "s3"]).await;
    let engine = engine(sessions, upstream, EnginePolicy::default());

    let outcome = engine.run(&feed_request(100)).await;
    assert_eq!(outcome.items.len(), 15);
    let unique: HashSet<&str> = outcome.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(unique.len(), 15);
}

#[tokio::test]
async fn auth_failure_rotates_and_continues_from_same_cursor() {
    let mut upstream = FakeUpstream::default();
    upstream
        .feed_pages
        .insert("start".into(), page("i", 0, 10, Some("c1")));
    upstream.feed_pages.insert("c1".into(), page("i", 10, 10, None));
    upstream.reject_sessions.insert("s1".into());
    let upstream = Arc::new(upstream);

    let sessions = pool_of(&["s1", "s2"]).await;
    let observer = Arc::new(RecordingObserver::new());
    let engine = engine(sessions, upstream.clone(), EnginePolicy::default())
        .with_observer(observer.clone());

    let outcome = engine.run(&feed_request(20)).await;

    assert_eq!(outcome.terminal, Terminal::Completed);
    assert_eq!(outcome.items.len(), 20);
    assert_eq!(outcome.sessions_used, vec!["s1", "s2"]);
    assert_eq!(observer.rotation_count(), 1);

    // The cursor that failed under s1 was retried as-is under s2.
    let calls = upstream.calls();
    assert_eq!(calls[0].session, "s1");
    assert_eq!(calls[0].cursor, None);
    assert_eq!(calls[1].session, "s2");
    assert_eq!(calls[1].cursor, None);
}

#[tokio::test]
async fn rotation_disabled_fails_instead_of_rotating() {
    let mut upstream = FakeUpstream::default();
    upstream.reject_sessions.insert("s1".into());
    let upstream = Arc::new(upstream);

    let sessions = pool_of(&["s1", "s2"]).await;
    let engine = engine(sessions, upstream, EnginePolicy::default());

    let mut request = feed_request(20);
    request.preferred_session = Some("s1".into());
    request.rotation_enabled = false;

    let outcome = engine.run(&request).await;
    assert_eq!(outcome.terminal, Terminal::Failed);
    assert!(matches!(outcome.error, Some(CrawlError::Auth { .. })));
    assert_eq!(outcome.sessions_used, vec!["s1"]);
}

/// Once enough items are collected, a stalled feed cursor flips the run to
/// search-backed fallback, anchored at the oldest collected timestamp, and
/// pagination keeps going.
#[tokio::test]
async fn deep_stall_switches_to_fallback_and_keeps_collecting() {
    let mut upstream = FakeUpstream::default();
    upstream
        .feed_pages
        .insert("start".into(), page("i", 0, 10, Some("c1")));
    // Items arrived but the cursor refuses to move: a depth limit, not
    // exhaustion.
    upstream
        .feed_pages
        .insert("c1".into(), page("i", 10, 10, Some("c1")));
    upstream
        .search_pages
        .insert("start".into(), page("f", 0, 5, Some("f1")));
    upstream.search_pages.insert("f1".into(), empty_page(None));
    let upstream = Arc::new(upstream);

    let sessions = pool_of(&["s1"]).await;
    let policy = EnginePolicy {
        fallback_min_items: 10,
        fallback_min_sessions: 1,
        ..Default::default()
    };
    let engine = engine(sessions, upstream.clone(), policy);

    let outcome = engine.run(&feed_request(100)).await;

    assert_eq!(outcome.terminal, Terminal::Exhausted);
    assert!(outcome.used_fallback);
    assert_eq!(outcome.items.len(), 25);

    let calls = upstream.calls();
    let search_calls: Vec<&Call> = calls
        .iter()
        .filter(|c| c.op == Operation::SearchPage)
        .collect();
    assert!(!search_calls.is_empty());
    // Fallback starts from a fresh cursor, narrowed to the oldest item
    // already collected.
    assert_eq!(search_calls[0].cursor, None);
    let oldest = Utc.timestamp_opt(1_700_000_000 - 19 * 60, 0).single();
    assert_eq!(search_calls[0].until, oldest);
}

#[tokio::test]
async fn stop_at_id_completes_mid_page() {
    let mut upstream = FakeUpstream::default();
    upstream
        .feed_pages
        .insert("start".into(), page("i", 0, 10, Some("c1")));
    upstream.feed_pages.insert("c1".into(), page("i", 10, 10, None));
    let upstream = Arc::new(upstream);

    let sessions = pool_of(&["s1"]).await;
    let engine = engine(sessions, upstream, EnginePolicy::default());

    let mut request = feed_request(100);
    request.stop_at_id = Some("i12".into());

    let outcome = engine.run(&request).await;
    assert_eq!(outcome.terminal, Terminal::Completed);
    assert_eq!(outcome.items.len(), 13);
    assert_eq!(outcome.items.last().map(|i| i.id.as_str()), Some("i12"));
}

#[tokio::test]
async fn terminal_error_salvages_partial_items() {
    let mut upstream = FakeUpstream::default();
    upstream
        .feed_pages
        .insert("start".into(), page("i", 0, 10, Some("c1")));
    // No page scripted at c1: the double returns not-found, which is
    // terminal for the target.
    let upstream = Arc::new(upstream);

    let sessions = pool_of(&["s1", "s2"]).await;
    let engine = engine(sessions, upstream, EnginePolicy::default());

    let outcome = engine.run(&feed_request(100)).await;
    assert_eq!(outcome.terminal, Terminal::Failed);
    assert!(matches!(outcome.error, Some(CrawlError::NotFound(_))));
    assert_eq!(outcome.items.len(), 10);
}

#[tokio::test]
async fn cancellation_stops_before_any_fetch() {
    let upstream = Arc::new(FakeUpstream::default());
    let sessions = pool_of(&["s1"]).await;
    let engine = engine(sessions, upstream.clone(), EnginePolicy::default());

    engine.cancel_flag().cancel();
    let outcome = engine.run(&feed_request(100)).await;

    assert_eq!(outcome.terminal, Terminal::Stopped);
    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn empty_pool_fails_with_config_error() {
    let upstream = Arc::new(FakeUpstream::default());
    let sessions = pool_of(&[]).await;
    let engine = engine(sessions, upstream, EnginePolicy::default());

    let outcome = engine.run(&feed_request(10)).await;
    assert_eq!(outcome.terminal, Terminal::Failed);
    assert!(matches!(outcome.error, Some(CrawlError::Config(_))));
}
