//! The pagination engine: one continuous fetch-accumulate-advance loop
//! per crawl target.
//!
//! This is a state machine over four interacting axes: cursor position,
//! session health, proxy health, and fetch mode. The loop recovers
//! everything retryable locally (rotation, mode switching, bounded empty
//! retries) and surfaces only target-level terminal outcomes, always with
//! whatever was collected so far.

mod chunks;
mod state;

pub use chunks::{ChunkOrchestrator, ChunkPolicy};
pub use state::{CursorState, FetchMode, RunState};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::checkpoint::{Checkpoint, CheckpointSink, NullCheckpointSink};
use crate::dispatch::{Operation, Upstream};
use crate::error::CrawlError;
use crate::extract::{ItemExtractor, JsonItemExtractor};
use crate::models::{CrawlRequest, CrawlTarget, QueryVars, RunOutcome, Terminal};
use crate::observer::{CrawlEvent, CrawlObserver, NullObserver};
use crate::pools::{Proxy, ProxyPool, Session, SessionPool};

/// Pause between generic-error retries that do not rotate. The dispatcher
/// already did its own backoff by the time an error reaches the engine.
const ERROR_PAUSE: Duration = Duration::from_millis(500);

/// Heuristic thresholds for the fetch loop.
///
/// "Zero items plus an unchanged cursor" is the only exhaustion signal the
/// upstream gives us, and it is ambiguous with session-specific visibility
/// gaps and transient glitches. These knobs are tunable policy, not
/// protocol truth; the defaults are deliberately small because over-
/// retrying wastes quota and under-retrying loses data behind one flaky
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginePolicy {
    /// Empty responses tolerated on one session before rotating.
    pub empty_retries_per_session: u32,
    /// Distinct sessions that must confirm emptiness at the same cursor
    /// before the stream is declared exhausted.
    pub exhaustion_confirmations: usize,
    /// Hard cap on consecutive empty responses regardless of rotation.
    pub max_consecutive_empty: u32,
    /// Distinct sessions that must have been tried before an empty page
    /// may trigger the fallback switch.
    pub fallback_min_sessions: usize,
    /// Items that must already be collected before the fallback switch is
    /// worth attempting; below this, apparent stalls are treated as
    /// exhaustion rather than a depth limit.
    pub fallback_min_items: usize,
    /// Generic errors in a row before forcing a session rotation.
    pub max_consecutive_errors: u32,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            empty_retries_per_session: 2,
            exhaustion_confirmations: 3,
            max_consecutive_empty: 5,
            fallback_min_sessions: 2,
            fallback_min_items: 500,
            max_consecutive_errors: 3,
        }
    }
}

/// Drives pagination for one target at a time. Clone-cheap dependencies
/// are shared; run state never is.
pub struct PaginationEngine {
    sessions: Arc<SessionPool>,
    proxies: Arc<ProxyPool>,
    upstream: Arc<dyn Upstream>,
    extractor: Arc<dyn ItemExtractor>,
    checkpoint: Arc<dyn CheckpointSink>,
    observer: Arc<dyn CrawlObserver>,
    policy: EnginePolicy,
    cancel: CancelFlag,
}

impl PaginationEngine {
    pub fn new(
        sessions: Arc<SessionPool>,
        proxies: Arc<ProxyPool>,
        upstream: Arc<dyn Upstream>,
        policy: EnginePolicy,
    ) -> Self {
        Self {
            sessions,
            proxies,
            upstream,
            extractor: Arc::new(JsonItemExtractor),
            checkpoint: Arc::new(NullCheckpointSink),
            observer: Arc::new(NullObserver),
            policy,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ItemExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_checkpoint(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint = sink;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CrawlObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run pagination until the budget is met or a terminal state is
    /// reached. Items collected before any failure are always returned.
    pub async fn run(&self, request: &CrawlRequest) -> RunOutcome {
        let run_id = Uuid::new_v4().to_string();
        let mut state = RunState::new();

        if let Err(err) = request.validate() {
            return self.finish(run_id, state, Terminal::Failed, Some(err));
        }

        let mut session = match self
            .sessions
            .select_next(request.preferred_session.as_deref(), None)
            .await
        {
            Some(session) => session,
            None => {
                return self.finish(
                    run_id,
                    state,
                    Terminal::Failed,
                    Some(CrawlError::Config("no active sessions available".into())),
                );
            }
        };
        state.note_session(&session.id);
        let mut proxy = self.resolve_proxy(request, &session).await;
        info!(
            "run {} starting on session {} (target {})",
            run_id, session.id, request.target
        );

        let (terminal, error) = loop {
            if self.cancel.is_cancelled() {
                break (Terminal::Stopped, None);
            }
            if state.items.len() >= request.limit {
                break (Terminal::Completed, None);
            }

            let op = operation_for(request, state.mode());
            let vars = self.query_vars(request, &state);
            let sent_cursor = state.position.cursor().map(str::to_string);

            match self
                .upstream
                .fetch(op, &vars, sent_cursor.as_deref(), &session, proxy.as_ref())
                .await
            {
                Ok(raw) => {
                    let page = match self.extractor.extract(&raw) {
                        Ok(page) => page,
                        Err(err) => break (Terminal::Failed, Some(err)),
                    };
                    state.pages_fetched += 1;
                    let stalled = page.cursor_stalled(sent_cursor.as_deref());
                    let next_cursor = page.next_cursor.clone();
                    let (added, stop_hit) = state.accumulate(page.items, request);

                    if stop_hit {
                        // A stop condition can also fire on a page that
                        // contributed nothing new.
                        self.sessions.mark_good(&session.id).await;
                        state.note_progress();
                        self.save_checkpoint(&run_id, &state, &session).await;
                        break (Terminal::Completed, None);
                    }

                    if added > 0 {
                        self.sessions.mark_good(&session.id).await;
                        state.note_progress();
                        self.save_checkpoint(&run_id, &state, &session).await;
                        self.observer.on_event(&CrawlEvent::PageFetched {
                            page: state.pages_fetched,
                            new_items: added,
                            total: state.items.len(),
                        });

                        if state.items.len() >= request.limit {
                            break (Terminal::Completed, None);
                        }
                        if !stalled {
                            state.position.set_cursor(next_cursor);
                            continue;
                        }
                        // Items arrived but the cursor refuses to advance:
                        // deep pagination limit if we are deep enough.
                        if self.fallback_eligible(&state) {
                            self.switch_to_fallback(&mut state, request);
                            continue;
                        }
                        // Refetch will dedup to zero and flow into the
                        // empty-page handling below.
                        continue;
                    }

                    // Zero new items.
                    state.consecutive_empty += 1;
                    if stalled {
                        state.empty_confirmations.insert(session.id.clone());
                        debug!(
                            "empty page at cursor {:?} ({} session(s) confirming)",
                            sent_cursor,
                            state.empty_confirmations.len()
                        );
                    }

                    if stalled
                        && state.empty_confirmations.len() >= self.policy.exhaustion_confirmations
                    {
                        break (Terminal::Exhausted, None);
                    }
                    if state.consecutive_empty >= self.policy.max_consecutive_empty {
                        break (Terminal::Exhausted, None);
                    }

                    if stalled
                        && state.tried_sessions.len() >= self.policy.fallback_min_sessions
                        && self.fallback_eligible(&state)
                    {
                        self.switch_to_fallback(&mut state, request);
                        continue;
                    }

                    if !stalled {
                        // Empty page but the cursor moved; keep walking.
                        state.position.set_cursor(next_cursor);
                        continue;
                    }

                    if state.consecutive_empty < self.policy.empty_retries_per_session {
                        continue;
                    }

                    // Rule out a session-specific visibility gap before
                    // accepting the stall as the end of the stream.
                    match self
                        .rotate(request, &mut state, &session, "empty page confirmation")
                        .await
                    {
                        Some(next) => {
                            proxy = self.resolve_proxy(request, &next).await;
                            session = next;
                            state.consecutive_empty = 0;
                        }
                        None => break (Terminal::Exhausted, None),
                    }
                }
                Err(err) => {
                    if err.is_terminal() {
                        break (Terminal::Failed, Some(err));
                    }
                    state.consecutive_errors += 1;
                    let wants_rotation = err.triggers_rotation()
                        || state.consecutive_errors >= self.policy.max_consecutive_errors;

                    if !wants_rotation {
                        debug!(
                            "transient error ({}), retrying same session: {}",
                            state.consecutive_errors, err
                        );
                        if !self.cancel.sleep(ERROR_PAUSE).await {
                            break (Terminal::Stopped, None);
                        }
                        continue;
                    }

                    self.sessions.mark_bad(&session.id, err.kind().as_str()).await;

                    if !request.rotation_enabled {
                        break (Terminal::Failed, Some(err));
                    }

                    match self.rotate(request, &mut state, &session, err.kind().as_str()).await {
                        Some(next) => {
                            // Same cursor, same mode; only the identity changes.
                            proxy = self.resolve_proxy(request, &next).await;
                            session = next;
                            state.consecutive_errors = 0;
                        }
                        None => {
                            if self.fallback_eligible(&state) {
                                warn!(
                                    "all sessions exhausted with {} items collected, trying fallback",
                                    state.items.len()
                                );
                                self.switch_to_fallback(&mut state, request);
                                continue;
                            }
                            break (Terminal::Failed, Some(err));
                        }
                    }
                }
            }
        };

        self.finish(run_id, state, terminal, error)
    }

    /// Whether the one-way fallback switch is available and worthwhile.
    fn fallback_eligible(&self, state: &RunState) -> bool {
        state.mode() == FetchMode::Primary && state.items.len() >= self.policy.fallback_min_items
    }

    fn switch_to_fallback(&self, state: &mut RunState, request: &CrawlRequest) {
        // Anchor the narrowed query at the oldest item we have; everything
        // newer is already collected.
        let anchor = state
            .oldest_item_time()
            .or(request.until)
            .or_else(|| Some(Utc::now()));
        info!(
            "switching to fallback pagination at {} items (anchor {:?})",
            state.items.len(),
            anchor
        );
        state.switch_to_fallback(anchor);
        self.observer.on_event(&CrawlEvent::ModeSwitched {
            anchor: anchor.map(|a| a.to_rfc3339()),
        });
    }

    /// Pick the next untried active session, preserving cursor and mode.
    async fn rotate(
        &self,
        request: &CrawlRequest,
        state: &mut RunState,
        current: &Session,
        reason: &str,
    ) -> Option<Session> {
        if !request.rotation_enabled {
            return None;
        }
        let next = self
            .sessions
            .all_active()
            .await
            .into_iter()
            .filter(|s| !state.tried_sessions.contains(&s.id))
            .min_by_key(|s| (s.error_count, s.usage_count, s.id.clone()))?;

        state.note_session(&next.id);
        self.observer.on_event(&CrawlEvent::SessionRotated {
            from: current.id.clone(),
            to: next.id.clone(),
            reason: reason.to_string(),
        });
        info!("rotated session {} -> {} ({})", current.id, next.id, reason);
        Some(next)
    }

    async fn resolve_proxy(&self, request: &CrawlRequest, session: &Session) -> Option<Proxy> {
        if !request.proxy_enabled {
            return None;
        }
        self.proxies.resolve_for(&session.id).await
    }

    fn query_vars(&self, request: &CrawlRequest, state: &RunState) -> QueryVars {
        let until = match state.mode() {
            FetchMode::Primary => request.until,
            // The fallback query is narrowed to strictly older material
            // than anything already collected.
            FetchMode::Fallback => match (request.until, state.fallback_anchor) {
                (Some(u), Some(a)) => Some(u.min(a)),
                (u, a) => a.or(u),
            },
        };
        QueryVars {
            query: request.target.query_string(),
            since: request.since,
            until,
        }
    }

    async fn save_checkpoint(&self, run_id: &str, state: &RunState, session: &Session) {
        let checkpoint = Checkpoint {
            cursor: state.position.cursor().map(str::to_string),
            accumulated: state.items.len() as u64,
            last_item_id: state.last_item_id(),
            session_id: Some(session.id.clone()),
        };
        // Fire and forget; a missing checkpoint costs at most one page on
        // resume, never the crawl.
        if let Err(err) = self.checkpoint.save(run_id, &checkpoint).await {
            warn!("checkpoint save failed for run {}: {}", run_id, err);
        }
    }

    fn finish(
        &self,
        run_id: String,
        state: RunState,
        terminal: Terminal,
        error: Option<CrawlError>,
    ) -> RunOutcome {
        self.observer.on_event(&CrawlEvent::RunFinished {
            terminal,
            items: state.items.len(),
            pages: state.pages_fetched,
        });
        if let Some(err) = &error {
            warn!(
                "run {} finished {}: {} ({} items salvaged)",
                run_id,
                terminal.as_str(),
                err,
                state.items.len()
            );
        } else {
            info!(
                "run {} finished {} with {} items over {} pages",
                run_id,
                terminal.as_str(),
                state.items.len(),
                state.pages_fetched
            );
        }
        RunOutcome {
            run_id,
            terminal,
            items: state.items,
            error,
            pages_fetched: state.pages_fetched,
            sessions_used: state.session_order,
            used_fallback: state.used_fallback,
        }
    }
}

/// Operation the current mode maps to. Fallback always goes through
/// search because only search accepts the narrowing date operators.
fn operation_for(request: &CrawlRequest, mode: FetchMode) -> Operation {
    match (mode, &request.target) {
        (FetchMode::Primary, CrawlTarget::Feed { .. }) => Operation::FeedPage,
        (FetchMode::Primary, CrawlTarget::Search { .. }) => Operation::SearchPage,
        (FetchMode::Fallback, _) => Operation::SearchPage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_always_uses_search() {
        let feed = CrawlRequest::new(CrawlTarget::parse("u/alice").unwrap(), 10);
        assert_eq!(
            operation_for(&feed, FetchMode::Primary),
            Operation::FeedPage
        );
        assert_eq!(
            operation_for(&feed, FetchMode::Fallback),
            Operation::SearchPage
        );
    }

    #[test]
    fn default_policy_matches_tuned_values() {
        let policy = EnginePolicy::default();
        assert_eq!(policy.empty_retries_per_session, 2);
        assert_eq!(policy.exhaustion_confirmations, 3);
        assert_eq!(policy.fallback_min_sessions, 2);
        assert_eq!(policy.fallback_min_items, 500);
    }
}
