//! Month-chunked historical crawls.
//!
//! Search-backed pagination degrades past a few thousand items, so a
//! bounded date range is split into calendar months and each month is
//! crawled as its own engine run. Chunks are independent failure domains:
//! one month failing never aborts the crawl, it is deferred and retried
//! later with a different session.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::PaginationEngine;
use crate::cancel::CancelFlag;
use crate::models::{generate_chunks, ChunkRunReport, CrawlRequest, FeedItem, Terminal, UnrecoveredRange};
use crate::observer::{CrawlEvent, CrawlObserver, NullObserver};
use crate::pools::SessionPool;

/// Retry budget for chunked crawls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkPolicy {
    /// Immediate retries of a failed chunk before it is deferred.
    pub max_chunk_retries: u32,
    /// Full passes over the deferred set after the main sweep.
    pub max_global_retries: u32,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_chunk_retries: 1,
            max_global_retries: 2,
        }
    }
}

/// A chunk that failed its main attempt and immediate retries, queued for
/// the global passes.
struct DeferredChunk {
    index: usize,
    request: CrawlRequest,
    label: String,
    error: String,
}

/// Runs a whole historical crawl as a sequence of engine runs.
pub struct ChunkOrchestrator {
    engine: Arc<PaginationEngine>,
    sessions: Arc<SessionPool>,
    policy: ChunkPolicy,
    observer: Arc<dyn CrawlObserver>,
    cancel: CancelFlag,
}

impl ChunkOrchestrator {
    pub fn new(engine: Arc<PaginationEngine>, sessions: Arc<SessionPool>, policy: ChunkPolicy) -> Self {
        let cancel = engine.cancel_flag();
        Self {
            engine,
            sessions,
            policy,
            observer: Arc::new(NullObserver),
            cancel,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CrawlObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Crawl the request's date range newest-first, month by month.
    ///
    /// Requests without a full date range degenerate to one plain engine
    /// run so callers have a single entry point.
    pub async fn run(&self, request: &CrawlRequest) -> ChunkRunReport {
        let (since, until) = match (request.since, request.until) {
            (Some(since), Some(until)) => (since, until),
            _ => return self.single_run(request).await,
        };

        let chunks = generate_chunks(since, until);
        info!(
            "chunked crawl of {}: {} month(s), budget {}",
            request.target,
            chunks.len(),
            request.limit
        );

        let mut seen: HashSet<String> = HashSet::new();
        let mut items: Vec<FeedItem> = Vec::new();
        let mut deferred: Vec<DeferredChunk> = Vec::new();
        let mut terminal = Terminal::Completed;

        // Newest months first; recent material is usually what the caller
        // wants inside a tight budget.
        let total = chunks.len();
        for (pos, chunk) in chunks.iter().rev().enumerate() {
            let index = total - 1 - pos;
            if self.cancel.is_cancelled() {
                terminal = Terminal::Stopped;
                break;
            }
            if items.len() >= request.limit {
                break;
            }

            let remaining = request.limit - items.len();
            let chunk_req = request.bounded(chunk.since, chunk.until, remaining);

            match self.run_chunk(&chunk_req, &chunk.label, &mut seen, &mut items).await {
                ChunkAttempt::Done => {
                    self.observer.on_event(&CrawlEvent::ChunkAdvanced {
                        index,
                        label: chunk.label.clone(),
                        collected: items.len(),
                    });
                }
                ChunkAttempt::Cancelled => {
                    terminal = Terminal::Stopped;
                    break;
                }
                ChunkAttempt::Failed(error) => {
                    warn!("chunk {} deferred after retries: {}", chunk.label, error);
                    self.observer.on_event(&CrawlEvent::ChunkDeferred {
                        index,
                        error: error.clone(),
                    });
                    deferred.push(DeferredChunk {
                        index,
                        request: chunk_req,
                        label: chunk.label.clone(),
                        error,
                    });
                }
            }
        }

        let recovered = if terminal == Terminal::Stopped {
            0
        } else {
            self.global_passes(&mut deferred, request, &mut seen, &mut items)
                .await
        };

        let unrecovered: Vec<UnrecoveredRange> = deferred
            .iter()
            .map(|d| UnrecoveredRange {
                index: d.index,
                label: d.label.clone(),
                since: d.request.since.unwrap_or(since),
                until: d.request.until.unwrap_or(until),
                query: d.request.target.query_string(),
                error: d.error.clone(),
            })
            .collect();

        if !unrecovered.is_empty() {
            warn!(
                "{} of {} chunk(s) unrecovered after all retry passes",
                unrecovered.len(),
                total
            );
        }

        ChunkRunReport {
            items,
            chunk_count: total,
            recovered_on_retry: recovered,
            unrecovered,
            terminal,
        }
    }

    /// One chunk: main attempt plus immediate retries on a different
    /// session. Partial items from failed attempts are kept.
    async fn run_chunk(
        &self,
        base: &CrawlRequest,
        label: &str,
        seen: &mut HashSet<String>,
        items: &mut Vec<FeedItem>,
    ) -> ChunkAttempt {
        let mut chunk_req = base.clone();
        let mut last_error = String::from("unknown");
        let mut tried: HashSet<String> = HashSet::new();
        let cap = items.len() + base.limit;

        for attempt in 0..=self.policy.max_chunk_retries {
            if self.cancel.is_cancelled() {
                return ChunkAttempt::Cancelled;
            }
            let outcome = self.engine.run(&chunk_req).await;
            tried.extend(outcome.sessions_used.iter().cloned());
            let terminal = outcome.terminal;
            let error = outcome.error;
            merge_items(outcome.items, seen, items, cap);

            match terminal {
                Terminal::Completed | Terminal::Exhausted => return ChunkAttempt::Done,
                Terminal::Stopped => return ChunkAttempt::Cancelled,
                Terminal::Failed => {
                    last_error = error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown".into());
                    if attempt < self.policy.max_chunk_retries {
                        // Retry on a session none of the failed attempts
                        // touched. When every active session has already
                        // been through this chunk, fall back to whatever
                        // the engine would pick on its own.
                        chunk_req.preferred_session = self
                            .sessions
                            .all_active()
                            .await
                            .into_iter()
                            .filter(|s| !tried.contains(&s.id))
                            .min_by_key(|s| (s.error_count, s.usage_count, s.id.clone()))
                            .map(|s| s.id);
                        info!(
                            "retrying chunk {} immediately on session {:?}",
                            label, chunk_req.preferred_session
                        );
                    }
                }
            }
        }
        ChunkAttempt::Failed(last_error)
    }

    /// Round-robin retry passes over the deferred chunks. Each pass
    /// starts chunks on a different session than the last. Returns how
    /// many chunks recovered.
    async fn global_passes(
        &self,
        deferred: &mut Vec<DeferredChunk>,
        request: &CrawlRequest,
        seen: &mut HashSet<String>,
        items: &mut Vec<FeedItem>,
    ) -> usize {
        let mut recovered = 0;
        for pass in 0..self.policy.max_global_retries {
            if deferred.is_empty() || self.cancel.is_cancelled() {
                break;
            }
            let active = self.sessions.all_active().await;
            if active.is_empty() {
                warn!("no active sessions left for global retry pass {}", pass + 1);
                break;
            }
            let preferred = active[pass as usize % active.len()].id.clone();
            info!(
                "global retry pass {} over {} chunk(s) starting on session {}",
                pass + 1,
                deferred.len(),
                preferred
            );

            let mut still_failed = Vec::new();
            for mut chunk in deferred.drain(..) {
                if self.cancel.is_cancelled() || items.len() >= request.limit {
                    still_failed.push(chunk);
                    continue;
                }
                chunk.request.limit = request.limit - items.len();
                chunk.request.preferred_session = Some(preferred.clone());

                let outcome = self.engine.run(&chunk.request).await;
                let terminal = outcome.terminal;
                let error = outcome.error;
                merge_items(outcome.items, seen, items, request.limit);
                if terminal.is_success() {
                    info!("chunk {} recovered on global pass {}", chunk.label, pass + 1);
                    recovered += 1;
                } else {
                    chunk.error = error.map(|e| e.to_string()).unwrap_or(chunk.error);
                    still_failed.push(chunk);
                }
            }
            *deferred = still_failed;
        }
        recovered
    }

    async fn single_run(&self, request: &CrawlRequest) -> ChunkRunReport {
        let outcome = self.engine.run(request).await;
        let unrecovered = Vec::new();
        ChunkRunReport {
            items: outcome.items,
            chunk_count: 1,
            recovered_on_retry: 0,
            unrecovered,
            terminal: outcome.terminal,
        }
    }
}

enum ChunkAttempt {
    Done,
    Cancelled,
    Failed(String),
}

/// Append items not yet seen across any chunk, up to `cap` total.
/// Adjacent months can both return items created exactly on the boundary.
fn merge_items(new: Vec<FeedItem>, seen: &mut HashSet<String>, items: &mut Vec<FeedItem>, cap: usize) {
    for item in new {
        if items.len() >= cap {
            break;
        }
        if seen.insert(item.id.clone()) {
            items.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeedItem;

    #[test]
    fn merge_deduplicates_across_chunks() {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        merge_items(
            vec![FeedItem::new("a"), FeedItem::new("b")],
            &mut seen,
            &mut items,
            10,
        );
        merge_items(
            vec![FeedItem::new("b"), FeedItem::new("c")],
            &mut seen,
            &mut items,
            10,
        );
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn merge_respects_cap() {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        merge_items(
            vec![FeedItem::new("a"), FeedItem::new("b"), FeedItem::new("c")],
            &mut seen,
            &mut items,
            2,
        );
        assert_eq!(items.len(), 2);
    }
}
