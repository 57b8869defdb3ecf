//! Run outcomes and chunk-level manifests.

use chrono::{DateTime, Utc};

use super::FeedItem;
use crate::error::CrawlError;

/// How a pagination run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// The item budget or a stop condition was reached.
    Completed,
    /// Pagination was confirmed exhausted before the budget was met.
    /// Still a success; the upstream simply had no more to give.
    Exhausted,
    /// Cancellation was requested and honored.
    Stopped,
    /// Every recovery avenue failed; `RunOutcome::error` carries the cause.
    Failed,
}

impl Terminal {
    pub fn is_success(&self) -> bool {
        !matches!(self, Terminal::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Terminal::Completed => "completed",
            Terminal::Exhausted => "exhausted",
            Terminal::Stopped => "stopped",
            Terminal::Failed => "failed",
        }
    }
}

/// Result of one pagination run over a single target or chunk.
///
/// Items collected before a failure are always returned; a partial result
/// beats a hard stop.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub terminal: Terminal,
    pub items: Vec<FeedItem>,
    pub error: Option<CrawlError>,
    pub pages_fetched: u32,
    pub sessions_used: Vec<String>,
    /// Whether the run switched to fallback mode at some point.
    pub used_fallback: bool,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.terminal.is_success()
    }
}

/// A date range that stayed failed through every retry pass.
#[derive(Debug, Clone)]
pub struct UnrecoveredRange {
    pub index: usize,
    pub label: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub query: String,
    pub error: String,
}

/// Aggregate result of a chunked historical crawl.
#[derive(Debug)]
pub struct ChunkRunReport {
    pub items: Vec<FeedItem>,
    pub chunk_count: usize,
    pub recovered_on_retry: usize,
    /// Chunks that failed every immediate and global retry. Reported,
    /// never fatal to the run.
    pub unrecovered: Vec<UnrecoveredRange>,
    pub terminal: Terminal,
}

impl ChunkRunReport {
    pub fn fully_covered(&self) -> bool {
        self.unrecovered.is_empty()
    }
}
