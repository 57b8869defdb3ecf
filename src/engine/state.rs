//! Mutable state for one pagination run.
//!
//! Owned exclusively by one engine invocation; never shared across
//! concurrent targets.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::models::{CrawlRequest, FeedItem};

/// Fetch strategy currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Primary,
    Fallback,
}

/// Pagination position, tagged by mode so the primary and fallback
/// cursors can never be conflated. Switching modes leaves the other
/// mode's position untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    Primary { cursor: Option<String> },
    Fallback { cursor: Option<String> },
}

impl CursorState {
    pub fn mode(&self) -> FetchMode {
        match self {
            CursorState::Primary { .. } => FetchMode::Primary,
            CursorState::Fallback { .. } => FetchMode::Fallback,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        match self {
            CursorState::Primary { cursor } | CursorState::Fallback { cursor } => cursor.as_deref(),
        }
    }

    pub fn set_cursor(&mut self, next: Option<String>) {
        match self {
            CursorState::Primary { cursor } | CursorState::Fallback { cursor } => *cursor = next,
        }
    }
}

/// Accumulated state of a single run.
#[derive(Debug)]
pub struct RunState {
    pub items: Vec<FeedItem>,
    seen: HashSet<String>,
    pub position: CursorState,
    /// Sessions already used at some point during this run.
    pub tried_sessions: HashSet<String>,
    /// Order in which sessions were used, for the run report.
    pub session_order: Vec<String>,
    /// Sessions that observed an empty page at the current cursor.
    /// Cleared whenever the cursor advances or the mode switches.
    pub empty_confirmations: HashSet<String>,
    pub consecutive_empty: u32,
    pub consecutive_errors: u32,
    /// Timestamp anchoring the narrowed fallback query.
    pub fallback_anchor: Option<DateTime<Utc>>,
    pub pages_fetched: u32,
    pub used_fallback: bool,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
            position: CursorState::Primary { cursor: None },
            tried_sessions: HashSet::new(),
            session_order: Vec::new(),
            empty_confirmations: HashSet::new(),
            consecutive_empty: 0,
            consecutive_errors: 0,
            fallback_anchor: None,
            pages_fetched: 0,
            used_fallback: false,
        }
    }

    pub fn mode(&self) -> FetchMode {
        self.position.mode()
    }

    pub fn note_session(&mut self, id: &str) {
        if self.tried_sessions.insert(id.to_string()) {
            self.session_order.push(id.to_string());
        }
    }

    /// Reset the per-cursor trackers after real progress.
    pub fn note_progress(&mut self) {
        self.consecutive_empty = 0;
        self.consecutive_errors = 0;
        self.empty_confirmations.clear();
    }

    /// Oldest timestamp among collected items, used to anchor the
    /// fallback query just below everything already seen.
    pub fn oldest_item_time(&self) -> Option<DateTime<Utc>> {
        self.items.iter().filter_map(|i| i.created_at).min()
    }

    /// One-way switch to fallback pagination with a fresh cursor.
    pub fn switch_to_fallback(&mut self, anchor: Option<DateTime<Utc>>) {
        self.position = CursorState::Fallback { cursor: None };
        self.fallback_anchor = anchor;
        self.used_fallback = true;
        self.note_progress();
    }

    /// Deduplicate and append a page of items, honoring the budget and
    /// stop conditions. Returns the number of newly accumulated items and
    /// whether a stop condition fired.
    pub fn accumulate(&mut self, page_items: Vec<FeedItem>, request: &CrawlRequest) -> (usize, bool) {
        let mut added = 0;
        for item in page_items {
            if self.items.len() >= request.limit {
                return (added, true);
            }
            if !self.seen.insert(item.id.clone()) {
                continue;
            }
            // Items at or before the stop timestamp are outside the
            // requested window and are not kept.
            if let (Some(stop_at), Some(created)) = (request.stop_at_time, item.created_at) {
                if created <= stop_at {
                    return (added, true);
                }
            }
            let hit_stop_id = request.stop_at_id.as_deref() == Some(item.id.as_str());
            self.items.push(item);
            added += 1;
            if hit_stop_id {
                return (added, true);
            }
        }
        (added, false)
    }

    pub fn last_item_id(&self) -> Option<String> {
        self.items.last().map(|i| i.id.clone())
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
