//! Items and pages as seen by the pagination engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One item from the upstream feed, already normalized by the extractor.
///
/// The engine only interprets `id` (for deduplication) and `created_at`
/// (for stop conditions and fallback anchoring); everything else rides
/// along in `data` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    /// Upstream item identifier, unique per platform.
    pub id: String,
    /// Author handle, when the payload carries one.
    pub author: Option<String>,
    /// Creation timestamp, when the payload carries one.
    pub created_at: Option<DateTime<Utc>>,
    /// Raw normalized payload for downstream consumers.
    pub data: serde_json::Value,
}

impl FeedItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: None,
            created_at: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_created_at(mut self, ts: DateTime<Utc>) -> Self {
        self.created_at = Some(ts);
        self
    }
}

/// One page of extracted items plus the cursor for the next page.
///
/// `next_cursor` equal to the cursor that produced this page, or absent,
/// is the upstream's only end-of-pagination signal.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<String>,
}

impl Page {
    /// Whether the upstream signaled no further progress past `sent_cursor`.
    pub fn cursor_stalled(&self, sent_cursor: Option<&str>) -> bool {
        match self.next_cursor.as_deref() {
            None => true,
            Some(next) => Some(next) == sent_cursor,
        }
    }
}
