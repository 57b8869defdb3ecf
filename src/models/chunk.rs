//! Calendar-month chunking of historical date ranges.

use chrono::{DateTime, Datelike, TimeZone, Utc};

/// One month-sized slice of a requested date range.
///
/// Created once per crawl and never merged or split afterwards; retry
/// bookkeeping lives with the orchestrator's deferred queue.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// Human-readable label, e.g. "2024-03".
    pub label: String,
}

impl Chunk {
    fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since,
            until,
            label: since.format("%Y-%m").to_string(),
        }
    }
}

/// First instant of the month following `ts`.
fn next_month_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if ts.month() == 12 {
        (ts.year() + 1, 1)
    } else {
        (ts.year(), ts.month() + 1)
    };
    // Day 1 of a valid month always exists.
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
}

/// Split `[start, end)` into contiguous chunks along calendar-month
/// boundaries, oldest first. The union of the returned ranges equals the
/// input range exactly; callers wanting newest-first iterate in reverse.
pub fn generate_chunks(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let boundary = next_month_start(cursor).min(end);
        chunks.push(Chunk::new(cursor, boundary));
        cursor = boundary;
    }
    chunks
}
