//! Observer port for crawl progress events.
//!
//! The engine emits events synchronously at well-defined points; the queue
//! layer decides what to do with them. Mirrors the event-enum style used
//! throughout the services layer.

use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::models::Terminal;

/// Events emitted during a crawl run.
#[derive(Debug, Clone)]
pub enum CrawlEvent {
    /// A page of results was fetched and accumulated.
    PageFetched {
        page: u32,
        new_items: usize,
        total: usize,
    },
    /// The engine moved to a different session.
    SessionRotated {
        from: String,
        to: String,
        reason: String,
    },
    /// The run switched from primary to fallback pagination.
    ModeSwitched { anchor: Option<String> },
    /// A chunked crawl advanced to the next date range.
    ChunkAdvanced {
        index: usize,
        label: String,
        collected: usize,
    },
    /// A chunk failed all immediate retries and was queued for global retry.
    ChunkDeferred { index: usize, error: String },
    /// A run reached a terminal state.
    RunFinished {
        terminal: Terminal,
        items: usize,
        pages: u32,
    },
}

/// Synchronous observer interface. Implementations must be cheap; the
/// engine calls them inline on its fetch loop.
pub trait CrawlObserver: Send + Sync {
    fn on_event(&self, event: &CrawlEvent);
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NullObserver;

impl CrawlObserver for NullObserver {
    fn on_event(&self, _event: &CrawlEvent) {}
}

/// Logs events through tracing, used by the CLI.
#[derive(Debug, Default)]
pub struct LogObserver;

impl CrawlObserver for LogObserver {
    fn on_event(&self, event: &CrawlEvent) {
        match event {
            CrawlEvent::PageFetched {
                page,
                new_items,
                total,
            } => debug!("page {} fetched: +{} items ({} total)", page, new_items, total),
            CrawlEvent::SessionRotated { from, to, reason } => {
                info!("session rotated {} -> {} ({})", from, to, reason)
            }
            CrawlEvent::ModeSwitched { anchor } => {
                info!("switched to fallback pagination (anchor: {:?})", anchor)
            }
            CrawlEvent::ChunkAdvanced {
                index,
                label,
                collected,
            } => info!("chunk {} ({}) done, {} collected so far", index, label, collected),
            CrawlEvent::ChunkDeferred { index, error } => {
                warn!("chunk {} deferred to global retry: {}", index, error)
            }
            CrawlEvent::RunFinished {
                terminal,
                items,
                pages,
            } => info!(
                "run finished: {} ({} items over {} pages)",
                terminal.as_str(),
                items,
                pages
            ),
        }
    }
}

/// Records events in memory; test helper.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<CrawlEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CrawlEvent> {
        self.events.lock().expect("observer lock poisoned").clone()
    }

    pub fn rotation_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, CrawlEvent::SessionRotated { .. }))
            .count()
    }
}

impl CrawlObserver for RecordingObserver {
    fn on_event(&self, event: &CrawlEvent) {
        self.events
            .lock()
            .expect("observer lock poisoned")
            .push(event.clone());
    }
}
