//! Data models for feedquarry.

mod chunk;
mod item;
mod report;
mod request;
mod target;

pub use chunk::{generate_chunks, Chunk};
pub use item::{FeedItem, Page};
pub use report::{ChunkRunReport, RunOutcome, Terminal, UnrecoveredRange};
pub use request::{CrawlRequest, QueryVars};
pub use target::CrawlTarget;
