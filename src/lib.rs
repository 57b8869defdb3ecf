//! feedquarry - resilient crawl orchestration for hostile feed platforms.
//!
//! The engine treats the upstream as adversarial: cursors stall without
//! warning, sessions get rate limited or banned mid-crawl, and deep
//! pagination silently stops. Every layer here exists to keep a crawl
//! making progress anyway, and to always hand back whatever was collected
//! before things went wrong.
//!
//! Layering, bottom to top:
//! - [`pools`]: session and proxy pools with health-based rotation
//! - [`rate_limit`]: shared admission counting plus header-driven delays
//! - [`dispatch`]: per-request routing, throttling, and bounded retry
//! - [`engine`]: the pagination state machine and month-chunk orchestrator

pub mod cancel;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod extract;
pub mod models;
pub mod observer;
pub mod pools;
pub mod rate_limit;

pub use engine::{ChunkOrchestrator, ChunkPolicy, EnginePolicy, PaginationEngine};
pub use error::{CrawlError, CrawlResult, ErrorKind};
pub use models::{CrawlRequest, CrawlTarget, RunOutcome, Terminal};
