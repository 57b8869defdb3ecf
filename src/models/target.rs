//! Crawl target parsing.

use std::fmt;

use crate::error::{CrawlError, CrawlResult};

/// What a single crawl run is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlTarget {
    /// A user's feed, addressed by handle.
    Feed { user: String },
    /// A free-form search query, optionally narrowed by date bounds
    /// at the request level.
    Search { query: String },
}

impl CrawlTarget {
    /// Parse a target from user input.
    ///
    /// Accepts full profile URLs, `u/handle`, `user/handle`, and `@handle`
    /// forms for feeds; anything else is treated as a search query.
    pub fn parse(input: &str) -> CrawlResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(CrawlError::Config("empty crawl target".into()));
        }

        if trimmed.contains("://") {
            let url = url::Url::parse(trimmed)
                .map_err(|e| CrawlError::Config(format!("invalid target URL: {e}")))?;
            let mut segments = url
                .path_segments()
                .map(|s| s.filter(|p| !p.is_empty()))
                .ok_or_else(|| CrawlError::Config("target URL has no path".into()))?;
            return match (segments.next(), segments.next()) {
                (Some("user"), Some(handle)) | (Some("u"), Some(handle)) => Ok(CrawlTarget::Feed {
                    user: handle.to_string(),
                }),
                _ => Err(CrawlError::Config(format!(
                    "cannot determine target from URL: {trimmed}"
                ))),
            };
        }

        for prefix in ["u/", "user/", "@"] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                if rest.is_empty() {
                    return Err(CrawlError::Config(format!("empty handle in '{trimmed}'")));
                }
                return Ok(CrawlTarget::Feed {
                    user: rest.trim_end_matches('/').to_string(),
                });
            }
        }

        Ok(CrawlTarget::Search {
            query: trimmed.to_string(),
        })
    }

    /// The query string sent upstream for this target.
    pub fn query_string(&self) -> String {
        match self {
            CrawlTarget::Feed { user } => format!("from:{user}"),
            CrawlTarget::Search { query } => query.clone(),
        }
    }
}

impl fmt::Display for CrawlTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlTarget::Feed { user } => write!(f, "@{user}"),
            CrawlTarget::Search { query } => write!(f, "search:{query}"),
        }
    }
}
