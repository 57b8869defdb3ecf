//! Crawl request and per-call query variables.

use chrono::{DateTime, Utc};

use super::CrawlTarget;
use crate::error::{CrawlError, CrawlResult};

/// Everything the caller specifies for one crawl run.
///
/// The queue layer owns job state; this is just the slice the engine needs.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub target: CrawlTarget,
    /// Item budget for the whole run.
    pub limit: usize,
    /// Optional historical bounds; presence of both turns the run into a
    /// chunked crawl.
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Stop as soon as this item id is seen.
    pub stop_at_id: Option<String>,
    /// Stop as soon as an item at or before this timestamp is seen.
    pub stop_at_time: Option<DateTime<Utc>>,
    /// When false the engine never rotates away from its first session.
    pub rotation_enabled: bool,
    /// When false the dispatcher uses direct egress even if proxies exist.
    pub proxy_enabled: bool,
    /// Session the run should start on, if the caller has a preference.
    /// Used by chunk retries to force a different identity.
    pub preferred_session: Option<String>,
}

impl CrawlRequest {
    pub fn new(target: CrawlTarget, limit: usize) -> Self {
        Self {
            target,
            limit,
            since: None,
            until: None,
            stop_at_id: None,
            stop_at_time: None,
            rotation_enabled: true,
            proxy_enabled: true,
            preferred_session: None,
        }
    }

    /// Validate before any network work starts.
    pub fn validate(&self) -> CrawlResult<()> {
        if self.limit == 0 {
            return Err(CrawlError::Config("item limit must be positive".into()));
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since >= until {
                return Err(CrawlError::Config(format!(
                    "empty date range: {since} >= {until}"
                )));
            }
        }
        Ok(())
    }

    pub fn has_date_range(&self) -> bool {
        self.since.is_some() && self.until.is_some()
    }

    /// Copy of this request narrowed to a sub-range, used per chunk.
    pub fn bounded(&self, since: DateTime<Utc>, until: DateTime<Utc>, limit: usize) -> Self {
        let mut req = self.clone();
        req.since = Some(since);
        req.until = Some(until);
        req.limit = limit;
        req
    }
}

/// Variables for one upstream call, derived from the request and the
/// engine's current mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryVars {
    pub query: String,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl QueryVars {
    /// Render the query the way the upstream search endpoint expects it,
    /// with inline date operators when bounds are present.
    pub fn rendered(&self) -> String {
        let mut out = self.query.clone();
        if let Some(since) = self.since {
            out.push_str(&format!(" since:{}", since.format("%Y-%m-%d")));
        }
        if let Some(until) = self.until {
            out.push_str(&format!(" until:{}", until.format("%Y-%m-%d")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn zero_limit_rejected() {
        let req = CrawlRequest::new(CrawlTarget::parse("u/bob").unwrap(), 0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn inverted_range_rejected() {
        let mut req = CrawlRequest::new(CrawlTarget::parse("u/bob").unwrap(), 10);
        req.since = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        req.until = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(req.validate().is_err());
    }

    #[test]
    fn rendered_query_includes_bounds() {
        let vars = QueryVars {
            query: "from:bob".into(),
            since: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            until: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
        };
        assert_eq!(vars.rendered(), "from:bob since:2024-01-01 until:2024-02-01");
    }
}
