//! Error taxonomy for crawl operations.
//!
//! Every failure the engine can see is classified here. The classification
//! drives two independent decisions: whether the dispatcher may retry the
//! same request, and whether the engine should rotate to a fresh session
//! before touching the same cursor again.

use thiserror::Error;

/// Broad failure classes, used for logging and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimit,
    Auth,
    NotFound,
    Upstream,
    BrowserCrashed,
    DataExtraction,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Upstream => "upstream",
            ErrorKind::BrowserCrashed => "browser_crashed",
            ErrorKind::DataExtraction => "data_extraction",
            ErrorKind::Config => "config",
        }
    }
}

/// Errors raised by the dispatch and pagination layers.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Connection reset/refused, DNS failure, or other transport error.
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded its deadline.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// 429 or an explicit quota-exhausted signal from the upstream.
    #[error("rate limited by upstream (retry after {retry_after_secs:?}s)")]
    RateLimit { retry_after_secs: Option<u64> },

    /// 401/403 or an invalidated session.
    #[error("authentication rejected (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// The crawl target does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// 5xx or an otherwise unexpected upstream status.
    #[error("upstream returned HTTP {status}")]
    Upstream { status: u16, body: String },

    /// The passive-capture subsystem died mid-query.
    #[error("capture subsystem failed: {0}")]
    BrowserCrashed(String),

    /// The payload did not match the expected shape.
    #[error("failed to extract items from payload: {0}")]
    DataExtraction(String),

    /// Invalid or missing configuration, detected before any network call.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CrawlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlError::Network(_) => ErrorKind::Network,
            CrawlError::Timeout(_) => ErrorKind::Timeout,
            CrawlError::RateLimit { .. } => ErrorKind::RateLimit,
            CrawlError::Auth { .. } => ErrorKind::Auth,
            CrawlError::NotFound(_) => ErrorKind::NotFound,
            CrawlError::Upstream { .. } => ErrorKind::Upstream,
            CrawlError::BrowserCrashed(_) => ErrorKind::BrowserCrashed,
            CrawlError::DataExtraction(_) => ErrorKind::DataExtraction,
            CrawlError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the dispatcher may retry the same request after backoff.
    /// 5xx and 429 retry; any other upstream status raises immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlError::Network(_)
            | CrawlError::Timeout(_)
            | CrawlError::RateLimit { .. }
            | CrawlError::BrowserCrashed(_) => true,
            CrawlError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the engine should rotate to a different session on this error.
    ///
    /// Rate limits and auth failures are session-scoped: a fresh identity has
    /// a fresh quota. Network trouble and timeouts may be proxy- or
    /// session-attributable, so they count too. Extraction and not-found
    /// errors would fail identically on any session.
    pub fn triggers_rotation(&self) -> bool {
        matches!(
            self,
            CrawlError::Network(_)
                | CrawlError::Timeout(_)
                | CrawlError::RateLimit { .. }
                | CrawlError::Auth { .. }
        )
    }

    /// Whether this error ends the run for the target regardless of session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrawlError::NotFound(_) | CrawlError::DataExtraction(_) | CrawlError::Config(_)
        )
    }

    /// Classify a transport-level error from reqwest.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            CrawlError::Timeout(err.to_string())
        } else {
            CrawlError::Network(err.to_string())
        }
    }
}

pub type CrawlResult<T> = Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_rotates_and_retries() {
        let err = CrawlError::RateLimit {
            retry_after_secs: Some(30),
        };
        assert!(err.is_retryable());
        assert!(err.triggers_rotation());
        assert!(!err.is_terminal());
    }

    #[test]
    fn auth_rotates_but_does_not_retry_same_session() {
        let err = CrawlError::Auth {
            status: 401,
            message: "session invalidated".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.triggers_rotation());
    }

    #[test]
    fn extraction_errors_are_terminal() {
        let err = CrawlError::DataExtraction("missing items array".into());
        assert!(!err.is_retryable());
        assert!(!err.triggers_rotation());
        assert!(err.is_terminal());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ErrorKind::RateLimit.as_str(), "rate_limit");
        assert_eq!(ErrorKind::BrowserCrashed.as_str(), "browser_crashed");
    }
}
