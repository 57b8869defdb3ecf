//! Session pool: authenticated identities with health tracking.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{fingerprint, EntryStats, PoolPolicy};
use crate::dispatch::user_agent::USER_AGENTS;

/// One reusable authenticated identity.
///
/// Health fields are mutated only through `mark_good`/`mark_bad` on the
/// pool; once retired a session never comes back within the process.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// Cookie name -> value, applied verbatim to outbound requests.
    pub cookies: HashMap<String, String>,
    pub display_name: Option<String>,
    /// User agent chosen at load time, stable for the session's lifetime
    /// so the identity presents consistently.
    pub user_agent: String,
    pub usage_count: u32,
    pub error_count: u32,
    pub consecutive_failures: u32,
    pub retired: bool,
}

impl Session {
    /// Cookie header value for outbound requests.
    pub fn cookie_header(&self) -> String {
        let mut pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        pairs.sort();
        pairs.join("; ")
    }

    /// Loggable fingerprint of the credential material.
    pub fn credential_fingerprint(&self) -> String {
        fingerprint(&self.cookie_header())
    }
}

/// On-disk shape of one credential file.
#[derive(Debug, Deserialize)]
struct CredentialFile {
    cookies: HashMap<String, String>,
    #[serde(default)]
    display_name: Option<String>,
}

/// Pool of sessions shared by all workers of a process.
#[derive(Debug)]
pub struct SessionPool {
    policy: PoolPolicy,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionPool {
    pub fn new(policy: PoolPolicy) -> Self {
        Self {
            policy,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Load every `*.json` credential file in `dir`. Invalid files are
    /// logged and skipped; an unreadable directory is fatal because a
    /// crawl without any chance of sessions cannot start.
    pub async fn load_all(&self, dir: &Path) -> anyhow::Result<usize> {
        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => match serde_json::from_str::<CredentialFile>(&raw) {
                    Ok(file) => {
                        if file.cookies.is_empty() {
                            warn!("credential file {} has no cookies, skipping", path.display());
                            continue;
                        }
                        self.insert(id, file.cookies, file.display_name).await;
                        loaded += 1;
                    }
                    Err(e) => warn!("skipping malformed credential file {}: {}", path.display(), e),
                },
                Err(e) => warn!("skipping unreadable credential file {}: {}", path.display(), e),
            }
        }
        info!("loaded {} session(s) from {}", loaded, dir.display());
        Ok(loaded)
    }

    /// Insert a session directly; used by tests and programmatic setup.
    pub async fn insert(
        &self,
        id: String,
        cookies: HashMap<String, String>,
        display_name: Option<String>,
    ) {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .map(|ua| ua.to_string())
            .unwrap_or_default();
        let session = Session {
            id: id.clone(),
            cookies,
            display_name,
            user_agent,
            usage_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            retired: false,
        };
        debug!(
            "session {} registered (credentials {})",
            id,
            session.credential_fingerprint()
        );
        self.sessions.write().await.insert(id, session);
    }

    /// Select the next session to use.
    ///
    /// Returns `preferred` if it is still active, otherwise the
    /// least-unhealthy active session not excluded, ordered by
    /// `(error_count, usage_count)` so load spreads toward sessions with
    /// both fewer errors and less wear.
    pub async fn select_next(
        &self,
        preferred: Option<&str>,
        exclude: Option<&str>,
    ) -> Option<Session> {
        let sessions = self.sessions.read().await;

        if let Some(id) = preferred {
            if let Some(session) = sessions.get(id) {
                if !session.retired && Some(id) != exclude {
                    return Some(session.clone());
                }
            }
        }

        sessions
            .values()
            .filter(|s| !s.retired && Some(s.id.as_str()) != exclude)
            .min_by_key(|s| (s.error_count, s.usage_count, s.id.clone()))
            .cloned()
    }

    /// Record a successful use: errors decay, the consecutive streak resets.
    pub async fn mark_good(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.usage_count += 1;
            session.error_count = session.error_count.saturating_sub(1);
            session.consecutive_failures = 0;
        }
    }

    /// Record a failed use; retires the session once either threshold trips.
    pub async fn mark_bad(&self, id: &str, reason: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.error_count += 1;
            session.consecutive_failures += 1;
            if !session.retired
                && (session.error_count >= self.policy.max_error_count
                    || session.consecutive_failures >= self.policy.max_consecutive_failures)
            {
                session.retired = true;
                warn!(
                    "session {} retired ({}; errors={}, consecutive={})",
                    id, reason, session.error_count, session.consecutive_failures
                );
            } else {
                debug!(
                    "session {} marked bad ({}; errors={}, consecutive={})",
                    id,
                    reason,
                    session.error_count,
                    session.consecutive_failures
                );
            }
        }
    }

    /// All non-retired sessions.
    pub async fn all_active(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut active: Vec<Session> = sessions.values().filter(|s| !s.retired).cloned().collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.retired)
            .count()
    }

    /// Health snapshot for every session, retired included.
    pub async fn stats(&self) -> Vec<EntryStats> {
        let sessions = self.sessions.read().await;
        let mut stats: Vec<EntryStats> = sessions
            .values()
            .map(|s| EntryStats {
                id: s.id.clone(),
                usage_count: s.usage_count,
                error_count: s.error_count,
                consecutive_failures: s.consecutive_failures,
                retired: s.retired,
            })
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }
}
