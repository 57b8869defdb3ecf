//! Application configuration.
//!
//! A single TOML file with every section optional; anything missing takes
//! the compiled-in default so a bare `feedquarry crawl` works with just a
//! credentials directory.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch::DispatchConfig;
use crate::engine::{ChunkPolicy, EnginePolicy};
use crate::pools::PoolPolicy;
use crate::rate_limit::RateLimitConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FEEDQUARRY_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "~/.config/feedquarry/config.toml";
const DEFAULT_CREDENTIALS_DIR: &str = "~/.config/feedquarry/sessions";
const DEFAULT_CHECKPOINT_DB: &str = "~/.local/share/feedquarry/checkpoints.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory of `*.json` session credential files.
    pub credentials_dir: String,
    /// Optional newline-delimited proxy list.
    pub proxies_file: Option<String>,
    /// SQLite database for run checkpoints.
    pub checkpoint_db: String,
    /// Shared admission counter store; in-process counting when absent.
    pub redis_url: Option<String>,
    pub dispatch: DispatchConfig,
    pub rate_limit: RateLimitConfig,
    pub engine: EnginePolicy,
    pub chunks: ChunkPolicy,
    pub pools: PoolPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            credentials_dir: DEFAULT_CREDENTIALS_DIR.into(),
            proxies_file: None,
            checkpoint_db: DEFAULT_CHECKPOINT_DB.into(),
            redis_url: None,
            dispatch: DispatchConfig::default(),
            rate_limit: RateLimitConfig::default(),
            engine: EnginePolicy::default(),
            chunks: ChunkPolicy::default(),
            pools: PoolPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, the `FEEDQUARRY_CONFIG` env var, or the default
    /// location, in that order. A missing file is not an error; a present
    /// but unparseable file is.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let expanded = shellexpand::tilde(&path).into_owned();

        match std::fs::read_to_string(&expanded) {
            Ok(raw) => {
                let config: AppConfig = toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid config {}: {}", expanded, e))?;
                debug!("loaded config from {}", expanded);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", expanded);
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("cannot read config {}: {}", expanded, e)),
        }
    }

    pub fn credentials_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.credentials_dir).into_owned())
    }

    pub fn proxies_file(&self) -> Option<PathBuf> {
        self.proxies_file
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
    }

    pub fn checkpoint_db(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.checkpoint_db).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            credentials_dir = "/tmp/sessions"

            [dispatch]
            base_url = "https://upstream.test"
            max_attempts = 5

            [engine]
            fallback_min_items = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.credentials_dir, "/tmp/sessions");
        assert_eq!(config.dispatch.base_url, "https://upstream.test");
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.engine.fallback_min_items, 100);
        // Untouched sections keep their defaults.
        assert_eq!(config.rate_limit.default_delay_ms, 2_000);
        assert_eq!(config.chunks.max_global_retries, 2);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Some("/nonexistent/feedquarry.toml")).unwrap();
        assert_eq!(config.pools.max_error_count, 3);
    }

    #[test]
    fn tilde_paths_expand() {
        let config = AppConfig::default();
        assert!(!config.credentials_dir().to_string_lossy().contains('~'));
    }
}
