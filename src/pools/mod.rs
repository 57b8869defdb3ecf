//! Session and proxy pools with health-based rotation.

mod proxy;
mod session;

pub use proxy::{Proxy, ProxyPool};
pub use session::{Session, SessionPool};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Health thresholds shared by both pools.
///
/// Two independent retirement thresholds: a credential with many
/// historical-but-recovered errors is a different animal from one failing
/// right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolPolicy {
    /// Retire once total errors reach this count.
    pub max_error_count: u32,
    /// Retire once this many failures happen back to back.
    pub max_consecutive_failures: u32,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            max_error_count: 3,
            max_consecutive_failures: 2,
        }
    }
}

/// Point-in-time health snapshot for one pool entry.
#[derive(Debug, Clone)]
pub struct EntryStats {
    pub id: String,
    pub usage_count: u32,
    pub error_count: u32,
    pub consecutive_failures: u32,
    pub retired: bool,
}

/// Stable 64-bit hash, identical across processes and runs.
///
/// The std hasher is seeded per process, which would break deterministic
/// session-to-proxy binding between restarts.
pub(crate) fn stable_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
}

/// Short non-reversible fingerprint for logging credential material.
pub(crate) fn fingerprint(material: &str) -> String {
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash("session-1"), stable_hash("session-1"));
        assert_ne!(stable_hash("session-1"), stable_hash("session-2"));
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let fp = fingerprint("cookie-jar");
        assert_eq!(fp.len(), 8);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
