//! Pinned-identity trust store.
//!
//! Append-only file of `endpoint fingerprint unix-time` records, one per
//! line, pointed at by `ASCII_CHAT_TRUST_STORE`. First contact pins the
//! key (TOFU); a later mismatch on a pinned endpoint is always fatal.

use super::identity::Fingerprint;
use log::warn;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Environment variable naming the store file.
pub const TRUST_STORE_ENV: &str = "ASCII_CHAT_TRUST_STORE";

/// Setting this disables identity verification entirely. Testing only.
pub const INSECURE_ENV: &str = "ASCII_CHAT_INSECURE_NO_HOST_IDENTITY_CHECK";

/// What to do with an unknown fingerprint when nobody can answer a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustPolicy {
    /// Ask the user (interactive client).
    Prompt,
    /// Refuse unknown hosts. The non-interactive default.
    Refuse,
    /// Accept and pin without asking. Opt-in.
    AcceptOnce,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy::Refuse
    }
}

/// Result of checking a presented identity against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Pinned and matching (or verification is disabled).
    Trusted,
    /// Never seen this endpoint; requires a user decision.
    Unknown(Fingerprint),
    /// Pinned to a different key. Abort.
    Mismatch { pinned: Fingerprint, presented: Fingerprint },
}

struct PinnedEntry {
    fingerprint: Fingerprint,
    #[allow(dead_code)]
    created_at: u64,
}

/// In-memory view over the append-only store file.
pub struct TrustStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, PinnedEntry>>,
    disabled: bool,
}

impl TrustStore {
    /// Open the store named by the environment, honoring the insecure
    /// override.
    pub fn open_default() -> io::Result<Self> {
        let disabled = std::env::var_os(INSECURE_ENV).is_some();
        if disabled {
            warn!("{} is set: host identity verification is DISABLED", INSECURE_ENV);
        }
        let path = std::env::var_os(TRUST_STORE_ENV).map(PathBuf::from);
        Self::open(path, disabled)
    }

    pub fn open(path: Option<PathBuf>, disabled: bool) -> io::Result<Self> {
        let mut entries = HashMap::new();
        if let Some(ref path) = path {
            match fs::read_to_string(path) {
                Ok(content) => {
                    for (lineno, line) in content.lines().enumerate() {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        let mut fields = line.split_whitespace();
                        let parsed = (|| {
                            let endpoint = fields.next()?;
                            let fingerprint = Fingerprint::parse(fields.next()?)?;
                            let created_at = fields.next()?.parse().ok()?;
                            Some((endpoint.to_string(), fingerprint, created_at))
                        })();
                        match parsed {
                            Some((endpoint, fingerprint, created_at)) => {
                                // Later lines win: re-pins appended after a
                                // user accepted a changed key.
                                entries.insert(endpoint, PinnedEntry { fingerprint, created_at });
                            }
                            None => {
                                warn!("trust store {}: skipping malformed line {}", path.display(), lineno + 1);
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(TrustStore { path, entries: RwLock::new(entries), disabled })
    }

    /// In-memory store for tests and ephemeral sessions.
    pub fn ephemeral() -> Self {
        TrustStore { path: None, entries: RwLock::new(HashMap::new()), disabled: false }
    }

    pub fn check(&self, endpoint: &str, presented: Fingerprint) -> TrustDecision {
        if self.disabled {
            return TrustDecision::Trusted;
        }
        match self.entries.read().get(endpoint) {
            Some(entry) if entry.fingerprint == presented => TrustDecision::Trusted,
            Some(entry) => {
                TrustDecision::Mismatch { pinned: entry.fingerprint, presented }
            }
            None => TrustDecision::Unknown(presented),
        }
    }

    /// Pin an accepted fingerprint, appending to the store file when one
    /// is configured.
    pub fn pin(&self, endpoint: &str, fingerprint: Fingerprint) -> io::Result<()> {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if let Some(ref path) = self.path {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{} {} {}", endpoint, fingerprint, created_at)?;
        }
        self.entries
            .write()
            .insert(endpoint.to_string(), PinnedEntry { fingerprint, created_at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::Identity;

    fn fingerprint() -> Fingerprint {
        Identity::generate().fingerprint()
    }

    #[test]
    fn unknown_then_pin_then_trusted() {
        let store = TrustStore::ephemeral();
        let fp = fingerprint();
        assert_eq!(store.check("host:9000", fp), TrustDecision::Unknown(fp));
        store.pin("host:9000", fp).expect("pin");
        assert_eq!(store.check("host:9000", fp), TrustDecision::Trusted);
    }

    #[test]
    fn mismatch_on_changed_key() {
        let store = TrustStore::ephemeral();
        let pinned = fingerprint();
        let presented = fingerprint();
        store.pin("host:9000", pinned).expect("pin");
        assert_eq!(
            store.check("host:9000", presented),
            TrustDecision::Mismatch { pinned, presented }
        );
    }

    #[test]
    fn persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("ascii-chat-trust-{}", std::process::id()));
        let path = dir.join("known_hosts");
        let fp = fingerprint();
        {
            let store = TrustStore::open(Some(path.clone()), false).expect("open");
            store.pin("example.com:9000", fp).expect("pin");
        }
        let store = TrustStore::open(Some(path), false).expect("reopen");
        assert_eq!(store.check("example.com:9000", fp), TrustDecision::Trusted);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn later_lines_win() {
        let dir = std::env::temp_dir().join(format!("ascii-chat-trust2-{}", std::process::id()));
        let path = dir.join("known_hosts");
        let old = fingerprint();
        let new = fingerprint();
        {
            let store = TrustStore::open(Some(path.clone()), false).expect("open");
            store.pin("host:1", old).expect("pin old");
            store.pin("host:1", new).expect("pin new");
        }
        let store = TrustStore::open(Some(path), false).expect("reopen");
        assert_eq!(store.check("host:1", new), TrustDecision::Trusted);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn disabled_trusts_everything() {
        let store = TrustStore::open(None, true).expect("open");
        assert_eq!(store.check("anywhere", fingerprint()), TrustDecision::Trusted);
    }
}
