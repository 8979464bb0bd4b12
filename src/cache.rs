//! TTL caches for directory listings, metadata and remote identifiers.
//!
//! All three caches the system uses share one contract, provided here by
//! [`TtlCache`]: entries expire `ttl` after insertion, an expired entry found
//! by `get` is removed in-line, and every mutation of the remote store is
//! paired with an invalidation. Expired entries are never collected in the
//! background; they linger until the next lookup touches them.

use crate::path;
use crate::storage::FileStats;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cache for directory listings keyed by canonical directory path.
pub type DirCache = TtlCache<Vec<FileStats>>;

/// Cache for single-entry metadata keyed by canonical path.
pub type MetaCache = TtlCache<FileStats>;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A thread-safe map from canonical paths to payloads with TTL expiration.
///
/// A TTL of zero means every `get` misses (immediate expiry); the payload is
/// still stored so that `put` remains observable through `invalidate`.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    /// Creates a cache whose entries live for `ttl` after each `put`.
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the payload for `key` iff an entry exists and has not expired.
    /// An expired entry encountered here is removed from the map.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores `value` under `key`, replacing any previous entry and resetting
    /// its expiry to `now + ttl`.
    pub fn put(&self, key: &str, value: V) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Removes the entry for `key` if present.
    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(key);
    }

    /// Removes the entry keyed by the parent directory of `path`. The path is
    /// normalized first, so host-style input is accepted.
    pub fn invalidate_parent(&self, path: &str) {
        self.invalidate(&path::parent(path));
    }

    /// Removes every entry equal to `prefix` or underneath it.
    pub fn invalidate_subtree(&self, prefix: &str) {
        let prefix = path::normalize(prefix);
        let below = if prefix == "/" {
            prefix.clone()
        } else {
            format!("{}/", prefix)
        };
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.retain(|key, _| key != &prefix && !key.starts_with(&below));
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.clear();
    }
}
