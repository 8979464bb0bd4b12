//! Path-to-ID resolution.
//!
//! Drive is ID-keyed, not path-keyed. Paths are resolved by walking the
//! folder hierarchy one segment at a time, querying for a child with the
//! given name inside the current parent; every partial path's ID is cached
//! with its own TTL so the next resolution only queries the tail. This cache
//! is the bridge between the two models and every mutation that could change
//! a path→ID relation must invalidate through it.

use crate::client::DriveClient;
use libremfs::cache::TtlCache;
use libremfs::path;
use libremfs::storage::Result;
use std::time::Duration;
use tracing::debug;

pub(crate) struct PathResolver {
    ids: TtlCache<String>,
    root_id: String,
}

impl PathResolver {
    pub(crate) fn new(ttl: Duration, root_id: String) -> Self {
        PathResolver {
            ids: TtlCache::new(ttl),
            root_id,
        }
    }

    /// Resolves a canonical path to a file ID, or `None` when some segment
    /// does not exist.
    pub(crate) async fn resolve(
        &self,
        client: &DriveClient,
        target: &str,
    ) -> Result<Option<String>> {
        let target = path::normalize(target);
        if target == "/" {
            return Ok(Some(self.root_id.clone()));
        }
        if let Some(id) = self.ids.get(&target) {
            return Ok(Some(id));
        }

        let mut current = self.root_id.clone();
        let mut partial = String::new();
        for segment in target.split('/').filter(|s| !s.is_empty()) {
            partial.push('/');
            partial.push_str(segment);
            if let Some(id) = self.ids.get(&partial) {
                current = id;
                continue;
            }
            match client.find_child(&current, segment).await? {
                Some(child) => {
                    debug!(segment, parent = %current, id = %child.id, "resolved");
                    self.ids.put(&partial, child.id.clone());
                    current = child.id;
                }
                None => {
                    debug!(segment, parent = %current, "path segment not found");
                    return Ok(None);
                }
            }
        }
        Ok(Some(current))
    }

    /// Drops the entry for one path.
    pub(crate) fn invalidate(&self, target: &str) {
        self.ids.invalidate(&path::normalize(target));
    }

    /// Drops the entry for `target` and everything cached beneath it.
    pub(crate) fn invalidate_subtree(&self, target: &str) {
        self.ids.invalidate_subtree(target);
    }

    pub(crate) fn clear(&self) {
        self.ids.clear();
    }
}
