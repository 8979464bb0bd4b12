//! An in-memory [`RemoteStore`] used by the translator integration tests.
//!
//! Behaves like a strict path-keyed store (FTP/SFTP shaped: no trash, empty
//! directories only) and records every back-end call so tests can assert what
//! the translator actually asked for.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use libremfs::storage::{Error, ErrorKind, FileStats, RemoteStore, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Clone, Debug)]
pub enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Default)]
pub struct MemStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    calls: Mutex<Vec<String>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, data: &[u8]) -> Self {
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::File(data.to_vec()));
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.nodes.lock().unwrap().insert(path.to_string(), Node::Dir);
        self
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(path)
    }

    pub fn remove(&self, path: &str) {
        self.nodes.lock().unwrap().remove(path);
    }

    /// All recorded calls, formatted as `op path`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(op))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn children_of<'a>(
        nodes: &'a BTreeMap<String, Node>,
        dir: &str,
    ) -> impl Iterator<Item = (&'a String, &'a Node)> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        nodes.iter().filter(move |(path, _)| {
            path.strip_prefix(&prefix)
                .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
        })
    }

    fn stats_for(path: &str, node: &Node) -> FileStats {
        let name = path.rsplit('/').next().unwrap_or("").to_string();
        let modified = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        match node {
            Node::File(data) => FileStats::file(name, data.len() as u64, modified),
            Node::Dir => FileStats::dir(name, modified),
        }
    }
}

#[async_trait]
impl RemoteStore for MemStore {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn list_dir(&self, path: &str) -> Result<Vec<FileStats>> {
        self.record(format!("list_dir {}", path));
        let nodes = self.nodes.lock().unwrap();
        if path != "/" && !matches!(nodes.get(path), Some(Node::Dir)) {
            return Err(ErrorKind::NotFound.into());
        }
        Ok(Self::children_of(&nodes, path)
            .map(|(child, node)| Self::stats_for(child, node))
            .collect())
    }

    async fn get_file_info(&self, path: &str) -> Result<FileStats> {
        self.record(format!("get_file_info {}", path));
        if path == "/" {
            let modified = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
            return Ok(FileStats::dir("/", modified));
        }
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(path)
            .map(|node| Self::stats_for(path, node))
            .ok_or_else(|| Error::from(ErrorKind::NotFound))
    }

    async fn read_file(&self, path: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        self.record(format!("read_file {}", path));
        let nodes = self.nodes.lock().unwrap();
        let Some(Node::File(data)) = nodes.get(path) else {
            return Err(ErrorKind::NotFound.into());
        };
        let start = (offset as usize).min(data.len());
        let end = match length {
            Some(len) => (start + len as usize).min(data.len()),
            None => data.len(),
        };
        Ok(data[start..end].to_vec())
    }

    async fn write_file(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        self.record(format!("write_file {} {}@{}", path, data.len(), offset));
        let mut nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(path) {
            nodes.insert(path.to_string(), Node::File(Vec::new()));
        }
        let content = match nodes.get_mut(path) {
            Some(Node::File(content)) => content,
            _ => return Err(ErrorKind::AccessDenied.into()),
        };
        let offset = offset as usize;
        if offset > content.len() {
            content.resize(offset, 0);
        }
        let overlap = data.len().min(content.len().saturating_sub(offset));
        content[offset..offset + overlap].copy_from_slice(&data[..overlap]);
        content.extend_from_slice(&data[overlap..]);
        Ok(data.len())
    }

    async fn create_file(&self, path: &str) -> Result<()> {
        self.record(format!("create_file {}", path));
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(path) {
            return Err(ErrorKind::AlreadyExists.into());
        }
        nodes.insert(path.to_string(), Node::File(Vec::new()));
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.record(format!("create_dir {}", path));
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.record(format!("delete_file {}", path));
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.remove(path) {
            Some(_) => Ok(()),
            None => Err(ErrorKind::NotFound.into()),
        }
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        self.record(format!("delete_dir {}", path));
        let mut nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(path) {
            return Err(ErrorKind::NotFound.into());
        }
        if Self::children_of(&nodes, path).next().is_some() {
            return Err(ErrorKind::NotEmpty.into());
        }
        nodes.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.record(format!("rename {} {}", from, to));
        let mut nodes = self.nodes.lock().unwrap();
        let Some(node) = nodes.remove(from) else {
            return Err(ErrorKind::NotFound.into());
        };
        let descendants: Vec<String> = nodes
            .keys()
            .filter(|k| k.starts_with(&format!("{}/", from)))
            .cloned()
            .collect();
        for old_key in descendants {
            let moved = nodes.remove(&old_key).unwrap();
            let new_key = format!("{}{}", to, &old_key[from.len()..]);
            nodes.insert(new_key, moved);
        }
        nodes.insert(to.to_string(), node);
        Ok(())
    }
}
