//! Inode numbering for the FUSE binding
//!
//! FUSE addresses entries by inode; the proxy works on virtual paths.
//! Numbers are handed out on first lookup and stay stable for the life
//! of the mount.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Inode of the virtual root
pub const ROOT_INO: u64 = 1;

/// Maps virtual paths to inode numbers and back
pub struct InodeTable {
    /// Next inode number
    next_ino: AtomicU64,
    /// ino -> virtual path
    paths: RwLock<HashMap<u64, String>>,
    /// virtual path -> ino
    inos: RwLock<HashMap<String, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = InodeTable {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            paths: RwLock::new(HashMap::new()),
            inos: RwLock::new(HashMap::new()),
        };
        table.paths.write().insert(ROOT_INO, "/".to_string());
        table.inos.write().insert("/".to_string(), ROOT_INO);
        table
    }

    /// Virtual path of an inode
    pub fn path(&self, ino: u64) -> Option<String> {
        self.paths.read().get(&ino).cloned()
    }

    /// Inode for a virtual path, allocating one if needed
    pub fn ino_for(&self, path: &str) -> u64 {
        if let Some(&ino) = self.inos.read().get(path) {
            return ino;
        }

        let mut inos = self.inos.write();
        // Raced with another lookup of the same path
        if let Some(&ino) = inos.get(path) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        inos.insert(path.to_string(), ino);
        self.paths.write().insert(ino, path.to_string());
        ino
    }

    /// Virtual path of `name` inside the directory `parent`
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent_path = self.path(parent)?;
        Some(join(&parent_path, name))
    }

    /// Inode of the parent directory of `ino`
    pub fn parent_of(&self, ino: u64) -> u64 {
        let Some(path) = self.path(ino) else {
            return ROOT_INO;
        };
        match path.rfind('/') {
            Some(0) | None => ROOT_INO,
            Some(idx) => self.ino_for(&path[..idx]),
        }
    }

    pub fn len(&self) -> usize {
        self.paths.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.read().is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}
