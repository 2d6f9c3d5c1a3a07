//! Open handle state and the handle table

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Largest in-memory buffer a transcoding handle may grow to
pub const MAX_BUFFER_LEN: usize = u32::MAX as usize;

/// UTF-8 view of a transcoded file
#[derive(Debug, Default)]
pub struct TranscodedBuffer {
    /// Whole file content, decoded to UTF-8
    pub content: Vec<u8>,
    /// Physical byte length when the file was opened
    pub original_len: u64,
    /// Content changed since open
    pub dirty: bool,
}

impl TranscodedBuffer {
    pub fn new(content: Vec<u8>, original_len: u64) -> Self {
        TranscodedBuffer {
            content,
            original_len,
            dirty: false,
        }
    }

    /// Copy up to `size` bytes from `offset`; empty at or past the end
    pub fn read(&self, offset: usize, size: usize) -> &[u8] {
        if offset >= self.content.len() {
            return &[];
        }
        let end = offset.saturating_add(size).min(self.content.len());
        &self.content[offset..end]
    }

    /// Overwrite at `offset`, zero-filling any gap past the current end
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<usize> {
        let end = offset
            .checked_add(data.len())
            .ok_or(Error::InvalidOffset(offset as u64))?;
        if end > self.content.len() {
            self.grow(end, offset as u64)?;
        }
        self.content[offset..end].copy_from_slice(data);
        self.dirty = true;
        Ok(data.len())
    }

    /// Cut or zero-extend the buffer to `len`
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.content.len() {
            self.grow(len, len as u64)?;
            self.dirty = true;
        } else if len < self.content.len() {
            self.content.truncate(len);
            self.dirty = true;
        }
        Ok(())
    }

    /// Zero-extend to `len`, refusing lengths past the cap or that the
    /// allocator cannot satisfy
    fn grow(&mut self, len: usize, offset: u64) -> Result<()> {
        if len > MAX_BUFFER_LEN {
            return Err(Error::InvalidOffset(offset));
        }
        self.content
            .try_reserve(len - self.content.len())
            .map_err(|_| Error::InvalidOffset(offset))?;
        self.content.resize(len, 0);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// What an open handle is backed by
#[derive(Debug)]
pub enum HandleKind {
    /// Directory; never transcoded
    Directory,
    /// Regular file held decoded in memory
    Transcoding(TranscodedBuffer),
    /// Regular file served raw from the physical file
    Passthrough(File),
    /// Nothing exists at the physical path
    Absent,
}

/// Observable handle state, without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Directory,
    Transcoding,
    Dirty,
    Passthrough,
    Absent,
}

/// One open file or directory
#[derive(Debug)]
pub struct FileHandle {
    /// Path as seen by the caller
    pub virtual_path: String,
    /// Resolved path in the backing directory
    pub physical_path: PathBuf,
    /// Backing state
    pub kind: HandleKind,
}

impl FileHandle {
    pub fn new(virtual_path: &str, physical_path: PathBuf, kind: HandleKind) -> Self {
        FileHandle {
            virtual_path: virtual_path.to_string(),
            physical_path,
            kind,
        }
    }

    pub fn state(&self) -> HandleState {
        match &self.kind {
            HandleKind::Directory => HandleState::Directory,
            HandleKind::Transcoding(buf) if buf.dirty => HandleState::Dirty,
            HandleKind::Transcoding(_) => HandleState::Transcoding,
            HandleKind::Passthrough(_) => HandleState::Passthrough,
            HandleKind::Absent => HandleState::Absent,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, HandleKind::Directory)
    }

    pub fn is_transcoding(&self) -> bool {
        matches!(self.kind, HandleKind::Transcoding(_))
    }

    /// Check if dirty (modified)
    pub fn is_dirty(&self) -> bool {
        matches!(&self.kind, HandleKind::Transcoding(buf) if buf.dirty)
    }

    /// Buffered UTF-8 length of a transcoding handle
    pub fn buffered_len(&self) -> Option<u64> {
        match &self.kind {
            HandleKind::Transcoding(buf) => Some(buf.len() as u64),
            _ => None,
        }
    }
}

/// Shared, individually locked handle
pub type SharedHandle = Arc<Mutex<FileHandle>>;

struct TableEntry {
    /// Copy of the handle's virtual path, readable without taking its lock
    virtual_path: String,
    handle: SharedHandle,
}

/// Table of open handles.
///
/// Each handle sits behind its own mutex, so operations on one handle are
/// serialized while different handles proceed in parallel.
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, TableEntry>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handle and return its id
    pub fn insert(&self, handle: FileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        let entry = TableEntry {
            virtual_path: handle.virtual_path.clone(),
            handle: Arc::new(Mutex::new(handle)),
        };
        self.handles.write().insert(fh, entry);
        fh
    }

    /// Get handle by id
    pub fn get(&self, fh: u64) -> Result<SharedHandle> {
        self.handles
            .read()
            .get(&fh)
            .map(|entry| entry.handle.clone())
            .ok_or(Error::InvalidHandle(fh))
    }

    /// Remove a handle, returning it for final cleanup
    pub fn remove(&self, fh: u64) -> Result<SharedHandle> {
        self.handles
            .write()
            .remove(&fh)
            .map(|entry| entry.handle)
            .ok_or(Error::InvalidHandle(fh))
    }

    /// All handles currently open on a virtual path
    pub fn handles_for_path(&self, virtual_path: &str) -> Vec<SharedHandle> {
        self.handles
            .read()
            .values()
            .filter(|entry| entry.virtual_path == virtual_path)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
