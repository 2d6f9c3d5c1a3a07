//! Proxy filesystem core
//!
//! Maps virtual paths onto the physical backing directory and keeps the
//! per-handle state machine:
//!
//! - directories are never transcoded
//! - files the filter selects are decoded to UTF-8 in full on open, edited
//!   in memory and re-encoded on close when dirty
//! - every other file is served raw and is read-only through the proxy
//! - a missing physical path yields an `Absent` handle rather than an error

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::attr::{FileAttributes, FreeSpace, NamedAttributes, VolumeInfo};
use super::handle::{FileHandle, HandleKind, HandleTable, SharedHandle, TranscodedBuffer};
use crate::config::{Config, DecodeFailurePolicy};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::transcode;

const GIB: u64 = 1024 * 1024 * 1024;

/// Proxy filesystem over a physical directory
pub struct ProxyFs {
    /// Root of the physical backing tree
    physical_root: PathBuf,
    /// Transcoding gate
    filter: Filter,
    /// What to do when an open cannot decode the file
    decode_failure: DecodeFailurePolicy,
    /// Open handles
    handles: HandleTable,
}

impl ProxyFs {
    /// Create a proxy over the configured physical path
    pub fn new(config: &Config, filter: Filter) -> Self {
        ProxyFs {
            physical_root: config.physical_path.clone(),
            filter,
            decode_failure: config.decode_failure,
            handles: HandleTable::new(),
        }
    }

    /// Root of the physical backing tree
    pub fn physical_root(&self) -> &Path {
        &self.physical_root
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Number of open handles
    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Resolve a virtual path under the physical root.
    ///
    /// Both separators are accepted. `..` is resolved lexically and never
    /// climbs above the root.
    pub fn physical_path(&self, virtual_path: &str) -> PathBuf {
        let mut relative = PathBuf::new();
        for part in virtual_path.split(['/', '\\']) {
            match Path::new(part).components().next() {
                Some(Component::Normal(name)) => relative.push(name),
                Some(Component::ParentDir) => {
                    relative.pop();
                }
                _ => {}
            }
        }
        if relative.as_os_str().is_empty() {
            return self.physical_root.clone();
        }
        self.physical_root.join(relative)
    }

    /// Is this the virtual root?
    pub fn is_root(virtual_path: &str) -> bool {
        virtual_path.trim_matches(|c| c == '/' || c == '\\').is_empty()
    }

    /// Open a file or directory on behalf of `process`, returning a handle id
    pub fn open(&self, virtual_path: &str, wants_directory: bool, process: &str) -> Result<u64> {
        let handle = self.open_handle(virtual_path, wants_directory, process)?;
        Ok(self.handles.insert(handle))
    }

    fn open_handle(
        &self,
        virtual_path: &str,
        wants_directory: bool,
        process: &str,
    ) -> Result<FileHandle> {
        let phys = self.physical_path(virtual_path);
        debug!(
            "[{}] open: {} (directory: {})",
            process, virtual_path, wants_directory
        );

        if Self::is_root(virtual_path) {
            return Ok(FileHandle::new(virtual_path, phys, HandleKind::Directory));
        }

        let meta = match fs::metadata(&phys) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("[{}] open: {} is absent", process, virtual_path);
                return Ok(FileHandle::new(virtual_path, phys, HandleKind::Absent));
            }
            Err(e) => {
                error!("[{}] open: stat {:?} failed: {}", process, phys, e);
                return Err(Error::Io(e));
            }
        };

        if wants_directory || meta.is_dir() {
            return Ok(FileHandle::new(virtual_path, phys, HandleKind::Directory));
        }

        let kind = if self.filter.should_process(process, virtual_path) {
            info!("[{}] Transcoding enabled for: {}", process, virtual_path);
            self.open_transcoding(&phys, virtual_path)?
        } else {
            open_passthrough(&phys)?
        };

        Ok(FileHandle::new(virtual_path, phys, kind))
    }

    fn open_transcoding(&self, phys: &Path, virtual_path: &str) -> Result<HandleKind> {
        let raw = match fs::read(phys) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HandleKind::Absent),
            Err(e) => return Err(Error::Io(e)),
        };
        let original_len = raw.len() as u64;

        match transcode::normalize_to_utf8(&raw) {
            Ok(content) => Ok(HandleKind::Transcoding(TranscodedBuffer::new(
                content,
                original_len,
            ))),
            Err(e) => match self.decode_failure {
                DecodeFailurePolicy::Empty => {
                    warn!("{}: {}; serving empty content", virtual_path, e);
                    Ok(HandleKind::Transcoding(TranscodedBuffer::new(
                        Vec::new(),
                        original_len,
                    )))
                }
                DecodeFailurePolicy::Reject => {
                    warn!("{}: {}; rejecting open", virtual_path, e);
                    Err(e)
                }
                DecodeFailurePolicy::Passthrough => {
                    warn!("{}: {}; serving raw bytes", virtual_path, e);
                    open_passthrough(phys)
                }
            },
        }
    }

    fn handle(&self, fh: u64) -> Result<SharedHandle> {
        self.handles.get(fh)
    }

    /// Read up to `size` bytes at `offset`; an empty result is end-of-data
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let handle = self.handle(fh)?;
        let handle = handle.lock();

        match &handle.kind {
            HandleKind::Transcoding(buf) => {
                let Ok(offset) = usize::try_from(offset) else {
                    return Ok(Vec::new());
                };
                Ok(buf.read(offset, size as usize).to_vec())
            }
            HandleKind::Passthrough(file) => read_at(file, offset, size as usize),
            HandleKind::Directory | HandleKind::Absent => Ok(Vec::new()),
        }
    }

    /// Write `data` at `offset`; only transcoding handles accept writes
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let handle = self.handle(fh)?;
        let mut guard = handle.lock();
        let handle = &mut *guard;

        match &mut handle.kind {
            HandleKind::Transcoding(buf) => {
                let start = usize::try_from(offset).map_err(|_| Error::InvalidOffset(offset))?;
                buf.write(start, data)
            }
            HandleKind::Passthrough(_) => {
                Err(Error::UnsupportedOperation("write to a passthrough file"))
            }
            HandleKind::Directory => Err(Error::UnsupportedOperation("write to a directory")),
            HandleKind::Absent => Err(Error::NotFound(handle.virtual_path.clone())),
        }
    }

    /// Resize a transcoding buffer
    pub fn truncate(&self, fh: u64, len: u64) -> Result<()> {
        let handle = self.handle(fh)?;
        let mut guard = handle.lock();
        let handle = &mut *guard;

        match &mut handle.kind {
            HandleKind::Transcoding(buf) => {
                let len = usize::try_from(len).map_err(|_| Error::InvalidOffset(len))?;
                buf.set_len(len)
            }
            HandleKind::Absent => Err(Error::NotFound(handle.virtual_path.clone())),
            _ => Err(Error::UnsupportedOperation("truncate")),
        }
    }

    /// Attributes of an open handle.
    ///
    /// Transcoding handles report their buffered UTF-8 length. A failed
    /// stat yields synthetic regular-file attributes.
    pub fn get_attributes(&self, fh: u64) -> Result<FileAttributes> {
        let handle = self.handle(fh)?;
        let handle = handle.lock();

        let attrs = match fs::metadata(&handle.physical_path) {
            Ok(meta) => FileAttributes::from_metadata(&meta),
            Err(e) => {
                debug!("get_attributes: {}: {}", handle.virtual_path, e);
                return Ok(FileAttributes::regular_fallback());
            }
        };

        Ok(match handle.buffered_len() {
            Some(len) if !attrs.is_directory() => attrs.with_size(len),
            _ => attrs,
        })
    }

    /// Attributes of a path as `process` would see them after opening it.
    ///
    /// Used by lookups that have no handle yet. Files the process would
    /// transcode report the UTF-8 length, taken from an open handle when one
    /// exists and otherwise by decoding the file.
    pub fn stat_path(&self, virtual_path: &str, process: &str) -> Result<FileAttributes> {
        let phys = self.physical_path(virtual_path);

        let meta = match fs::metadata(&phys) {
            Ok(meta) => meta,
            Err(_) if Self::is_root(virtual_path) => return Ok(FileAttributes::directory_fallback()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(virtual_path.to_string()))
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let attrs = FileAttributes::from_metadata(&meta);
        if attrs.is_directory() || !self.filter.should_process(process, virtual_path) {
            return Ok(attrs);
        }

        if let Some(len) = self.live_utf8_len(virtual_path) {
            return Ok(attrs.with_size(len));
        }

        let len = fs::read(&phys)
            .ok()
            .and_then(|raw| transcode::normalize_to_utf8(&raw).ok())
            .map(|content| content.len() as u64);
        Ok(match len {
            Some(len) => attrs.with_size(len),
            None => attrs,
        })
    }

    /// Buffered length of the most recent transcoding handle on a path
    fn live_utf8_len(&self, virtual_path: &str) -> Option<u64> {
        self.handles
            .handles_for_path(virtual_path)
            .iter()
            .filter_map(|h| h.lock().buffered_len())
            .last()
    }

    /// Enumerate a directory handle's physical entries.
    ///
    /// `pattern` is left to the host framework; entry names pass through
    /// untouched.
    pub fn list_directory<F>(&self, fh: u64, pattern: &str, mut fill: F) -> Result<()>
    where
        F: FnMut(NamedAttributes) -> Result<()>,
    {
        let handle = self.handle(fh)?;
        let handle = handle.lock();
        debug!("list_directory: {} (pattern: {:?})", handle.virtual_path, pattern);

        if !handle.is_directory() {
            return Err(Error::NotADirectory(handle.virtual_path.clone()));
        }

        let entries = fs::read_dir(&handle.physical_path).map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOTDIR) {
                Error::NotADirectory(handle.virtual_path.clone())
            } else {
                Error::Io(e)
            }
        })?;

        for entry in entries {
            let entry = entry?;
            let attrs = match entry.metadata() {
                Ok(meta) => FileAttributes::from_metadata(&meta),
                Err(_) => FileAttributes::regular_fallback(),
            };
            fill(NamedAttributes {
                name: entry.file_name(),
                attrs,
            })?;
        }

        Ok(())
    }

    /// Close a handle, writing dirty transcoded content back.
    ///
    /// The handle is gone afterwards even when write-back fails. An encode
    /// failure leaves the physical file untouched.
    pub fn close(&self, fh: u64) -> Result<()> {
        let handle = self.handles.remove(fh)?;
        let mut handle = handle.lock();
        debug!("close: {}", handle.virtual_path);

        match std::mem::replace(&mut handle.kind, HandleKind::Absent) {
            HandleKind::Transcoding(buf) if buf.dirty => {
                let encoded = transcode::convert_from_utf8(&buf.content).map_err(|e| {
                    error!(
                        "close: {} not written back, edits discarded: {}",
                        handle.virtual_path, e
                    );
                    e
                })?;
                fs::write(&handle.physical_path, &encoded)?;
                debug!(
                    "close: wrote {} bytes to {:?} (was {})",
                    encoded.len(),
                    handle.physical_path,
                    buf.original_len
                );
                Ok(())
            }
            HandleKind::Passthrough(file) => {
                drop(file);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Flush buffers; write-back happens on close only
    pub fn flush(&self, fh: u64) -> Result<()> {
        self.handle(fh).map(|_| ())
    }

    pub fn move_file(&self, source: &str, target: &str, _replace_existing: bool) -> Result<()> {
        debug!("move_file: ignored ({} -> {})", source, target);
        Ok(())
    }

    pub fn lock(&self, _fh: u64, _offset: u64, _length: u64) -> Result<()> {
        Ok(())
    }

    pub fn unlock(&self, _fh: u64, _offset: u64, _length: u64) -> Result<()> {
        Ok(())
    }

    pub fn set_file_attributes(&self, _virtual_path: &str, _attributes: u32) -> Result<()> {
        Ok(())
    }

    pub fn set_file_time(&self, _virtual_path: &str) -> Result<()> {
        Ok(())
    }

    pub fn file_security(&self, _virtual_path: &str) -> Result<()> {
        Ok(())
    }

    pub fn volume_info(&self) -> VolumeInfo {
        VolumeInfo {
            volume_name: "UTF8Proxy",
            serial_number: 0x1234_5678,
            max_component_length: 255,
            file_system_name: "NTFS",
        }
    }

    pub fn free_space(&self) -> FreeSpace {
        FreeSpace {
            free_bytes_available: 10 * GIB,
            total_bytes: 20 * GIB,
            total_free_bytes: 10 * GIB,
        }
    }
}

/// Raw handle for read/write, falling back to read-only
fn open_passthrough(phys: &Path) -> Result<HandleKind> {
    let file = match OpenOptions::new().read(true).write(true).open(phys) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => File::open(phys),
    };

    match file {
        Ok(file) => Ok(HandleKind::Passthrough(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HandleKind::Absent),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Positioned read that keeps going until `size` bytes or end of file
fn read_at(file: &File, offset: u64, size: usize) -> Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;

    let mut buffer = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read_at(&mut buffer[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    buffer.truncate(filled);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::handle::HandleState;
    use std::ffi::OsString;
    use tempfile::{tempdir, TempDir};

    const NI_HAO_GB: [u8; 4] = [0xC4, 0xE3, 0xBA, 0xC3];
    const LEGACY: &str = "a.exe";
    const MODERN: &str = "code";

    fn setup(policy: DecodeFailurePolicy) -> (TempDir, ProxyFs) {
        let dir = tempdir().unwrap();
        let config = Config {
            physical_path: dir.path().to_path_buf(),
            decode_failure: policy,
            ..Config::default()
        };
        let proxy = ProxyFs::new(&config, Filter::new([LEGACY], [".txt"]));
        (dir, proxy)
    }

    fn state(proxy: &ProxyFs, fh: u64) -> HandleState {
        proxy.handle(fh).unwrap().lock().state()
    }

    #[test]
    fn test_physical_path() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        assert_eq!(proxy.physical_path("/"), dir.path());
        assert_eq!(proxy.physical_path("/a/b.txt"), dir.path().join("a").join("b.txt"));
        assert_eq!(proxy.physical_path("\\a\\b.txt"), dir.path().join("a").join("b.txt"));
        assert_eq!(proxy.physical_path("/a/./../../../etc/passwd"), dir.path().join("etc").join("passwd"));
    }

    #[test]
    fn test_root_is_directory_even_if_unreadable() {
        let config = Config {
            physical_path: PathBuf::from("/nonexistent/utf8proxyfs/root"),
            ..Config::default()
        };
        let proxy = ProxyFs::new(&config, Filter::default());

        for root in ["/", "\\", ""] {
            let fh = proxy.open(root, false, MODERN).unwrap();
            assert_eq!(state(&proxy, fh), HandleState::Directory);
        }
        assert!(proxy.stat_path("/", MODERN).unwrap().is_directory());
    }

    #[test]
    fn test_missing_file_is_absent() {
        let (_dir, proxy) = setup(DecodeFailurePolicy::Empty);

        let fh = proxy.open("/missing.txt", false, LEGACY).unwrap();
        assert_eq!(state(&proxy, fh), HandleState::Absent);
        assert!(proxy.read(fh, 0, 10).unwrap().is_empty());
        assert!(proxy.write(fh, 0, b"x").is_err());
        assert_eq!(
            proxy.get_attributes(fh).unwrap().attributes,
            crate::fs::attr::FILE_ATTRIBUTE_NORMAL
        );
        proxy.close(fh).unwrap();
        assert!(!proxy.physical_root().join("missing.txt").exists());

        assert!(matches!(
            proxy.stat_path("/missing.txt", LEGACY),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_directory_handle() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("a.txt"), b"abc").unwrap();

        // Existence probe as a file still yields a directory handle
        let fh = proxy.open("/sub", false, LEGACY).unwrap();
        assert_eq!(state(&proxy, fh), HandleState::Directory);
        assert!(proxy.read(fh, 0, 10).unwrap().is_empty());
        assert!(matches!(
            proxy.write(fh, 0, b"x"),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(proxy.get_attributes(fh).unwrap().is_directory());

        let mut names = Vec::new();
        proxy.list_directory(fh, "*", |entry| {
            names.push((entry.name, entry.attrs.size));
            Ok(())
        })
        .unwrap();
        assert_eq!(names, vec![(OsString::from("a.txt"), 3u64)]);
        proxy.close(fh).unwrap();
    }

    #[test]
    fn test_list_file_requested_as_directory() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("a.txt"), b"abc").unwrap();

        let fh = proxy.open("/a.txt", true, LEGACY).unwrap();
        assert_eq!(state(&proxy, fh), HandleState::Directory);
        assert!(proxy.list_directory(fh, "*", |_| Ok(())).is_err());
    }

    #[test]
    fn test_list_directory_on_file_handle() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("a.dat"), b"abc").unwrap();

        let fh = proxy.open("/a.dat", false, LEGACY).unwrap();
        assert!(matches!(
            proxy.list_directory(fh, "*", |_| Ok(())),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_transcoding_read() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("hello.txt"), NI_HAO_GB).unwrap();

        let fh = proxy.open("/hello.txt", false, LEGACY).unwrap();
        assert_eq!(state(&proxy, fh), HandleState::Transcoding);
        assert_eq!(proxy.read(fh, 0, 100).unwrap(), "你好".as_bytes());
        assert_eq!(proxy.read(fh, 3, 3).unwrap(), "好".as_bytes());
        assert!(proxy.read(fh, 6, 10).unwrap().is_empty());
        assert!(proxy.read(fh, u64::MAX, 10).unwrap().is_empty());

        // UTF-8 length, not the 4 physical bytes
        assert_eq!(proxy.get_attributes(fh).unwrap().size, 6);
        assert_eq!(proxy.stat_path("/hello.txt", LEGACY).unwrap().size, 6);
        assert_eq!(proxy.stat_path("/hello.txt", MODERN).unwrap().size, 4);
    }

    #[test]
    fn test_passthrough_for_other_process() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("hello.txt"), NI_HAO_GB).unwrap();

        let fh = proxy.open("/hello.txt", false, MODERN).unwrap();
        assert_eq!(state(&proxy, fh), HandleState::Passthrough);
        assert_eq!(proxy.read(fh, 0, 100).unwrap(), NI_HAO_GB);
        assert_eq!(proxy.read(fh, 2, 100).unwrap(), &NI_HAO_GB[2..]);
        assert!(proxy.read(fh, 10, 100).unwrap().is_empty());
        assert_eq!(proxy.get_attributes(fh).unwrap().size, 4);
    }

    #[test]
    fn test_passthrough_for_other_extension() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("data.csv"), NI_HAO_GB).unwrap();

        let fh = proxy.open("/data.csv", false, LEGACY).unwrap();
        assert_eq!(state(&proxy, fh), HandleState::Passthrough);
    }

    #[test]
    fn test_passthrough_rejects_writes() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("hello.txt"), b"abc").unwrap();

        let fh = proxy.open("/hello.txt", false, MODERN).unwrap();
        let err = proxy.write(fh, 0, b"xyz").unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
        proxy.close(fh).unwrap();
        assert_eq!(fs::read(dir.path().join("hello.txt")).unwrap(), b"abc");
    }

    #[cfg(unix)]
    #[test]
    fn test_passthrough_falls_back_to_read_only() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        let path = dir.path().join("ro.dat");
        fs::write(&path, b"readonly").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();

        // Root opens a 0o444 file read-write, so the fallback never runs
        if nix::unistd::geteuid().is_root() {
            return;
        }

        let fh = proxy.open("/ro.dat", false, MODERN).unwrap();
        assert_eq!(state(&proxy, fh), HandleState::Passthrough);
        assert_eq!(proxy.read(fh, 0, 64).unwrap(), b"readonly");

        let handle = proxy.handle(fh).unwrap();
        let guard = handle.lock();
        let HandleKind::Passthrough(file) = &guard.kind else {
            panic!("expected a passthrough handle");
        };
        // The descriptor is read-only
        assert!((&*file).write_all(b"x").is_err());
    }

    #[test]
    fn test_stat_error_is_propagated() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("a.txt"), b"abc").unwrap();

        // A regular file used as a directory component fails with ENOTDIR
        let err = proxy.open("/a.txt/child", false, LEGACY).unwrap_err();
        assert!(matches!(&err, Error::Io(e) if e.raw_os_error() == Some(libc::ENOTDIR)));
        assert_eq!(err.errno(), libc::ENOTDIR);
        assert_eq!(proxy.open_handle_count(), 0);
    }

    #[test]
    fn test_write_at_huge_offset_is_refused() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("hello.txt"), NI_HAO_GB).unwrap();

        let fh = proxy.open("/hello.txt", false, LEGACY).unwrap();
        assert!(matches!(
            proxy.write(fh, (i64::MAX - 10) as u64, b"y"),
            Err(Error::InvalidOffset(_))
        ));
        assert!(matches!(
            proxy.truncate(fh, u64::MAX / 2),
            Err(Error::InvalidOffset(_))
        ));

        // The handle is still usable and unchanged
        assert_eq!(state(&proxy, fh), HandleState::Transcoding);
        assert_eq!(proxy.read(fh, 0, 64).unwrap(), "你好".as_bytes());
        proxy.close(fh).unwrap();
        assert_eq!(fs::read(dir.path().join("hello.txt")).unwrap(), NI_HAO_GB);
    }

    #[test]
    fn test_write_zero_extends_and_commits_on_close() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        let path = dir.path().join("hello.txt");
        fs::write(&path, NI_HAO_GB).unwrap();

        let fh = proxy.open("/hello.txt", false, LEGACY).unwrap();
        assert_eq!(proxy.write(fh, 8, b"!").unwrap(), 1);
        assert_eq!(state(&proxy, fh), HandleState::Dirty);
        assert_eq!(proxy.get_attributes(fh).unwrap().size, 9);
        assert_eq!(proxy.read(fh, 6, 10).unwrap(), b"\0\0!");

        // Physical file untouched until close
        assert_eq!(fs::read(&path).unwrap(), NI_HAO_GB);
        proxy.close(fh).unwrap();

        let mut expected = NI_HAO_GB.to_vec();
        expected.extend_from_slice(b"\0\0!");
        assert_eq!(fs::read(&path).unwrap(), expected);
        assert_eq!(proxy.open_handle_count(), 0);
    }

    #[test]
    fn test_utf8_edit_is_stored_as_gb18030() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        let path = dir.path().join("note.txt");
        fs::write(&path, b"").unwrap();

        let fh = proxy.open("/note.txt", false, LEGACY).unwrap();
        proxy.write(fh, 0, "你好".as_bytes()).unwrap();
        proxy.close(fh).unwrap();
        assert_eq!(fs::read(&path).unwrap(), NI_HAO_GB);

        // The modern tool sees the raw legacy bytes
        let fh = proxy.open("/note.txt", false, MODERN).unwrap();
        assert_eq!(proxy.read(fh, 0, 16).unwrap(), NI_HAO_GB);
    }

    #[test]
    fn test_clean_close_does_not_rewrite() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        let path = dir.path().join("bom.txt");
        let mut original = transcode::UTF8_BOM.to_vec();
        original.extend_from_slice("你好".as_bytes());
        fs::write(&path, &original).unwrap();

        let fh = proxy.open("/bom.txt", false, LEGACY).unwrap();
        assert_eq!(proxy.read(fh, 0, 64).unwrap(), "你好".as_bytes());
        proxy.close(fh).unwrap();

        assert_eq!(fs::read(&path).unwrap(), original);
    }

    #[test]
    fn test_truncate() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        let path = dir.path().join("hello.txt");
        fs::write(&path, NI_HAO_GB).unwrap();

        let fh = proxy.open("/hello.txt", false, LEGACY).unwrap();
        proxy.truncate(fh, 3).unwrap();
        proxy.close(fh).unwrap();
        assert_eq!(fs::read(&path).unwrap(), &NI_HAO_GB[..2]);

        let fh = proxy.open("/hello.txt", false, MODERN).unwrap();
        assert!(matches!(
            proxy.truncate(fh, 0),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_encode_failure_leaves_file_untouched() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        let path = dir.path().join("hello.txt");
        fs::write(&path, NI_HAO_GB).unwrap();

        let fh = proxy.open("/hello.txt", false, LEGACY).unwrap();
        // Splitting a UTF-8 sequence leaves the buffer invalid
        proxy.write(fh, 1, &[0xFF]).unwrap();

        assert!(matches!(proxy.close(fh), Err(Error::Encode(_))));
        assert_eq!(fs::read(&path).unwrap(), NI_HAO_GB);
        assert!(matches!(proxy.read(fh, 0, 1), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_decode_failure_policies() {
        let malformed = [0x81u8, 0x30, 0xFF];

        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("bad.txt"), malformed).unwrap();
        let fh = proxy.open("/bad.txt", false, LEGACY).unwrap();
        assert_eq!(state(&proxy, fh), HandleState::Transcoding);
        assert!(proxy.read(fh, 0, 16).unwrap().is_empty());
        // Closing an untouched handle must not wipe the file
        proxy.close(fh).unwrap();
        assert_eq!(fs::read(dir.path().join("bad.txt")).unwrap(), malformed);

        let (dir, proxy) = setup(DecodeFailurePolicy::Reject);
        fs::write(dir.path().join("bad.txt"), malformed).unwrap();
        assert!(matches!(
            proxy.open("/bad.txt", false, LEGACY),
            Err(Error::Decode(_))
        ));
        assert_eq!(proxy.open_handle_count(), 0);

        let (dir, proxy) = setup(DecodeFailurePolicy::Passthrough);
        fs::write(dir.path().join("bad.txt"), malformed).unwrap();
        let fh = proxy.open("/bad.txt", false, LEGACY).unwrap();
        assert_eq!(state(&proxy, fh), HandleState::Passthrough);
        assert_eq!(proxy.read(fh, 0, 16).unwrap(), malformed);
    }

    #[test]
    fn test_stat_path_prefers_open_handle() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        fs::write(dir.path().join("hello.txt"), NI_HAO_GB).unwrap();

        let fh = proxy.open("/hello.txt", false, LEGACY).unwrap();
        proxy.write(fh, 6, b"abc").unwrap();
        assert_eq!(proxy.stat_path("/hello.txt", LEGACY).unwrap().size, 9);
    }

    #[test]
    fn test_stubs_and_volume() {
        let (_dir, proxy) = setup(DecodeFailurePolicy::Empty);
        let fh = proxy.open("/", true, MODERN).unwrap();

        proxy.flush(fh).unwrap();
        proxy.move_file("/a.txt", "/elsewhere", true).unwrap();
        proxy.lock(fh, 0, 10).unwrap();
        proxy.unlock(fh, 0, 10).unwrap();
        proxy.set_file_attributes("/", 0).unwrap();
        proxy.set_file_time("/").unwrap();
        proxy.file_security("/").unwrap();

        assert_eq!(proxy.volume_info().volume_name, "UTF8Proxy");
        let space = proxy.free_space();
        assert_eq!(space.total_bytes, 20 * GIB);
        assert_eq!(space.free_bytes_available, 10 * GIB);
    }

    #[test]
    fn test_concurrent_handles() {
        let (dir, proxy) = setup(DecodeFailurePolicy::Empty);
        for i in 0..8 {
            fs::write(dir.path().join(format!("f{}.txt", i)), NI_HAO_GB).unwrap();
        }
        let proxy = std::sync::Arc::new(proxy);

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let proxy = proxy.clone();
                std::thread::spawn(move || {
                    let path = format!("/f{}.txt", i);
                    let fh = proxy.open(&path, false, LEGACY).unwrap();
                    for _ in 0..50 {
                        assert_eq!(proxy.read(fh, 0, 6).unwrap(), "你好".as_bytes());
                    }
                    proxy.write(fh, 6, "好".as_bytes()).unwrap();
                    proxy.close(fh).unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        for i in 0..8 {
            let data = fs::read(dir.path().join(format!("f{}.txt", i))).unwrap();
            assert_eq!(data, [0xC4u8, 0xE3, 0xBA, 0xC3, 0xBA, 0xC3]);
        }
    }
}
