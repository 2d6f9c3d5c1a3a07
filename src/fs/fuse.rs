//! FUSE binding for the proxy filesystem
//!
//! Translates inode-addressed FUSE callbacks into path-addressed
//! `ProxyFs` calls, resolving the acting process from the request pid.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

use super::inode::InodeTable;
use super::proxy::ProxyFs;
use crate::error::{Error, Result};
use crate::process::process_label;

/// Sizes depend on who is asking, so the kernel must not cache attributes
const TTL: Duration = Duration::ZERO;

const BLOCK_SIZE: u64 = 4096;

/// `fuser::Filesystem` adapter over a shared `ProxyFs`
pub struct ProxyFuse {
    proxy: Arc<ProxyFs>,
    inodes: InodeTable,
    uid: u32,
    gid: u32,
}

impl ProxyFuse {
    pub fn new(proxy: Arc<ProxyFs>) -> Self {
        ProxyFuse {
            proxy,
            inodes: InodeTable::new(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn path_of(&self, ino: u64) -> Result<String> {
        self.inodes
            .path(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }

    /// Attributes of `path` as seen by `process`
    /// Apply the changes a `setattr` carries; size only affects
    /// transcoding handles
    fn apply_setattr(
        &self,
        path: &str,
        fh: Option<u64>,
        size: Option<u64>,
        mode: Option<u32>,
        touches_times: bool,
    ) -> Result<()> {
        if let (Some(size), Some(fh)) = (size, fh) {
            match self.proxy.truncate(fh, size) {
                Ok(()) | Err(Error::UnsupportedOperation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(mode) = mode {
            self.proxy.set_file_attributes(path, mode)?;
        }
        if touches_times {
            self.proxy.set_file_time(path)?;
        }
        Ok(())
    }

    fn attr_for(&self, path: &str, process: &str) -> Result<FileAttr> {
        let attrs = self.proxy.stat_path(path, process)?;
        let ino = self.inodes.ino_for(path);
        Ok(attrs.to_fuser_attr(ino, self.uid, self.gid))
    }

    /// Directory listing including `.` and `..`
    fn dir_entries(&self, ino: u64, fh: u64) -> Result<Vec<(u64, FileType, OsString)>> {
        let path = self.path_of(ino)?;
        let mut entries = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (self.inodes.parent_of(ino), FileType::Directory, OsString::from("..")),
        ];

        self.proxy.list_directory(fh, "*", |entry| {
            let child = self
                .inodes
                .ino_for(&format!("{}/{}", path.trim_end_matches('/'), entry.name.to_string_lossy()));
            let kind = if entry.attrs.is_directory() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child, kind, entry.name));
            Ok(())
        })?;

        Ok(entries)
    }
}

impl Filesystem for ProxyFuse {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let process = process_label(req.pid());
        debug!("[{}] lookup(parent={}, name={:?})", process, parent, name);

        let Some(path) = self.inodes.child_path(parent, &name.to_string_lossy()) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.attr_for(&path, &process) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let process = process_label(req.pid());
        debug!("[{}] getattr(ino={})", process, ino);

        match self
            .path_of(ino)
            .and_then(|path| self.attr_for(&path, &process))
        {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let process = process_label(req.pid());
        debug!("[{}] setattr(ino={}, size={:?}, fh={:?})", process, ino, size, fh);

        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let touches_times = atime.is_some() || mtime.is_some();
        if let Err(e) = self.apply_setattr(&path, fh, size, mode, touches_times) {
            reply.error(e.errno());
            return;
        }

        let attrs = match fh {
            Some(fh) => self
                .proxy
                .get_attributes(fh)
                .map(|a| a.to_fuser_attr(ino, self.uid, self.gid)),
            None => self.attr_for(&path, &process),
        };
        match attrs {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let process = process_label(req.pid());
        debug!("[{}] open(ino={}, flags={:#o})", process, ino, flags);

        match self
            .path_of(ino)
            .and_then(|path| self.proxy.open(&path, false, &process))
        {
            // Direct I/O keeps the kernel from clipping reads to a stale size
            Ok(fh) => reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO),
            Err(e) => {
                error!("[{}] open(ino={}) failed: {}", process, ino, e);
                reply.error(e.errno());
            }
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let process = process_label(req.pid());
        debug!("[{}] opendir(ino={})", process, ino);

        match self
            .path_of(ino)
            .and_then(|path| self.proxy.open(&path, true, &process))
        {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.proxy.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read(fh={}) failed: {}", fh, e);
                reply.error(e.errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.proxy.write(fh, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                debug!("write(fh={}) refused: {}", fh, e);
                reply.error(e.errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.proxy.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.proxy.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("[{}] release(ino={}, fh={})", process_label(req.pid()), ino, fh);
        match self.proxy.close(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.dir_entries(ino, fh) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, *kind, name);
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.proxy.close(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let space = self.proxy.free_space();
        let volume = self.proxy.volume_info();
        reply.statfs(
            space.total_bytes / BLOCK_SIZE,
            space.total_free_bytes / BLOCK_SIZE,
            space.free_bytes_available / BLOCK_SIZE,
            1_000_000,
            500_000,
            BLOCK_SIZE as u32,
            volume.max_component_length,
            BLOCK_SIZE as u32,
        );
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let source = self.inodes.child_path(parent, &name.to_string_lossy());
        let target = self.inodes.child_path(newparent, &newname.to_string_lossy());
        match (source, target) {
            (Some(source), Some(target)) => match self.proxy.move_file(&source, &target, true) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            },
            _ => reply.error(libc::ENOENT),
        }
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        _typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        // Never conflicting
        reply.locked(start, end, libc::F_UNLCK, pid);
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        _pid: u32,
        _sleep: bool,
        reply: ReplyEmpty,
    ) {
        let length = end.saturating_sub(start);
        let result = if typ == libc::F_UNLCK {
            self.proxy.unlock(fh, start, length)
        } else {
            self.proxy.lock(fh, start, length)
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        match self
            .path_of(ino)
            .and_then(|path| self.proxy.file_security(&path))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        if self.inodes.path(ino).is_some() {
            reply.ok();
        } else {
            reply.error(libc::ENOENT);
        }
    }
}
