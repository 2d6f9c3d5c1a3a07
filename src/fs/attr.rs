//! File attributes reported to the driver

use std::ffi::OsString;
use std::fs::Metadata;
use std::time::SystemTime;

/// Attribute bit for directories
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;

/// Attribute bit for plain files
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x80;

/// Size, attribute bits and timestamps of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: u64,
    pub attributes: u32,
    pub creation: SystemTime,
    pub last_access: SystemTime,
    pub last_write: SystemTime,
    pub perm: u16,
}

impl FileAttributes {
    /// Synthetic attributes used when the physical path cannot be stat'ed
    pub fn regular_fallback() -> Self {
        Self::synthetic(FILE_ATTRIBUTE_NORMAL, 0o644)
    }

    /// Synthetic directory attributes
    pub fn directory_fallback() -> Self {
        Self::synthetic(FILE_ATTRIBUTE_DIRECTORY, 0o755)
    }

    fn synthetic(attributes: u32, perm: u16) -> Self {
        let now = SystemTime::now();
        FileAttributes {
            size: 0,
            attributes,
            creation: now,
            last_access: now,
            last_write: now,
            perm,
        }
    }

    /// Build attributes from physical metadata.
    ///
    /// All three timestamps come from the modification time.
    pub fn from_metadata(meta: &Metadata) -> Self {
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        FileAttributes {
            size: meta.len(),
            attributes: if meta.is_dir() {
                FILE_ATTRIBUTE_DIRECTORY
            } else {
                FILE_ATTRIBUTE_NORMAL
            },
            creation: mtime,
            last_access: mtime,
            last_write: mtime,
            perm: permissions(meta),
        }
    }

    /// Replace the reported size (transcoded files report their UTF-8 length)
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    /// Convert to fuser FileAttr
    pub fn to_fuser_attr(&self, ino: u64, uid: u32, gid: u32) -> fuser::FileAttr {
        let (kind, nlink) = if self.is_directory() {
            (fuser::FileType::Directory, 2)
        } else {
            (fuser::FileType::RegularFile, 1)
        };
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.size.div_ceil(512),
            atime: self.last_access,
            mtime: self.last_write,
            ctime: self.last_write,
            crtime: self.creation,
            kind,
            perm: self.perm,
            nlink,
            uid,
            gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

#[cfg(unix)]
fn permissions(meta: &Metadata) -> u16 {
    use std::os::unix::fs::PermissionsExt;
    (meta.permissions().mode() & 0o7777) as u16
}

#[cfg(not(unix))]
fn permissions(meta: &Metadata) -> u16 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Directory listing entry
#[derive(Debug, Clone)]
pub struct NamedAttributes {
    pub name: OsString,
    pub attrs: FileAttributes,
}

/// Static volume description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub volume_name: &'static str,
    pub serial_number: u32,
    pub max_component_length: u32,
    pub file_system_name: &'static str,
}

/// Static capacity numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpace {
    pub free_bytes_available: u64,
    pub total_bytes: u64,
    pub total_free_bytes: u64,
}
