//! Proxy filesystem
//!
//! `ProxyFs` holds the handle state machine over the physical directory;
//! `ProxyFuse` exposes it through FUSE.

mod attr;
mod fuse;
mod handle;
mod inode;
mod proxy;

pub use attr::{
    FileAttributes, FreeSpace, NamedAttributes, VolumeInfo, FILE_ATTRIBUTE_DIRECTORY,
    FILE_ATTRIBUTE_NORMAL,
};
pub use fuse::ProxyFuse;
pub use handle::{FileHandle, HandleKind, HandleState, HandleTable, TranscodedBuffer};
pub use inode::{InodeTable, ROOT_INO};
pub use proxy::ProxyFs;
