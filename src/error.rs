//! Error types for utf8proxyfs

use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the proxy filesystem and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Legacy decode failed: {0}")]
    Decode(String),

    #[error("Legacy encode failed: {0}")]
    Encode(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    #[error("Offset out of range: {0}")]
    InvalidOffset(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map to the errno reported back through FUSE
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::UnsupportedOperation(_) => libc::EROFS,
            Error::InvalidHandle(_) => libc::EBADF,
            Error::InvalidOffset(_) => libc::EINVAL,
            Error::Decode(_)
            | Error::Encode(_)
            | Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::Internal(_) => libc::EIO,
        }
    }

    /// True when the underlying cause is a missing path
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
