//! utf8proxyfs - per-process GB18030/UTF-8 transcoding proxy filesystem
//!
//! Mirrors a physical directory through FUSE. Selected processes see the
//! content of selected text files decoded to UTF-8; their edits are
//! encoded back to the legacy encoding on close. Everyone else sees the
//! raw bytes.

pub mod config;
pub mod error;
pub mod filter;
pub mod fs;
pub mod process;
pub mod transcode;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::filter::Filter;
    pub use crate::fs::ProxyFs;
}
