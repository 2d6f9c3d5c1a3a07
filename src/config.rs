//! Configuration management for utf8proxyfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default configuration file name, resolved relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Legacy plain-text extensions transcoded out of the box
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    ".txt",
    ".csv",
    ".log",
    ".ini",
    ".conf",
    ".properties",
    ".bas",
    ".cls",
    ".frm",
    ".vbp",
];

/// Mount configuration, built once at startup and shared read-only
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Real directory backing the virtual tree
    pub physical_path: PathBuf,

    /// Where the virtual tree is mounted
    pub mount_point: PathBuf,

    /// Process names whose opens are transcoded (case-insensitive)
    #[serde(default)]
    pub allowed_processes: Vec<String>,

    /// Dotted extensions whose content is transcoded (case-insensitive)
    #[serde(default)]
    pub allowed_extensions: Vec<String>,

    /// What to do when a file cannot be decoded from the legacy encoding
    #[serde(default)]
    pub decode_failure: DecodeFailurePolicy,

    /// Allow other users to access the mount
    #[serde(default)]
    pub allow_other: bool,
}

/// Policy applied when legacy decoding fails while opening a file
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecodeFailurePolicy {
    /// Open succeeds with an empty buffer
    #[default]
    Empty,
    /// Open fails with a decode error
    Reject,
    /// Serve the raw bytes untouched
    Passthrough,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            physical_path: PathBuf::from("/srv/legacy"),
            mount_point: PathBuf::from("/mnt/utf8proxy"),
            allowed_processes: vec!["a.exe".to_string()],
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            decode_failure: DecodeFailurePolicy::default(),
            allow_other: false,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to built-in defaults on any failure
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Could not load config {:?}: {}. Using default values.",
                    path.as_ref(),
                    e
                );
                let mut config = Config::default();
                config.apply_env_overrides();
                config
            }
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("UTF8PROXYFS_PHYSICAL_PATH") {
            let path = path.trim();
            if !path.is_empty() {
                self.physical_path = PathBuf::from(path);
            }
        }

        if let Some(mount) = lookup("UTF8PROXYFS_MOUNT_POINT") {
            let mount = mount.trim();
            if !mount.is_empty() {
                self.mount_point = PathBuf::from(mount);
            }
        }

        if let Some(list) = lookup("UTF8PROXYFS_PROCESSES") {
            self.allowed_processes = split_list(&list);
        }

        if let Some(list) = lookup("UTF8PROXYFS_EXTENSIONS") {
            self.allowed_extensions = split_list(&list);
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.physical_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "physical_path must not be empty".to_string(),
            ));
        }

        if self.mount_point.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "mount_point must not be empty".to_string(),
            ));
        }

        if let Some(ext) = self.allowed_extensions.iter().find(|e| !e.starts_with('.')) {
            return Err(Error::InvalidConfig(format!(
                "extension {:?} must start with '.'",
                ext
            )));
        }

        Ok(())
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
