//! Transcoding gate
//!
//! Whitelist-only: a file is transcoded when both the acting process and
//! the file extension are listed. An empty list on either axis matches
//! nothing.

use crate::config::Config;

/// Decides whether a (process, path) pair is transcoded
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Lower-cased process names
    processes: Vec<String>,
    /// Lower-cased dotted extensions
    extensions: Vec<String>,
}

impl Filter {
    /// Create a filter from the two allow-lists
    pub fn new<P, E>(processes: P, extensions: E) -> Self
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Filter {
            processes: processes
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .collect(),
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// Create a filter from the mount configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.allowed_processes, &config.allowed_extensions)
    }

    /// Should this process see `virtual_path` transcoded to UTF-8?
    pub fn should_process(&self, process_name: &str, virtual_path: &str) -> bool {
        self.match_process(process_name) && self.match_extension(virtual_path)
    }

    fn match_process(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.processes.iter().any(|p| *p == name)
    }

    fn match_extension(&self, path: &str) -> bool {
        match extension(path) {
            Some(ext) => {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            }
            None => false,
        }
    }
}

/// Dotted extension of the last path component, accepting either separator
fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    name.rfind('.').map(|idx| &name[idx..])
}
