//! Acting-process identification
//!
//! Resolves the executable base name of the process behind a FUSE request
//! from procfs. Windows programs running under Wine report their own
//! image path in argv[0], so the command line is preferred over the
//! `exe` link (which would name the loader).

use crate::error::{Error, Result};
use std::path::Path;

/// Executable base name for `pid`
pub fn process_name(pid: u32) -> Result<String> {
    let proc_dir = Path::new("/proc").join(pid.to_string());

    if let Ok(cmdline) = std::fs::read(proc_dir.join("cmdline")) {
        if let Some(name) = cmdline
            .split(|b| *b == 0)
            .next()
            .map(|argv0| base_name(&String::from_utf8_lossy(argv0)).to_string())
            .filter(|name| !name.is_empty())
        {
            return Ok(name);
        }
    }

    if let Ok(exe) = std::fs::read_link(proc_dir.join("exe")) {
        if let Some(name) = exe.file_name() {
            return Ok(name.to_string_lossy().into_owned());
        }
    }

    let comm = std::fs::read_to_string(proc_dir.join("comm"))?;
    let comm = comm.trim();
    if comm.is_empty() {
        return Err(Error::NotFound(format!("process {}", pid)));
    }
    Ok(comm.to_string())
}

/// Process name, or `PID:<id>` when it cannot be resolved
pub fn process_label(pid: u32) -> String {
    process_name(pid).unwrap_or_else(|_| format!("PID:{}", pid))
}

/// Last component of a path written with either separator
fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
