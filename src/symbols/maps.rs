use std::path::PathBuf;

use anyhow::{Context, Result};
use procfs::process::{MMPermissions, MMapPath, Process};

/// An executable mapping of a shared object in some process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedLibrary {
    /// Start address of the mapping.
    pub start: u64,
    /// File offset the mapping was created from.
    pub offset: u64,
    pub path: PathBuf,
}

/// First mapping whose path contains `needle` and which is executable.
///
/// `pid` of `None` inspects the calling process. Unreadable maps are an error;
/// an absent library is `Ok(None)`.
pub fn find_library(pid: Option<i32>, needle: &str) -> Result<Option<LoadedLibrary>> {
    let process = match pid {
        Some(pid) => Process::new(pid).with_context(|| format!("open /proc/{pid}"))?,
        None => Process::myself().context("open /proc/self")?,
    };
    let maps = process
        .maps()
        .with_context(|| format!("parsing /proc/{}/maps", process.pid))?;

    for map in maps {
        if !map.perms.contains(MMPermissions::EXECUTE) {
            continue;
        }
        let path = match &map.pathname {
            MMapPath::Path(p) => p,
            _ => continue,
        };
        if !path.to_string_lossy().contains(needle) {
            continue;
        }
        return Ok(Some(LoadedLibrary {
            start: map.address.0,
            offset: map.offset,
            path: path.clone(),
        }));
    }
    Ok(None)
}
