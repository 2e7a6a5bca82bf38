//! Symbol resolution against a live process.
//!
//! Runtime internals are not exported through any public ABI, so their names
//! differ by mangling and Android release. Callers pass an ordered list of
//! candidate names and the first one defined in the library wins. The base
//! address comes from the live memory map and the symbol value from the
//! on-disk copy of the same library.

mod elf;
mod maps;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

pub use elf::{list_sections, ElfImage, SectionInfo, SymbolHit};
pub use maps::{find_library, LoadedLibrary};

/// A symbol located in a running process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSymbol {
    /// The candidate that matched.
    pub name: String,
    /// File-relative virtual address.
    pub offset: u64,
    pub address: u64,
    pub library: PathBuf,
}

type CacheKey = (Option<i32>, String, Vec<String>);

/// Resolves symbols and remembers every answer, positive or negative, for the
/// lifetime of the resolver.
#[derive(Default)]
pub struct Resolver {
    fallback_paths: Vec<PathBuf>,
    cache: Mutex<HashMap<CacheKey, Option<ResolvedSymbol>>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// On-disk copies to try when the mapped path cannot be read or does not
    /// define any candidate.
    pub fn with_fallback_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.fallback_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve in the calling process.
    pub fn resolve(&self, library: &str, candidates: &[&str]) -> Option<ResolvedSymbol> {
        self.resolve_in(None, library, candidates)
    }

    pub fn resolve_in(
        &self,
        pid: Option<i32>,
        library: &str,
        candidates: &[&str],
    ) -> Option<ResolvedSymbol> {
        let key: CacheKey = (
            pid,
            library.to_string(),
            candidates.iter().map(|c| c.to_string()).collect(),
        );
        if let Some(hit) = self.lock_cache().get(&key) {
            return hit.clone();
        }

        let resolved = resolve_uncached(pid, library, candidates, &self.fallback_paths);
        self.lock_cache().insert(key, resolved.clone());
        resolved
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Option<ResolvedSymbol>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn resolve_uncached(
    pid: Option<i32>,
    library: &str,
    candidates: &[&str],
    fallback_paths: &[PathBuf],
) -> Option<ResolvedSymbol> {
    let loaded = match find_library(pid, library) {
        Ok(Some(loaded)) => loaded,
        Ok(None) => {
            debug!(library, "library not mapped");
            return None;
        }
        Err(err) => {
            debug!(library, "memory maps unavailable: {err:#}");
            return None;
        }
    };
    info!(library, base = format_args!("{:#x}", loaded.start), "found library mapping");

    let paths = std::iter::once(loaded.path.as_path()).chain(fallback_paths.iter().map(PathBuf::as_path));
    for path in paths {
        match lookup_in_file(path, &loaded, candidates) {
            Ok(Some(resolved)) => {
                info!(
                    symbol = %resolved.name,
                    offset = format_args!("{:#x}", resolved.offset),
                    address = format_args!("{:#x}", resolved.address),
                    "resolved symbol"
                );
                return Some(resolved);
            }
            Ok(None) => continue,
            Err(err) => {
                debug!(path = %path.display(), "skipping library copy: {err:#}");
                continue;
            }
        }
    }
    debug!(library, ?candidates, "no candidate symbol found");
    None
}

fn lookup_in_file(
    path: &Path,
    loaded: &LoadedLibrary,
    candidates: &[&str],
) -> anyhow::Result<Option<ResolvedSymbol>> {
    let image = ElfImage::open(path)?;
    let Some(hit) = image.find_symbol(candidates)? else {
        return Ok(None);
    };
    // The executable mapping usually starts at the text segment rather than
    // the load bias; undo the segment's vaddr when the headers tell us.
    let base = match image.exec_segment_vaddr(loaded.offset)? {
        Some(vaddr) => loaded.start.wrapping_sub(vaddr),
        None => loaded.start,
    };
    Ok(Some(ResolvedSymbol {
        name: hit.name,
        offset: hit.value,
        address: base.wrapping_add(hit.value),
        library: path.to_path_buf(),
    }))
}
