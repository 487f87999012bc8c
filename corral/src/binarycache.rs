//! Lookup of previously-resolved copies of external binaries (the
//! hypervisor, guest firmware) under `<HOME>/cache/bin`.
//!
//! Downloading these binaries is out of scope for this crate (see the
//! top-level design notes): [`BinaryCache`] only answers "do we already
//! have one", leaving the fetch itself to an injected callback the CLI
//! supplies.

use std::path::PathBuf;

use crate::HomeDir;

/// Read-only view of `<HOME>/cache/bin`.
#[derive(Debug, Clone)]
pub struct BinaryCache {
    dir: PathBuf,
}

impl BinaryCache {
    /// Opens the binary cache rooted at `home`'s `cache/bin` directory.
    #[must_use]
    pub fn new(home: &HomeDir) -> Self {
        Self { dir: home.bin_cache_dir() }
    }

    /// Returns the path to a cached copy of `name`, if one exists.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }

    /// The path a fetcher should write `name` to in order to populate the
    /// cache. Does not create the file itself.
    #[must_use]
    pub fn target_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_none_when_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");
        let cache = BinaryCache::new(&home);
        assert!(cache.resolve("cloud-hypervisor").is_none());
    }

    #[test]
    fn resolve_some_once_populated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");
        let cache = BinaryCache::new(&home);
        std::fs::write(cache.target_path("cloud-hypervisor"), b"binary").expect("write");
        assert!(cache.resolve("cloud-hypervisor").is_some());
    }
}
