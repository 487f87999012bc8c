//! Resolution of the on-disk base directory.

use std::path::{Path, PathBuf};

/// The on-disk base directory for VMs, the OCI cache, and scratch space.
///
/// Threaded explicitly into storage/network constructors rather than read
/// from an ambient global, so tests can point at an isolated directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeDir(PathBuf);

impl HomeDir {
    /// Resolves the home directory: `CORRAL_HOME` if set, else
    /// `$HOME/.corral`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if neither `CORRAL_HOME` nor the
    /// platform home directory can be determined.
    pub fn resolve() -> crate::Result<Self> {
        if let Ok(over_ride) = std::env::var("CORRAL_HOME") {
            return Ok(Self(PathBuf::from(over_ride)));
        }

        let home = dirs::home_dir()
            .ok_or_else(|| crate::Error::NotFound("cannot determine user home directory".into()))?;

        Ok(Self(home.join(".corral")))
    }

    /// Builds a `HomeDir` pinned to an explicit path, bypassing environment
    /// resolution. Used by tests.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The base path itself (also the target of the [`crate::lock::GlobalLock`]).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// `<HOME>/tmp` — scratch directories awaiting publish or GC.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.0.join("tmp")
    }

    /// `<HOME>/vms` — published local VM directories.
    #[must_use]
    pub fn vms_dir(&self) -> PathBuf {
        self.0.join("vms")
    }

    /// `<HOME>/cache/OCIs` — the content-addressed remote cache.
    #[must_use]
    pub fn ocis_dir(&self) -> PathBuf {
        self.0.join("cache").join("OCIs")
    }

    /// `<HOME>/cache/bin` — cached auxiliary binaries (hypervisor, firmware).
    #[must_use]
    pub fn bin_cache_dir(&self) -> PathBuf {
        self.0.join("cache").join("bin")
    }

    /// Ensures `tmp/`, `vms/`, `cache/OCIs/`, and `cache/bin/` exist.
    pub fn ensure_layout(&self) -> crate::Result<()> {
        for dir in [self.tmp_dir(), self.vms_dir(), self.ocis_dir(), self.bin_cache_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        // SAFETY: test runs single-threaded within this process for this var.
        unsafe { std::env::set_var("CORRAL_HOME", "/tmp/corral-test-home") };
        let home = HomeDir::resolve().expect("resolve");
        unsafe { std::env::remove_var("CORRAL_HOME") };
        assert_eq!(home.path(), Path::new("/tmp/corral-test-home"));
    }

    #[test]
    fn subdirectories_are_relative_to_base() {
        let home = HomeDir::at("/base");
        assert_eq!(home.tmp_dir(), Path::new("/base/tmp"));
        assert_eq!(home.vms_dir(), Path::new("/base/vms"));
        assert_eq!(home.ocis_dir(), Path::new("/base/cache/OCIs"));
        assert_eq!(home.bin_cache_dir(), Path::new("/base/cache/bin"));
    }
}
