//! A directory bundling one VM's config, kernel, optional initramfs, and
//! disks.

use std::path::{Path, PathBuf};

use crate::lock::{FileLock, LockKind, PidLock};
use crate::vmconfig::VmConfig;
use crate::{Error, Result};

const EXPLICITLY_PULLED_SENTINEL: &str = ".explicitly-pulled";

/// Whether a VM's hypervisor process appears to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No process holds the `config.json` PID lock.
    Stopped,
    /// A process holds the `config.json` PID lock and is alive.
    Running,
}

/// A VM directory: config + kernel + optional initramfs + disks.
///
/// Locks are constructed fresh on every call rather than cached as open
/// file descriptors on the value, so a long-lived `VmDirectory` handle
/// never silently holds a lock its owner didn't explicitly ask for.
#[derive(Debug, Clone)]
pub struct VmDirectory {
    base: PathBuf,
}

impl VmDirectory {
    /// Wraps an existing directory at `base` without checking its
    /// contents. Use [`VmDirectory::initialize`] to seed a new one.
    #[must_use]
    pub fn open(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Creates `base` and writes a fresh [`VmConfig`] into it.
    pub fn initialize(base: impl Into<PathBuf>, config: &VmConfig) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        let dir = Self { base };
        dir.set_config(config)?;
        Ok(dir)
    }

    /// The directory's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.base
    }

    /// `<dir>/config.json`.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// `<dir>/kernel`.
    #[must_use]
    pub fn kernel_path(&self) -> PathBuf {
        self.base.join("kernel")
    }

    /// `<dir>/initramfs`.
    #[must_use]
    pub fn initramfs_path(&self) -> PathBuf {
        self.base.join("initramfs")
    }

    /// `<dir>/<name>` for a disk entry.
    #[must_use]
    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    /// Re-reads and revalidates `config.json` from disk.
    ///
    /// Deliberately does not cache: other processes can mutate this file
    /// under their own lock, so every read must reflect the current state
    /// rather than what was true when this handle was created.
    pub fn config(&self) -> Result<VmConfig> {
        let bytes = std::fs::read(self.config_path())?;
        VmConfig::from_json(&bytes)
    }

    /// Validates and atomically replaces `config.json`.
    ///
    /// Callers are expected to hold an exclusive [`FileLock`] on this
    /// directory; `set_config` itself does not lock, mirroring
    /// `VMDirectory::Config()`'s read-side contract.
    pub fn set_config(&self, config: &VmConfig) -> Result<()> {
        config.validate()?;
        let bytes = config.to_json()?;
        let tmp_path = self.base.join(".config.json.tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, self.config_path())?;
        Ok(())
    }

    /// Opens a [`FileLock`] against this directory. A fresh handle is
    /// returned on every call; the caller decides how long to hold it.
    pub fn file_lock(&self) -> Result<FileLock> {
        FileLock::open(&self.base)
    }

    /// Opens a [`PidLock`] on `config.json`.
    pub fn pid_lock(&self) -> Result<PidLock> {
        PidLock::open(self.config_path())
    }

    /// `true` iff the `config.json` PID lock is held by a live process.
    pub fn running(&self) -> Result<bool> {
        let pid = PidLock::pid(self.config_path())?;
        Ok(pid != 0 && crate::lock::pid_is_alive(pid))
    }

    /// [`State::Running`] or [`State::Stopped`], per [`VmDirectory::running`].
    pub fn state(&self) -> Result<State> {
        Ok(if self.running()? { State::Running } else { State::Stopped })
    }

    /// Recursive byte count of every file under this directory.
    pub fn size(&self) -> Result<u64> {
        fn walk(path: &Path) -> Result<u64> {
            let mut total = 0u64;
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    total += walk(&entry.path())?;
                } else if file_type.is_file() {
                    total += entry.metadata()?.len();
                }
                // Symlinks (tag entries in the remote cache) contribute
                // nothing of their own; the target directory is counted
                // separately when walked directly.
            }
            Ok(total)
        }
        walk(&self.base)
    }

    /// `true` iff `.explicitly-pulled` is present (remote cache only).
    #[must_use]
    pub fn explicitly_pulled(&self) -> bool {
        self.base.join(EXPLICITLY_PULLED_SENTINEL).exists()
    }

    /// Creates or removes the `.explicitly-pulled` sentinel.
    pub fn set_explicitly_pulled(&self, value: bool) -> Result<()> {
        let path = self.base.join(EXPLICITLY_PULLED_SENTINEL);
        if value {
            std::fs::write(&path, b"")?;
        } else {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Copies every regular file from `src` into a fresh directory at
    /// `dest`, truncating each destination to the source's size first so
    /// sparse regions stay sparse, then tries [`crate::sparseio::clone_file`]
    /// before falling back to [`crate::sparseio::sparse_copy`].
    pub fn create_from(src: &Path, dest: impl Into<PathBuf>) -> Result<Self> {
        let dest = dest.into();
        std::fs::create_dir_all(&dest)?;

        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let src_path = entry.path();
            let dest_path = dest.join(&name);

            let src_file = std::fs::File::open(&src_path)?;
            let src_len = src_file.metadata()?.len();

            let dest_file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&dest_path)?;
            dest_file.set_len(src_len)?;

            if crate::sparseio::clone_file(&dest_file, &src_file).is_err() {
                crate::sparseio::sparse_copy(&dest_file, &src_file)?;
            }
        }

        Ok(Self { base: dest })
    }

    /// Acquires the lock kind used by `run`: exclusive, for the full
    /// execution of the hypervisor.
    pub fn lock_for_run(&self) -> Result<FileLock> {
        let lock = self.file_lock()?;
        lock.try_lock(LockKind::Exclusive)?;
        Ok(lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmconfig::VmConfig;

    #[test]
    fn set_config_then_config_is_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vm = VmDirectory::initialize(dir.path(), &VmConfig::new(1, 512)).expect("init");

        let mut updated = vm.config().expect("config");
        updated.cmdline = "console=ttyS0".into();
        vm.set_config(&updated).expect("set_config");

        assert_eq!(vm.config().expect("reload"), updated);
    }

    #[test]
    fn explicitly_pulled_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vm = VmDirectory::initialize(dir.path(), &VmConfig::new(1, 512)).expect("init");

        assert!(!vm.explicitly_pulled());
        vm.set_explicitly_pulled(true).expect("set true");
        assert!(vm.explicitly_pulled());
        vm.set_explicitly_pulled(false).expect("set false");
        assert!(!vm.explicitly_pulled());
    }

    #[test]
    fn stopped_when_no_pid_lock_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vm = VmDirectory::initialize(dir.path(), &VmConfig::new(1, 512)).expect("init");
        assert_eq!(vm.state().expect("state"), State::Stopped);
    }

    #[test]
    fn create_from_preserves_file_contents() {
        let src_dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(src_dir.path().join("disk.img"), b"hello disk contents").expect("write");

        let dest_dir = tempfile::tempdir().expect("tempdir");
        let cloned = VmDirectory::create_from(src_dir.path(), dest_dir.path().join("vm")).expect("create_from");

        let copied = std::fs::read(cloned.disk_path("disk.img")).expect("read");
        assert_eq!(copied, b"hello disk contents");
    }
}
