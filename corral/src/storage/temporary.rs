//! Scratch VM directories under `<HOME>/tmp`, created fresh for every
//! multi-step operation (create, clone, pull) and published atomically
//! once the operation succeeds.

use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::lock::{FileLock, LockKind};
use crate::vmconfig::VmConfig;
use crate::{Error, HomeDir, Result, VmDirectory};

/// A freshly allocated scratch directory, held under an exclusive
/// [`FileLock`] for its entire lifetime so [`gc`] cannot race-delete it
/// out from under a concurrently running command.
///
/// `flock` locks an open file description, not a path, so the lock
/// survives the `rename` that `local::publish`/`remote::move_in` perform
/// to move the directory into its final slot; the lock is released only
/// once the `Scratch` itself is dropped, i.e. after publish completes.
#[derive(Debug)]
pub struct Scratch {
    vm: VmDirectory,
    _lock: FileLock,
}

impl Scratch {
    /// The wrapped [`VmDirectory`], by value, for callers (`publish`,
    /// `move_in`) that need to consume it directly. The lock guard is
    /// dropped along with the rest of `self` at the end of that call.
    #[must_use]
    pub fn into_vm_directory(self) -> VmDirectory {
        self.vm
    }
}

impl Deref for Scratch {
    type Target = VmDirectory;

    fn deref(&self) -> &VmDirectory {
        &self.vm
    }
}

/// Allocates a new UUID-named scratch directory under `<HOME>/tmp`,
/// seeded with a default [`VmConfig`] for `cpu_count`/`memory_size`, and
/// locks it exclusively before returning.
pub fn create(home: &HomeDir, cpu_count: u8, memory_size: u64) -> Result<Scratch> {
    let vm = VmDirectory::initialize(scratch_path(home), &VmConfig::new(cpu_count, memory_size))?;
    lock_scratch(vm)
}

/// Allocates a new scratch directory and copies every regular file from
/// `src` into it via [`VmDirectory::create_from`] (zero-copy with a
/// sparse-copy fallback, preserving holes), then locks it exclusively
/// before returning.
pub fn create_from(home: &HomeDir, src: &Path) -> Result<Scratch> {
    let vm = VmDirectory::create_from(src, scratch_path(home))?;
    lock_scratch(vm)
}

fn lock_scratch(vm: VmDirectory) -> Result<Scratch> {
    let lock = vm.file_lock()?;
    lock.try_lock(LockKind::Exclusive)?;
    Ok(Scratch { vm, _lock: lock })
}

fn scratch_path(home: &HomeDir) -> PathBuf {
    home.tmp_dir().join(uuid::Uuid::new_v4().to_string())
}

/// Walks `<HOME>/tmp` and removes every child directory that is not
/// currently locked — i.e. every scratch directory abandoned by a failed
/// or interrupted command. Run as a pre-run hook at the start of every
/// CLI command; a directory still held by a concurrently running command
/// is left alone rather than raced.
pub fn gc(home: &HomeDir) -> Result<()> {
    let tmp_dir = home.tmp_dir();
    let entries = match std::fs::read_dir(&tmp_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io(e)),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let lock = match crate::lock::FileLock::open(&path) {
            Ok(lock) => lock,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        match lock.try_lock(LockKind::Exclusive) {
            Ok(()) => {
                let _ = std::fs::remove_dir_all(&path);
            }
            Err(Error::AlreadyLocked(_)) => {
                tracing::debug!(path = %path.display(), "scratch directory still locked, skipping GC");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_seeds_a_default_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        let vm = create(&home, 2, 1024).expect("create");
        let config = vm.config().expect("config");
        assert_eq!(config.cpu_count, 2);
        assert_eq!(config.memory_size, 1024);
    }

    #[test]
    fn gc_skips_a_scratch_directory_still_held_by_its_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        // `create` locks the scratch directory exclusively and hands the
        // lock back bundled in `Scratch`; as long as it's alive, gc must
        // not race-delete it out from under the command that owns it.
        let scratch = create(&home, 1, 512).expect("create");
        let path = scratch.path().to_path_buf();
        assert!(path.exists());

        gc(&home).expect("gc");
        assert!(path.exists());
    }

    #[test]
    fn gc_removes_an_abandoned_scratch_directory_once_its_lock_is_released() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        let scratch = create(&home, 1, 512).expect("create");
        let path = scratch.path().to_path_buf();
        drop(scratch);

        gc(&home).expect("gc");
        assert!(!path.exists());
    }
}
