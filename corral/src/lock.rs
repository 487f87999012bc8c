//! Advisory locking: whole-file `flock`, PID-carrying `fcntl` record locks,
//! and the process-wide global lock built on top of the former.
//!
//! Two independent flavors coexist (see module docs on each type) because
//! they answer different questions: `FileLock` answers "is anyone using
//! this VM directory right now", while `PIDLock` answers "which process,
//! if any, is the running hypervisor for this VM" — a question `flock`
//! cannot answer since it does not expose the holder's PID.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::time::Duration;

use nix::fcntl::{FcntlArg, FlockArg, flock};
use nix::libc;

use crate::{Error, Result};

/// Shared or exclusive intent for a [`FileLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Multiple holders may coexist (e.g. concurrent `clone` of a template).
    Shared,
    /// Exactly one holder at a time.
    Exclusive,
}

/// A whole-file advisory lock (`flock(2)` semantics).
///
/// Held against the VM directory's inode (a directory fd is opened purely
/// to serve as a lock target) or against the home directory for
/// [`GlobalLock`].
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Opens `path` (which must already exist) for use as a lock target.
    /// Does not itself acquire the lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Ok(Self { file })
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::already_locked`] if the kernel reports
    /// `EAGAIN`/`EWOULDBLOCK`.
    pub fn try_lock(&self, kind: LockKind) -> Result<()> {
        let arg = match kind {
            LockKind::Shared => FlockArg::LockSharedNonblock,
            LockKind::Exclusive => FlockArg::LockExclusiveNonblock,
        };

        flock(self.file.as_fd(), arg).map_err(|errno| {
            if matches!(errno, nix::errno::Errno::EAGAIN | nix::errno::Errno::EWOULDBLOCK) {
                Error::already_locked()
            } else {
                Error::Io(errno.into())
            }
        })
    }

    /// Acquires the lock, blocking until it is available or `canceled`
    /// fires. Polls in short increments so the cancellation flag is
    /// observed promptly rather than only before the call.
    pub fn lock(&self, kind: LockKind, canceled: &dyn Fn() -> bool) -> Result<()> {
        loop {
            match self.try_lock(kind) {
                Ok(()) => return Ok(()),
                Err(Error::AlreadyLocked(_)) => {
                    if canceled() {
                        return Err(Error::Canceled);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Releases the lock.
    pub fn unlock(&self) -> Result<()> {
        flock(self.file.as_fd(), FlockArg::UnlockNonblock).map_err(|e| Error::Io(e.into()))
    }
}

/// An `fcntl(F_SETLK/F_SETLKW)` record lock covering the entire file,
/// which additionally lets any process query the holder's PID via
/// `F_GETLK`. Used on `config.json` during `run`, so `stop`/`ip` can find
/// the hypervisor's PID without any coordination channel to `run` itself.
#[derive(Debug)]
pub struct PidLock {
    file: File,
}

impl PidLock {
    /// Opens `path` for use as a PID-lock target.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Ok(Self { file })
    }

    /// Attempts to take an exclusive record lock without blocking.
    pub fn try_lock(&self) -> Result<()> {
        let lock = whole_file_flock(libc::F_WRLCK);
        nix::fcntl::fcntl(self.file.as_fd(), FcntlArg::F_SETLK(&lock)).map_err(|errno| {
            if matches!(errno, nix::errno::Errno::EAGAIN | nix::errno::Errno::EWOULDBLOCK) {
                Error::already_running()
            } else {
                Error::Io(errno.into())
            }
        })?;
        Ok(())
    }

    /// Releases the lock held by this handle.
    pub fn unlock(&self) -> Result<()> {
        let lock = whole_file_flock(libc::F_UNLCK);
        nix::fcntl::fcntl(self.file.as_fd(), FcntlArg::F_SETLK(&lock)).map_err(|e| Error::Io(e.into()))?;
        Ok(())
    }

    /// Queries the PID currently holding an exclusive lock on `path`,
    /// or `0` if unlocked. Does not require prior acquisition.
    pub fn pid(path: impl AsRef<Path>) -> Result<u32> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let mut probe = whole_file_flock(libc::F_WRLCK);

        nix::fcntl::fcntl(file.as_fd(), FcntlArg::F_GETLK(&mut probe)).map_err(|e| Error::Io(e.into()))?;

        if probe.l_type == libc::F_UNLCK as i16 {
            Ok(0)
        } else {
            Ok(u32::try_from(probe.l_pid).unwrap_or(0))
        }
    }
}

fn whole_file_flock(l_type: libc::c_int) -> libc::flock {
    // SAFETY: `libc::flock` is a plain-old-data struct; zeroing every field
    // is a valid representation and the fields we care about are set
    // explicitly below.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = l_type as i16;
    lock.l_whence = libc::SEEK_SET as i16;
    lock.l_start = 0;
    lock.l_len = 0; // 0 means "to end of file", i.e. the whole file.
    lock
}

/// Takes an exclusive [`FileLock`] on the home directory for the duration
/// of `body`, releasing it on every exit path (including panics that
/// unwind, since the underlying fd is closed by `Drop`).
///
/// Per the ordering rule: acquire first, hold briefly, release before any
/// long-running I/O (pull/push/run).
pub fn with_global_lock<T>(home: &crate::HomeDir, body: impl FnOnce() -> Result<T>) -> Result<T> {
    let lock = FileLock::open(home.path())?;
    lock.lock(LockKind::Exclusive, &|| false)?;
    let result = body();
    let _ = lock.unlock();
    result
}

/// Returns `true` if `pid` names a process that is currently alive.
#[must_use]
pub fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs no action beyond existence/permission
    // checks; it never affects the target process.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_conflicts_with_itself_from_second_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("target");
        std::fs::write(&path, b"").expect("write");

        let a = FileLock::open(&path).expect("open a");
        let b = FileLock::open(&path).expect("open b");

        a.try_lock(LockKind::Exclusive).expect("a locks");
        assert!(matches!(b.try_lock(LockKind::Exclusive), Err(Error::AlreadyLocked(_))));

        a.unlock().expect("unlock");
        b.try_lock(LockKind::Exclusive).expect("b locks after release");
    }

    #[test]
    fn shared_locks_do_not_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("target");
        std::fs::write(&path, b"").expect("write");

        let a = FileLock::open(&path).expect("open a");
        let b = FileLock::open(&path).expect("open b");

        a.try_lock(LockKind::Shared).expect("a locks shared");
        b.try_lock(LockKind::Shared).expect("b locks shared too");
    }

    #[test]
    fn pid_lock_reports_zero_when_unheld() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{}").expect("write");

        assert_eq!(PidLock::pid(&path).expect("pid"), 0);
    }

    #[test]
    fn pid_lock_reports_holder_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{}").expect("write");

        let lock = PidLock::open(&path).expect("open");
        lock.try_lock().expect("lock");

        let pid = PidLock::pid(&path).expect("pid");
        assert_eq!(pid, std::process::id());
    }
}
