//! Raw syscalls that have no safe wrapper in `nix`: `FICLONE` reflinks and
//! `TUNSETIFF`/`TUNGETIFF` TAP setup. All `unsafe` in the crate is confined
//! to this module.

use std::os::fd::RawFd;
#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;
#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

use nix::libc;

use crate::{Error, Result};

const FICLONE: libc::c_ulong = 0x4009_4009;

/// Converts a negative/-1 syscall return into `io::Error::last_os_error`,
/// tagging the failing operation for diagnostics.
#[cfg(target_os = "linux")]
fn check(op: &'static str, ret: libc::c_int) -> Result<()> {
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        Err(Error::Io(std::io::Error::new(err.kind(), format!("{op}: {err}"))))
    } else {
        Ok(())
    }
}

/// Reflinks `src_fd` onto `dst_fd` via `ioctl(FICLONE)`. Callers should
/// treat `ENOTSUP`/`EOPNOTSUPP`/`EXDEV` as "fall back to `sparse_copy`",
/// which [`crate::sparseio::clone_file`] does by surfacing them as
/// [`Error::Platform`].
pub(crate) fn ficlone(dst_fd: RawFd, src_fd: RawFd) -> Result<()> {
    // SAFETY: `FICLONE` takes the source fd packed into the ioctl request
    // value itself (no pointer payload), and both descriptors are valid
    // for the duration of this call since callers hold the `File`s open.
    let ret = unsafe { libc::ioctl(dst_fd, FICLONE, src_fd as libc::c_ulong) };

    if ret < 0 {
        let errno = nix::errno::Errno::last();
        if matches!(
            errno,
            nix::errno::Errno::ENOTSUP | nix::errno::Errno::EOPNOTSUPP | nix::errno::Errno::EXDEV
        ) {
            return Err(Error::Platform("FICLONE not supported on this filesystem".into()));
        }
        return Err(Error::Io(errno.into()));
    }
    Ok(())
}

/// Opens `/dev/net/tun` and binds it to a TAP interface matching
/// `name_template` (e.g. `"corral%d"`), with `additional_flags` (typically
/// `IFF_VNET_HDR`) layered on top of `IFF_TAP | IFF_NO_PI`. Returns the
/// kernel-assigned interface name and the open, non-blocking file.
#[cfg(target_os = "linux")]
pub(crate) fn create_tap(name_template: &str, additional_flags: u16) -> Result<(String, std::fs::File)> {
    use std::ffi::CString;

    const IFF_TAP: u16 = 0x0002;
    const IFF_NO_PI: u16 = 0x1000;
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFNAMSIZ: usize = 16;

    #[repr(C)]
    struct IfReq {
        name: [libc::c_char; IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open("/dev/net/tun")?;

    let name_c = CString::new(name_template).map_err(|_| Error::Parse("TAP name contains NUL".into()))?;
    let name_bytes = name_c.as_bytes_with_nul();
    if name_bytes.len() > IFNAMSIZ {
        return Err(Error::Parse("TAP name template too long".into()));
    }

    // SAFETY: `IfReq` is a plain ioctl argument struct matching the kernel
    // ABI for `struct ifreq`'s name+flags prefix; zero-initializing then
    // copying a NUL-terminated name of verified length is well-defined.
    let mut ifreq: IfReq = unsafe { std::mem::zeroed() };
    for (dst, &src) in ifreq.name.iter_mut().zip(name_bytes.iter()) {
        *dst = src as libc::c_char;
    }
    ifreq.flags = (IFF_TAP | IFF_NO_PI | additional_flags) as libc::c_short;

    // SAFETY: `ifreq` is a valid, appropriately-sized argument for
    // `TUNSETIFF` on the just-opened tun fd.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, std::ptr::addr_of_mut!(ifreq)) };
    check("TUNSETIFF", ret)?;

    let name_len = ifreq.name.iter().position(|&c| c == 0).unwrap_or(IFNAMSIZ);
    // SAFETY: bytes in `ifreq.name[..name_len]` were written by the kernel
    // (or our own copy above) and are valid interface-name characters.
    let name_bytes: Vec<u8> = ifreq.name[..name_len].iter().map(|&c| c as u8).collect();
    let name = String::from_utf8(name_bytes).map_err(|_| Error::Platform("TAP interface name is not UTF-8".into()))?;

    Ok((name, file))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn create_tap(_name_template: &str, _additional_flags: u16) -> Result<(String, std::fs::File)> {
    Err(Error::Platform("TAP interfaces are only supported on Linux".into()))
}

/// Sets `IFF_PROMISC` (and implicitly `IFF_UP`) on `ifname` via a throwaway
/// `AF_INET`/`SOCK_DGRAM` socket and `SIOCGIFFLAGS`/`SIOCSIFFLAGS` — the
/// usual way to flip interface flags that aren't exposed through
/// `rtnetlink`'s typed link-attribute builders.
#[cfg(target_os = "linux")]
pub(crate) fn set_promiscuous(ifname: &str) -> Result<()> {
    const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
    const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
    const IFF_PROMISC: libc::c_short = 0x100;
    const IFNAMSIZ: usize = 16;

    #[repr(C)]
    struct IfReqFlags {
        name: [libc::c_char; IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    if ifname.len() >= IFNAMSIZ {
        return Err(Error::Parse("interface name too long".into()));
    }

    // SAFETY: a local `AF_INET`/`SOCK_DGRAM` socket used only to issue
    // interface ioctls, closed via `File`'s `Drop` below.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: wraps the just-created fd so it's closed exactly once.
    let socket = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fd) };

    // SAFETY: `IfReqFlags` mirrors the kernel's `struct ifreq` name+flags
    // prefix; zero-initializing then copying a bounds-checked name is
    // well-defined.
    let mut ifreq: IfReqFlags = unsafe { std::mem::zeroed() };
    for (dst, src) in ifreq.name.iter_mut().zip(ifname.bytes()) {
        *dst = src as libc::c_char;
    }

    // SAFETY: `ifreq` is a valid argument for `SIOCGIFFLAGS`/`SIOCSIFFLAGS`
    // on an `AF_INET` socket.
    let ret = unsafe { libc::ioctl(socket.as_raw_fd(), SIOCGIFFLAGS, std::ptr::addr_of_mut!(ifreq)) };
    check("SIOCGIFFLAGS", ret)?;

    ifreq.flags |= IFF_PROMISC;

    // SAFETY: same argument struct, now with `IFF_PROMISC` set.
    let ret = unsafe { libc::ioctl(socket.as_raw_fd(), SIOCSIFFLAGS, std::ptr::addr_of_mut!(ifreq)) };
    check("SIOCSIFFLAGS", ret)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_promiscuous(_ifname: &str) -> Result<()> {
    Err(Error::Platform("interface flags are only supported on Linux".into()))
}
