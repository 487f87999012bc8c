//! TAP interface creation: `/dev/net/tun` plus `TUNSETIFF`.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use crate::Result;

/// The interface-name template handed to the kernel; it assigns the next
/// free `corral%d`.
const NAME_TEMPLATE: &str = "corral%d";

/// `IFF_VNET_HDR`: every frame read from/written to the tap fd is
/// prefixed with a `virtio_net_hdr`, which Cloud Hypervisor expects on
/// the fd it's handed for `--net fd=N`.
const IFF_VNET_HDR: u16 = 0x4000;

/// An open, non-blocking TAP device and its kernel-assigned name.
#[derive(Debug)]
pub struct Tap {
    name: String,
    file: File,
}

impl Tap {
    /// Creates a fresh TAP device with `IFF_VNET_HDR` set.
    pub fn create() -> Result<Self> {
        let (name, file) = crate::sys::create_tap(NAME_TEMPLATE, IFF_VNET_HDR)?;
        Ok(Self { name, file })
    }

    /// The kernel-assigned interface name, e.g. `"corral0"`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrows the underlying file, for reading/writing raw frames or
    /// `dup`-ing onto a child process's fd 3.
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Duplicates the underlying fd, for handing to a spawned hypervisor
    /// process without giving up ownership of this `Tap`.
    pub fn try_clone_fd(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }

    /// The raw fd, for ioctls that configure the interface (promiscuous
    /// mode, address assignment) via netlink or `SIOCSIFFLAGS`.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// A borrowed fd suitable for `nix` calls that take `impl AsFd`.
    #[must_use]
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Wraps an already-open TAP fd (typically a `try_clone_fd` of
    /// another `Tap`) without re-running `TUNSETIFF`. `name` may be left
    /// empty when the caller only needs the fd, not the interface name.
    #[must_use]
    pub(crate) fn from_raw_parts(name: String, file: File) -> Self {
        Self { name, file }
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
