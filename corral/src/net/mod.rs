//! The three network backends a VM can be run with — software (a
//! user-space gateway), host-only (a real address on the TAP), and
//! bridged (enslaved to an existing bridge) — plus the pieces they share.

pub mod bridged;
pub mod dhcp;
pub mod host;
mod netlink;
pub mod tap;
pub mod userstack;
pub mod wire;

use std::net::Ipv4Addr;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::subnetfinder::Subnet;
use crate::Result;
use tap::Tap;

/// Which backend `run` wires up for a VM, mirroring the CLI's
/// `--net-bridged`/`--net-host`/software-by-default surface.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Promiscuous user-space gateway on a freshly-carved `/29`.
    Software,
    /// A real address on the TAP, no packet forwarding.
    HostOnly,
    /// Enslaved directly to an existing bridge device.
    Bridged { bridge_name: String },
}

/// A running network backend. Dropping this without calling [`close`]
/// leaks its background tasks (they're aborted, not gracefully joined);
/// always prefer `close`.
///
/// [`close`]: NetworkHandle::close
#[derive(Debug)]
pub struct NetworkHandle {
    tap: Tap,
    subnet: Option<Subnet>,
    cancel: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkHandle {
    /// The TAP device's kernel-assigned interface name.
    #[must_use]
    pub fn tap_name(&self) -> &str {
        self.tap.name()
    }

    /// The file handle to pass to the hypervisor process as its `--net
    /// fd=N` backend, via `dup`.
    pub fn tap_fd(&self) -> Result<std::fs::File> {
        self.tap.try_clone_fd()
    }

    /// The `/29` assigned to this VM, if the backend carved one (software
    /// and host-only do; bridged doesn't).
    #[must_use]
    pub fn subnet(&self) -> Option<&Subnet> {
        self.subnet.as_ref()
    }

    /// Cancels every background task (stack forwarder, DHCP server) and
    /// waits for them to finish. Best-effort: conntrack entries for the
    /// assigned subnet are not reclaimed, since no conntrack-capable
    /// dependency is part of this crate's stack.
    pub async fn close(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Stands up `backend` for a VM with the given MAC address, already
/// having claimed `claimed_host_addresses` via a prior interface
/// enumeration (only consulted for `Backend::Software`/`HostOnly`, which
/// need a fresh `/29`).
pub async fn setup(backend: Backend, vm_mac: [u8; 6], claimed_host_addresses: &[Ipv4Addr]) -> Result<NetworkHandle> {
    match backend {
        Backend::Bridged { bridge_name } => {
            let tap = bridged::attach(&bridge_name).await?;
            Ok(NetworkHandle { tap, subnet: None, cancel: None, tasks: Vec::new() })
        }
        Backend::HostOnly => {
            let subnet = crate::subnetfinder::find(claimed_host_addresses)?;
            let tap = host::setup(&subnet, vm_mac).await?;

            let (cancel_tx, cancel_rx) = oneshot::channel();
            let dhcp_subnet = subnet;
            let dhcp_task = tokio::spawn(async move {
                let cancel = async {
                    let _ = cancel_rx.await;
                };
                if let Err(error) = host::run_dhcp(dhcp_subnet, cancel).await {
                    tracing::warn!(%error, "host-only DHCP server exited with an error");
                }
            });

            Ok(NetworkHandle {
                tap,
                subnet: Some(subnet),
                cancel: Some(cancel_tx),
                tasks: vec![dhcp_task],
            })
        }
        Backend::Software => {
            let subnet = crate::subnetfinder::find(claimed_host_addresses)?;
            let tap = Tap::create()?;
            let gateway_mac = random_gateway_mac();

            let (cancel_tx, cancel_rx) = oneshot::channel();
            let config = userstack::UserStackConfig { gateway_mac, vm_mac, subnet };
            let stack_tap = tap.try_clone_fd()?;
            let stack_task = tokio::spawn(async move {
                // `userstack::run` takes ownership of a `Tap`; reconstruct one
                // from the duplicated fd so the original stays with the caller.
                let stack_tap = tap::Tap::from_raw_parts(String::new(), stack_tap);
                let cancel = async {
                    let _ = cancel_rx.await;
                };
                if let Err(error) = userstack::run(stack_tap, config, cancel).await {
                    tracing::warn!(%error, "software network stack exited with an error");
                }
            });

            Ok(NetworkHandle {
                tap,
                subnet: Some(subnet),
                cancel: Some(cancel_tx),
                tasks: vec![stack_task],
            })
        }
    }
}

/// Every IPv4 address currently assigned to a host interface, for passing
/// as `claimed_host_addresses` to [`setup`] — callers take this snapshot
/// once per command, before opening any per-VM lock, per §4.11 step 5.
pub async fn claimed_host_addresses() -> Result<Vec<Ipv4Addr>> {
    let handle = netlink::connect().await?;
    netlink::host_ipv4_addresses(&handle).await
}

/// Looks up the host's ARP/neighbor-table entry for `mac`, the backing
/// query for the `ip` command.
pub async fn ip_for_mac(mac: [u8; 6]) -> Result<Option<Ipv4Addr>> {
    let handle = netlink::connect().await?;
    netlink::neighbor_ip_for_mac(&handle, mac).await
}

/// A locally-administered, unicast MAC the software stack presents as
/// the gateway's hardware address — never seen by anything but the
/// guest, so any address in the locally-administered range is fine.
fn random_gateway_mac() -> [u8; 6] {
    let mut bytes = uuid::Uuid::new_v4().into_bytes();
    bytes[0] = (bytes[0] & 0xFE) | 0x02;
    [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]
}

