//! Host-only networking: the TAP gets a real address on the chosen `/29`
//! and a static neighbor entry for the guest, with DHCP served directly
//! on that interface — no user-space packet forwarding at all, since the
//! kernel's own IP stack handles the interface once it's configured.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::net::dhcp::{self, LeaseConfig};
use crate::net::tap::Tap;
use crate::net::netlink;
use crate::subnetfinder::Subnet;
use crate::Result;

/// Creates a TAP, assigns it the subnet's host address, and inserts a
/// static ARP entry for the guest. `vm_mac` is the MAC the guest's vNIC
/// will present, learned from the VM's [`crate::VmConfig`].
pub async fn setup(subnet: &Subnet, vm_mac: [u8; 6]) -> Result<Tap> {
    let tap = Tap::create()?;

    let handle = netlink::connect().await?;
    let index = netlink::link_index(&handle, tap.name()).await?;
    netlink::set_up(&handle, index).await?;
    netlink::add_address(&handle, index, subnet.gateway, subnet.prefix_len).await?;

    // systemd-udev may briefly overwrite our static neighbor entry right
    // after the interface appears; giving it a moment to settle first
    // avoids a lost race.
    tokio::time::sleep(Duration::from_millis(100)).await;
    netlink::add_neighbor(&handle, index, subnet.guest, vm_mac).await?;

    Ok(tap)
}

/// Runs a DHCP server bound to the subnet's host address on UDP/67 until
/// `cancel` resolves. Used only by the host-only backend — the software
/// backend serves DHCP out of [`super::userstack`] instead.
pub async fn run_dhcp(subnet: Subnet, cancel: impl std::future::Future<Output = ()>) -> Result<()> {
    let socket = UdpSocket::bind((subnet.gateway, 67)).await?;
    socket.set_broadcast(true)?;

    let lease = LeaseConfig { vm_ip: subnet.guest, gateway_ip: subnet.gateway, netmask: subnet.netmask() };

    tokio::pin!(cancel);
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            biased;
            () = &mut cancel => break,
            received = socket.recv_from(&mut buf) => {
                let (n, _) = received?;
                if let Some(reply) = dhcp::handle(&buf[..n], &lease) {
                    let _ = socket.send_to(&reply, (Ipv4Addr::BROADCAST, 68)).await;
                }
            }
        }
    }

    Ok(())
}
