//! Shared `rtnetlink` helpers: everything that talks to the kernel's
//! routing netlink socket to enumerate, address, or reconfigure
//! interfaces lives here so the three network backends don't each open
//! their own connection.

use std::net::Ipv4Addr;

use futures::TryStreamExt;
use rtnetlink::Handle;

use crate::{Error, Result};

/// Opens a connection to the kernel's routing netlink socket and spawns
/// the background task that drives it. The returned [`Handle`] is cheap
/// to clone and is what every other function here takes.
pub async fn connect() -> Result<Handle> {
    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|e| Error::Platform(format!("rtnetlink connection failed: {e}")))?;
    tokio::spawn(connection);
    Ok(handle)
}

/// Resolves an interface name to its kernel link index.
pub async fn link_index(handle: &Handle, ifname: &str) -> Result<u32> {
    let link = handle
        .link()
        .get()
        .match_name(ifname.to_owned())
        .execute()
        .try_next()
        .await
        .map_err(|e| Error::Platform(format!("link lookup failed: {e}")))?
        .ok_or_else(|| Error::NotFound(format!("interface {ifname} not found")))?;
    Ok(link.header.index)
}

/// Brings an interface up (`ip link set dev <ifname> up`).
pub async fn set_up(handle: &Handle, index: u32) -> Result<()> {
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::Platform(format!("link set up failed: {e}")))
}

/// Sets an interface's master device to `bridge_index`, enslaving it
/// (`ip link set dev <ifname> master <bridge>`).
pub async fn set_master(handle: &Handle, index: u32, bridge_index: u32) -> Result<()> {
    handle
        .link()
        .set(index)
        .controller(bridge_index)
        .execute()
        .await
        .map_err(|e| Error::Platform(format!("link set master failed: {e}")))
}

/// Assigns an IPv4 address with the given prefix length to an interface.
pub async fn add_address(handle: &Handle, index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
    handle
        .address()
        .add(index, addr.into(), prefix_len)
        .execute()
        .await
        .map_err(|e| Error::Platform(format!("address add failed: {e}")))
}

/// Inserts a permanent (static) IPv4 neighbor entry mapping `addr` to
/// `mac` on the given interface.
pub async fn add_neighbor(handle: &Handle, index: u32, addr: Ipv4Addr, mac: [u8; 6]) -> Result<()> {
    handle
        .neighbours()
        .add(index, addr.into())
        .link_local_address(&mac)
        .execute()
        .await
        .map_err(|e| Error::Platform(format!("neighbor add failed: {e}")))
}

/// Every IPv4 address currently assigned to any host interface, used by
/// [`crate::subnetfinder::find`] to avoid choosing an overlapping `/29`.
pub async fn host_ipv4_addresses(handle: &Handle) -> Result<Vec<Ipv4Addr>> {
    use netlink_packet_route::address::AddressAttribute;

    let mut addresses = Vec::new();
    let mut stream = handle.address().get().execute();
    while let Some(msg) = stream
        .try_next()
        .await
        .map_err(|e| Error::Platform(format!("address enumeration failed: {e}")))?
    {
        for attr in msg.attributes {
            if let AddressAttribute::Address(std::net::IpAddr::V4(addr)) = attr {
                addresses.push(addr);
            }
        }
    }
    Ok(addresses)
}

/// Looks up the IPv4 neighbor-table entry for `mac`, returning its
/// resolved address if the kernel has one cached — the backing query for
/// the `ip` command.
pub async fn neighbor_ip_for_mac(handle: &Handle, mac: [u8; 6]) -> Result<Option<Ipv4Addr>> {
    use netlink_packet_route::neighbour::NeighbourAttribute;

    let mut stream = handle.neighbours().get().execute();
    while let Some(msg) = stream
        .try_next()
        .await
        .map_err(|e| Error::Platform(format!("neighbour enumeration failed: {e}")))?
    {
        let mut found_mac = None;
        let mut found_ip = None;
        for attr in &msg.attributes {
            match attr {
                NeighbourAttribute::LinkLocalAddress(addr_bytes) if addr_bytes.as_slice() == mac => {
                    found_mac = Some(());
                }
                NeighbourAttribute::Destination(std::net::IpAddr::V4(addr)) => {
                    found_ip = Some(*addr);
                }
                _ => {}
            }
        }
        if found_mac.is_some() {
            if let Some(ip) = found_ip {
                return Ok(Some(ip));
            }
        }
    }
    Ok(None)
}
