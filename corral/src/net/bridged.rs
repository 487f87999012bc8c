//! Bridged networking: attach the guest's TAP directly to an existing
//! host bridge. No DHCP, no IP assignment — the bridge's own DHCP server
//! (if any) and the guest's own client handle addressing.

use crate::net::tap::Tap;
use crate::net::netlink;
use crate::Result;

/// Creates a TAP, brings it up, and enslaves it to `bridge_name`.
/// Returns the TAP so the caller can hand its fd to the hypervisor.
pub async fn attach(bridge_name: &str) -> Result<Tap> {
    let tap = Tap::create()?;

    let handle = netlink::connect().await?;
    let bridge_index = netlink::link_index(&handle, bridge_name).await?;
    let tap_index = netlink::link_index(&handle, tap.name()).await?;

    netlink::set_up(&handle, tap_index).await?;
    netlink::set_master(&handle, tap_index, bridge_index).await?;

    Ok(tap)
}
