//! Picks an unused RFC 1918 `/29` for the software-stack network variant's
//! gateway/VM/host addressing, by subtracting every `/29`-or-larger block
//! already claimed by a live host interface from the private address space.

use std::net::Ipv4Addr;

use crate::{Error, Result};

/// The four addresses a `/29` subnet hands out: network base, gateway
/// (first usable host), guest (second usable host), and the broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    /// Network address (the `/29` base, host bits zero).
    pub network: Ipv4Addr,
    /// Prefix length; always 29 for addresses returned by [`find`].
    pub prefix_len: u8,
    /// First usable host address — assigned to the gateway/DHCP server.
    pub gateway: Ipv4Addr,
    /// Second usable host address — assigned to the guest NIC.
    pub guest: Ipv4Addr,
}

impl Subnet {
    /// The subnet's broadcast address (all host bits set).
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        let mask = host_mask(self.prefix_len);
        Ipv4Addr::from(u32::from(self.network) | mask)
    }

    /// The subnet's dotted netmask, e.g. `255.255.255.248` for a `/29`.
    #[must_use]
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(!host_mask(self.prefix_len))
    }
}

fn host_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 { u32::MAX } else { u32::MAX >> prefix_len }
}

/// The three RFC 1918 private ranges to search, in priority order.
const PRIVATE_RANGES: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// Finds the first `/29` in RFC 1918 space that does not overlap any of
/// `claimed` (typically every address currently assigned to a host
/// interface, each treated as occupying its own `/29`-aligned block).
pub fn find(claimed: &[Ipv4Addr]) -> Result<Subnet> {
    for &(base, prefix_len) in &PRIVATE_RANGES {
        let range_start = u32::from(base);
        let range_end = range_start | host_mask(prefix_len);

        let mut candidate = range_start;
        while candidate.saturating_add(7) <= range_end {
            if !claimed.iter().any(|addr| subnet_contains(candidate, 29, *addr)) {
                let network = Ipv4Addr::from(candidate);
                return Ok(Subnet {
                    network,
                    prefix_len: 29,
                    gateway: Ipv4Addr::from(candidate + 1),
                    guest: Ipv4Addr::from(candidate + 2),
                });
            }
            candidate += 8;
        }
    }

    Err(Error::NotFound("no unused /29 found in RFC 1918 address space".into()))
}

fn subnet_contains(network: u32, prefix_len: u8, addr: Ipv4Addr) -> bool {
    let mask = !host_mask(prefix_len);
    (network & mask) == (u32::from(addr) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_first_block_when_nothing_is_claimed() {
        let subnet = find(&[]).expect("find");
        assert_eq!(subnet.network, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(subnet.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(subnet.guest, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn skips_blocks_overlapping_claimed_addresses() {
        let claimed = vec![Ipv4Addr::new(10, 0, 0, 1)];
        let subnet = find(&claimed).expect("find");
        assert_ne!(subnet.network, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(subnet.network, Ipv4Addr::new(10, 0, 0, 8));
    }

    #[test]
    fn netmask_and_broadcast_match_a_slash_29() {
        let subnet = find(&[]).expect("find");
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 255, 248));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(10, 0, 0, 7));
    }
}
