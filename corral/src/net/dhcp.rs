//! Minimal DHCPv4 server: handles DISCOVER→OFFER and REQUEST→ACK only,
//! with every other message type silently dropped. Both the software
//! stack (udp/67 on the user-space side) and the host-only network
//! variant (a real UDP socket on the bridge/tap interface) drive this
//! through the same [`handle`] entry point.

use std::net::Ipv4Addr;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;

const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_LEASE_TIME: u8 = 51;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_ACK: u8 = 5;

/// Fixed 10-minute lease, matching the spec's single-guest-per-subnet
/// deployment (there is no lease table to expire from).
const LEASE_SECONDS: u32 = 10 * 60;

/// The addresses a lease response carries, fixed per VM for the lifetime
/// of its `/29` subnet.
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub vm_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// A minimally parsed DHCP request.
struct Request<'a> {
    xid: [u8; 4],
    chaddr: [u8; 6],
    message_type: u8,
    _unused: std::marker::PhantomData<&'a ()>,
}

fn parse(packet: &[u8]) -> Option<Request<'_>> {
    if packet.len() < 240 || packet[0] != OP_BOOTREQUEST {
        return None;
    }
    if packet[236..240] != MAGIC_COOKIE {
        return None;
    }

    let xid = packet[4..8].try_into().ok()?;
    let chaddr = packet[28..34].try_into().ok()?;

    let mut message_type = None;
    let mut options = &packet[240..];
    while let [opt, rest @ ..] = options {
        if *opt == OPT_END {
            break;
        }
        let [len, rest @ ..] = rest else { break };
        let len = usize::from(*len);
        if rest.len() < len {
            break;
        }
        if *opt == OPT_MESSAGE_TYPE && len == 1 {
            message_type = Some(rest[0]);
        }
        options = &rest[len..];
    }

    Some(Request {
        xid,
        chaddr,
        message_type: message_type?,
        _unused: std::marker::PhantomData,
    })
}

/// Processes one received DHCP packet (the UDP payload, client port 68 →
/// server port 67) and returns the reply payload to send back to
/// `0xFFFFFFFF:68`, or `None` if the message type isn't handled
/// (anything other than DISCOVER/REQUEST) or fails to parse.
#[must_use]
pub fn handle(packet: &[u8], lease: &LeaseConfig) -> Option<Vec<u8>> {
    let request = parse(packet)?;

    let reply_type = match request.message_type {
        MSG_DISCOVER => MSG_OFFER,
        MSG_REQUEST => MSG_ACK,
        _ => return None,
    };

    Some(build_reply(&request, reply_type, lease))
}

fn build_reply(request: &Request<'_>, message_type: u8, lease: &LeaseConfig) -> Vec<u8> {
    let mut out = vec![0u8; 240];
    out[0] = OP_BOOTREPLY;
    out[1] = 1; // htype: Ethernet
    out[2] = 6; // hlen
    out[3] = 0; // hops
    out[4..8].copy_from_slice(&request.xid);
    out[16..20].copy_from_slice(&lease.vm_ip.octets()); // yiaddr
    out[28..34].copy_from_slice(&request.chaddr);
    out[236..240].copy_from_slice(&MAGIC_COOKIE);

    let mut options = Vec::new();
    options.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, message_type]);
    options.extend_from_slice(&[OPT_SUBNET_MASK, 4]);
    options.extend_from_slice(&lease.netmask.octets());
    options.extend_from_slice(&[OPT_ROUTER, 4]);
    options.extend_from_slice(&lease.gateway_ip.octets());
    options.extend_from_slice(&[OPT_DNS, 8]);
    options.extend_from_slice(&Ipv4Addr::new(8, 8, 8, 8).octets());
    options.extend_from_slice(&Ipv4Addr::new(8, 8, 4, 4).octets());
    options.extend_from_slice(&[OPT_LEASE_TIME, 4]);
    options.extend_from_slice(&LEASE_SECONDS.to_be_bytes());
    options.extend_from_slice(&[OPT_SERVER_ID, 4]);
    options.extend_from_slice(&lease.gateway_ip.octets());
    options.push(OPT_END);

    out.extend_from_slice(&options);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discover_packet(xid: [u8; 4], chaddr: [u8; 6]) -> Vec<u8> {
        let mut packet = vec![0u8; 240];
        packet[0] = OP_BOOTREQUEST;
        packet[1] = 1;
        packet[2] = 6;
        packet[4..8].copy_from_slice(&xid);
        packet[28..34].copy_from_slice(&chaddr);
        packet[236..240].copy_from_slice(&MAGIC_COOKIE);
        packet.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, MSG_DISCOVER, OPT_END]);
        packet
    }

    #[test]
    fn discover_yields_an_offer_with_the_right_yiaddr() {
        let lease = LeaseConfig {
            vm_ip: Ipv4Addr::new(10, 0, 0, 2),
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 248),
        };
        let reply = handle(&discover_packet([1, 2, 3, 4], [0xAA; 6]), &lease).expect("offer");

        assert_eq!(reply[0], OP_BOOTREPLY);
        assert_eq!(&reply[16..20], &lease.vm_ip.octets());
        assert_eq!(&reply[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn request_yields_an_ack() {
        let mut packet = discover_packet([9, 9, 9, 9], [0xBB; 6]);
        let offset = packet.len() - 2; // message-type value byte, before END
        packet[offset] = MSG_REQUEST;

        let lease = LeaseConfig {
            vm_ip: Ipv4Addr::new(10, 0, 0, 2),
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 248),
        };
        let reply = handle(&packet, &lease).expect("ack");
        let message_type_opt_pos = 240 + 2; // [53, 1, <type>]
        assert_eq!(reply[message_type_opt_pos], MSG_ACK);
    }

    #[test]
    fn other_message_types_are_dropped() {
        let mut packet = discover_packet([1, 1, 1, 1], [0xCC; 6]);
        let offset = packet.len() - 2;
        packet[offset] = 7; // RELEASE

        let lease = LeaseConfig {
            vm_ip: Ipv4Addr::new(10, 0, 0, 2),
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 248),
        };
        assert!(handle(&packet, &lease).is_none());
    }
}
