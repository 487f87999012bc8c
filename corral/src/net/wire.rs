//! Minimal Ethernet/ARP/IPv4/TCP/UDP header parsing and construction —
//! just enough of each protocol for the gateway stack in [`super::userstack`]
//! to interpret guest frames and synthesize replies. Not a general-purpose
//! packet library: fields the stack never inspects (IP options, TCP
//! options beyond MSS) are neither parsed nor preserved.

use std::net::Ipv4Addr;

/// A 6-byte Ethernet hardware address.
pub type MacAddr = [u8; 6];

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// A parsed Ethernet header; `payload` is everything after it.
pub struct EthernetFrame<'a> {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < 14 {
            return None;
        }
        Some(Self {
            dst: frame[0..6].try_into().ok()?,
            src: frame[6..12].try_into().ok()?,
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
            payload: &frame[14..],
        })
    }
}

/// Prepends a 14-byte Ethernet header to `payload`.
pub fn build_ethernet(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + payload.len());
    out.extend_from_slice(&dst);
    out.extend_from_slice(&src);
    out.extend_from_slice(&ethertype.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// A parsed IPv4 ARP request/reply (the only hardware/protocol
/// combination this stack ever sees on a TAP device).
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

impl ArpPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 28 {
            return None;
        }
        // Only Ethernet/IPv4 ARP (htype=1, ptype=0x0800, hlen=6, plen=4)
        // is meaningful here; anything else is ignored by the caller.
        if payload[0..2] != [0, 1] || payload[2..4] != [0x08, 0x00] {
            return None;
        }
        Some(Self {
            operation: u16::from_be_bytes([payload[6], payload[7]]),
            sender_mac: payload[8..14].try_into().ok()?,
            sender_ip: Ipv4Addr::new(payload[14], payload[15], payload[16], payload[17]),
            target_mac: payload[18..24].try_into().ok()?,
            target_ip: Ipv4Addr::new(payload[24], payload[25], payload[26], payload[27]),
        })
    }

    pub fn build_reply(our_mac: MacAddr, our_ip: Ipv4Addr, request: &ArpPacket) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        out.extend_from_slice(&[0, 1]); // htype: Ethernet
        out.extend_from_slice(&[0x08, 0x00]); // ptype: IPv4
        out.push(6); // hlen
        out.push(4); // plen
        out.extend_from_slice(&ARP_REPLY.to_be_bytes());
        out.extend_from_slice(&our_mac);
        out.extend_from_slice(&our_ip.octets());
        out.extend_from_slice(&request.sender_mac);
        out.extend_from_slice(&request.sender_ip.octets());
        out
    }
}

/// A parsed IPv4 header; `payload` is everything after it (options are
/// skipped over but not retained).
pub struct Ipv4Packet<'a> {
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub payload: &'a [u8],
}

impl<'a> Ipv4Packet<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 20 {
            return None;
        }
        let version = data[0] >> 4;
        if version != 4 {
            return None;
        }
        let ihl = usize::from(data[0] & 0x0F) * 4;
        if ihl < 20 || data.len() < ihl {
            return None;
        }
        Some(Self {
            protocol: data[9],
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            payload: &data[ihl..],
        })
    }
}

/// Builds an IPv4 header (no options) followed by `payload`, with a
/// correct header checksum.
pub fn build_ipv4(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total_len = 20 + payload.len();
    let mut header = vec![0u8; 20];
    header[0] = 0x45; // version 4, IHL 5
    header[1] = 0; // DSCP/ECN
    header[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    header[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    header[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/fragment offset
    header[8] = 64; // TTL
    header[9] = protocol;
    header[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum, filled below
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());

    let checksum = ip_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());

    let mut out = header;
    out.extend_from_slice(payload);
    out
}

/// The one's-complement Internet checksum (RFC 1071) used by IPv4, TCP,
/// and UDP headers alike.
pub fn ip_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds the IPv4 pseudo-header used by TCP/UDP checksums.
fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&dst.octets());
    out.push(0);
    out.push(protocol);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out
}

/// Computes a TCP/UDP checksum over the pseudo-header + segment.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut combined = pseudo_header(src, dst, protocol, segment.len());
    combined.extend_from_slice(segment);
    ip_checksum(&combined)
}

/// A parsed UDP header; `payload` is the datagram body.
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([data[4], data[5]]));
        let payload_end = len.max(8).min(data.len());
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            payload: &data[8..payload_end],
        })
    }
}

/// Builds a UDP datagram (header + checksum) ready to wrap in
/// [`build_ipv4`].
pub fn build_udp(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut segment = vec![0u8; 8];
    segment[0..2].copy_from_slice(&src.1.to_be_bytes());
    segment[2..4].copy_from_slice(&dst.1.to_be_bytes());
    segment[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    segment.extend_from_slice(payload);

    let checksum = transport_checksum(src.0, dst.0, IPPROTO_UDP, &segment);
    segment[6..8].copy_from_slice(&checksum.to_be_bytes());
    segment
}

/// TCP header flags this stack cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            ack: b & 0x10 != 0,
        }
    }

    fn to_byte(self) -> u8 {
        (u8::from(self.fin)) | (u8::from(self.syn) << 1) | (u8::from(self.rst) << 2) | (u8::from(self.ack) << 4)
    }
}

/// A parsed TCP segment header; `payload` is everything after the header
/// (options included in the header length are skipped, not retained).
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 20 {
            return None;
        }
        let data_offset = usize::from(data[12] >> 4) * 4;
        if data_offset < 20 || data.len() < data_offset {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags::from_byte(data[13]),
            window: u16::from_be_bytes([data[14], data[15]]),
            payload: &data[data_offset..],
        })
    }
}

/// Builds a TCP segment (no options), with checksum, wrapped by the
/// caller in [`build_ipv4`].
#[allow(clippy::too_many_arguments)]
pub fn build_tcp(
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut segment = vec![0u8; 20];
    segment[0..2].copy_from_slice(&src.1.to_be_bytes());
    segment[2..4].copy_from_slice(&dst.1.to_be_bytes());
    segment[4..8].copy_from_slice(&seq.to_be_bytes());
    segment[8..12].copy_from_slice(&ack.to_be_bytes());
    segment[12] = 5 << 4; // data offset, no options
    segment[13] = flags.to_byte();
    segment[14..16].copy_from_slice(&window.to_be_bytes());
    segment.extend_from_slice(payload);

    let checksum = transport_checksum(src.0, dst.0, IPPROTO_TCP, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
    segment
}

/// `true` iff `addr` is not link-local, loopback, multicast, broadcast,
/// or unspecified — the forwarding filter's "remote is globally
/// reachable" check.
#[must_use]
pub fn is_globally_unicast(addr: Ipv4Addr) -> bool {
    !(addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_broadcast()
        || addr.is_unspecified()
        || addr.is_documentation())
}
