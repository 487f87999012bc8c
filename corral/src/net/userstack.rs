//! The software networking backend: a user-space gateway bound to a TAP
//! device. Answers ARP for the gateway address, serves DHCP on UDP/67,
//! and forwards everything else by dialing out from the host kernel and
//! splicing — there is no real IP stack underneath, just enough protocol
//! handling to act as a NAT gateway for a single guest.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::net::dhcp::{self, LeaseConfig};
use crate::net::tap::Tap;
use crate::net::wire::{
    self, ArpPacket, EthernetFrame, Ipv4Packet, TcpFlags, TcpSegment, UdpDatagram, ARP_REQUEST, ETHERTYPE_ARP,
    ETHERTYPE_IPV4, IPPROTO_TCP, IPPROTO_UDP,
};
use crate::subnetfinder::Subnet;
use crate::Result;

const VNET_HDR_LEN: usize = 12;
const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Everything [`run`] needs to know about the guest it's fronting.
#[derive(Debug, Clone, Copy)]
pub struct UserStackConfig {
    pub gateway_mac: wire::MacAddr,
    pub vm_mac: wire::MacAddr,
    pub subnet: Subnet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
}

/// Runs the user-space gateway until `cancel` resolves. Reads raw frames
/// off `tap`, answers ARP/DHCP directly, and forwards TCP/UDP flows by
/// dialing the real destination from the host and splicing.
pub async fn run(tap: Tap, config: UserStackConfig, cancel: impl std::future::Future<Output = ()>) -> Result<()> {
    let write_fd = tap.try_clone_fd()?;
    let async_fd = AsyncFd::new(tap)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        let mut file = tokio::fs::File::from_std(write_fd);
        while let Some(frame) = rx.recv().await {
            let mut out = Vec::with_capacity(VNET_HDR_LEN + frame.len());
            out.resize(VNET_HDR_LEN, 0);
            out.extend_from_slice(&frame);
            if file.write_all(&out).await.is_err() {
                break;
            }
        }
    });

    let mut state = StackState {
        config,
        tx,
        tcp_flows: HashMap::new(),
        udp_flows: HashMap::new(),
    };

    tokio::pin!(cancel);
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            biased;
            () = &mut cancel => break,
            guard_result = async_fd.readable() => {
                let mut guard = guard_result?;
                let read = guard.try_io(|inner| nix::unistd::read(inner.as_fd(), &mut buf).map_err(std::io::Error::from));
                let Ok(Ok(n)) = read else { continue };
                if n > VNET_HDR_LEN {
                    state.on_frame(&buf[VNET_HDR_LEN..n]).await;
                }
            }
        }
    }

    writer_task.abort();
    Ok(())
}

struct StackState {
    config: UserStackConfig,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    tcp_flows: HashMap<FlowKey, mpsc::UnboundedSender<Vec<u8>>>,
    udp_flows: HashMap<FlowKey, mpsc::UnboundedSender<Vec<u8>>>,
}

impl StackState {
    async fn on_frame(&mut self, frame: &[u8]) {
        let Some(eth) = EthernetFrame::parse(frame) else { return };
        match eth.ethertype {
            ETHERTYPE_ARP => self.on_arp(eth.payload),
            ETHERTYPE_IPV4 => self.on_ipv4(eth.payload).await,
            _ => {}
        }
    }

    fn on_arp(&mut self, payload: &[u8]) {
        let Some(arp) = ArpPacket::parse(payload) else { return };
        if arp.operation != ARP_REQUEST || arp.target_ip != self.config.subnet.gateway {
            return;
        }
        let reply = ArpPacket::build_reply(self.config.gateway_mac, self.config.subnet.gateway, &arp);
        let frame = wire::build_ethernet(arp.sender_mac, self.config.gateway_mac, ETHERTYPE_ARP, &reply);
        let _ = self.tx.send(frame);
    }

    async fn on_ipv4(&mut self, payload: &[u8]) {
        let Some(ip) = Ipv4Packet::parse(payload) else { return };
        match ip.protocol {
            IPPROTO_UDP => self.on_udp(ip.src, ip.dst, ip.payload).await,
            IPPROTO_TCP => self.on_tcp(ip.src, ip.dst, ip.payload).await,
            _ => {}
        }
    }

    async fn on_udp(&mut self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
        let Some(udp) = UdpDatagram::parse(payload) else { return };

        if dst == self.config.subnet.gateway && udp.dst_port == 67 {
            let lease = LeaseConfig {
                vm_ip: self.config.subnet.guest,
                gateway_ip: self.config.subnet.gateway,
                netmask: self.config.subnet.netmask(),
            };
            if let Some(reply) = dhcp::handle(udp.payload, &lease) {
                self.send_udp(self.config.subnet.gateway, 67, src, udp.src_port, &reply);
            }
            return;
        }

        if !should_forward(&self.config.subnet, dst) {
            return;
        }

        let key = FlowKey { src_port: udp.src_port, dst_ip: dst, dst_port: udp.dst_port };
        if let Some(existing) = self.udp_flows.get(&key) {
            let _ = existing.send(udp.payload.to_vec());
            return;
        }

        let (flow_tx, flow_rx) = mpsc::unbounded_channel();
        let _ = flow_tx.send(udp.payload.to_vec());
        self.udp_flows.insert(key, flow_tx);

        let reply_tx = self.tx.clone();
        let vm_ip = self.config.subnet.guest;
        let gateway_mac = self.config.gateway_mac;
        let vm_mac = self.config.vm_mac;
        tokio::spawn(async move {
            let _ =
                run_udp_flow(dst, udp.dst_port, vm_ip, udp.src_port, gateway_mac, vm_mac, flow_rx, reply_tx).await;
        });
    }

    fn send_udp(&self, src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16, payload: &[u8]) {
        let datagram = wire::build_udp((src_ip, src_port), (dst_ip, dst_port), payload);
        let ip_packet = wire::build_ipv4(IPPROTO_UDP, src_ip, dst_ip, &datagram);
        let frame = wire::build_ethernet(self.config.vm_mac, self.config.gateway_mac, ETHERTYPE_IPV4, &ip_packet);
        let _ = self.tx.send(frame);
    }

    async fn on_tcp(&mut self, _src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
        let Some(seg) = TcpSegment::parse(payload) else { return };

        let key = FlowKey { src_port: seg.src_port, dst_ip: dst, dst_port: seg.dst_port };
        if let Some(existing) = self.tcp_flows.get(&key) {
            if seg.flags.fin || seg.flags.rst {
                self.tcp_flows.remove(&key);
            } else {
                let _ = existing.send(payload.to_vec());
            }
            return;
        }

        if !seg.flags.syn || seg.flags.ack {
            return;
        }
        if !should_forward(&self.config.subnet, dst) {
            return;
        }

        let (flow_tx, flow_rx) = mpsc::unbounded_channel();
        self.tcp_flows.insert(key, flow_tx);

        let reply_tx = self.tx.clone();
        tokio::spawn(run_tcp_flow(TcpFlowParams {
            remote_ip: dst,
            remote_port: seg.dst_port,
            vm_ip: self.config.subnet.guest,
            vm_port: seg.src_port,
            client_isn: seg.seq,
            gateway_mac: self.config.gateway_mac,
            vm_mac: self.config.vm_mac,
            reply_tx,
            from_guest: flow_rx,
        }));
    }
}

struct TcpFlowParams {
    remote_ip: Ipv4Addr,
    remote_port: u16,
    vm_ip: Ipv4Addr,
    vm_port: u16,
    client_isn: u32,
    gateway_mac: wire::MacAddr,
    vm_mac: wire::MacAddr,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
    from_guest: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Dials the real destination, completes the three-way handshake against
/// the guest, and splices bytes in both directions until either side
/// closes or the connection idles past [`IDLE_TIMEOUT`]. Sends an RST if
/// the dial itself fails.
async fn run_tcp_flow(params: TcpFlowParams) {
    let TcpFlowParams {
        remote_ip,
        remote_port,
        vm_ip,
        vm_port,
        client_isn,
        gateway_mac,
        vm_mac,
        reply_tx,
        mut from_guest,
    } = params;

    let frame = |seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]| {
        let segment = wire::build_tcp((remote_ip, remote_port), (vm_ip, vm_port), seq, ack, flags, 65535, payload);
        let ip_packet = wire::build_ipv4(IPPROTO_TCP, remote_ip, vm_ip, &segment);
        wire::build_ethernet(vm_mac, gateway_mac, ETHERTYPE_IPV4, &ip_packet)
    };

    let stream = match timeout(IDLE_TIMEOUT, TcpStream::connect(SocketAddr::from((remote_ip, remote_port)))).await {
        Ok(Ok(stream)) => stream,
        _ => {
            let rst = frame(0, client_isn.wrapping_add(1), TcpFlags { rst: true, ack: true, ..Default::default() }, &[]);
            let _ = reply_tx.send(rst);
            return;
        }
    };

    let our_isn: u32 = 0x1000_0000;
    let synack =
        frame(our_isn, client_isn.wrapping_add(1), TcpFlags { syn: true, ack: true, ..Default::default() }, &[]);
    let _ = reply_tx.send(synack);

    // Wait for the guest's final handshake ACK before splicing.
    let Some(first) = from_guest.recv().await else { return };
    let Some(seg) = TcpSegment::parse(&first) else { return };
    if seg.flags.rst || seg.flags.fin {
        return;
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let mut guest_seq = our_isn.wrapping_add(1);
    let mut host_ack = client_isn.wrapping_add(1);

    let mut read_buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            result = timeout(IDLE_TIMEOUT, read_half.read(&mut read_buf)) => {
                match result {
                    Ok(Ok(0)) | Err(_) => {
                        let fin = frame(guest_seq, host_ack, TcpFlags { fin: true, ack: true, ..Default::default() }, &[]);
                        let _ = reply_tx.send(fin);
                        break;
                    }
                    Ok(Ok(n)) => {
                        let data = frame(guest_seq, host_ack, TcpFlags { ack: true, ..Default::default() }, &read_buf[..n]);
                        guest_seq = guest_seq.wrapping_add(n as u32);
                        let _ = reply_tx.send(data);
                    }
                    Ok(Err(_)) => break,
                }
            }
            segment = timeout(IDLE_TIMEOUT, from_guest.recv()) => {
                match segment {
                    Ok(Some(bytes)) => {
                        let Some(seg) = TcpSegment::parse(&bytes) else { continue };
                        if seg.flags.rst || seg.flags.fin {
                            break;
                        }
                        if !seg.payload.is_empty() {
                            host_ack = host_ack.wrapping_add(seg.payload.len() as u32);
                            if write_half.write_all(seg.payload).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}

/// Dials a UDP socket to `remote`, relays datagrams bidirectionally, and
/// exits after [`IDLE_TIMEOUT`] of silence in both directions.
#[allow(clippy::too_many_arguments)]
async fn run_udp_flow(
    remote_ip: Ipv4Addr,
    remote_port: u16,
    vm_ip: Ipv4Addr,
    vm_port: u16,
    gateway_mac: wire::MacAddr,
    vm_mac: wire::MacAddr,
    mut from_guest: mpsc::UnboundedReceiver<Vec<u8>>,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(SocketAddr::from((remote_ip, remote_port))).await?;

    let mut recv_buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            sent = timeout(IDLE_TIMEOUT, from_guest.recv()) => {
                match sent {
                    Ok(Some(payload)) => {
                        if socket.send(&payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            received = timeout(IDLE_TIMEOUT, socket.recv(&mut recv_buf)) => {
                match received {
                    Ok(Ok(n)) => {
                        let datagram = wire::build_udp((remote_ip, remote_port), (vm_ip, vm_port), &recv_buf[..n]);
                        let ip_packet = wire::build_ipv4(IPPROTO_UDP, remote_ip, vm_ip, &datagram);
                        let frame = wire::build_ethernet(vm_mac, gateway_mac, ETHERTYPE_IPV4, &ip_packet);
                        let _ = reply_tx.send(frame);
                    }
                    _ => break,
                }
            }
        }
    }

    Ok(())
}

/// The forwarding filter shared by TCP and UDP: only IPv4 addresses
/// outside the assigned `/29` and only globally-unicast remotes pass.
#[must_use]
pub fn should_forward(subnet: &Subnet, remote: Ipv4Addr) -> bool {
    if in_subnet(subnet, remote) {
        return false;
    }
    wire::is_globally_unicast(remote)
}

fn in_subnet(subnet: &Subnet, addr: Ipv4Addr) -> bool {
    let mask = u32::from(subnet.netmask());
    (u32::from(addr) & mask) == (u32::from(subnet.network) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> Subnet {
        crate::subnetfinder::find(&[]).expect("find")
    }

    #[test]
    fn forwarding_drops_addresses_inside_the_assigned_subnet() {
        let subnet = subnet();
        assert!(!should_forward(&subnet, subnet.gateway));
        assert!(!should_forward(&subnet, subnet.guest));
    }

    #[test]
    fn forwarding_drops_non_global_remotes() {
        let subnet = subnet();
        assert!(!should_forward(&subnet, Ipv4Addr::new(169, 254, 1, 1)));
        assert!(!should_forward(&subnet, Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!should_forward(&subnet, Ipv4Addr::new(224, 0, 0, 1)));
    }

    #[test]
    fn forwarding_accepts_a_globally_routable_remote_outside_the_subnet() {
        let subnet = subnet();
        assert!(should_forward(&subnet, Ipv4Addr::new(93, 184, 216, 34)));
    }
}
