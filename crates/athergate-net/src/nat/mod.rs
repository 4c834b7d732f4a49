//! The NAT forwarding engine.
//!
//! Two symmetric threads share the port translation table of [`table`]:
//! LAN→WAN rewrites the source endpoint to the gateway's own address and a
//! table-allocated WAN port; WAN→LAN resolves the WAN port back to the LAN
//! endpoint and rewrites the destination. Both directions validate and
//! recompute the IPv4 header checksum and the transport checksum (ICMP
//! echo identifier or UDP port is the translated field), decrement the
//! TTL, and re-emit through the peer device's egress ring.
//!
//! Packets the engine cannot forward are dropped, with a warning when the
//! packet is malformed and silently when it is merely not ours to handle
//! (unsupported protocol, loopback, unknown mapping). Port exhaustion
//! terminates the process.

pub mod table;

use std::net::Ipv4Addr;
use std::thread::{self, JoinHandle};

use ipnetwork::Ipv4Network;
use tracing::{info, trace, warn};

use crate::device::{Device, DeviceRx, DeviceTx};
use crate::error::fatal;
use crate::wire::{checksum, ipv4_split, IcmpEchoHeader, Protocol, UdpHeader, Overlay};

use table::{ForwardTable, NatTable};

/// The subnet the LAN device serves; LAN→WAN traffic addressed into it is
/// local and never crosses the gateway.
const LAN_SUBNET: (Ipv4Addr, u8) = (Ipv4Addr::new(192, 168, 1, 0), 24);

/// A running NAT gateway: the two forwarding threads over a LAN and a WAN
/// device.
pub struct NatServer {
    lan_to_wan: JoinHandle<()>,
    wan_to_lan: JoinHandle<()>,
}

impl NatServer {
    /// Installs the static port mappings and starts the forwarding
    /// threads.
    ///
    /// Static mappings reserve consecutive WAN ports starting at
    /// [`table::NAT_PORTS_BASE`], in order, before either thread runs.
    /// Exhausting the port range here is fatal.
    #[must_use]
    pub fn start(
        lan: Device,
        wan: Device,
        gateway_ip: Ipv4Addr,
        static_maps: &[(Ipv4Addr, u16)],
    ) -> Self {
        let mut table = NatTable::new();
        for &(lan_ip, lan_port) in static_maps {
            if table.wan_port_for(lan_ip, lan_port).is_none() {
                fatal("nat ports used up");
            }
        }
        let forward = table.forward_handle();

        let (lan_tx, lan_rx) = lan.split();
        let (wan_tx, wan_rx) = wan.split();

        info!(%gateway_ip, mappings = static_maps.len(), "starting NAT forwarding threads");

        let lan_to_wan = thread::Builder::new()
            .name("nat-lan-wan".into())
            .spawn(move || lan_to_wan_loop(lan_rx, wan_tx, table, gateway_ip))
            .unwrap_or_else(|err| fatal(&format!("spawning forwarding thread: {err}")));
        let wan_to_lan = thread::Builder::new()
            .name("nat-wan-lan".into())
            .spawn(move || wan_to_lan_loop(wan_rx, lan_tx, forward))
            .unwrap_or_else(|err| fatal(&format!("spawning forwarding thread: {err}")));

        Self {
            lan_to_wan,
            wan_to_lan,
        }
    }

    /// Parks the caller until the forwarding threads exit, which they
    /// never do in normal operation. A panicked thread is fatal.
    pub fn join(self) {
        if self.lan_to_wan.join().is_err() || self.wan_to_lan.join().is_err() {
            fatal("forwarding thread panicked");
        }
    }
}

fn lan_to_wan_loop(mut lan: DeviceRx, mut wan: DeviceTx, mut table: NatTable, gateway_ip: Ipv4Addr) {
    let lan_subnet = Ipv4Network::new(LAN_SUBNET.0, LAN_SUBNET.1).expect("static subnet prefix");
    let wan_mtu = wan.mtu();

    loop {
        let mut slot = lan.recv();
        let Some(total_len) =
            translate_lan_to_wan(&mut slot, &mut table, gateway_ip, lan_subnet, wan_mtu)
        else {
            continue;
        };

        let mut out = wan.try_send();
        if out.is_empty() {
            warn!("package loss");
            continue;
        }
        out[..total_len].copy_from_slice(&slot[..total_len]);
    }
}

fn wan_to_lan_loop(mut wan: DeviceRx, mut lan: DeviceTx, forward: std::sync::Arc<ForwardTable>) {
    let lan_mtu = lan.mtu();

    loop {
        let mut slot = wan.recv();
        let Some(total_len) = translate_wan_to_lan(&mut slot, &forward, lan_mtu) else {
            continue;
        };

        let mut out = lan.try_send();
        if out.is_empty() {
            warn!("package loss");
            continue;
        }
        out[..total_len].copy_from_slice(&slot[..total_len]);
    }
}

/// Rewrites one LAN-originated datagram in place.
///
/// Returns the datagram length to forward, or `None` to drop.
fn translate_lan_to_wan(
    buf: &mut [u8],
    table: &mut NatTable,
    gateway_ip: Ipv4Addr,
    lan_subnet: Ipv4Network,
    wan_mtu: usize,
) -> Option<usize> {
    let Some((header, options, data)) = ipv4_split(buf) else {
        warn!("invalid packet, dropping");
        return None;
    };
    if checksum::ipv4_checksum(header, options) != 0 {
        warn!("bad IPv4 header checksum, dropping");
        return None;
    }
    if header.ttl() == 0 {
        warn!("zero TTL, dropping");
        return None;
    }

    let src_ip = header.src_ip();
    if src_ip == gateway_ip {
        trace!(%src_ip, "own packet looped back, dropping");
        return None;
    }
    if lan_subnet.contains(header.dst_ip()) {
        trace!(dst_ip = %header.dst_ip(), "destination is on the LAN, dropping");
        return None;
    }

    let lan_port = match Protocol::from(header.protocol()) {
        Protocol::Icmp => {
            let Some(icmp) = IcmpEchoHeader::overlay(data) else {
                warn!("truncated ICMP header, dropping");
                return None;
            };
            if checksum::checksum(data) != 0 {
                warn!("bad ICMP checksum, dropping");
                return None;
            }
            icmp.identifier()
        }
        Protocol::Udp => {
            let Some(udp) = UdpHeader::overlay(data) else {
                warn!("truncated UDP header, dropping");
                return None;
            };
            if !udp.verify_checksum(checksum::udp_checksum(header, data)) {
                warn!("bad UDP checksum, dropping");
                return None;
            }
            udp.src_port()
        }
        _ => {
            trace!(protocol = header.protocol(), "unsupported protocol, dropping");
            return None;
        }
    };

    let total_len = usize::from(header.total_length());
    if total_len > wan_mtu {
        warn!(total_len, wan_mtu, "datagram exceeds egress MTU, dropping");
        return None;
    }

    let Some(wan_port) = table.wan_port_for(src_ip, lan_port) else {
        fatal("nat ports used up");
    };

    header.set_ttl(header.ttl() - 1);
    header.set_src_ip(gateway_ip);
    header.set_checksum(0);
    let ip_sum = checksum::ipv4_checksum(header, options);
    header.set_checksum(ip_sum);

    match Protocol::from(header.protocol()) {
        Protocol::Icmp => {
            if let Some(icmp) = IcmpEchoHeader::overlay_mut(data) {
                icmp.set_identifier(wan_port);
                icmp.set_checksum(0);
            }
            let icmp_sum = checksum::checksum(data);
            if let Some(icmp) = IcmpEchoHeader::overlay_mut(data) {
                icmp.set_checksum(icmp_sum);
            }
        }
        Protocol::Udp => {
            if let Some(udp) = UdpHeader::overlay_mut(data) {
                udp.set_src_port(wan_port);
                udp.clear_checksum();
            }
            let udp_sum = checksum::udp_checksum(header, data);
            if let Some(udp) = UdpHeader::overlay_mut(data) {
                udp.set_checksum(udp_sum);
            }
        }
        _ => unreachable!("checked above"),
    }

    Some(total_len)
}

/// Rewrites one WAN-originated datagram in place.
///
/// Returns the datagram length to forward, or `None` to drop.
fn translate_wan_to_lan(
    buf: &mut [u8],
    forward: &ForwardTable,
    lan_mtu: usize,
) -> Option<usize> {
    let Some((header, options, data)) = ipv4_split(buf) else {
        warn!("invalid packet, dropping");
        return None;
    };
    if checksum::ipv4_checksum(header, options) != 0 {
        warn!("bad IPv4 header checksum, dropping");
        return None;
    }
    if header.ttl() == 0 {
        warn!("zero TTL, dropping");
        return None;
    }

    let wan_port = match Protocol::from(header.protocol()) {
        Protocol::Icmp => {
            let Some(icmp) = IcmpEchoHeader::overlay(data) else {
                warn!("truncated ICMP header, dropping");
                return None;
            };
            if checksum::checksum(data) != 0 {
                warn!("bad ICMP checksum, dropping");
                return None;
            }
            icmp.identifier()
        }
        Protocol::Udp => {
            let Some(udp) = UdpHeader::overlay(data) else {
                warn!("truncated UDP header, dropping");
                return None;
            };
            if !udp.verify_checksum(checksum::udp_checksum(header, data)) {
                warn!("bad UDP checksum, dropping");
                return None;
            }
            udp.dst_port()
        }
        _ => {
            trace!(protocol = header.protocol(), "unsupported protocol, dropping");
            return None;
        }
    };

    let Some(entry) = forward.lookup(wan_port) else {
        trace!(wan_port, "no active mapping, dropping");
        return None;
    };

    let total_len = usize::from(header.total_length());
    if total_len > lan_mtu {
        warn!(total_len, lan_mtu, "datagram exceeds egress MTU, dropping");
        return None;
    }

    header.set_ttl(header.ttl() - 1);
    header.set_dst_ip(entry.lan_ip);
    header.set_checksum(0);
    let ip_sum = checksum::ipv4_checksum(header, options);
    header.set_checksum(ip_sum);

    match Protocol::from(header.protocol()) {
        Protocol::Icmp => {
            if let Some(icmp) = IcmpEchoHeader::overlay_mut(data) {
                icmp.set_identifier(entry.lan_port);
                icmp.set_checksum(0);
            }
            let icmp_sum = checksum::checksum(data);
            if let Some(icmp) = IcmpEchoHeader::overlay_mut(data) {
                icmp.set_checksum(icmp_sum);
            }
        }
        Protocol::Udp => {
            if let Some(udp) = UdpHeader::overlay_mut(data) {
                udp.set_dst_port(entry.lan_port);
                udp.clear_checksum();
            }
            let udp_sum = checksum::udp_checksum(header, data);
            if let Some(udp) = UdpHeader::overlay_mut(data) {
                udp.set_checksum(udp_sum);
            }
        }
        _ => unreachable!("checked above"),
    }

    Some(total_len)
}
