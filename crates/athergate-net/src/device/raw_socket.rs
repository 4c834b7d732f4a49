//! WAN NIC device: packet capture in, raw IPv4 injection out.
//!
//! The receiver thread drives a libpcap capture with the filter
//! `"icmp or udp or tcp"`, peels the Ethernet framing, validates the IPv4
//! header, and copies the datagram (`total_length` bytes) into the ingress
//! ring. The sender thread drains the egress ring and emits each datagram
//! through a raw IPv4 socket with `IP_HDRINCL`, so the header's own fields
//! go out verbatim.
//!
//! Per-packet problems are logged and dropped; a failing capture handle is
//! unrecoverable and terminates the process.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::thread;

use pcap::{Active, Capture};
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::warn;

use crate::datapath::{RingReceiver, RingSender};
use crate::error::{fatal, NetError, Result};
use crate::wire::checksum::checksum;
use crate::wire::{ipv4_split, EthernetHeader, Ipv4Header, Overlay};

use super::Device;

/// Maximum IPv4 datagram the NIC device accepts.
pub const RAW_SOCKET_MTU: usize = 1500;

/// Capture filter: only protocols the gateway can possibly forward.
const CAPTURE_FILTER: &str = "icmp or udp or tcp";

/// Opens the default capture interface and returns the engine-facing
/// device.
///
/// `gateway_ip` is the gateway's own WAN address, used for the
/// anti-loopback drop on ingress. Spawns the receiver and sender I/O
/// threads.
///
/// # Errors
///
/// Returns an error if no capture device is available, the capture handle
/// or BPF filter cannot be set up, or the raw injection socket cannot be
/// created.
pub fn open(gateway_ip: Ipv4Addr, capacity: usize) -> Result<Device> {
    let iface = default_interface()?;

    let mut capture = Capture::from_device(iface)?
        .promisc(false)
        .snaplen((RAW_SOCKET_MTU + 100) as i32)
        .timeout(10)
        .open()?;
    capture.filter(CAPTURE_FILTER, true)?;

    let socket = open_inject_socket()?;

    let (device, wire) = Device::pair(RAW_SOCKET_MTU, capacity);
    let (ingress, egress) = wire.split();

    thread::Builder::new()
        .name("wan-recv".into())
        .spawn(move || receiver_loop(capture, ingress, gateway_ip))?;
    thread::Builder::new()
        .name("wan-send".into())
        .spawn(move || sender_loop(egress, socket))?;

    Ok(device)
}

/// Returns the IPv4 address of the default capture interface.
///
/// # Errors
///
/// Returns an error if no capture device exists or it carries no IPv4
/// address.
pub fn lookup_local_ip() -> Result<Ipv4Addr> {
    let iface = default_interface()?;
    iface
        .addresses
        .iter()
        .find_map(|addr| match addr.addr {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| NetError::Config("capture device has no IPv4 address".into()))
}

fn default_interface() -> Result<pcap::Device> {
    pcap::Device::lookup()?.ok_or_else(|| NetError::Config("no capture device found".into()))
}

/// Creates the raw IPv4 socket used for injection, with `IP_HDRINCL` so
/// datagrams are sent with their header bytes untouched.
fn open_inject_socket() -> Result<Socket> {
    let socket = Socket::new(
        Domain::IPV4,
        Type::RAW,
        Some(socket2::Protocol::from(libc::IPPROTO_RAW)),
    )?;

    let one: libc::c_int = 1;
    // Safety: valid fd, valid pointer to a c_int of the advertised size.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(NetError::Inject(format!(
            "IP_HDRINCL: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(socket)
}

/// Capture loop: Ethernet frame in, IPv4 datagram into the ingress ring.
fn receiver_loop(mut capture: Capture<Active>, mut ingress: RingSender, gateway_ip: Ipv4Addr) {
    loop {
        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(err) => fatal(&format!("packet capture failed: {err}")),
        };

        // A frame the kernel truncated cannot be forwarded faithfully.
        if packet.header.caplen != packet.header.len {
            warn!(
                caplen = packet.header.caplen,
                len = packet.header.len,
                "truncated capture, dropping frame"
            );
            continue;
        }

        let Some(eth) = EthernetHeader::overlay(packet.data) else {
            warn!("runt frame, dropping");
            continue;
        };
        if !eth.is_ipv4() {
            continue;
        }

        let ip_bytes = &packet.data[std::mem::size_of::<EthernetHeader>()..];
        let Some(ip) = Ipv4Header::overlay(ip_bytes) else {
            warn!("frame too short for IPv4 header, dropping");
            continue;
        };

        let header_len = ip.header_len();
        if header_len < std::mem::size_of::<Ipv4Header>() || ip_bytes.len() < header_len {
            warn!("invalid IPv4 header length, dropping");
            continue;
        }
        if checksum(&ip_bytes[..header_len]) != 0 {
            warn!("bad IPv4 header checksum, dropping");
            continue;
        }

        // A packet we injected ourselves loops straight back through the
        // capture; forwarding it again would echo forever.
        if ip.src_ip() == gateway_ip && ip.dst_ip() != gateway_ip {
            continue;
        }

        let total_len = usize::from(ip.total_length());
        if total_len < header_len || total_len > ip_bytes.len() || total_len > RAW_SOCKET_MTU {
            warn!(total_len, "inconsistent total length, dropping");
            continue;
        }

        let mut slot = ingress.try_send();
        if slot.is_empty() {
            warn!("package loss");
            continue;
        }
        slot[..total_len].copy_from_slice(&ip_bytes[..total_len]);
    }
}

/// Injection loop: egress ring out through the raw socket.
fn sender_loop(mut egress: RingReceiver, socket: Socket) {
    loop {
        let mut slot = egress.recv();

        let (dst_ip, total_len) = {
            let Some((header, _options, _data)) = ipv4_split(&mut slot) else {
                warn!("invalid egress datagram, dropping");
                continue;
            };
            (header.dst_ip(), usize::from(header.total_length()))
        };

        let addr = SockAddr::from(SocketAddrV4::new(dst_ip, 0));
        if let Err(err) = socket.send_to(&slot[..total_len], &addr) {
            warn!(%dst_ip, "raw socket send failed: {err}");
        }
    }
}
