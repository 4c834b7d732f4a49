//! LAN tunnel device: Athernet link emulated over a Unix stream socket.
//!
//! The tunnel peer speaks fixed [`ATHERNET_MTU`]-byte frames; the first
//! byte of every frame is reserved by the tunnel itself, so the datagram
//! payload, and with it the MTU this device reports, is one byte less.
//! Datagram
//! boundaries inside the payload come from the IPv4 `total_length` field,
//! so the device moves whole frames and leaves parsing to the engine.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;

use tracing::warn;

use crate::datapath::{RingReceiver, RingSender};
use crate::error::{fatal, NetError, Result};

use super::Device;

/// Fixed frame size of the Athernet tunnel, reserved header byte included.
pub const ATHERNET_MTU: usize = 256;

/// Connects to the Athernet tunnel peer at `path` and returns the
/// engine-facing device. Spawns the receiver and sender I/O threads.
///
/// # Errors
///
/// Returns an error if the Unix socket connection cannot be established.
pub fn connect(path: &Path, capacity: usize) -> Result<Device> {
    let stream = UnixStream::connect(path)
        .map_err(|err| NetError::Tunnel(format!("connect {}: {err}", path.display())))?;
    let reader = stream
        .try_clone()
        .map_err(|err| NetError::Tunnel(format!("clone tunnel stream: {err}")))?;

    let (device, wire) = Device::pair(ATHERNET_MTU - 1, capacity);
    let (ingress, egress) = wire.split();

    thread::Builder::new()
        .name("lan-recv".into())
        .spawn(move || receiver_loop(reader, ingress))?;
    thread::Builder::new()
        .name("lan-send".into())
        .spawn(move || sender_loop(egress, stream))?;

    Ok(device)
}

/// Tunnel read loop: one fixed-size frame per ingress slot.
fn receiver_loop(mut stream: UnixStream, mut ingress: RingSender) {
    let mut frame = [0u8; ATHERNET_MTU];
    loop {
        if let Err(err) = stream.read_exact(&mut frame) {
            fatal(&format!("athernet tunnel read failed: {err}"));
        }

        let mut slot = ingress.try_send();
        if slot.is_empty() {
            warn!("package loss");
            continue;
        }
        slot.copy_from_slice(&frame[1..]);
    }
}

/// Tunnel write loop: one egress slot per fixed-size frame.
fn sender_loop(mut egress: RingReceiver, mut stream: UnixStream) {
    let mut frame = [0u8; ATHERNET_MTU];
    loop {
        {
            let slot = egress.recv();
            frame[0] = 0;
            frame[1..].copy_from_slice(&slot);
        }

        if let Err(err) = stream.write_all(&frame) {
            fatal(&format!("athernet tunnel write failed: {err}"));
        }
    }
}
