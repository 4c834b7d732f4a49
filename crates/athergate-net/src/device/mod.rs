//! Packet devices.
//!
//! A device is the forwarding engine's view of one side of the gateway: a
//! pair of SPSC packet rings (ingress toward the engine, egress toward the
//! wire) plus the MTU, with background I/O threads bridging the rings to
//! the actual transport. The engine only ever touches ring slots; it never
//! sees transport errors.
//!
//! Backends: [`raw_socket`] (real NIC via packet capture / raw IPv4
//! injection) and [`athernet`] (Athernet tunnel over a Unix stream
//! socket). Both are built on [`Device::pair`], which exposes the
//! wire-facing [`WireEnd`] the I/O threads drive; tests drive a `WireEnd`
//! directly to emulate a wire.

pub mod athernet;
pub mod raw_socket;

use crate::datapath::{PacketRing, RecvSlot, RingReceiver, RingSender, SendSlot};

/// The engine-facing side of a device.
pub struct Device {
    mtu: usize,
    /// Egress ring, producer half: the engine writes datagrams here.
    tx: RingSender,
    /// Ingress ring, consumer half: the engine reads datagrams here.
    rx: RingReceiver,
}

impl Device {
    /// Creates a device backed by a fresh ring pair and returns it with
    /// the wire-facing end.
    ///
    /// Slots are `mtu` bytes; each ring holds `capacity` slots.
    #[must_use]
    pub fn pair(mtu: usize, capacity: usize) -> (Device, WireEnd) {
        let (ingress_tx, ingress_rx) = PacketRing::with_capacity(mtu, capacity);
        let (egress_tx, egress_rx) = PacketRing::with_capacity(mtu, capacity);

        (
            Device {
                mtu,
                tx: egress_tx,
                rx: ingress_rx,
            },
            WireEnd {
                mtu,
                tx: ingress_tx,
                rx: egress_rx,
            },
        )
    }

    /// Returns the maximum datagram size in bytes.
    #[inline]
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Acquires an egress slot, blocking until one is free.
    pub fn send(&mut self) -> SendSlot<'_> {
        self.tx.send()
    }

    /// Acquires an egress slot without blocking; empty when the ring is full.
    pub fn try_send(&mut self) -> SendSlot<'_> {
        self.tx.try_send()
    }

    /// Acquires the next ingress datagram, blocking until one arrives.
    pub fn recv(&mut self) -> RecvSlot<'_> {
        self.rx.recv()
    }

    /// Acquires the next ingress datagram without blocking; empty when none.
    pub fn try_recv(&mut self) -> RecvSlot<'_> {
        self.rx.try_recv()
    }

    /// Splits the device into its send and receive halves so the two
    /// forwarding threads can each own their side.
    #[must_use]
    pub fn split(self) -> (DeviceTx, DeviceRx) {
        (
            DeviceTx {
                mtu: self.mtu,
                tx: self.tx,
            },
            DeviceRx {
                mtu: self.mtu,
                rx: self.rx,
            },
        )
    }
}

/// Egress half of a device: the engine publishes datagrams through this.
pub struct DeviceTx {
    mtu: usize,
    tx: RingSender,
}

impl DeviceTx {
    /// Returns the maximum datagram size in bytes.
    #[inline]
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Acquires an egress slot, blocking until one is free.
    pub fn send(&mut self) -> SendSlot<'_> {
        self.tx.send()
    }

    /// Acquires an egress slot without blocking; empty when the ring is full.
    pub fn try_send(&mut self) -> SendSlot<'_> {
        self.tx.try_send()
    }
}

/// Ingress half of a device: the engine consumes datagrams through this.
pub struct DeviceRx {
    mtu: usize,
    rx: RingReceiver,
}

impl DeviceRx {
    /// Returns the maximum datagram size in bytes.
    #[inline]
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Acquires the next ingress datagram, blocking until one arrives.
    pub fn recv(&mut self) -> RecvSlot<'_> {
        self.rx.recv()
    }

    /// Acquires the next ingress datagram without blocking; empty when none.
    pub fn try_recv(&mut self) -> RecvSlot<'_> {
        self.rx.try_recv()
    }
}

/// The wire-facing side of a device: what the background I/O threads (or a
/// test emulating a wire) drive.
///
/// `send` feeds received datagrams into the device's ingress ring;
/// `recv` drains datagrams the engine queued for transmission.
pub struct WireEnd {
    mtu: usize,
    /// Ingress ring, producer half.
    tx: RingSender,
    /// Egress ring, consumer half.
    rx: RingReceiver,
}

impl WireEnd {
    /// Returns the maximum datagram size in bytes.
    #[inline]
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Acquires an ingress slot, blocking until one is free.
    pub fn send(&mut self) -> SendSlot<'_> {
        self.tx.send()
    }

    /// Acquires an ingress slot without blocking; empty when the ring is full.
    pub fn try_send(&mut self) -> SendSlot<'_> {
        self.tx.try_send()
    }

    /// Acquires the next egress datagram, blocking until one is queued.
    pub fn recv(&mut self) -> RecvSlot<'_> {
        self.rx.recv()
    }

    /// Acquires the next egress datagram without blocking; empty when none.
    pub fn try_recv(&mut self) -> RecvSlot<'_> {
        self.rx.try_recv()
    }

    /// Splits the wire end for backends that run separate receiver and
    /// sender I/O threads.
    #[must_use]
    pub fn split(self) -> (RingSender, RingReceiver) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_pair_plumbs_both_rings() {
        let (mut device, mut wire) = Device::pair(32, 4);
        assert_eq!(device.mtu(), 32);
        assert_eq!(wire.mtu(), 32);

        // Wire -> ingress -> engine.
        wire.try_send()[0] = 0x11;
        assert_eq!(device.try_recv()[0], 0x11);

        // Engine -> egress -> wire.
        device.try_send()[0] = 0x22;
        assert_eq!(wire.try_recv()[0], 0x22);
    }

    #[test]
    fn test_split_halves_keep_mtu() {
        let (device, _wire) = Device::pair(64, 4);
        let (tx, rx) = device.split();
        assert_eq!(tx.mtu(), 64);
        assert_eq!(rx.mtu(), 64);
    }
}
