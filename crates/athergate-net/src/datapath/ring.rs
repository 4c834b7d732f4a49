//! Lock-free SPSC ring of fixed-size packet slots.
//!
//! Unlike a value queue, this ring never moves packet bytes: the producer
//! borrows a slot in place, writes a datagram into it, and publishes it to
//! the consumer by advancing the tail index on guard drop. The consumer
//! symmetrically borrows the slot at the head index and releases it on drop.
//! The only cross-thread hand-off is the index publication; slot contents
//! become visible through the release store / acquire load pairing on the
//! indices.
//!
//! The ring is split at construction into a [`RingSender`] and a
//! [`RingReceiver`], statically pinning one producer thread and one
//! consumer thread. `try_send`/`try_recv` are wait-free; `send`/`recv`
//! block on a condition variable when the ring is full/empty.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use super::{next_power_of_two, CachePadded};

/// Shared ring state. Slot access is governed by the head/tail protocol:
/// the producer has exclusive access to slots in `[tail, head + capacity)`,
/// the consumer to slots in `[head, tail)`.
struct RingShared {
    /// Contiguous slot storage, `capacity * slot_size` bytes.
    buffer: Box<[UnsafeCell<u8>]>,
    /// Size of one slot in bytes (the device MTU).
    slot_size: usize,
    /// Capacity in slots (always a power of 2).
    capacity: usize,
    /// Index mask for fast modulo.
    mask: usize,
    /// Consumer index (next slot to read). Monotonic, wrapping.
    head: CachePadded<AtomicUsize>,
    /// Producer index (next slot to write). Monotonic, wrapping.
    tail: CachePadded<AtomicUsize>,
    /// Pairing for the blocking `send`/`recv` variants.
    lock: Mutex<()>,
    cond: Condvar,
}

// Safety: slot bytes are only reached through the index protocol above;
// the atomics provide the required ordering.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    /// Returns the slot at `index` as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of the slot per the
    /// head/tail protocol.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot(&self, index: usize) -> &mut [u8] {
        let offset = (index & self.mask) * self.slot_size;
        // Safety: offset is in bounds by construction; exclusivity is the
        // caller's obligation.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.buffer.as_ptr().add(offset).cast::<u8>().cast_mut(),
                self.slot_size,
            )
        }
    }

    /// Publishes an index advance and wakes any blocked peer.
    fn publish(&self, counter: &AtomicUsize, next: usize) {
        counter.store(next, Ordering::Release);
        // Taking the lock orders the store against a peer that checked the
        // indices and is about to wait.
        drop(self.lock.lock().unwrap());
        self.cond.notify_all();
    }
}

/// Fixed-capacity SPSC packet ring.
///
/// Constructed via [`PacketRing::with_capacity`], which returns the two
/// halves directly; the ring itself is never handed out whole.
pub struct PacketRing;

impl PacketRing {
    /// Creates a ring of `capacity` slots of `slot_size` bytes each and
    /// splits it into its producer and consumer halves.
    ///
    /// The capacity is rounded up to the next power of 2.
    ///
    /// # Panics
    ///
    /// Panics if `slot_size` or `capacity` is 0.
    #[must_use]
    pub fn with_capacity(slot_size: usize, capacity: usize) -> (RingSender, RingReceiver) {
        assert!(slot_size > 0, "slot size must be > 0");
        assert!(capacity > 0, "capacity must be > 0");

        let capacity = next_power_of_two(capacity);
        let buffer: Vec<UnsafeCell<u8>> = (0..capacity * slot_size)
            .map(|_| UnsafeCell::new(0))
            .collect();

        let shared = Arc::new(RingShared {
            buffer: buffer.into_boxed_slice(),
            slot_size,
            capacity,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        });

        (
            RingSender {
                shared: Arc::clone(&shared),
            },
            RingReceiver { shared },
        )
    }
}

/// Producer half of a packet ring. Owned by exactly one thread.
pub struct RingSender {
    shared: Arc<RingShared>,
}

impl RingSender {
    /// Returns the slot size in bytes.
    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    /// Acquires a writable slot without blocking.
    ///
    /// Returns an empty guard if the ring is full; dropping an empty guard
    /// leaves the ring unchanged. Dropping a non-empty guard publishes the
    /// slot to the consumer.
    pub fn try_send(&mut self) -> SendSlot<'_> {
        let tail = self.shared.tail.0.load(Ordering::Relaxed);
        let head = self.shared.head.0.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.shared.capacity {
            return SendSlot {
                shared: &self.shared,
                index: tail,
                empty: true,
            };
        }

        SendSlot {
            shared: &self.shared,
            index: tail,
            empty: false,
        }
    }

    /// Acquires a writable slot, blocking until one is free.
    ///
    /// The returned guard is never empty. Spurious wakeups are tolerated.
    pub fn send(&mut self) -> SendSlot<'_> {
        let tail = self.shared.tail.0.load(Ordering::Relaxed);

        if tail.wrapping_sub(self.shared.head.0.load(Ordering::Acquire)) >= self.shared.capacity {
            let mut guard = self.shared.lock.lock().unwrap();
            loop {
                let head = self.shared.head.0.load(Ordering::Acquire);
                if tail.wrapping_sub(head) < self.shared.capacity {
                    break;
                }
                guard = self.shared.cond.wait(guard).unwrap();
            }
        }

        SendSlot {
            shared: &self.shared,
            index: tail,
            empty: false,
        }
    }
}

// Safety: the half is moved to its producer thread; shared state is Sync.
unsafe impl Send for RingSender {}

/// Consumer half of a packet ring. Owned by exactly one thread.
pub struct RingReceiver {
    shared: Arc<RingShared>,
}

impl RingReceiver {
    /// Returns the slot size in bytes.
    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    /// Acquires the next published slot without blocking.
    ///
    /// Returns an empty guard if the ring is empty. Dropping a non-empty
    /// guard releases the slot back to the producer.
    pub fn try_recv(&mut self) -> RecvSlot<'_> {
        let head = self.shared.head.0.load(Ordering::Relaxed);
        let tail = self.shared.tail.0.load(Ordering::Acquire);

        if head == tail {
            return RecvSlot {
                shared: &self.shared,
                index: head,
                empty: true,
            };
        }

        RecvSlot {
            shared: &self.shared,
            index: head,
            empty: false,
        }
    }

    /// Acquires the next published slot, blocking until one is available.
    ///
    /// The returned guard is never empty. Spurious wakeups are tolerated.
    pub fn recv(&mut self) -> RecvSlot<'_> {
        let head = self.shared.head.0.load(Ordering::Relaxed);

        if head == self.shared.tail.0.load(Ordering::Acquire) {
            let mut guard = self.shared.lock.lock().unwrap();
            loop {
                let tail = self.shared.tail.0.load(Ordering::Acquire);
                if head != tail {
                    break;
                }
                guard = self.shared.cond.wait(guard).unwrap();
            }
        }

        RecvSlot {
            shared: &self.shared,
            index: head,
            empty: false,
        }
    }
}

// Safety: the half is moved to its consumer thread; shared state is Sync.
unsafe impl Send for RingReceiver {}

/// Scoped guard over a producer-owned slot.
///
/// Dereferences to the slot bytes (the full slot, `slot_size` long). An
/// empty guard dereferences to an empty slice. Dropping a non-empty guard
/// publishes the slot; the publication runs on every exit path, including
/// unwinding.
pub struct SendSlot<'a> {
    shared: &'a RingShared,
    index: usize,
    empty: bool,
}

impl SendSlot<'_> {
    /// Returns true if the ring was full and no slot was acquired.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.empty
    }
}

impl std::ops::Deref for SendSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.empty {
            &[]
        } else {
            // Safety: a non-empty guard owns the slot at `index`.
            unsafe { self.shared.slot(self.index) }
        }
    }
}

impl std::ops::DerefMut for SendSlot<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        if self.empty {
            &mut []
        } else {
            // Safety: a non-empty guard owns the slot at `index`.
            unsafe { self.shared.slot(self.index) }
        }
    }
}

impl Drop for SendSlot<'_> {
    fn drop(&mut self) {
        if !self.empty {
            self.shared
                .publish(&self.shared.tail.0, self.index.wrapping_add(1));
        }
    }
}

/// Scoped guard over a consumer-owned slot.
///
/// Mutable access is deliberate: the forwarding engine rewrites headers in
/// the receive slot before copying the datagram out. Dropping a non-empty
/// guard releases the slot back to the producer side.
pub struct RecvSlot<'a> {
    shared: &'a RingShared,
    index: usize,
    empty: bool,
}

impl RecvSlot<'_> {
    /// Returns true if the ring was empty and no slot was acquired.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.empty
    }
}

impl std::ops::Deref for RecvSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.empty {
            &[]
        } else {
            // Safety: a non-empty guard owns the slot at `index`.
            unsafe { self.shared.slot(self.index) }
        }
    }
}

impl std::ops::DerefMut for RecvSlot<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        if self.empty {
            &mut []
        } else {
            // Safety: a non-empty guard owns the slot at `index`.
            unsafe { self.shared.slot(self.index) }
        }
    }
}

impl Drop for RecvSlot<'_> {
    fn drop(&mut self) {
        if !self.empty {
            self.shared
                .publish(&self.shared.head.0, self.index.wrapping_add(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_try_send_try_recv_roundtrip() {
        let (mut tx, mut rx) = PacketRing::with_capacity(16, 4);

        {
            let mut slot = tx.try_send();
            assert!(!slot.is_empty());
            slot[0] = 0xAB;
            slot[15] = 0xCD;
        }

        let slot = rx.try_recv();
        assert!(!slot.is_empty());
        assert_eq!(slot[0], 0xAB);
        assert_eq!(slot[15], 0xCD);
    }

    #[test]
    fn test_empty_ring_recv() {
        let (_tx, mut rx) = PacketRing::with_capacity(16, 4);
        assert!(rx.try_recv().is_empty());
    }

    #[test]
    fn test_full_ring_send() {
        let (mut tx, mut rx) = PacketRing::with_capacity(16, 4);

        for i in 0..4 {
            let mut slot = tx.try_send();
            assert!(!slot.is_empty());
            slot[0] = i;
        }

        // Fifth enqueue must report full.
        assert!(tx.try_send().is_empty());

        // Draining one slot frees one.
        assert_eq!(rx.try_recv()[0], 0);
        assert!(!tx.try_send().is_empty());
    }

    #[test]
    fn test_empty_send_guard_leaves_ring_unchanged() {
        let (mut tx, mut rx) = PacketRing::with_capacity(16, 2);

        drop(tx.try_send()); // published: slot 0
        drop(tx.try_send()); // published: slot 1
        drop(tx.try_send()); // full -> empty guard, must not publish

        drop(rx.try_recv());
        drop(rx.try_recv());
        assert!(rx.try_recv().is_empty());
    }

    #[test]
    fn test_fifo_order_across_wrap() {
        let (mut tx, mut rx) = PacketRing::with_capacity(16, 4);

        for round in 0..10u8 {
            for i in 0..4u8 {
                tx.try_send()[0] = round * 4 + i;
            }
            for i in 0..4u8 {
                assert_eq!(rx.try_recv()[0], round * 4 + i);
            }
        }
    }

    #[test]
    fn test_blocking_fifo_threaded() {
        let (mut tx, mut rx) = PacketRing::with_capacity(8, 8);
        let count = 10_000u32;

        let producer = thread::spawn(move || {
            for i in 0..count {
                let mut slot = tx.send();
                slot[..4].copy_from_slice(&i.to_be_bytes());
            }
        });

        let consumer = thread::spawn(move || {
            for i in 0..count {
                let slot = rx.recv();
                let got = u32::from_be_bytes(slot[..4].try_into().unwrap());
                assert_eq!(got, i, "out of order at {i}");
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }

    #[test]
    fn test_mixed_send_try_send_preserves_order() {
        let (mut tx, mut rx) = PacketRing::with_capacity(4, 16);

        for i in 0..8u8 {
            if i % 2 == 0 {
                tx.send()[0] = i;
            } else {
                let mut slot = tx.try_send();
                assert!(!slot.is_empty());
                slot[0] = i;
            }
        }
        for i in 0..8u8 {
            assert_eq!(rx.recv()[0], i);
        }
    }
}
