//! Port translation tables.
//!
//! The table is a coupled pair: a forward array indexed by WAN port,
//! read concurrently by the WAN→LAN thread, and a reverse map keyed by
//! LAN endpoint, touched only by the LAN→WAN thread. Each forward cell is
//! a single `AtomicU64` packing `(lan_ip:32, lan_port:16, present:16)`,
//! one word, so a concurrent reader can never observe a torn entry. Ports
//! are handed out sequentially and never reclaimed; the table is
//! append-only for the life of the process.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;

/// First WAN port the gateway hands out.
pub const NAT_PORTS_BASE: u16 = 50000;

/// Number of forward-table cells.
pub const NAT_PORTS_SIZE: usize = 16384;

/// One past the last allocatable WAN port. The configured range is capped
/// at the top of the 16-bit port space.
const NAT_PORT_LIMIT: u32 = {
    let end = NAT_PORTS_BASE as u32 + NAT_PORTS_SIZE as u32;
    if end > 1 << 16 {
        1 << 16
    } else {
        end
    }
};

/// A LAN endpoint mapped behind one WAN port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatEntry {
    /// LAN host address.
    pub lan_ip: Ipv4Addr,
    /// LAN transport port (UDP source port or ICMP echo identifier).
    pub lan_port: u16,
}

impl NatEntry {
    /// Packs the entry into a forward-table cell with the present bit set.
    fn encode(self) -> u64 {
        (u64::from(u32::from(self.lan_ip)) << 32) | (u64::from(self.lan_port) << 16) | 1
    }

    /// Unpacks a forward-table cell; `None` if the cell is unused.
    fn decode(value: u64) -> Option<Self> {
        if value & 0xFFFF == 0 {
            return None;
        }
        Some(Self {
            lan_ip: Ipv4Addr::from((value >> 32) as u32),
            lan_port: (value >> 16) as u16,
        })
    }
}

/// WAN-port-indexed half of the table, shared with the WAN→LAN thread.
///
/// The LAN→WAN thread is the sole writer; publication uses a release
/// store so that a reader seeing the present bit also sees the endpoint.
pub struct ForwardTable {
    cells: Box<[AtomicU64]>,
}

impl ForwardTable {
    fn new() -> Self {
        let cells: Vec<AtomicU64> = (0..NAT_PORTS_SIZE).map(|_| AtomicU64::new(0)).collect();
        Self {
            cells: cells.into_boxed_slice(),
        }
    }

    /// Looks up the LAN endpoint behind `wan_port`.
    ///
    /// Returns `None` for ports outside the configured range and for
    /// cells no mapping was ever installed in.
    #[must_use]
    pub fn lookup(&self, wan_port: u16) -> Option<NatEntry> {
        let index = usize::from(wan_port.checked_sub(NAT_PORTS_BASE)?);
        if index >= NAT_PORTS_SIZE {
            return None;
        }
        NatEntry::decode(self.cells[index].load(Ordering::Acquire))
    }

    fn publish(&self, wan_port: u16, entry: NatEntry) {
        let index = usize::from(wan_port - NAT_PORTS_BASE);
        self.cells[index].store(entry.encode(), Ordering::Release);
    }
}

impl std::fmt::Debug for ForwardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardTable")
            .field("capacity", &NAT_PORTS_SIZE)
            .finish()
    }
}

/// The full translation table, owned by the LAN→WAN thread.
///
/// The reverse map and the next-free counter have a single owner and need
/// no synchronisation; only the forward half crosses threads.
pub struct NatTable {
    forward: Arc<ForwardTable>,
    reverse: HashMap<NatEntry, u16>,
    next_free: u32,
}

impl NatTable {
    /// Creates an empty table covering `[NAT_PORTS_BASE, NAT_PORT_LIMIT)`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            forward: Arc::new(ForwardTable::new()),
            reverse: HashMap::new(),
            next_free: u32::from(NAT_PORTS_BASE),
        }
    }

    /// Returns a handle to the forward half for the WAN→LAN thread.
    #[must_use]
    pub fn forward_handle(&self) -> Arc<ForwardTable> {
        Arc::clone(&self.forward)
    }

    /// Returns the WAN port mapped to `(lan_ip, lan_port)`, installing a
    /// new mapping on first sight.
    ///
    /// A fresh mapping is published to the forward table (release store)
    /// before it is recorded in the reverse map, and announced with one
    /// `port mapping add` line on standard output. Returns `None` when
    /// the port range is exhausted; ports are never reclaimed.
    pub fn wan_port_for(&mut self, lan_ip: Ipv4Addr, lan_port: u16) -> Option<u16> {
        let entry = NatEntry { lan_ip, lan_port };
        if let Some(&wan_port) = self.reverse.get(&entry) {
            return Some(wan_port);
        }

        if self.next_free >= NAT_PORT_LIMIT {
            return None;
        }
        let wan_port = self.next_free as u16;
        self.next_free += 1;

        self.forward.publish(wan_port, entry);
        self.reverse.insert(entry, wan_port);

        println!("port mapping add: {lan_ip}:{lan_port} <-> {wan_port}");

        Some(wan_port)
    }

    /// Returns the number of installed mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    /// Returns true if no mapping was installed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NatTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatTable")
            .field("mappings", &self.reverse.len())
            .field("next_free", &self.next_free)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lan(host: u8, port: u16) -> (Ipv4Addr, u16) {
        (Ipv4Addr::new(192, 168, 1, host), port)
    }

    #[test]
    fn test_sequential_allocation_from_base() {
        let mut table = NatTable::new();

        let (ip_a, port_a) = lan(5, 7000);
        let (ip_b, port_b) = lan(6, 7000);
        assert_eq!(table.wan_port_for(ip_a, port_a), Some(NAT_PORTS_BASE));
        assert_eq!(table.wan_port_for(ip_b, port_b), Some(NAT_PORTS_BASE + 1));
    }

    #[test]
    fn test_mapping_is_stable() {
        let mut table = NatTable::new();
        let (ip, port) = lan(5, 7000);

        let first = table.wan_port_for(ip, port).unwrap();
        for _ in 0..100 {
            assert_eq!(table.wan_port_for(ip, port), Some(first));
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_forward_and_reverse_agree() {
        let mut table = NatTable::new();
        let forward = table.forward_handle();

        let endpoints = [lan(5, 7000), lan(5, 7001), lan(9, 53), lan(20, 0x1234)];
        for (ip, port) in endpoints {
            let wan_port = table.wan_port_for(ip, port).unwrap();
            let entry = forward.lookup(wan_port).unwrap();
            assert_eq!(entry.lan_ip, ip);
            assert_eq!(entry.lan_port, port);
        }
    }

    #[test]
    fn test_distinct_endpoints_get_distinct_ports() {
        let mut table = NatTable::new();

        let mut ports = std::collections::HashSet::new();
        for host in 1..=50u8 {
            for port in [53u16, 7000, 7001] {
                let (ip, p) = (Ipv4Addr::new(192, 168, 1, host), port);
                assert!(ports.insert(table.wan_port_for(ip, p).unwrap()));
            }
        }
        assert_eq!(ports.len(), table.len());
    }

    #[test]
    fn test_cells_beyond_next_free_are_unused() {
        let mut table = NatTable::new();
        let forward = table.forward_handle();

        let (ip, port) = lan(5, 7000);
        let wan_port = table.wan_port_for(ip, port).unwrap();
        assert!(forward.lookup(wan_port + 1).is_none());
        assert!(forward.lookup(NAT_PORTS_BASE + 100).is_none());
    }

    #[test]
    fn test_lookup_out_of_range() {
        let table = NatTable::new();
        let forward = table.forward_handle();

        assert!(forward.lookup(49000).is_none());
        assert!(forward.lookup(0).is_none());
        assert!(forward.lookup(NAT_PORTS_BASE - 1).is_none());
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut table = NatTable::new();

        let capacity = (NAT_PORT_LIMIT - u32::from(NAT_PORTS_BASE)) as usize;
        for i in 0..capacity {
            let ip = Ipv4Addr::from(0xC0A8_0000 + i as u32);
            assert!(table.wan_port_for(ip, 7000).is_some(), "slot {i}");
        }

        assert_eq!(
            table.wan_port_for(Ipv4Addr::new(10, 99, 99, 99), 7000),
            None
        );
        // An existing mapping still resolves after exhaustion.
        assert_eq!(
            table.wan_port_for(Ipv4Addr::from(0xC0A8_0000u32), 7000),
            Some(NAT_PORTS_BASE)
        );
    }
}
