//! # athergate-net
//!
//! User-space IPv4 NAT datapath for the athergate gateway.
//!
//! The gateway bridges two packet devices (an Athernet LAN link emulated
//! over a Unix-domain socket, and a real WAN NIC reached via packet
//! capture / raw injection), rewriting ICMP echo identifiers and UDP
//! ports so that LAN hosts share the gateway's WAN address.
//!
//! Module map:
//!
//! - [`datapath`]: lock-free SPSC packet rings with borrowed slot guards
//! - [`wire`]: header overlays, packet splitting, Internet checksums
//! - [`device`]: ring-fronted packet devices (NIC, Athernet tunnel)
//! - [`nat`]: the translation table and the two forwarding threads
//!
//! The forwarding hot path never returns errors and, apart from
//! first-sight mapping installs, never allocates: packets are forwarded,
//! dropped, or, for unrecoverable facility failures, the process exits.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod datapath;
pub mod device;
pub mod error;
pub mod nat;
pub mod wire;

pub use device::Device;
pub use error::{NetError, Result};
pub use nat::NatServer;
