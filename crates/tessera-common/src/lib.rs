//! Tessera Common - Shared types for the Tessera DPI engine
//!
//! This crate provides the leaf types every layer of the stack exchanges:
//! - Packet views over captured frames
//! - Bidirectional flow keys
//! - Counters and the uniform counter map
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flow;
pub mod metrics;
pub mod packet;

pub use error::*;
pub use flow::*;
pub use metrics::*;
pub use packet::*;

/// Ethertype for IPv4
pub const ETHERTYPE_IP: u16 = 0x0800;

/// IP protocol number for ICMP
pub const IPPROTO_ICMP: u8 = 1;

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;
