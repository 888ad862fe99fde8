//! Tessera Stack - composable deep packet inspection
//!
//! Protocol decoders are assembled into layered pipelines. Packet-scoped
//! layers are joined by [`Multiplexer`]s that route on the protocol
//! identifier each decoder extracts; flow-scoped layers are joined by
//! [`FlowForwarder`]s that offer each payload to an ordered list of
//! candidate decoders. Tunnel decoders re-inject decapsulated frames into a
//! second, independent pipeline.
//!
//! # Architecture
//!
//! ```text
//! physical:  ethernet ─▶ ip ─▶ udp ─▶ FlowForwarder(udp) ─▶ vxlan
//!                              │                             │
//!                        FlowManager ◀─ FlowCache            │
//!                                                            ▼
//! virtual:   ethernet ─▶ ip ─┬▶ tcp ─▶ [http, ssl, ..., tcpgeneric]
//!                            ├▶ udp ─▶ [dns, sip, ..., udpgeneric]
//!                            └▶ icmp
//! ```
//!
//! # Runtime model
//!
//! 1. **Run-to-completion**: one packet traverses the whole graph before
//!    the next one enters
//! 2. **Bounded memory**: flows come from pre-sized pools; an empty pool
//!    drops the packet instead of allocating
//! 3. **Lazy eviction**: idle flows are swept on packet arrival, driven by
//!    packet timestamps
//! 4. **Hot reconfiguration**: mode toggles only enable, disable or reorder
//!    forwarders; live flows are never dropped

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod anomaly;
pub mod cache;
pub mod config;
pub mod engines;
pub mod flow;
pub mod forwarder;
pub mod multiplexer;
pub mod protocol;
pub mod protocols;
pub mod stack;

#[cfg(test)]
mod testutil;

pub use anomaly::{AnomalyKind, AnomalyManager};
pub use cache::Cache;
pub use config::{CacheShares, StackConfig};
pub use engines::{AddressSet, AddressSetEngine, EngineMatch, RegexSignatures, SignatureEngine};
pub use flow::{Flow, FlowCache, FlowManager, SharedFlow};
pub use forwarder::FlowForwarder;
pub use multiplexer::Multiplexer;
pub use protocol::{FlowDecoder, PacketDecoder, Protocol};
pub use stack::{NetworkStack, StackModes, StackOpenFlow, StackVirtual};

pub use tessera_common::{DpiError, DpiResult, FlowDirection, FlowKey, Packet};
