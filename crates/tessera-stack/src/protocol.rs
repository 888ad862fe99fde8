//! Decoder capability traits
//!
//! Every protocol module plugs into the stack through these traits. The
//! framework never looks inside a decoder: it invokes the checker and the
//! processor bound at assembly time and reads the aggregate counters.

use crate::anomaly::AnomalyManager;
use crate::flow::Flow;
use crate::forwarder::FlowForwarder;
use crate::multiplexer::Multiplexer;
use std::io::{self, Write};
use std::sync::{Arc, Weak};
use tessera_common::{AtomicCounter, CounterMap, Packet};

/// Capabilities shared by all decoders
pub trait Protocol: Send + Sync {
    /// Long name, e.g. "TCPProtocol"
    fn name(&self) -> &'static str;

    /// Short name used for flow filtering, e.g. "tcp"
    fn short_name(&self) -> &'static str;

    /// Minimum header size this decoder needs
    fn header_size(&self) -> usize;

    /// Aggregate counters
    fn counters(&self) -> CounterMap;

    /// Human readable statistics. Level 0 prints nothing.
    fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        render_statistics(out, self.name(), &self.counters(), level)
    }

    /// Back-reference to the multiplexer that owns this decoder's layer
    fn set_multiplexer(&self, _mux: Weak<Multiplexer>) {}

    /// Back-reference to the forwarder that dispatches this decoder's flows
    fn set_flow_forwarder(&self, _ff: Weak<FlowForwarder>) {}

    /// Shared sink for structural anomalies
    fn set_anomaly_manager(&self, _anomalies: Arc<AnomalyManager>) {}

    /// Whether the decoder is currently taking traffic
    fn is_active(&self) -> bool {
        true
    }

    /// Toggle the decoder
    fn set_active(&self, _active: bool) {}

    /// Return any per-flow state attached by this decoder to its cache
    fn release_flow_info(&self, _flow: &mut Flow) {}

    /// Bytes held by the decoder's per-flow record caches
    fn allocated_memory(&self) -> usize {
        0
    }

    /// Pre-allocate `records` additional per-flow records
    fn increase_allocated_memory(&self, _records: usize) {}

    /// Drop up to `records` free per-flow records
    fn decrease_allocated_memory(&self, _records: usize) {}
}

/// Packet-scoped decoder (one multiplexer layer)
pub trait PacketDecoder: Protocol {
    /// Cheap structural validation
    fn check_packet(&self, packet: &Packet) -> bool;

    /// Stateful decode; selects the next protocol on its multiplexer
    fn process_packet(&self, packet: &mut Packet);
}

/// Flow-scoped decoder (one flow forwarder entry)
pub trait FlowDecoder: Protocol {
    /// Cheap classification of the flow's current payload
    fn check_flow(&self, flow: &Flow) -> bool;

    /// Stateful decode of the flow's current payload
    fn process_flow(&self, flow: &mut Flow);
}

/// Counters every decoder keeps
#[derive(Debug, Default)]
pub struct ProtocolCounters {
    /// Packets processed
    pub packets: AtomicCounter,
    /// Bytes processed
    pub bytes: AtomicCounter,
    /// Packets accepted by the checker
    pub valid: AtomicCounter,
    /// Packets rejected by the checker
    pub invalid: AtomicCounter,
}

impl ProtocolCounters {
    /// Record one processed packet of `len` bytes
    #[inline(always)]
    pub fn record(&self, len: usize) {
        self.packets.inc();
        self.bytes.add(len as u64);
    }

    /// Record a checker verdict and pass it through
    #[inline(always)]
    pub fn verdict(&self, valid: bool) -> bool {
        if valid {
            self.valid.inc();
        } else {
            self.invalid.inc();
        }
        valid
    }

    /// Base counter map
    pub fn to_map(&self) -> CounterMap {
        CounterMap::new()
            .with("packets", self.packets.get())
            .with("bytes", self.bytes.get())
            .with("valid packets", self.valid.get())
            .with("invalid packets", self.invalid.get())
    }
}

/// Render a counter map in the stack's statistics layout
pub fn render_statistics(
    out: &mut dyn Write,
    name: &str,
    counters: &CounterMap,
    level: u8,
) -> io::Result<()> {
    if level == 0 {
        return Ok(());
    }
    writeln!(out, "{} statistics", name)?;
    for (key, value) in counters.iter() {
        let basic = matches!(key, "packets" | "bytes");
        if basic || level > 1 {
            writeln!(out, "\t{:<24}{:>12}", format!("Total {}:", key), value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_counts() {
        let c = ProtocolCounters::default();
        assert!(c.verdict(true));
        assert!(!c.verdict(false));
        assert!(!c.verdict(false));
        c.record(100);
        let map = c.to_map();
        assert_eq!(map.get("valid packets"), Some(1));
        assert_eq!(map.get("invalid packets"), Some(2));
        assert_eq!(map.get("bytes"), Some(100));
    }

    #[test]
    fn test_render_levels() {
        let map = CounterMap::new().with("packets", 3).with("valid packets", 2);

        let mut out = Vec::new();
        render_statistics(&mut out, "Test", &map, 0).unwrap();
        assert!(out.is_empty());

        render_statistics(&mut out, "Test", &map, 1).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.contains("Total packets:"));
        assert!(!text.contains("valid"));

        out.clear();
        render_statistics(&mut out, "Test", &map, 2).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Total valid packets:"));
    }
}
