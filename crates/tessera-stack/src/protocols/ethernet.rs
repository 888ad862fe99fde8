//! Ethernet II framing

use super::Link;
use crate::multiplexer::Multiplexer;
use crate::protocol::{PacketDecoder, Protocol, ProtocolCounters};
use std::sync::Weak;
use tessera_common::{AtomicCounter, CounterMap, Packet, ETHERTYPE_IP};

/// Destination, source and ethertype
pub const ETHER_HEADER_SIZE: usize = 14;

/// Ethernet decoder; routes on the ethertype
pub struct EthernetProtocol {
    name: &'static str,
    mux: Link<Multiplexer>,
    counters: ProtocolCounters,
    ip_packets: AtomicCounter,
    other_packets: AtomicCounter,
}

impl EthernetProtocol {
    /// Create a decoder
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            mux: Link::default(),
            counters: ProtocolCounters::default(),
            ip_packets: AtomicCounter::new(0),
            other_packets: AtomicCounter::new(0),
        }
    }
}

impl Protocol for EthernetProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    fn short_name(&self) -> &'static str {
        "ethernet"
    }

    fn header_size(&self) -> usize {
        ETHER_HEADER_SIZE
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("ip packets", self.ip_packets.get())
            .with("other packets", self.other_packets.get())
    }

    fn set_multiplexer(&self, mux: Weak<Multiplexer>) {
        self.mux.set(mux);
    }
}

impl PacketDecoder for EthernetProtocol {
    fn check_packet(&self, packet: &Packet) -> bool {
        self.counters.verdict(packet.len() >= ETHER_HEADER_SIZE)
    }

    fn process_packet(&self, packet: &mut Packet) {
        self.counters.record(packet.len());
        let Some(ethertype) = packet.read_u16(12) else {
            return;
        };
        if ethertype == ETHERTYPE_IP {
            self.ip_packets.inc();
        } else {
            self.other_packets.inc();
        }
        if let Some(mux) = self.mux.get() {
            mux.set_next_protocol_identifier(u32::from(ethertype));
        }
    }
}
