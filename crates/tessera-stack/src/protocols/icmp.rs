//! ICMP

use crate::protocol::{PacketDecoder, Protocol, ProtocolCounters};
use tessera_common::{AtomicCounter, CounterMap, Packet};

/// Type, code, checksum and rest of header
pub const ICMP_HEADER_SIZE: usize = 8;

/// ICMP decoder; end of the packet-scoped chain
pub struct IcmpProtocol {
    name: &'static str,
    counters: ProtocolCounters,
    echo_requests: AtomicCounter,
    echo_replies: AtomicCounter,
    unreachables: AtomicCounter,
    others: AtomicCounter,
}

impl IcmpProtocol {
    /// Create a decoder
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            counters: ProtocolCounters::default(),
            echo_requests: AtomicCounter::new(0),
            echo_replies: AtomicCounter::new(0),
            unreachables: AtomicCounter::new(0),
            others: AtomicCounter::new(0),
        }
    }
}

impl Protocol for IcmpProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    fn short_name(&self) -> &'static str {
        "icmp"
    }

    fn header_size(&self) -> usize {
        ICMP_HEADER_SIZE
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("echo requests", self.echo_requests.get())
            .with("echo replies", self.echo_replies.get())
            .with("destination unreachables", self.unreachables.get())
            .with("other messages", self.others.get())
    }
}

impl PacketDecoder for IcmpProtocol {
    fn check_packet(&self, packet: &Packet) -> bool {
        self.counters.verdict(packet.len() >= ICMP_HEADER_SIZE)
    }

    fn process_packet(&self, packet: &mut Packet) {
        self.counters.record(packet.len());
        match packet.payload().first() {
            Some(8) => self.echo_requests.inc(),
            Some(0) => self.echo_replies.inc(),
            Some(3) => self.unreachables.inc(),
            _ => self.others.inc(),
        };
    }
}
