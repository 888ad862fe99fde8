//! IPv4

use super::{AnomalySink, Link};
use crate::anomaly::{AnomalyKind, AnomalyManager};
use crate::multiplexer::Multiplexer;
use crate::protocol::{PacketDecoder, Protocol, ProtocolCounters};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tessera_common::{AtomicCounter, CounterMap, Packet, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};

/// Header without options
pub const IPV4_HEADER_SIZE: usize = 20;

const MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET: u16 = 0x1fff;

/// IPv4 decoder; routes on the protocol field
pub struct IpProtocol {
    name: &'static str,
    mux: Link<Multiplexer>,
    anomalies: AnomalySink,
    counters: ProtocolCounters,
    last_protocol: AtomicU8,
    tcp_packets: AtomicCounter,
    udp_packets: AtomicCounter,
    icmp_packets: AtomicCounter,
    other_packets: AtomicCounter,
    fragmented_packets: AtomicCounter,
}

impl IpProtocol {
    /// Create a decoder
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            mux: Link::default(),
            anomalies: AnomalySink::default(),
            counters: ProtocolCounters::default(),
            last_protocol: AtomicU8::new(0),
            tcp_packets: AtomicCounter::new(0),
            udp_packets: AtomicCounter::new(0),
            icmp_packets: AtomicCounter::new(0),
            other_packets: AtomicCounter::new(0),
            fragmented_packets: AtomicCounter::new(0),
        }
    }

    /// Protocol field of the last packet decoded
    pub fn last_protocol(&self) -> u8 {
        self.last_protocol.load(Ordering::Relaxed)
    }
}

impl Protocol for IpProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    fn short_name(&self) -> &'static str {
        "ip"
    }

    fn header_size(&self) -> usize {
        IPV4_HEADER_SIZE
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("tcp packets", self.tcp_packets.get())
            .with("udp packets", self.udp_packets.get())
            .with("icmp packets", self.icmp_packets.get())
            .with("other packets", self.other_packets.get())
            .with("fragmented packets", self.fragmented_packets.get())
    }

    fn set_multiplexer(&self, mux: Weak<Multiplexer>) {
        self.mux.set(mux);
    }

    fn set_anomaly_manager(&self, anomalies: Arc<AnomalyManager>) {
        self.anomalies.set(anomalies);
    }
}

impl PacketDecoder for IpProtocol {
    fn check_packet(&self, packet: &Packet) -> bool {
        let data = packet.payload();
        let valid = data.len() >= IPV4_HEADER_SIZE && data[0] >> 4 == 4 && {
            let ihl = usize::from(data[0] & 0x0f) * 4;
            ihl >= IPV4_HEADER_SIZE && ihl <= data.len()
        };
        if !valid && !data.is_empty() {
            self.anomalies.report(AnomalyKind::Ipv4BogusHeader);
        }
        self.counters.verdict(valid)
    }

    fn process_packet(&self, packet: &mut Packet) {
        self.counters.record(packet.len());
        let data = packet.payload();
        if data.len() < IPV4_HEADER_SIZE {
            return;
        }
        let ihl = usize::from(data[0] & 0x0f) * 4;
        let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
        let frag = u16::from_be_bytes([data[6], data[7]]);
        let protocol = data[9];
        let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

        // Link layer padding
        if total_len >= ihl && total_len < packet.len() {
            packet.truncate(total_len);
        }
        packet.set_addresses(IpAddr::V4(src), IpAddr::V4(dst), protocol);
        self.last_protocol.store(protocol, Ordering::Relaxed);

        match protocol {
            IPPROTO_TCP => self.tcp_packets.inc(),
            IPPROTO_UDP => self.udp_packets.inc(),
            IPPROTO_ICMP => self.icmp_packets.inc(),
            _ => self.other_packets.inc(),
        };

        if frag & (MORE_FRAGMENTS | FRAGMENT_OFFSET) != 0 {
            self.fragmented_packets.inc();
            self.anomalies.report(AnomalyKind::Ipv4Fragmentation);
            return;
        }

        if let Some(mux) = self.mux.get() {
            mux.set_header_size(ihl);
            mux.set_next_protocol_identifier(u32::from(protocol));
        }
    }
}
