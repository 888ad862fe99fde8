//! UDP

use super::transport::{FlowLayer, TransportDecoder};
use super::AnomalySink;
use crate::anomaly::{AnomalyKind, AnomalyManager};
use crate::forwarder::FlowForwarder;
use crate::protocol::{PacketDecoder, Protocol, ProtocolCounters};
use std::sync::{Arc, Weak};
use tessera_common::{CounterMap, FlowKey, Packet, IPPROTO_UDP};

/// Ports, length and checksum
pub const UDP_HEADER_SIZE: usize = 8;

/// UDP decoder
pub struct UdpProtocol {
    name: &'static str,
    flows: FlowLayer,
    anomalies: AnomalySink,
    counters: ProtocolCounters,
}

impl UdpProtocol {
    /// Create a decoder
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            flows: FlowLayer::default(),
            anomalies: AnomalySink::default(),
            counters: ProtocolCounters::default(),
        }
    }
}

impl Protocol for UdpProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    fn short_name(&self) -> &'static str {
        "udp"
    }

    fn header_size(&self) -> usize {
        UDP_HEADER_SIZE
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("dropped packets", self.flows.total_dropped())
    }

    fn set_flow_forwarder(&self, ff: Weak<FlowForwarder>) {
        self.flows.set_flow_forwarder(ff);
    }

    fn set_anomaly_manager(&self, anomalies: Arc<AnomalyManager>) {
        self.anomalies.set(anomalies);
    }
}

impl TransportDecoder for UdpProtocol {
    fn flow_layer(&self) -> &FlowLayer {
        &self.flows
    }
}

impl PacketDecoder for UdpProtocol {
    fn check_packet(&self, packet: &Packet) -> bool {
        self.counters.verdict(packet.len() >= UDP_HEADER_SIZE)
    }

    fn process_packet(&self, packet: &mut Packet) {
        self.counters.record(packet.len());
        let (Some(src_port), Some(dst_port), Some(length)) =
            (packet.read_u16(0), packet.read_u16(2), packet.read_u16(4))
        else {
            return;
        };
        let length = usize::from(length);
        if length < UDP_HEADER_SIZE {
            self.anomalies.report(AnomalyKind::UdpBogusHeader);
            return;
        }
        packet.set_ports(src_port, dst_port);

        let (Some(src), Some(dst)) = (packet.src_addr(), packet.dst_addr()) else {
            return;
        };
        let Some(key) = FlowKey::from_addrs(src, dst, src_port, dst_port, IPPROTO_UDP) else {
            return;
        };
        let Some((flow, direction, created)) = self.flows.attach(key, packet.timestamp()) else {
            return;
        };

        {
            let mut f = flow.lock();
            f.update(direction, packet.len(), packet.timestamp());
            if created {
                self.flows.on_new_flow(&mut f, packet);
            }
            if length > packet.len() {
                self.anomalies.report_flow(AnomalyKind::UdpBogusHeader, &mut f);
            }
            let end = length.min(packet.len());
            if let Some(payload) = packet.slice(UDP_HEADER_SIZE, end).filter(|p| !p.is_empty()) {
                f.set_packet(payload);
                self.flows.forward(&mut f);
                f.take_packet();
            }
            if f.have_evidence() {
                packet.set_evidence(true);
            }
        }
        self.flows.set_current(&flow);
    }
}
