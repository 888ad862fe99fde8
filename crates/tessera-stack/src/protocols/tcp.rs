//! TCP
//!
//! Attaches segments to flows, keeps a small per-flow state machine and
//! closes flows explicitly on RST or on FIN seen in both directions.

use super::transport::{FlowLayer, TransportDecoder};
use super::AnomalySink;
use crate::anomaly::{AnomalyKind, AnomalyManager};
use crate::cache::Cache;
use crate::flow::Flow;
use crate::forwarder::FlowForwarder;
use crate::protocol::{PacketDecoder, Protocol, ProtocolCounters};
use bitflags::bitflags;
use std::mem;
use std::sync::{Arc, Weak};
use tessera_common::{AtomicCounter, CounterMap, FlowDirection, FlowKey, Packet, IPPROTO_TCP};

/// Header without options
pub const TCP_HEADER_SIZE: usize = 20;

bitflags! {
    /// TCP control bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        /// No more data from sender
        const FIN = 0x01;
        /// Synchronize sequence numbers
        const SYN = 0x02;
        /// Reset the connection
        const RST = 0x04;
        /// Push function
        const PSH = 0x08;
        /// Acknowledgment field significant
        const ACK = 0x10;
        /// Urgent pointer field significant
        const URG = 0x20;
    }
}

impl TcpFlags {
    /// Combinations no conforming stack sends
    pub fn is_bogus(&self) -> bool {
        self.is_empty()
            || self.contains(Self::SYN | Self::FIN)
            || self.contains(Self::SYN | Self::RST)
    }
}

/// Connection state as seen from the middle of the path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    /// Nothing seen yet
    #[default]
    None,
    /// SYN seen
    SynSent,
    /// SYN+ACK seen
    SynReceived,
    /// Handshake completed
    Established,
    /// FIN seen in one direction
    Closing,
    /// RST, or FIN in both directions
    Closed,
}

/// Per-flow TCP state
#[derive(Debug, Clone, Default)]
pub struct TcpInfo {
    /// Connection state
    pub state: TcpState,
    /// SYN segments
    pub syn: u32,
    /// SYN+ACK segments
    pub syn_ack: u32,
    /// ACK segments
    pub ack: u32,
    /// FIN segments
    pub fin: u32,
    /// RST segments
    pub rst: u32,
    /// PSH segments
    pub push: u32,
    fin_upstream: bool,
    fin_downstream: bool,
}

impl TcpInfo {
    /// Account one segment
    pub fn update(&mut self, flags: TcpFlags, direction: FlowDirection) {
        if flags.contains(TcpFlags::SYN | TcpFlags::ACK) {
            self.syn_ack += 1;
            self.state = TcpState::SynReceived;
        } else if flags.contains(TcpFlags::SYN) {
            self.syn += 1;
            self.state = TcpState::SynSent;
        } else if flags.contains(TcpFlags::ACK) && self.state == TcpState::SynReceived {
            self.state = TcpState::Established;
        }
        if flags.contains(TcpFlags::ACK) {
            self.ack += 1;
        }
        if flags.contains(TcpFlags::PSH) {
            self.push += 1;
        }
        if flags.contains(TcpFlags::FIN) {
            self.fin += 1;
            match direction {
                FlowDirection::Upstream => self.fin_upstream = true,
                FlowDirection::Downstream => self.fin_downstream = true,
            }
            self.state = TcpState::Closing;
        }
        if self.fin_upstream && self.fin_downstream {
            self.state = TcpState::Closed;
        }
        if flags.contains(TcpFlags::RST) {
            self.rst += 1;
            self.state = TcpState::Closed;
        }
    }

    /// Whether the flow can be released
    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }
}

/// TCP decoder
pub struct TcpProtocol {
    name: &'static str,
    flows: FlowLayer,
    infos: Cache<Box<TcpInfo>>,
    anomalies: AnomalySink,
    counters: ProtocolCounters,
    syn_packets: AtomicCounter,
    rst_packets: AtomicCounter,
    fin_packets: AtomicCounter,
    closed_flows: AtomicCounter,
}

impl TcpProtocol {
    /// Create a decoder
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            flows: FlowLayer::default(),
            infos: Cache::new("tcp infos"),
            anomalies: AnomalySink::default(),
            counters: ProtocolCounters::default(),
            syn_packets: AtomicCounter::new(0),
            rst_packets: AtomicCounter::new(0),
            fin_packets: AtomicCounter::new(0),
            closed_flows: AtomicCounter::new(0),
        }
    }

    /// Free per-flow TCP records
    pub fn total_free_infos(&self) -> usize {
        self.infos.free_count()
    }

    /// Per-flow TCP records owned, free or attached
    pub fn total_infos(&self) -> usize {
        self.infos.allocated()
    }

    fn track(&self, flow: &mut Flow, flags: TcpFlags) -> bool {
        if flow.l4_info::<TcpInfo>().is_none() {
            if let Some(info) = self.infos.acquire() {
                flow.set_l4_info(info);
            }
        }
        let direction = flow.direction();
        match flow.l4_info_mut::<TcpInfo>() {
            Some(info) => {
                info.update(flags, direction);
                info.is_closed()
            }
            None => flags.contains(TcpFlags::RST),
        }
    }
}

impl Protocol for TcpProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    fn short_name(&self) -> &'static str {
        "tcp"
    }

    fn header_size(&self) -> usize {
        TCP_HEADER_SIZE
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("syn packets", self.syn_packets.get())
            .with("fin packets", self.fin_packets.get())
            .with("rst packets", self.rst_packets.get())
            .with("closed flows", self.closed_flows.get())
            .with("dropped packets", self.flows.total_dropped())
    }

    fn set_flow_forwarder(&self, ff: Weak<FlowForwarder>) {
        self.flows.set_flow_forwarder(ff);
    }

    fn set_anomaly_manager(&self, anomalies: Arc<AnomalyManager>) {
        self.anomalies.set(anomalies);
    }

    fn release_flow_info(&self, flow: &mut Flow) {
        if let Some(info) = flow.take_l4_info() {
            if let Ok(mut info) = info.downcast::<TcpInfo>() {
                *info = TcpInfo::default();
                self.infos.release(info);
            }
        }
    }

    fn allocated_memory(&self) -> usize {
        self.infos.allocated() * mem::size_of::<TcpInfo>()
    }

    fn increase_allocated_memory(&self, records: usize) {
        self.infos.create(records);
    }

    fn decrease_allocated_memory(&self, records: usize) {
        self.infos.destroy(records);
    }
}

impl TransportDecoder for TcpProtocol {
    fn flow_layer(&self) -> &FlowLayer {
        &self.flows
    }
}

impl PacketDecoder for TcpProtocol {
    fn check_packet(&self, packet: &Packet) -> bool {
        self.counters.verdict(packet.len() >= TCP_HEADER_SIZE)
    }

    fn process_packet(&self, packet: &mut Packet) {
        self.counters.record(packet.len());
        let data = packet.payload();
        if data.len() < TCP_HEADER_SIZE {
            return;
        }
        let header_len = usize::from(data[12] >> 4) * 4;
        if header_len < TCP_HEADER_SIZE || header_len > data.len() {
            self.anomalies.report(AnomalyKind::TcpBogusHeader);
            return;
        }
        let src_port = u16::from_be_bytes([data[0], data[1]]);
        let dst_port = u16::from_be_bytes([data[2], data[3]]);
        let flags = TcpFlags::from_bits_truncate(data[13]);
        packet.set_ports(src_port, dst_port);

        if flags.contains(TcpFlags::SYN) {
            self.syn_packets.inc();
        }
        if flags.contains(TcpFlags::FIN) {
            self.fin_packets.inc();
        }
        if flags.contains(TcpFlags::RST) {
            self.rst_packets.inc();
        }

        let (Some(src), Some(dst)) = (packet.src_addr(), packet.dst_addr()) else {
            return;
        };
        let Some(key) = FlowKey::from_addrs(src, dst, src_port, dst_port, IPPROTO_TCP) else {
            return;
        };
        let Some((flow, direction, created)) = self.flows.attach(key, packet.timestamp()) else {
            return;
        };

        let (closed, flow_key) = {
            let mut f = flow.lock();
            f.update(direction, packet.len(), packet.timestamp());
            if created {
                self.flows.on_new_flow(&mut f, packet);
            }
            if flags.is_bogus() {
                self.anomalies.report_flow(AnomalyKind::TcpBadFlags, &mut f);
            }
            let closed = self.track(&mut f, flags);

            if let Some(payload) = packet.child(header_len).filter(|p| !p.is_empty()) {
                f.set_packet(payload);
                self.flows.forward(&mut f);
                f.take_packet();
            }
            if f.have_evidence() {
                packet.set_evidence(true);
            }
            (closed, *f.key())
        };

        self.flows.set_current(&flow);
        if closed {
            self.closed_flows.inc();
            self.flows.close(&flow_key);
        }
    }
}
