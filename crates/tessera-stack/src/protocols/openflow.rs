//! OpenFlow tunnel decoder
//!
//! Claims TCP flows speaking OpenFlow 1.x. A segment may carry several
//! messages; PACKET_IN and PACKET_OUT messages carry a full Ethernet frame,
//! which is re-injected into the virtual pipeline through this decoder's
//! multiplexer.

use super::{AnomalySink, Link};
use crate::anomaly::{AnomalyKind, AnomalyManager};
use crate::flow::Flow;
use crate::multiplexer::Multiplexer;
use crate::protocol::{FlowDecoder, Protocol, ProtocolCounters};
use std::sync::{Arc, Weak};
use tessera_common::{AtomicCounter, CounterMap, Packet};

/// Version, type, length, xid
pub const OPENFLOW_HEADER_SIZE: usize = 8;

/// Well known controller port
pub const OPENFLOW_PORT: u16 = 6653;

/// Message types this decoder counts
pub mod msg_type {
    /// Session start
    pub const HELLO: u8 = 0;
    /// Liveness probe
    pub const ECHO_REQUEST: u8 = 2;
    /// Liveness answer
    pub const ECHO_REPLY: u8 = 3;
    /// Controller asks for switch features
    pub const FEATURES_REQUEST: u8 = 5;
    /// Switch features
    pub const FEATURES_REPLY: u8 = 6;
    /// Frame punted to the controller
    pub const PACKET_IN: u8 = 10;
    /// Frame injected by the controller
    pub const PACKET_OUT: u8 = 13;
    /// Flow table change
    pub const FLOW_MOD: u8 = 14;
}

/// buffer_id(4) total_len(2) in_port(2) reason(1) pad(1)
const PACKET_IN_FRAME_OFFSET: usize = 18;
/// buffer_id(4) in_port(2) actions_len(2)
const PACKET_OUT_ACTIONS_OFFSET: usize = 16;

/// OpenFlow decoder
pub struct OpenFlowProtocol {
    mux: Link<Multiplexer>,
    anomalies: AnomalySink,
    counters: ProtocolCounters,
    hellos: AtomicCounter,
    echos: AtomicCounter,
    features: AtomicCounter,
    packet_ins: AtomicCounter,
    packet_outs: AtomicCounter,
    flow_mods: AtomicCounter,
    others: AtomicCounter,
    reinjected: AtomicCounter,
}

impl OpenFlowProtocol {
    /// Create a decoder
    pub fn new() -> Self {
        Self {
            mux: Link::default(),
            anomalies: AnomalySink::default(),
            counters: ProtocolCounters::default(),
            hellos: AtomicCounter::new(0),
            echos: AtomicCounter::new(0),
            features: AtomicCounter::new(0),
            packet_ins: AtomicCounter::new(0),
            packet_outs: AtomicCounter::new(0),
            flow_mods: AtomicCounter::new(0),
            others: AtomicCounter::new(0),
            reinjected: AtomicCounter::new(0),
        }
    }

    /// Push the frame at `frame_offset` of `message` into the virtual pipeline
    fn reinject(&self, message: &Packet, frame_offset: usize) -> bool {
        if frame_offset >= message.len() {
            return false;
        }
        let Some(mux) = self.mux.get() else {
            return false;
        };
        let mut frame = message.clone();
        self.reinjected.inc();
        mux.set_header_size(frame_offset);
        mux.set_next_protocol_identifier(0);
        mux.forward_packet(&mut frame);
        frame.have_evidence()
    }
}

impl Default for OpenFlowProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for OpenFlowProtocol {
    fn name(&self) -> &'static str {
        "OpenFlowProtocol"
    }

    fn short_name(&self) -> &'static str {
        "openflow"
    }

    fn header_size(&self) -> usize {
        OPENFLOW_HEADER_SIZE
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("hellos", self.hellos.get())
            .with("echos", self.echos.get())
            .with("features", self.features.get())
            .with("packets in", self.packet_ins.get())
            .with("packets out", self.packet_outs.get())
            .with("flow mods", self.flow_mods.get())
            .with("other messages", self.others.get())
            .with("reinjected frames", self.reinjected.get())
    }

    fn set_multiplexer(&self, mux: Weak<Multiplexer>) {
        self.mux.set(mux);
    }

    fn set_anomaly_manager(&self, anomalies: Arc<AnomalyManager>) {
        self.anomalies.set(anomalies);
    }
}

impl FlowDecoder for OpenFlowProtocol {
    fn check_flow(&self, flow: &Flow) -> bool {
        let payload = flow.payload();
        let valid = payload.len() >= OPENFLOW_HEADER_SIZE
            && (1..=6).contains(&payload[0])
            && usize::from(u16::from_be_bytes([payload[2], payload[3]])) >= OPENFLOW_HEADER_SIZE;
        self.counters.verdict(valid)
    }

    fn process_flow(&self, flow: &mut Flow) {
        let Some(segment) = flow.packet().cloned() else {
            return;
        };
        self.counters.record(segment.len());

        let mut evidence = false;
        let mut offset = 0;
        while offset + OPENFLOW_HEADER_SIZE <= segment.len() {
            let length = segment.read_u16(offset + 2).map(usize::from).unwrap_or(0);
            if length < OPENFLOW_HEADER_SIZE || offset + length > segment.len() {
                self.counters.invalid.inc();
                self.anomalies.report_flow(AnomalyKind::OpenFlowBogusHeader, flow);
                break;
            }
            let Some(message) = segment.slice(offset, offset + length) else {
                break;
            };

            match message.payload()[1] {
                msg_type::HELLO => {
                    self.hellos.inc();
                }
                msg_type::ECHO_REQUEST | msg_type::ECHO_REPLY => {
                    self.echos.inc();
                }
                msg_type::FEATURES_REQUEST | msg_type::FEATURES_REPLY => {
                    self.features.inc();
                }
                msg_type::PACKET_IN => {
                    self.packet_ins.inc();
                    evidence |= self.reinject(&message, PACKET_IN_FRAME_OFFSET);
                }
                msg_type::PACKET_OUT => {
                    self.packet_outs.inc();
                    if let Some(actions_len) = message.read_u16(PACKET_OUT_ACTIONS_OFFSET - 2) {
                        let frame = PACKET_OUT_ACTIONS_OFFSET + usize::from(actions_len);
                        evidence |= self.reinject(&message, frame);
                    }
                }
                msg_type::FLOW_MOD => {
                    self.flow_mods.inc();
                }
                _ => {
                    self.others.inc();
                }
            }
            offset += length;
        }

        if evidence {
            flow.set_evidence(true);
        }
    }
}
