//! VXLAN tunnel decoder
//!
//! Claims UDP flows carrying VXLAN, strips the 8-byte header, tags the inner
//! frame with the VNI and pushes it through the virtual pipeline's root
//! multiplexer. Evidence raised inside comes back onto the outer flow.

use super::{AnomalySink, Link};
use crate::anomaly::{AnomalyKind, AnomalyManager};
use crate::flow::Flow;
use crate::multiplexer::Multiplexer;
use crate::protocol::{FlowDecoder, Protocol, ProtocolCounters};
use std::io::{self, Write};
use std::sync::{Arc, Weak};
use tessera_common::{AtomicCounter, CounterMap};

/// Flags, reserved, VNI, reserved
pub const VXLAN_HEADER_SIZE: usize = 8;

/// "VNI present" flag
pub const VXLAN_FLAG_VNI: u8 = 0x08;

/// IANA port for VXLAN
pub const VXLAN_PORT: u16 = 4789;

/// VXLAN decoder
pub struct VxlanProtocol {
    mux: Link<Multiplexer>,
    anomalies: AnomalySink,
    counters: ProtocolCounters,
    decapsulated: AtomicCounter,
    evidence_flows: AtomicCounter,
}

impl VxlanProtocol {
    /// Create a decoder
    pub fn new() -> Self {
        Self {
            mux: Link::default(),
            anomalies: AnomalySink::default(),
            counters: ProtocolCounters::default(),
            decapsulated: AtomicCounter::new(0),
            evidence_flows: AtomicCounter::new(0),
        }
    }
}

impl Default for VxlanProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for VxlanProtocol {
    fn name(&self) -> &'static str {
        "VxLanProtocol"
    }

    fn short_name(&self) -> &'static str {
        "vxlan"
    }

    fn header_size(&self) -> usize {
        VXLAN_HEADER_SIZE
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("decapsulated packets", self.decapsulated.get())
            .with("evidence flows", self.evidence_flows.get())
    }

    fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        if level == 0 {
            return Ok(());
        }
        writeln!(out, "{} statistics", self.name())?;
        writeln!(out, "\tTotal packets:          {:>12}", self.counters.packets.get())?;
        writeln!(out, "\tTotal bytes:            {:>12}", self.counters.bytes.get())?;
        if level > 1 {
            writeln!(out, "\tTotal valid packets:    {:>12}", self.counters.valid.get())?;
            writeln!(out, "\tTotal invalid packets:  {:>12}", self.counters.invalid.get())?;
            writeln!(out, "\tTotal decapsulated:     {:>12}", self.decapsulated.get())?;
        }
        if level > 2 {
            if let Some(mux) = self.mux.get() {
                mux.statistics(out)?;
            }
        }
        Ok(())
    }

    fn set_multiplexer(&self, mux: Weak<Multiplexer>) {
        self.mux.set(mux);
    }

    fn set_anomaly_manager(&self, anomalies: Arc<AnomalyManager>) {
        self.anomalies.set(anomalies);
    }
}

impl FlowDecoder for VxlanProtocol {
    fn check_flow(&self, flow: &Flow) -> bool {
        let payload = flow.payload();
        let valid = payload.len() >= VXLAN_HEADER_SIZE && payload[0] & VXLAN_FLAG_VNI != 0;
        self.counters.verdict(valid)
    }

    fn process_flow(&self, flow: &mut Flow) {
        let Some(mut inner) = flow.packet().cloned() else {
            return;
        };
        self.counters.record(inner.len());

        let Some(vni) = inner.read_u32(4).map(|word| word >> 8) else {
            self.counters.invalid.inc();
            self.anomalies.report_flow(AnomalyKind::VxlanBogusHeader, flow);
            return;
        };
        if inner.payload()[0] & VXLAN_FLAG_VNI == 0 {
            self.counters.invalid.inc();
            self.anomalies.report_flow(AnomalyKind::VxlanBogusHeader, flow);
            return;
        }

        inner.set_tag(vni);
        if let Some(mux) = self.mux.get() {
            self.decapsulated.inc();
            mux.set_next_protocol_identifier(0);
            mux.forward_packet(&mut inner);
        }
        if inner.have_evidence() && !flow.have_evidence() {
            self.evidence_flows.inc();
            flow.set_evidence(true);
        }
    }
}
