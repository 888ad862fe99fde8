//! Protocol decoders
//!
//! Representative implementations of the decoder contract: packet-scoped
//! framing decoders (Ethernet, IPv4, TCP, UDP, ICMP), tunnel decoders that
//! bridge into a virtual pipeline (VXLAN, OpenFlow) and flow-scoped
//! classifiers (L7, generic fallback, frequency analysis).

pub mod ethernet;
pub mod frequency;
pub mod generic;
pub mod icmp;
pub mod ip;
pub mod l7;
pub mod openflow;
pub mod tcp;
pub mod transport;
pub mod udp;
pub mod vxlan;

pub use ethernet::EthernetProtocol;
pub use frequency::{Frequencies, FrequencyProtocol};
pub use generic::GenericProtocol;
pub use icmp::IcmpProtocol;
pub use ip::IpProtocol;
pub use l7::{L7Info, L7Kind, L7Protocol};
pub use openflow::OpenFlowProtocol;
pub use tcp::{TcpFlags, TcpInfo, TcpProtocol, TcpState};
pub use transport::{FlowLayer, TransportDecoder};
pub use udp::UdpProtocol;
pub use vxlan::VxlanProtocol;

use crate::anomaly::{AnomalyKind, AnomalyManager};
use crate::flow::Flow;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Non-owning back-reference from a decoder to framework objects
pub struct Link<T>(RwLock<Weak<T>>);

impl<T> Link<T> {
    /// Point the link at `target`
    pub fn set(&self, target: Weak<T>) {
        *self.0.write() = target;
    }

    /// Target, if still alive
    #[inline]
    pub fn get(&self) -> Option<Arc<T>> {
        self.0.read().upgrade()
    }
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self(RwLock::new(Weak::new()))
    }
}

/// Optional anomaly sink shared by the decoders of one stack
#[derive(Default)]
pub struct AnomalySink(RwLock<Option<Arc<AnomalyManager>>>);

impl AnomalySink {
    /// Attach the stack's collector
    pub fn set(&self, anomalies: Arc<AnomalyManager>) {
        *self.0.write() = Some(anomalies);
    }

    /// Count an anomaly
    pub fn report(&self, kind: AnomalyKind) {
        if let Some(anomalies) = &*self.0.read() {
            anomalies.report(kind);
        }
    }

    /// Count an anomaly and mark the flow
    pub fn report_flow(&self, kind: AnomalyKind, flow: &mut Flow) {
        match &*self.0.read() {
            Some(anomalies) => anomalies.report_flow(kind, flow),
            None => flow.set_anomaly(kind),
        }
    }
}
