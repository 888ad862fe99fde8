//! Catch-all decoder placed last on the TCP and UDP chains
//!
//! Accepts every payload nobody else claimed and runs the flow's signature
//! engine over it until one signature matches.

use crate::flow::Flow;
use crate::protocol::{FlowDecoder, Protocol, ProtocolCounters};
use tessera_common::{AtomicCounter, CounterMap};
use tracing::debug;

/// Generic fallback decoder
pub struct GenericProtocol {
    name: &'static str,
    short_name: &'static str,
    counters: ProtocolCounters,
    evaluated: AtomicCounter,
    matched: AtomicCounter,
}

impl GenericProtocol {
    /// TCP fallback
    pub fn tcp() -> Self {
        Self::new("TCPGenericProtocol", "tcpgeneric")
    }

    /// UDP fallback
    pub fn udp() -> Self {
        Self::new("UDPGenericProtocol", "udpgeneric")
    }

    fn new(name: &'static str, short_name: &'static str) -> Self {
        Self {
            name,
            short_name,
            counters: ProtocolCounters::default(),
            evaluated: AtomicCounter::new(0),
            matched: AtomicCounter::new(0),
        }
    }

    /// Payloads that matched a signature
    pub fn total_matches(&self) -> u64 {
        self.matched.get()
    }
}

impl Protocol for GenericProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    fn short_name(&self) -> &'static str {
        self.short_name
    }

    fn header_size(&self) -> usize {
        0
    }

    fn counters(&self) -> CounterMap {
        self.counters
            .to_map()
            .with("evaluated payloads", self.evaluated.get())
            .with("matched signatures", self.matched.get())
    }
}

impl FlowDecoder for GenericProtocol {
    fn check_flow(&self, _flow: &Flow) -> bool {
        self.counters.verdict(true)
    }

    fn process_flow(&self, flow: &mut Flow) {
        self.counters.record(flow.payload().len());
        if flow.matched_signature().is_some() {
            return;
        }
        let Some(engine) = flow.signature_engine().cloned() else {
            return;
        };
        self.evaluated.inc();
        let Some(hit) = engine.evaluate(flow.payload()) else {
            return;
        };
        self.matched.inc();
        debug!(flow = %flow.key(), signature = %hit.name, evidence = hit.evidence, "signature matched");
        if hit.evidence {
            flow.set_evidence(true);
        }
        flow.set_matched_signature(hit.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{RegexSignatures, SignatureEngine};
    use crate::testutil::flow_on_ports;
    use std::sync::Arc;

    #[test]
    fn test_signature_marks_flow_once() {
        let mut sigs = RegexSignatures::new("udp");
        sigs.add_signature("botnet", "^hello bot", true).unwrap();
        let sigs = Arc::new(sigs);
        let engine: Arc<dyn SignatureEngine> = sigs.clone();

        let generic = GenericProtocol::udp();
        let mut flow = flow_on_ports(1000, 2000, b"hello bot 42");
        flow.set_signature_engine(Some(engine));

        assert!(generic.check_flow(&flow));
        generic.process_flow(&mut flow);
        generic.process_flow(&mut flow);
        assert!(flow.have_evidence());
        assert_eq!(flow.matched_signature(), Some("botnet"));
        assert_eq!(generic.total_matches(), 1);
        assert_eq!(sigs.total_evaluations(), 1);
    }

    #[test]
    fn test_no_engine_is_quiet() {
        let generic = GenericProtocol::tcp();
        let mut flow = flow_on_ports(1000, 2000, b"anything");
        generic.process_flow(&mut flow);
        assert!(!flow.have_evidence());
        assert_eq!(generic.counters().get("packets"), Some(1));
    }
}
