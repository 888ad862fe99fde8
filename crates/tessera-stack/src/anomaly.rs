//! Shared collector for structural anomalies reported by decoders

use crate::flow::Flow;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use tracing::trace;

/// Kinds of malformed traffic decoders report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AnomalyKind {
    /// IPv4 header length or version is invalid
    Ipv4BogusHeader,
    /// Fragmented IPv4 datagram
    Ipv4Fragmentation,
    /// TCP data offset outside the segment
    TcpBogusHeader,
    /// Impossible TCP flag combination (e.g. SYN+FIN)
    TcpBadFlags,
    /// UDP length field larger than the datagram
    UdpBogusHeader,
    /// VXLAN payload without a valid header
    VxlanBogusHeader,
    /// OpenFlow message length inconsistent with the segment
    OpenFlowBogusHeader,
}

impl AnomalyKind {
    /// Description used in statistics
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ipv4BogusHeader => "IPv4 bogus header",
            Self::Ipv4Fragmentation => "IPv4 fragmentation",
            Self::TcpBogusHeader => "TCP bogus header",
            Self::TcpBadFlags => "TCP bad flags",
            Self::UdpBogusHeader => "UDP bogus header",
            Self::VxlanBogusHeader => "VXLAN bogus header",
            Self::OpenFlowBogusHeader => "OpenFlow bogus header",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Anomaly sink shared by every decoder of a stack
#[derive(Debug, Default)]
pub struct AnomalyManager {
    counts: Mutex<BTreeMap<AnomalyKind, u64>>,
}

impl AnomalyManager {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one anomaly
    pub fn report(&self, kind: AnomalyKind) {
        trace!(anomaly = %kind, "anomaly");
        *self.counts.lock().entry(kind).or_insert(0) += 1;
    }

    /// Count one anomaly and mark the flow it belongs to
    pub fn report_flow(&self, kind: AnomalyKind, flow: &mut Flow) {
        flow.set_anomaly(kind);
        self.report(kind);
    }

    /// Occurrences of `kind`
    pub fn count(&self, kind: AnomalyKind) -> u64 {
        self.counts.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Occurrences of every kind seen so far
    pub fn snapshot(&self) -> BTreeMap<AnomalyKind, u64> {
        self.counts.lock().clone()
    }

    /// Human readable statistics
    pub fn statistics(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Packet Anomalies")?;
        for (kind, count) in self.snapshot() {
            writeln!(out, "\t{:<24}{:>12}", format!("Total {}:", kind), count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_kind() {
        let anomalies = AnomalyManager::new();
        anomalies.report(AnomalyKind::TcpBadFlags);
        anomalies.report(AnomalyKind::TcpBadFlags);
        let mut flow = Flow::default();
        anomalies.report_flow(AnomalyKind::UdpBogusHeader, &mut flow);

        assert_eq!(anomalies.count(AnomalyKind::TcpBadFlags), 2);
        assert_eq!(anomalies.count(AnomalyKind::UdpBogusHeader), 1);
        assert_eq!(anomalies.count(AnomalyKind::Ipv4Fragmentation), 0);
        assert_eq!(flow.anomaly(), Some(AnomalyKind::UdpBogusHeader));

        let mut out = Vec::new();
        anomalies.statistics(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Total TCP bad flags:"));
    }
}
