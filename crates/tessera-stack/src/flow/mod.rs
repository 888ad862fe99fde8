//! Flow state and lifecycle
//!
//! A [`Flow`] is one tracked bidirectional connection. Records are pooled
//! by a [`FlowCache`] and indexed by a [`FlowManager`]; the manager is the
//! only owner of a live flow.

mod cache;
mod manager;

pub use cache::FlowCache;
pub use manager::{FlowManager, DEFAULT_FLOW_TIMEOUT};

use crate::anomaly::AnomalyKind;
use crate::engines::SignatureEngine;
use crate::forwarder::FlowForwarder;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use tessera_common::{FlowDirection, FlowKey, Packet};

/// Flow record shared between its manager and the packet traversing it
pub type SharedFlow = Arc<Mutex<Flow>>;

/// Opaque per-decoder state attached to a flow
pub type FlowInfo = Box<dyn Any + Send>;

/// One tracked connection
#[derive(Default)]
pub struct Flow {
    key: FlowKey,
    tag: Option<u32>,
    arrive_time: u64,
    last_seen: u64,
    total_packets: u64,
    total_bytes: u64,
    upstream_packets: u64,
    downstream_packets: u64,
    direction: FlowDirection,
    /// Payload currently being dispatched
    packet: Option<Packet>,
    evidence: bool,
    anomaly: Option<AnomalyKind>,
    /// Forwarder that claimed this flow
    forwarder: Option<Weak<FlowForwarder>>,
    l7_protocol: Option<&'static str>,
    signatures: Option<Arc<dyn SignatureEngine>>,
    matched_signature: Option<String>,
    address_set: Option<String>,
    /// Transport decoder state (e.g. TCP flags)
    l4_info: Option<FlowInfo>,
    /// State of the decoder that claimed the flow
    l7_info: Option<FlowInfo>,
}

impl Flow {
    /// Create a flow for `key`
    pub fn new(key: FlowKey) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    /// Wipe every field so the record can go back to its cache.
    ///
    /// Per-decoder info must have been released first; anything still
    /// attached is dropped here.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Connection identity
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Assign the connection identity (done once, on creation)
    pub fn set_key(&mut self, key: FlowKey) {
        self.key = key;
    }

    /// Tunnel tag of the packets carrying this flow
    pub fn tag(&self) -> Option<u32> {
        self.tag
    }

    /// Set the tunnel tag
    pub fn set_tag(&mut self, tag: Option<u32>) {
        self.tag = tag;
    }

    /// Account one packet of `len` bytes seen at `now`
    pub fn update(&mut self, direction: FlowDirection, len: usize, now: u64) {
        if self.total_packets == 0 {
            self.arrive_time = now;
        }
        self.direction = direction;
        self.total_packets += 1;
        self.total_bytes += len as u64;
        match direction {
            FlowDirection::Upstream => self.upstream_packets += 1,
            FlowDirection::Downstream => self.downstream_packets += 1,
        }
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// First packet time
    pub fn arrive_time(&self) -> u64 {
        self.arrive_time
    }

    /// Last packet time
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Set the last packet time
    pub fn set_last_seen(&mut self, now: u64) {
        self.last_seen = now;
    }

    /// Idle for longer than `timeout` seconds at `now`
    pub fn is_idle(&self, now: u64, timeout: u64) -> bool {
        now.saturating_sub(self.last_seen) > timeout
    }

    /// Packets in both directions
    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    /// Bytes in both directions
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Packets in the creating direction
    pub fn upstream_packets(&self) -> u64 {
        self.upstream_packets
    }

    /// Packets in the reply direction
    pub fn downstream_packets(&self) -> u64 {
        self.downstream_packets
    }

    /// Direction of the current packet
    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    /// Payload currently being dispatched
    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    /// Current payload bytes (empty when nothing is being dispatched)
    pub fn payload(&self) -> &[u8] {
        self.packet.as_ref().map(Packet::payload).unwrap_or(&[])
    }

    /// Attach the payload to dispatch
    pub fn set_packet(&mut self, packet: Packet) {
        self.packet = Some(packet);
    }

    /// Detach the payload once dispatch is over
    pub fn take_packet(&mut self) -> Option<Packet> {
        self.packet.take()
    }

    /// Evidence marker
    pub fn have_evidence(&self) -> bool {
        self.evidence
    }

    /// Set the evidence marker
    pub fn set_evidence(&mut self, evidence: bool) {
        self.evidence = evidence;
    }

    /// Last anomaly seen on this flow
    pub fn anomaly(&self) -> Option<AnomalyKind> {
        self.anomaly
    }

    /// Record an anomaly
    pub fn set_anomaly(&mut self, kind: AnomalyKind) {
        self.anomaly = Some(kind);
    }

    /// Forwarder currently handling this flow, if still alive
    pub fn forwarder(&self) -> Option<Arc<FlowForwarder>> {
        self.forwarder.as_ref().and_then(Weak::upgrade)
    }

    /// Bind the flow to the forwarder that claimed it
    pub fn set_forwarder(&mut self, ff: Option<Weak<FlowForwarder>>) {
        self.forwarder = ff;
    }

    /// Short name of the L7 decoder that claimed the flow
    pub fn l7_protocol(&self) -> Option<&'static str> {
        self.l7_protocol
    }

    /// Record the claiming L7 decoder
    pub fn set_l7_protocol(&mut self, name: Option<&'static str>) {
        self.l7_protocol = name;
    }

    /// Signature engine assigned by the transport layer
    pub fn signature_engine(&self) -> Option<&Arc<dyn SignatureEngine>> {
        self.signatures.as_ref()
    }

    /// Assign a signature engine
    pub fn set_signature_engine(&mut self, engine: Option<Arc<dyn SignatureEngine>>) {
        self.signatures = engine;
    }

    /// Name of the signature that matched this flow
    pub fn matched_signature(&self) -> Option<&str> {
        self.matched_signature.as_deref()
    }

    /// Record a signature match
    pub fn set_matched_signature(&mut self, name: impl Into<String>) {
        self.matched_signature = Some(name.into());
    }

    /// Name of the address set that matched this flow
    pub fn address_set(&self) -> Option<&str> {
        self.address_set.as_deref()
    }

    /// Record an address set match
    pub fn set_address_set(&mut self, name: impl Into<String>) {
        self.address_set = Some(name.into());
    }

    /// Transport decoder state
    pub fn l4_info<T: Any>(&self) -> Option<&T> {
        self.l4_info.as_ref().and_then(|info| info.downcast_ref())
    }

    /// Mutable transport decoder state
    pub fn l4_info_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.l4_info.as_mut().and_then(|info| info.downcast_mut())
    }

    /// Attach transport decoder state
    pub fn set_l4_info(&mut self, info: FlowInfo) {
        self.l4_info = Some(info);
    }

    /// Detach transport decoder state
    pub fn take_l4_info(&mut self) -> Option<FlowInfo> {
        self.l4_info.take()
    }

    /// L7 decoder state
    pub fn l7_info<T: Any>(&self) -> Option<&T> {
        self.l7_info.as_ref().and_then(|info| info.downcast_ref())
    }

    /// Mutable L7 decoder state
    pub fn l7_info_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.l7_info.as_mut().and_then(|info| info.downcast_mut())
    }

    /// Whether any L7 state is attached
    pub fn has_l7_info(&self) -> bool {
        self.l7_info.is_some()
    }

    /// Attach L7 decoder state
    pub fn set_l7_info(&mut self, info: FlowInfo) {
        self.l7_info = Some(info);
    }

    /// Detach L7 decoder state
    pub fn take_l7_info(&mut self) -> Option<FlowInfo> {
        self.l7_info.take()
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("key", &self.key)
            .field("tag", &self.tag)
            .field("last_seen", &self.last_seen)
            .field("packets", &self.total_packets)
            .field("bytes", &self.total_bytes)
            .field("l7", &self.l7_protocol)
            .field("evidence", &self.evidence)
            .finish()
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pkts:{} bytes:{} l7:{}",
            self.key,
            self.total_packets,
            self.total_bytes,
            self.l7_protocol.unwrap_or("-")
        )?;
        if let Some(tag) = self.tag {
            write!(f, " tag:{}", tag)?;
        }
        if let Some(sig) = &self.matched_signature {
            write!(f, " signature:{}", sig)?;
        }
        if let Some(set) = &self.address_set {
            write!(f, " ipset:{}", set)?;
        }
        if self.evidence {
            write!(f, " evidence")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key() -> FlowKey {
        FlowKey::from_v4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 1234, 80, 6)
    }

    #[test]
    fn test_update_counts_directions() {
        let mut flow = Flow::new(key());
        flow.update(FlowDirection::Upstream, 100, 10);
        flow.update(FlowDirection::Downstream, 50, 12);
        flow.update(FlowDirection::Upstream, 10, 11);

        assert_eq!(flow.total_packets(), 3);
        assert_eq!(flow.total_bytes(), 160);
        assert_eq!(flow.upstream_packets(), 2);
        assert_eq!(flow.downstream_packets(), 1);
        assert_eq!(flow.arrive_time(), 10);
        // Timestamps never move backwards
        assert_eq!(flow.last_seen(), 12);
        assert!(flow.is_idle(20, 5));
        assert!(!flow.is_idle(17, 5));
    }

    #[test]
    fn test_info_slots() {
        let mut flow = Flow::new(key());
        flow.set_l7_info(Box::new(7u32));
        assert_eq!(flow.l7_info::<u32>(), Some(&7));
        assert!(flow.l7_info::<u64>().is_none());
        *flow.l7_info_mut::<u32>().unwrap() += 1;
        let info = flow.take_l7_info().unwrap();
        assert_eq!(*info.downcast::<u32>().unwrap(), 8);
        assert!(!flow.has_l7_info());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut flow = Flow::new(key());
        flow.update(FlowDirection::Upstream, 100, 10);
        flow.set_evidence(true);
        flow.set_l7_protocol(Some("http"));
        flow.set_tag(Some(5));
        flow.reset();

        assert_eq!(*flow.key(), FlowKey::default());
        assert_eq!(flow.total_packets(), 0);
        assert!(!flow.have_evidence());
        assert!(flow.l7_protocol().is_none());
        assert!(flow.tag().is_none());
    }

    #[test]
    fn test_display() {
        let mut flow = Flow::new(key());
        flow.update(FlowDirection::Upstream, 60, 1);
        flow.set_l7_protocol(Some("http"));
        flow.set_evidence(true);
        assert_eq!(
            flow.to_string(),
            "[10.0.0.1:1234]:TCP:[10.0.0.2:80] pkts:1 bytes:60 l7:http evidence"
        );
    }
}
