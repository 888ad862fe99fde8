//! VXLAN stack
//!
//! ```text
//! ethernet -> ip -> udp -> [vxlan] -> ethernet -> ip -> tcp -> [l7...]
//!                                                   -> udp -> [l7...]
//!                                                   -> icmp
//! ```

use super::pipeline::{NetworkLayers, TransportLayer, VirtualPipeline};
use super::NetworkStack;
use crate::anomaly::AnomalyManager;
use crate::flow::{FlowManager, SharedFlow};
use crate::forwarder::FlowForwarder;
use crate::multiplexer::Multiplexer;
use crate::protocol::Protocol;
use crate::protocols::{UdpProtocol, VxlanProtocol};
use std::io::{self, Write};
use std::sync::Arc;
use tessera_common::{DpiResult, Packet, IPPROTO_UDP};
use tracing::info;

/// Stack for VXLAN overlays
pub struct StackVirtual {
    anomalies: Arc<AnomalyManager>,
    /// Physical Ethernet and IPv4
    pub net: NetworkLayers,
    /// Physical UDP
    pub udp: TransportLayer<UdpProtocol>,
    /// Tunnel decoder
    pub vxlan: Arc<VxlanProtocol>,
    /// Multiplexer feeding decapsulated frames to the virtual pipeline
    pub mux_vxlan: Arc<Multiplexer>,
    /// Forwarder of the tunnel decoder on the physical UDP chain
    pub ff_vxlan: Arc<FlowForwarder>,
    /// Pipeline decoding the overlay traffic
    pub inner: VirtualPipeline,
}

impl StackVirtual {
    /// Assemble and validate the stack
    pub fn new() -> DpiResult<Self> {
        let anomalies = Arc::new(AnomalyManager::new());
        let net = NetworkLayers::new("EthernetProtocol", "IPProtocol", &anomalies)?;
        let udp = TransportLayer::new(UdpProtocol::new("UDPProtocol"), &anomalies);
        udp.attach(&net, IPPROTO_UDP)?;

        let inner = VirtualPipeline::new(&anomalies)?;
        let vxlan = Arc::new(VxlanProtocol::new());
        vxlan.set_anomaly_manager(anomalies.clone());
        let (mux_vxlan, ff_vxlan) = inner.attach_tunnel(&vxlan)?;
        udp.forwarder.add_up_flow_forwarder(ff_vxlan.clone());

        let stack = Self {
            anomalies,
            net,
            udp,
            vxlan,
            mux_vxlan,
            ff_vxlan,
            inner,
        };
        stack.net.validate()?;
        stack.udp.validate()?;
        stack.inner.validate()?;
        info!("{} ready", stack.name());
        Ok(stack)
    }
}

impl NetworkStack for StackVirtual {
    fn name(&self) -> &'static str {
        "Virtual Network Stack"
    }

    fn pipeline(&self) -> &VirtualPipeline {
        &self.inner
    }

    fn anomalies(&self) -> &Arc<AnomalyManager> {
        &self.anomalies
    }

    fn physical_flows(&self) -> &Arc<FlowManager> {
        &self.udp.manager
    }

    fn process_packet(&self, packet: &mut Packet) -> bool {
        self.net.process_packet(packet)
    }

    fn set_total_tcp_flows(&self, total: usize) {
        self.inner.set_total_tcp_flows(total);
    }

    fn set_total_udp_flows(&self, total: usize) {
        let physical = self.inner.cache_shares().physical(total);
        self.udp.resize_flows(physical);
        self.inner.set_total_udp_flows(total);
    }

    fn set_physical_flows_timeout(&self, seconds: u64) {
        self.udp.manager.set_timeout(seconds);
    }

    fn current_flows(&self) -> (Option<SharedFlow>, Option<SharedFlow>) {
        (self.udp.current_flow(), self.inner.current_flow())
    }

    fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        if level == 0 {
            return Ok(());
        }
        writeln!(out, "{}", self.name())?;
        self.net.statistics(out, level)?;
        self.udp.statistics(out, level)?;
        self.vxlan.statistics(out, level)?;
        if level > 2 {
            self.ff_vxlan.statistics(out)?;
        }
        self.inner.statistics(out, level)?;
        self.anomalies.statistics(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyKind;
    use crate::config::StackConfig;
    use crate::engines::{AddressSet, AddressSetEngine, RegexSignatures, SignatureEngine};
    use crate::protocols::vxlan::VXLAN_PORT;
    use crate::protocols::{Frequencies, L7Info, L7Kind};
    use crate::testutil::{tcp_frame, udp_frame, vxlan};
    use std::net::Ipv4Addr;
    use tessera_common::{FlowKey, IPPROTO_TCP};

    const VTEP_A: [u8; 4] = [172, 16, 0, 1];
    const VTEP_B: [u8; 4] = [172, 16, 0, 2];

    fn stack() -> StackVirtual {
        let stack = StackVirtual::new().unwrap();
        stack.set_total_tcp_flows(64);
        stack.set_total_udp_flows(64);
        stack
    }

    /// Outer VXLAN datagram carrying `inner`
    fn overlay(vni: u32, inner: &[u8], ts: u64) -> Packet {
        Packet::new(udp_frame(VTEP_A, VTEP_B, 50000, VXLAN_PORT, &vxlan(vni, inner)), ts)
    }

    fn http_request(host: u8, src_port: u16, ts: u64) -> Packet {
        let inner = tcp_frame(
            [10, 0, 0, host],
            [10, 0, 1, 1],
            src_port,
            80,
            0x18,
            b"GET /index.html HTTP/1.1\r\n",
        );
        overlay(7, &inner, ts)
    }

    #[test]
    fn test_tunnel_round_trip() {
        let stack = stack();
        let mut packet = http_request(1, 40000, 1);
        assert!(stack.process_packet(&mut packet));

        assert_eq!(stack.udp.total_flows(), 1);
        assert_eq!(stack.total_tcp_flows(), 1);
        assert_eq!(stack.vxlan.counters().get("decapsulated packets"), Some(1));

        let (outer, inner) = stack.current_flows();
        let inner = inner.unwrap();
        let f = inner.lock();
        let expected = FlowKey::from_v4(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 1, 1),
            40000,
            80,
            IPPROTO_TCP,
        );
        assert_eq!(*f.key(), expected);
        assert_eq!(f.tag(), Some(7));
        assert_eq!(f.l7_protocol(), Some("http"));
        assert_eq!(f.l7_info::<L7Info>().unwrap().packets, 1);
        assert_eq!(outer.unwrap().lock().l7_protocol(), Some("vxlan"));
    }

    #[test]
    fn test_inner_evidence_reaches_outer_flow() {
        let stack = stack();
        let mut set = AddressSet::new("blocklist", true);
        set.add_network("10.66.0.0/16").unwrap();
        let engine: Arc<dyn AddressSetEngine> = Arc::new(set);
        stack.set_tcp_address_set(Some(engine));

        let clean = tcp_frame([10, 0, 0, 1], [10, 0, 1, 1], 40000, 443, 0x02, b"");
        let mut packet = overlay(7, &clean, 1);
        stack.process_packet(&mut packet);
        assert!(!packet.have_evidence());

        let flagged = tcp_frame([10, 0, 0, 1], [10, 66, 1, 1], 40001, 443, 0x02, b"");
        let mut packet = overlay(7, &flagged, 2);
        stack.process_packet(&mut packet);
        assert!(packet.have_evidence());

        let (outer, inner) = stack.current_flows();
        assert!(outer.unwrap().lock().have_evidence());
        assert_eq!(inner.unwrap().lock().address_set(), Some("blocklist"));
        assert_eq!(stack.vxlan.counters().get("evidence flows"), Some(1));
    }

    #[test]
    fn test_bad_vxlan_header_is_contained() {
        let stack = stack();
        let mut data = vxlan(7, &[0u8; 4]);
        data[0] = 0;
        let mut packet = Packet::new(udp_frame(VTEP_A, VTEP_B, 50000, VXLAN_PORT, &data), 1);

        assert!(stack.process_packet(&mut packet));
        assert_eq!(stack.udp.total_flows(), 1);
        assert_eq!(stack.total_tcp_flows() + stack.total_udp_flows(), 0);
        assert_eq!(stack.vxlan.counters().get("invalid packets"), Some(1));
        assert_eq!(stack.udp.forwarder.total_fail_flows(), 1);
    }

    #[test]
    fn test_short_inner_frame_is_contained() {
        let stack = stack();
        let mut packet = overlay(7, &[0u8; 4], 1);

        assert!(stack.process_packet(&mut packet));
        assert_eq!(stack.vxlan.counters().get("decapsulated packets"), Some(1));
        assert_eq!(stack.inner.root().total_failed_packets(), 1);
        assert_eq!(stack.inner.net.eth.counters().get("invalid packets"), Some(1));
        assert_eq!(stack.inner.net.mux_ip.total_received_packets(), 0);
        assert_eq!(stack.udp.total_flows(), 1);
        assert_eq!(stack.total_tcp_flows() + stack.total_udp_flows(), 0);
    }

    #[test]
    fn test_frequency_toggle_preserves_flows() {
        let stack = stack();
        for host in 1..=5 {
            stack.process_packet(&mut http_request(host, 40000, 1));
        }
        assert_eq!(stack.total_tcp_flows(), 5);
        let classifiers = &stack.inner.tcp_classifiers;
        let http = classifiers.classifier(L7Kind::Http).unwrap().clone();
        assert_eq!(http.total_free_infos(), 48 - 5);

        stack.enable_frequency_engine(true);
        assert!(stack.is_frequency_engine_enabled());
        let freqs = classifiers.frequency().clone();
        assert_eq!(freqs.total_frequencies(), 64);
        assert_eq!(stack.total_tcp_flows(), 5);

        // Next payload moves the flow to the frequency decoder
        stack.process_packet(&mut http_request(1, 40000, 2));
        let (_, inner) = stack.current_flows();
        {
            let inner = inner.unwrap();
            let f = inner.lock();
            assert_eq!(f.l7_protocol(), Some("tcpfrequency"));
            assert!(f.l7_info::<Frequencies>().is_some());
        }
        assert_eq!(http.total_free_infos(), 48 - 4);

        stack.enable_frequency_engine(false);
        assert_eq!(stack.total_tcp_flows(), 5);
        assert_eq!(freqs.total_frequencies(), 0);

        stack.process_packet(&mut http_request(1, 40000, 3));
        let (_, inner) = stack.current_flows();
        assert_eq!(inner.unwrap().lock().l7_protocol(), Some("http"));
    }

    #[test]
    fn test_resize_in_frequency_mode_follows_flow_pools() {
        let stack = stack();
        stack.enable_frequency_engine(true);
        let tcp = stack.inner.tcp_classifiers.frequency().clone();
        let udp = stack.inner.udp_classifiers.frequency().clone();
        assert_eq!(tcp.total_frequencies(), 64);

        stack.set_total_tcp_flows(128);
        stack.set_total_udp_flows(16);
        assert_eq!(tcp.total_frequencies(), 128);
        assert_eq!(udp.total_frequencies(), 16);

        stack.enable_frequency_engine(false);
        stack.set_total_tcp_flows(256);
        assert_eq!(tcp.total_frequencies(), 0);
    }

    #[test]
    fn test_toggle_to_current_state_is_noop() {
        let stack = stack();
        stack.enable_frequency_engine(true);
        stack.enable_frequency_engine(true);
        let freqs = stack.inner.tcp_classifiers.frequency();
        assert_eq!(freqs.total_frequencies(), 64);
        assert_eq!(stack.inner.tcp.forwarder.total_up_flow_forwarders(), 8);

        stack.enable_nids_engine(false);
        assert!(!stack.is_nids_engine_enabled());
    }

    #[test]
    fn test_nids_mode_uses_generic_decoders() {
        let stack = stack();
        let mut sigs = RegexSignatures::new("tcp");
        sigs.add_signature("admin-probe", r"GET /admin", true).unwrap();
        let engine: Arc<dyn SignatureEngine> = Arc::new(sigs);
        stack.set_tcp_signature_engine(Some(engine));
        stack.enable_nids_engine(true);

        let request = b"GET /admin HTTP/1.1\r\n";
        let inner = tcp_frame([10, 0, 0, 9], [10, 0, 1, 1], 41000, 80, 0x18, request);
        let mut packet = overlay(9, &inner, 1);
        stack.process_packet(&mut packet);

        assert!(packet.have_evidence());
        let (_, inner) = stack.current_flows();
        let inner = inner.unwrap();
        let f = inner.lock();
        assert_eq!(f.l7_protocol(), Some("tcpgeneric"));
        assert_eq!(f.matched_signature(), Some("admin-probe"));
    }

    #[test]
    fn test_sizing() {
        let stack = StackVirtual::new().unwrap();
        stack.set_total_tcp_flows(1000);
        stack.set_total_udp_flows(800);

        assert_eq!(stack.inner.tcp.cache.capacity(), 1000);
        assert_eq!(stack.inner.tcp.decoder.total_infos(), 1000);
        assert_eq!(stack.inner.udp.cache.capacity(), 800);
        assert_eq!(stack.udp.cache.capacity(), 100);

        let tcp = &stack.inner.tcp_classifiers;
        assert_eq!(tcp.classifier(L7Kind::Http).unwrap().total_infos(), 750);
        assert_eq!(tcp.classifier(L7Kind::Ssl).unwrap().total_infos(), 400);
        let udp = &stack.inner.udp_classifiers;
        assert_eq!(udp.classifier(L7Kind::Dns).unwrap().total_infos(), 400);
        assert_eq!(udp.classifier(L7Kind::Sip).unwrap().total_infos(), 160);

        stack.set_total_tcp_flows(100);
        assert_eq!(stack.inner.tcp.cache.capacity(), 100);
    }

    #[test]
    fn test_inner_cache_exhaustion_drops_packet() {
        let stack = StackVirtual::new().unwrap();
        stack.set_total_tcp_flows(4);
        stack.set_total_udp_flows(8);

        for host in 1..=4 {
            stack.process_packet(&mut http_request(host, 40000, 1));
        }
        stack.process_packet(&mut http_request(5, 40000, 1));

        assert_eq!(stack.total_tcp_flows(), 4);
        assert_eq!(stack.inner.tcp.manager.total_exhausted(), 1);
        assert_eq!(stack.inner.tcp.decoder.counters().get("dropped packets"), Some(1));
        for host in 1..=4 {
            let key = FlowKey::from_v4(
                Ipv4Addr::new(10, 0, 0, host),
                Ipv4Addr::new(10, 0, 1, 1),
                40000,
                80,
                IPPROTO_TCP,
            );
            assert!(stack.inner.tcp.manager.find_flow(&key).is_some());
        }
    }

    #[test]
    fn test_inner_flows_time_out() {
        let stack = stack();
        stack.set_flows_timeout(10);
        stack.process_packet(&mut http_request(1, 40000, 100));
        stack.process_packet(&mut http_request(2, 40000, 105));
        assert_eq!(stack.total_tcp_flows(), 2);

        stack.process_packet(&mut http_request(3, 40000, 112));
        assert_eq!(stack.total_tcp_flows(), 2);
        assert_eq!(stack.inner.tcp.manager.total_timeouts(), 1);
        // The outer VXLAN flow stays, its timeout is separate
        assert_eq!(stack.udp.total_flows(), 1);
    }

    #[test]
    fn test_reset_closes_inner_flow() {
        let stack = stack();
        stack.process_packet(&mut http_request(1, 40000, 1));
        let rst = tcp_frame([10, 0, 1, 1], [10, 0, 0, 1], 80, 40000, 0x04, b"");
        stack.process_packet(&mut overlay(7, &rst, 2));

        assert_eq!(stack.total_tcp_flows(), 0);
        let http = stack.inner.tcp_classifiers.classifier(L7Kind::Http).unwrap();
        assert_eq!(http.total_free_infos(), 48);
    }

    #[test]
    fn test_show_flows() {
        let stack = stack();
        stack.process_packet(&mut http_request(1, 40000, 1));
        stack.process_packet(&mut http_request(2, 40000, 1));
        let dns = udp_frame([10, 0, 0, 3], [10, 0, 0, 53], 5353, 53, &[0u8; 12]);
        stack.process_packet(&mut overlay(7, &dns, 1));

        let mut out = Vec::new();
        assert_eq!(stack.show_flows(&mut out, None, 100).unwrap(), 4);
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Flows on memory 4"));
        // The physical tunnel flow comes before the inner ones
        assert!(lines.next().unwrap().contains("l7:vxlan"));

        let mut out = Vec::new();
        assert_eq!(stack.show_flows(&mut out, Some("dns"), 100).unwrap(), 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Flows on memory 4"));
        assert!(text.contains("l7:dns"));
        assert!(!text.contains("l7:vxlan"));

        let mut out = Vec::new();
        assert_eq!(stack.show_flows(&mut out, None, 2).unwrap(), 2);
    }

    #[test]
    fn test_ip_fragment_reported() {
        let stack = stack();
        let mut inner = tcp_frame([10, 0, 0, 1], [10, 0, 1, 1], 40000, 80, 0x18, b"GET /");
        // More-fragments bit in the inner IPv4 header
        inner[14 + 6] = 0x20;
        stack.process_packet(&mut overlay(7, &inner, 1));

        assert_eq!(stack.total_tcp_flows(), 0);
        assert_eq!(stack.anomalies().count(AnomalyKind::Ipv4Fragmentation), 1);
    }

    #[test]
    fn test_apply_config() {
        let stack = StackVirtual::new().unwrap();
        let config = StackConfig {
            total_tcp_flows: 256,
            total_udp_flows: 512,
            flows_timeout: 30,
            physical_flows_timeout: 600,
            nids_engine: true,
            ..StackConfig::default()
        };
        stack.apply_config(&config).unwrap();

        assert_eq!(stack.flows_timeout(), 30);
        assert_eq!(stack.udp.manager.timeout(), 600);
        assert_eq!(stack.inner.tcp.cache.capacity(), 256);
        assert_eq!(stack.udp.cache.capacity(), 64);
        assert!(stack.is_nids_engine_enabled());
        assert!(!stack.is_frequency_engine_enabled());

        let bad = StackConfig {
            flows_timeout: 0,
            ..StackConfig::default()
        };
        assert!(stack.apply_config(&bad).is_err());
        assert_eq!(stack.flows_timeout(), 30);
    }

    #[test]
    fn test_statistics_levels() {
        let stack = stack();
        stack.process_packet(&mut http_request(1, 40000, 1));

        let mut quiet = Vec::new();
        stack.statistics(&mut quiet, 0).unwrap();
        assert!(quiet.is_empty());

        let mut out = Vec::new();
        stack.statistics(&mut out, 3).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Virtual Network Stack"));
        assert!(text.contains("VxLanProtocol"));
        assert!(text.contains("FlowManager(tcp)"));
        assert!(text.contains("HTTPProtocol"));
    }
}
