//! OpenFlow stack
//!
//! ```text
//! ethernet -> ip -> tcp -> [openflow] -> ethernet -> ip -> tcp -> [l7...]
//!                                                      -> udp -> [l7...]
//!                                                      -> icmp
//! ```
//!
//! Controller sessions are long lived, so the physical TCP flows use the
//! physical timeout (24 h by default) instead of the inner one.

use super::pipeline::{NetworkLayers, TransportLayer, VirtualPipeline};
use super::NetworkStack;
use crate::anomaly::AnomalyManager;
use crate::config::PHYSICAL_FLOWS_TIMEOUT;
use crate::flow::{FlowManager, SharedFlow};
use crate::forwarder::FlowForwarder;
use crate::multiplexer::Multiplexer;
use crate::protocol::Protocol;
use crate::protocols::{OpenFlowProtocol, TcpProtocol};
use std::io::{self, Write};
use std::sync::Arc;
use tessera_common::{DpiResult, Packet, IPPROTO_TCP};
use tracing::info;

/// Stack for OpenFlow control channels carrying data-plane frames
pub struct StackOpenFlow {
    anomalies: Arc<AnomalyManager>,
    /// Physical Ethernet and IPv4
    pub net: NetworkLayers,
    /// Physical TCP
    pub tcp: TransportLayer<TcpProtocol>,
    /// Tunnel decoder
    pub openflow: Arc<OpenFlowProtocol>,
    /// Multiplexer re-injecting frames into the virtual pipeline
    pub mux_openflow: Arc<Multiplexer>,
    /// Forwarder of the tunnel decoder on the physical TCP chain
    pub ff_openflow: Arc<FlowForwarder>,
    /// Pipeline decoding the frames carried by OpenFlow messages
    pub inner: VirtualPipeline,
}

impl StackOpenFlow {
    /// Assemble and validate the stack
    pub fn new() -> DpiResult<Self> {
        let anomalies = Arc::new(AnomalyManager::new());
        let net = NetworkLayers::new("EthernetProtocol", "IPProtocol", &anomalies)?;
        let tcp = TransportLayer::new(TcpProtocol::new("TCPProtocol"), &anomalies);
        tcp.attach(&net, IPPROTO_TCP)?;
        tcp.manager.set_timeout(PHYSICAL_FLOWS_TIMEOUT);

        let inner = VirtualPipeline::new(&anomalies)?;
        let openflow = Arc::new(OpenFlowProtocol::new());
        openflow.set_anomaly_manager(anomalies.clone());
        let (mux_openflow, ff_openflow) = inner.attach_tunnel(&openflow)?;
        tcp.forwarder.add_up_flow_forwarder(ff_openflow.clone());

        let stack = Self {
            anomalies,
            net,
            tcp,
            openflow,
            mux_openflow,
            ff_openflow,
            inner,
        };
        stack.net.validate()?;
        stack.tcp.validate()?;
        stack.inner.validate()?;
        info!("{} ready", stack.name());
        Ok(stack)
    }
}

impl NetworkStack for StackOpenFlow {
    fn name(&self) -> &'static str {
        "OpenFlow Network Stack"
    }

    fn pipeline(&self) -> &VirtualPipeline {
        &self.inner
    }

    fn anomalies(&self) -> &Arc<AnomalyManager> {
        &self.anomalies
    }

    fn physical_flows(&self) -> &Arc<FlowManager> {
        &self.tcp.manager
    }

    fn process_packet(&self, packet: &mut Packet) -> bool {
        self.net.process_packet(packet)
    }

    fn set_total_tcp_flows(&self, total: usize) {
        let physical = self.inner.cache_shares().physical(total);
        self.tcp.resize_tcp(physical);
        self.inner.set_total_tcp_flows(total);
    }

    fn set_total_udp_flows(&self, total: usize) {
        self.inner.set_total_udp_flows(total);
    }

    fn set_physical_flows_timeout(&self, seconds: u64) {
        self.tcp.manager.set_timeout(seconds);
    }

    fn current_flows(&self) -> (Option<SharedFlow>, Option<SharedFlow>) {
        (self.tcp.current_flow(), self.inner.current_flow())
    }

    fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        if level == 0 {
            return Ok(());
        }
        writeln!(out, "{}", self.name())?;
        self.net.statistics(out, level)?;
        self.tcp.statistics(out, level)?;
        self.openflow.statistics(out, level)?;
        if level > 2 {
            self.mux_openflow.statistics(out)?;
            self.ff_openflow.statistics(out)?;
        }
        self.inner.statistics(out, level)?;
        self.anomalies.statistics(out)
    }
}
