//! Pipeline fragments shared by the stacks
//!
//! Each fragment is instantiated per pipeline: the physical and the virtual
//! pipelines are built from the same types but never share a multiplexer,
//! a flow manager or a flow cache.

use super::classifiers::ClassifierChain;
use super::{resize, StackModes};
use crate::anomaly::AnomalyManager;
use crate::config::CacheShares;
use crate::engines::{AddressSetEngine, SignatureEngine};
use crate::flow::{FlowCache, FlowManager, SharedFlow};
use crate::forwarder::FlowForwarder;
use crate::multiplexer::Multiplexer;
use crate::protocol::{FlowDecoder, Protocol};
use crate::protocols::l7::{TCP_KINDS, UDP_KINDS};
use crate::protocols::{
    EthernetProtocol, FrequencyProtocol, GenericProtocol, IcmpProtocol, IpProtocol, TcpProtocol,
    TransportDecoder, UdpProtocol,
};
use parking_lot::{Mutex, RwLock};
use std::io::{self, Write};
use std::sync::{Arc, Weak};
use tessera_common::{DpiResult, Packet, ETHERTYPE_IP, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use tracing::info;

/// Ethernet and IPv4, the root of every pipeline
pub struct NetworkLayers {
    /// Ethernet decoder
    pub eth: Arc<EthernetProtocol>,
    /// Root multiplexer
    pub mux_eth: Arc<Multiplexer>,
    /// IPv4 decoder
    pub ip: Arc<IpProtocol>,
    /// IPv4 multiplexer
    pub mux_ip: Arc<Multiplexer>,
}

impl NetworkLayers {
    /// Build Ethernet -> IPv4
    pub fn new(
        eth_name: &'static str,
        ip_name: &'static str,
        anomalies: &Arc<AnomalyManager>,
    ) -> DpiResult<Self> {
        let eth = Arc::new(EthernetProtocol::new(eth_name));
        let mux_eth = Arc::new(Multiplexer::new("ethernet"));
        mux_eth.bind_decoder(&eth);

        let ip = Arc::new(IpProtocol::new(ip_name));
        ip.set_anomaly_manager(anomalies.clone());
        let mux_ip = Arc::new(Multiplexer::new("ip"));
        mux_ip.bind_decoder(&ip);

        mux_eth.add_up_multiplexer(mux_ip.clone(), u32::from(ETHERTYPE_IP))?;
        Ok(Self {
            eth,
            mux_eth,
            ip,
            mux_ip,
        })
    }

    /// Run a frame through the pipeline
    pub fn process_packet(&self, packet: &mut Packet) -> bool {
        self.mux_eth.process_packet(packet)
    }

    /// Check every multiplexer reachable from the root
    pub fn validate(&self) -> DpiResult<()> {
        self.mux_eth.validate()
    }

    /// Decoder statistics
    pub fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        self.eth.statistics(out, level)?;
        self.ip.statistics(out, level)?;
        if level > 2 {
            self.mux_eth.statistics(out)?;
            self.mux_ip.statistics(out)?;
        }
        Ok(())
    }
}

/// A transport decoder with its multiplexer, flow table, flow pool and the
/// forwarder its payloads are dispatched through
pub struct TransportLayer<D> {
    /// Transport decoder
    pub decoder: Arc<D>,
    /// Multiplexer owning the decoder
    pub mux: Arc<Multiplexer>,
    /// Live flows
    pub manager: Arc<FlowManager>,
    /// Flow records
    pub cache: Arc<FlowCache>,
    /// Root of the flow-scoped dispatch chain
    pub forwarder: Arc<FlowForwarder>,
}

impl<D> TransportLayer<D>
where
    D: TransportDecoder + 'static,
{
    /// Wire decoder, multiplexer, manager, cache and forwarder together
    pub fn new(decoder: D, anomalies: &Arc<AnomalyManager>) -> Self {
        let decoder = Arc::new(decoder);
        decoder.set_anomaly_manager(anomalies.clone());
        let name = decoder.short_name();

        let mux = Arc::new(Multiplexer::new(name));
        mux.bind_decoder(&decoder);

        let cache = Arc::new(FlowCache::new(name));
        let manager = Arc::new(FlowManager::new(name));
        manager.set_flow_cache(cache.clone());
        let protocol: Weak<dyn Protocol> = Arc::<D>::downgrade(&decoder);
        manager.set_protocol(protocol.clone());
        decoder.flow_layer().set_flow_manager(Arc::downgrade(&manager));

        let forwarder = Arc::new(FlowForwarder::new(name));
        forwarder.set_protocol(protocol);
        decoder.set_flow_forwarder(Arc::downgrade(&forwarder));

        Self {
            decoder,
            mux,
            manager,
            cache,
            forwarder,
        }
    }

    /// Plug the transport multiplexer under the IPv4 one
    pub fn attach(&self, net: &NetworkLayers, ip_protocol: u8) -> DpiResult<()> {
        net.mux_ip.add_up_multiplexer(self.mux.clone(), u32::from(ip_protocol))
    }

    /// Grow or shrink the flow pool to `records`; live flows are kept
    pub fn resize_flows(&self, records: usize) {
        resize(
            self.cache.capacity(),
            records,
            |n| self.cache.create_flows(n),
            |n| {
                self.cache.destroy_flows(n);
            },
        );
    }

    /// Live flows
    pub fn total_flows(&self) -> usize {
        self.manager.total_flows()
    }

    /// Flow of the last packet
    pub fn current_flow(&self) -> Option<SharedFlow> {
        self.decoder.flow_layer().current_flow()
    }

    /// Check manager and forwarder wiring
    pub fn validate(&self) -> DpiResult<()> {
        self.manager.validate()?;
        self.forwarder.validate()
    }

    /// Decoder, table and pool statistics
    pub fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        self.decoder.statistics(out, level)?;
        if level > 1 {
            self.manager.statistics(out)?;
            self.cache.statistics(out, self.decoder.short_name())?;
        }
        if level > 2 {
            self.mux.statistics(out)?;
            self.forwarder.statistics(out)?;
        }
        Ok(())
    }
}

impl TransportLayer<TcpProtocol> {
    /// Pool sizes for `records` flows, TCP state records included
    pub fn resize_tcp(&self, records: usize) {
        self.resize_flows(records);
        let tcp = &self.decoder;
        resize(
            tcp.total_infos(),
            records,
            |n| tcp.increase_allocated_memory(n),
            |n| tcp.decrease_allocated_memory(n),
        );
    }
}

/// The inner pipeline tunnel decoders feed: Ethernet -> IPv4 ->
/// {TCP, UDP, ICMP}, with the classifier chains on TCP and UDP.
pub struct VirtualPipeline {
    /// Ethernet and IPv4
    pub net: NetworkLayers,
    /// Inner TCP
    pub tcp: TransportLayer<TcpProtocol>,
    /// Inner UDP
    pub udp: TransportLayer<UdpProtocol>,
    /// Inner ICMP
    pub icmp: Arc<IcmpProtocol>,
    /// Multiplexer owning the ICMP decoder
    pub mux_icmp: Arc<Multiplexer>,
    /// Classifiers on TCP flows
    pub tcp_classifiers: ClassifierChain,
    /// Classifiers on UDP flows
    pub udp_classifiers: ClassifierChain,
    modes: Mutex<StackModes>,
    shares: RwLock<CacheShares>,
}

impl VirtualPipeline {
    /// Build and wire the inner pipeline
    pub fn new(anomalies: &Arc<AnomalyManager>) -> DpiResult<Self> {
        let net = NetworkLayers::new("EthernetVirtualProtocol", "IPVirtualProtocol", anomalies)?;

        let tcp = TransportLayer::new(TcpProtocol::new("TCPVirtualProtocol"), anomalies);
        tcp.attach(&net, IPPROTO_TCP)?;
        let udp = TransportLayer::new(UdpProtocol::new("UDPVirtualProtocol"), anomalies);
        udp.attach(&net, IPPROTO_UDP)?;

        let icmp = Arc::new(IcmpProtocol::new("ICMPVirtualProtocol"));
        let mux_icmp = Arc::new(Multiplexer::new("icmp"));
        mux_icmp.bind_decoder(&icmp);
        net.mux_ip
            .add_up_multiplexer(mux_icmp.clone(), u32::from(IPPROTO_ICMP))?;

        let tcp_classifiers =
            ClassifierChain::new(&TCP_KINDS, GenericProtocol::tcp(), FrequencyProtocol::tcp());
        tcp_classifiers.attach(&tcp.forwarder);
        let udp_classifiers =
            ClassifierChain::new(&UDP_KINDS, GenericProtocol::udp(), FrequencyProtocol::udp());
        udp_classifiers.attach(&udp.forwarder);

        Ok(Self {
            net,
            tcp,
            udp,
            icmp,
            mux_icmp,
            tcp_classifiers,
            udp_classifiers,
            modes: Mutex::new(StackModes::default()),
            shares: RwLock::new(CacheShares::default()),
        })
    }

    /// Root multiplexer, the re-injection point of tunnel decoders
    pub fn root(&self) -> &Arc<Multiplexer> {
        &self.net.mux_eth
    }

    /// Bridge a tunnel decoder into this pipeline.
    ///
    /// The decoder is bound to a new forwarder (to be registered on the
    /// outer transport) and owns a new multiplexer whose only child, id 0,
    /// is this pipeline's root.
    pub fn attach_tunnel<D>(&self, decoder: &Arc<D>) -> DpiResult<(Arc<Multiplexer>, Arc<FlowForwarder>)>
    where
        D: FlowDecoder + 'static,
    {
        let name = decoder.short_name();
        let mux = Arc::new(Multiplexer::new(name));
        let protocol: Weak<dyn Protocol> = Arc::<D>::downgrade(decoder);
        mux.set_protocol(protocol);
        mux.set_header_size(decoder.header_size());
        decoder.set_multiplexer(Arc::downgrade(&mux));
        mux.add_up_multiplexer(self.root().clone(), 0)?;

        let ff = Arc::new(FlowForwarder::new(name));
        ff.bind_decoder(decoder);
        Ok((mux, ff))
    }

    /// Check every multiplexer, forwarder and manager
    pub fn validate(&self) -> DpiResult<()> {
        self.net.validate()?;
        self.tcp.validate()?;
        self.udp.validate()
    }

    /// Sizing weights
    pub fn cache_shares(&self) -> CacheShares {
        self.shares.read().clone()
    }

    /// Replace the sizing weights; applies on the next resize
    pub fn set_cache_shares(&self, shares: CacheShares) {
        *self.shares.write() = shares;
    }

    /// Size the TCP pools and the TCP classifiers' records.
    ///
    /// In frequency mode the histogram pool follows the new flow pool.
    pub fn set_total_tcp_flows(&self, total: usize) {
        let modes = self.modes.lock();
        self.tcp.resize_tcp(total);
        self.tcp_classifiers.resize(total, &self.shares.read());
        if modes.frequency {
            self.tcp_classifiers.resize_frequencies(self.tcp.cache.capacity());
        }
    }

    /// Size the UDP pool and the UDP classifiers' records.
    ///
    /// In frequency mode the histogram pool follows the new flow pool.
    pub fn set_total_udp_flows(&self, total: usize) {
        let modes = self.modes.lock();
        self.udp.resize_flows(total);
        self.udp_classifiers.resize(total, &self.shares.read());
        if modes.frequency {
            self.udp_classifiers.resize_frequencies(self.udp.cache.capacity());
        }
    }

    /// Idle timeout of the inner flows
    pub fn set_flows_timeout(&self, seconds: u64) {
        self.tcp.manager.set_timeout(seconds);
        self.udp.manager.set_timeout(seconds);
    }

    /// Idle timeout of the inner flows
    pub fn flows_timeout(&self) -> u64 {
        self.tcp.manager.timeout()
    }

    /// Current modes
    pub fn modes(&self) -> StackModes {
        *self.modes.lock()
    }

    /// Switch frequency mode; no-op when already in the requested state.
    ///
    /// Switching on sizes the histogram pools from the capacity of the
    /// inner flow pools. Switching off takes the histograms back from the
    /// live flows and frees the pools.
    pub fn enable_frequency_engine(&self, enable: bool) {
        let mut modes = self.modes.lock();
        if modes.frequency == enable {
            return;
        }
        modes.frequency = enable;
        if enable {
            self.tcp_classifiers.resize_frequencies(self.tcp.cache.capacity());
            self.udp_classifiers.resize_frequencies(self.udp.cache.capacity());
        }
        self.tcp_classifiers.apply(&self.tcp.forwarder, *modes);
        self.udp_classifiers.apply(&self.udp.forwarder, *modes);
        if !enable {
            self.tcp_classifiers.destroy_frequencies(&self.tcp.manager);
            self.udp_classifiers.destroy_frequencies(&self.udp.manager);
        }
        info!(enable, "frequency engine");
    }

    /// Switch NIDS mode; no-op when already in the requested state
    pub fn enable_nids_engine(&self, enable: bool) {
        let mut modes = self.modes.lock();
        if modes.nids == enable {
            return;
        }
        modes.nids = enable;
        self.tcp_classifiers.apply(&self.tcp.forwarder, *modes);
        self.udp_classifiers.apply(&self.udp.forwarder, *modes);
        info!(enable, "nids engine");
    }

    /// Signature engine for new TCP flows
    pub fn set_tcp_signature_engine(&self, engine: Option<Arc<dyn SignatureEngine>>) {
        self.tcp.decoder.flow_layer().set_signature_engine(engine);
    }

    /// Signature engine for new UDP flows
    pub fn set_udp_signature_engine(&self, engine: Option<Arc<dyn SignatureEngine>>) {
        self.udp.decoder.flow_layer().set_signature_engine(engine);
    }

    /// Address set for new TCP flows
    pub fn set_tcp_address_set(&self, engine: Option<Arc<dyn AddressSetEngine>>) {
        self.tcp.decoder.flow_layer().set_address_set(engine);
    }

    /// Address set for new UDP flows
    pub fn set_udp_address_set(&self, engine: Option<Arc<dyn AddressSetEngine>>) {
        self.udp.decoder.flow_layer().set_address_set(engine);
    }

    /// Flow of the last inner packet, chosen by its IP protocol
    pub fn current_flow(&self) -> Option<SharedFlow> {
        match self.net.ip.last_protocol() {
            IPPROTO_TCP => self.tcp.current_flow(),
            IPPROTO_UDP => self.udp.current_flow(),
            _ => None,
        }
    }

    /// Print up to `limit` inner flows, TCP first
    pub fn show_flows(
        &self,
        out: &mut dyn Write,
        protocol: Option<&str>,
        limit: usize,
    ) -> io::Result<usize> {
        let shown = self.tcp.manager.show_flows(out, protocol, limit)?;
        let rest = limit.saturating_sub(shown);
        Ok(shown + self.udp.manager.show_flows(out, protocol, rest)?)
    }

    /// Statistics of every inner component
    pub fn statistics(&self, out: &mut dyn Write, level: u8) -> io::Result<()> {
        self.net.statistics(out, level)?;
        self.tcp.statistics(out, level)?;
        self.udp.statistics(out, level)?;
        self.icmp.statistics(out, level)?;
        self.tcp_classifiers.statistics(out, level)?;
        self.udp_classifiers.statistics(out, level)
    }
}
