//! Frame builders and fixture decoders for unit tests

use crate::flow::Flow;
use crate::multiplexer::Multiplexer;
use crate::protocol::{FlowDecoder, PacketDecoder, Protocol};
use crate::protocols::Link;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use tessera_common::{
    AtomicCounter, CounterMap, FlowKey, Packet, ETHERTYPE_IP, IPPROTO_TCP, IPPROTO_UDP,
};

/// TCP key 10.0.0.`host`:`src_port` -> 10.0.1.1:`dst_port`
pub fn flow_key(host: u8, src_port: u16, dst_port: u16) -> FlowKey {
    FlowKey::from_v4(
        Ipv4Addr::new(10, 0, 0, host),
        Ipv4Addr::new(10, 0, 1, 1),
        src_port,
        dst_port,
        IPPROTO_TCP,
    )
}

/// Flow carrying `payload` as its current packet
pub fn flow_with_payload(payload: &[u8]) -> Flow {
    flow_on_ports(40000, 9999, payload)
}

/// Flow on the given ports carrying `payload` as its current packet
pub fn flow_on_ports(src_port: u16, dst_port: u16, payload: &[u8]) -> Flow {
    let mut flow = Flow::new(flow_key(1, src_port, dst_port));
    flow.set_packet(Packet::new(payload.to_vec(), 0));
    flow
}

/// Ethernet II frame
pub fn ethernet(ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// IPv4 header without options
pub fn ipv4(src: [u8; 4], dst: [u8; 4], protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total = (20 + payload.len()) as u16;
    let mut ip = vec![0x45, 0x00];
    ip.extend_from_slice(&total.to_be_bytes());
    ip.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 64, protocol, 0x00, 0x00]);
    ip.extend_from_slice(&src);
    ip.extend_from_slice(&dst);
    ip.extend_from_slice(payload);
    ip
}

/// TCP header without options
pub fn tcp(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut seg = Vec::with_capacity(20 + payload.len());
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);
    seg.extend_from_slice(payload);
    seg
}

/// UDP header
pub fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let len = (8 + payload.len()) as u16;
    let mut dgram = Vec::with_capacity(8 + payload.len());
    dgram.extend_from_slice(&src_port.to_be_bytes());
    dgram.extend_from_slice(&dst_port.to_be_bytes());
    dgram.extend_from_slice(&len.to_be_bytes());
    dgram.extend_from_slice(&[0, 0]);
    dgram.extend_from_slice(payload);
    dgram
}

/// Ethernet/IPv4/TCP frame
pub fn tcp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    ethernet(ETHERTYPE_IP, &ipv4(src, dst, IPPROTO_TCP, &tcp(src_port, dst_port, flags, payload)))
}

/// Ethernet/IPv4/UDP frame
pub fn udp_frame(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    ethernet(ETHERTYPE_IP, &ipv4(src, dst, IPPROTO_UDP, &udp(src_port, dst_port, payload)))
}

/// VXLAN header followed by `inner`
pub fn vxlan(vni: u32, inner: &[u8]) -> Vec<u8> {
    let vni = vni.to_be_bytes();
    let mut data = vec![0x08, 0, 0, 0, vni[1], vni[2], vni[3], 0];
    data.extend_from_slice(inner);
    data
}

fn openflow_header(kind: u8, body_len: usize) -> Vec<u8> {
    let len = (8 + body_len) as u16;
    let mut msg = vec![0x01, kind];
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(&[0, 0, 0, 7]);
    msg
}

/// OpenFlow 1.0 HELLO
pub fn openflow_hello() -> Vec<u8> {
    openflow_header(0, 0)
}

/// OpenFlow 1.0 PACKET_IN carrying `frame`
pub fn openflow_packet_in(frame: &[u8]) -> Vec<u8> {
    let mut msg = openflow_header(10, 10 + frame.len());
    msg.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    msg.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    msg.extend_from_slice(&[0, 1, 0, 0]);
    msg.extend_from_slice(frame);
    msg
}

/// OpenFlow 1.0 PACKET_OUT with `actions_len` bytes of actions before `frame`
pub fn openflow_packet_out(actions_len: u16, frame: &[u8]) -> Vec<u8> {
    let mut msg = openflow_header(13, 8 + usize::from(actions_len) + frame.len());
    msg.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0, 1]);
    msg.extend_from_slice(&actions_len.to_be_bytes());
    msg.extend(std::iter::repeat(0u8).take(usize::from(actions_len)));
    msg.extend_from_slice(frame);
    msg
}

/// Packet decoder with a one byte header naming the next protocol
pub struct ByteRouter {
    name: &'static str,
    mux: Link<Multiplexer>,
    seen: AtomicCounter,
    evidence: AtomicBool,
}

impl ByteRouter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            mux: Link::default(),
            seen: AtomicCounter::new(0),
            evidence: AtomicBool::new(false),
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen.get()
    }

    pub fn flag_evidence(&self, on: bool) {
        self.evidence.store(on, Ordering::Relaxed);
    }
}

impl Protocol for ByteRouter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn short_name(&self) -> &'static str {
        self.name
    }

    fn header_size(&self) -> usize {
        1
    }

    fn counters(&self) -> CounterMap {
        CounterMap::new().with("packets", self.seen())
    }

    fn set_multiplexer(&self, mux: Weak<Multiplexer>) {
        self.mux.set(mux);
    }
}

impl PacketDecoder for ByteRouter {
    fn check_packet(&self, packet: &Packet) -> bool {
        !packet.is_empty()
    }

    fn process_packet(&self, packet: &mut Packet) {
        self.seen.inc();
        if self.evidence.load(Ordering::Relaxed) {
            packet.set_evidence(true);
        }
        if let (Some(mux), Some(id)) = (self.mux.get(), packet.payload().first()) {
            mux.set_next_protocol_identifier(u32::from(*id));
        }
    }
}

/// Flow decoder claiming payloads that start with a marker byte
pub struct MarkerDecoder {
    name: &'static str,
    marker: Option<u8>,
    checked: AtomicCounter,
    processed: AtomicCounter,
    released: AtomicCounter,
}

impl MarkerDecoder {
    /// `None` accepts everything
    pub fn new(name: &'static str, marker: Option<u8>) -> Self {
        Self {
            name,
            marker,
            checked: AtomicCounter::new(0),
            processed: AtomicCounter::new(0),
            released: AtomicCounter::new(0),
        }
    }

    pub fn checked(&self) -> u64 {
        self.checked.get()
    }

    pub fn processed(&self) -> u64 {
        self.processed.get()
    }

    pub fn released(&self) -> u64 {
        self.released.get()
    }
}

impl Protocol for MarkerDecoder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn short_name(&self) -> &'static str {
        self.name
    }

    fn header_size(&self) -> usize {
        0
    }

    fn counters(&self) -> CounterMap {
        CounterMap::new().with("packets", self.processed())
    }

    fn release_flow_info(&self, flow: &mut Flow) {
        if flow.take_l7_info().is_some() {
            self.released.inc();
        }
    }
}

impl FlowDecoder for MarkerDecoder {
    fn check_flow(&self, flow: &Flow) -> bool {
        self.checked.inc();
        match self.marker {
            Some(m) => flow.payload().first() == Some(&m),
            None => true,
        }
    }

    fn process_flow(&self, flow: &mut Flow) {
        self.processed.inc();
        if !flow.has_l7_info() {
            flow.set_l7_info(Box::new(self.name));
        }
    }
}
