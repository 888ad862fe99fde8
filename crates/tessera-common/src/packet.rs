//! Packet view passed between layers
//!
//! A `Packet` is a window over a captured frame. Moving up one layer slices
//! the window forward; the underlying buffer is shared, never copied.

use bytes::Bytes;
use std::net::IpAddr;

/// Packet view plus the metadata lower layers attach to it
#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// Bytes from the start of this layer's header to the end of the frame
    data: Bytes,
    /// Size of the header consumed by the layer below
    prev_header_size: usize,
    /// Capture time in seconds
    timestamp: u64,
    /// Source address (set by the IP layer)
    src_addr: Option<IpAddr>,
    /// Destination address (set by the IP layer)
    dst_addr: Option<IpAddr>,
    /// IP protocol number (set by the IP layer)
    ip_protocol: u8,
    /// Transport source port
    src_port: u16,
    /// Transport destination port
    dst_port: u16,
    /// Tunnel tag (e.g. VXLAN network identifier)
    tag: Option<u32>,
    /// Set when a decoder flagged this packet as evidence
    evidence: bool,
}

impl Packet {
    /// Create a packet over a captured frame
    pub fn new(data: impl Into<Bytes>, timestamp: u64) -> Self {
        Self {
            data: data.into(),
            timestamp,
            ..Default::default()
        }
    }

    /// Create the view for the next layer, skipping `header_size` bytes.
    ///
    /// Metadata is inherited; returns `None` when the header does not fit.
    pub fn child(&self, header_size: usize) -> Option<Packet> {
        if header_size > self.data.len() {
            return None;
        }
        Some(Self {
            data: self.data.slice(header_size..),
            prev_header_size: header_size,
            evidence: false,
            ..self.clone()
        })
    }

    /// Create a packet over an arbitrary sub-range of this packet's payload
    pub fn slice(&self, start: usize, end: usize) -> Option<Packet> {
        if start > end || end > self.data.len() {
            return None;
        }
        Some(Self {
            data: self.data.slice(start..end),
            prev_header_size: start,
            evidence: false,
            ..self.clone()
        })
    }

    /// Payload slice
    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Shared payload buffer
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Payload length
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop trailing bytes beyond `len` (link layer padding)
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Header size consumed by the previous layer
    pub fn prev_header_size(&self) -> usize {
        self.prev_header_size
    }

    /// Capture time in seconds
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Set the capture time in seconds
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    /// Record the network addresses of this packet
    pub fn set_addresses(&mut self, src: IpAddr, dst: IpAddr, protocol: u8) {
        self.src_addr = Some(src);
        self.dst_addr = Some(dst);
        self.ip_protocol = protocol;
    }

    /// Source address, when an IP layer has been decoded
    pub fn src_addr(&self) -> Option<IpAddr> {
        self.src_addr
    }

    /// Destination address, when an IP layer has been decoded
    pub fn dst_addr(&self) -> Option<IpAddr> {
        self.dst_addr
    }

    /// IP protocol number
    pub fn ip_protocol(&self) -> u8 {
        self.ip_protocol
    }

    /// Record transport ports
    pub fn set_ports(&mut self, src: u16, dst: u16) {
        self.src_port = src;
        self.dst_port = dst;
    }

    /// Transport source port
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Transport destination port
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Tunnel tag
    pub fn tag(&self) -> Option<u32> {
        self.tag
    }

    /// Set tunnel tag
    pub fn set_tag(&mut self, tag: u32) {
        self.tag = Some(tag);
    }

    /// Evidence flag
    pub fn have_evidence(&self) -> bool {
        self.evidence
    }

    /// Set evidence flag
    pub fn set_evidence(&mut self, evidence: bool) {
        self.evidence = evidence;
    }

    /// Read a big-endian u16 at `offset`
    #[inline(always)]
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let b = self.data.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32 at `offset`
    #[inline(always)]
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset + 4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_child_inherits_metadata() {
        let mut pkt = Packet::new(vec![0u8; 64], 100);
        pkt.set_tag(42);
        pkt.set_addresses(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            17,
        );
        pkt.set_evidence(true);

        let child = pkt.child(14).unwrap();
        assert_eq!(child.len(), 50);
        assert_eq!(child.prev_header_size(), 14);
        assert_eq!(child.tag(), Some(42));
        assert_eq!(child.timestamp(), 100);
        assert_eq!(child.ip_protocol(), 17);
        // Evidence is per layer; parents collect it from children
        assert!(!child.have_evidence());
    }

    #[test]
    fn test_child_too_short() {
        let pkt = Packet::new(vec![0u8; 10], 0);
        assert!(pkt.child(14).is_none());
        assert!(pkt.child(10).unwrap().is_empty());
    }

    #[test]
    fn test_read_helpers() {
        let pkt = Packet::new(vec![0x08, 0x00, 0xde, 0xad, 0xbe, 0xef], 0);
        assert_eq!(pkt.read_u16(0), Some(0x0800));
        assert_eq!(pkt.read_u32(2), Some(0xdeadbeef));
        assert_eq!(pkt.read_u32(4), None);
    }

    #[test]
    fn test_slice_bounds() {
        let pkt = Packet::new(vec![1u8, 2, 3, 4, 5], 0);
        assert_eq!(pkt.slice(1, 3).unwrap().payload(), &[2, 3]);
        assert!(pkt.slice(3, 6).is_none());
        assert!(pkt.slice(4, 3).is_none());
    }
}
