//! Connection identity for flow tracking

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// 5-tuple flow key
///
/// Addresses are stored as `u128` (IPv4 in the low bits) so the key stays
/// `Copy` and hashes without touching the enum discriminant of `IpAddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlowKey {
    /// Source IP (v4 stored in low bits)
    pub src_ip: u128,
    /// Destination IP
    pub dst_ip: u128,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// IP protocol
    pub protocol: u8,
    /// Address family marker
    pub v6: bool,
}

impl FlowKey {
    /// Create from IPv4 tuple
    #[inline(always)]
    pub const fn from_v4(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            src_ip: u32::from_be_bytes(src.octets()) as u128,
            dst_ip: u32::from_be_bytes(dst.octets()) as u128,
            src_port,
            dst_port,
            protocol,
            v6: false,
        }
    }

    /// Create from IPv6 tuple
    #[inline(always)]
    pub const fn from_v6(
        src: Ipv6Addr,
        dst: Ipv6Addr,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            src_ip: u128::from_be_bytes(src.octets()),
            dst_ip: u128::from_be_bytes(dst.octets()),
            src_port,
            dst_port,
            protocol,
            v6: true,
        }
    }

    /// Create from a pair of addresses; mixed families yield `None`
    pub fn from_addrs(
        src: IpAddr,
        dst: IpAddr,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
    ) -> Option<Self> {
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => Some(Self::from_v4(s, d, src_port, dst_port, protocol)),
            (IpAddr::V6(s), IpAddr::V6(d)) => Some(Self::from_v6(s, d, src_port, dst_port, protocol)),
            _ => None,
        }
    }

    /// Get reverse flow key (for bidirectional matching)
    #[inline(always)]
    pub const fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
            v6: self.v6,
        }
    }

    /// Source address
    pub fn src_addr(&self) -> IpAddr {
        self.addr(self.src_ip)
    }

    /// Destination address
    pub fn dst_addr(&self) -> IpAddr {
        self.addr(self.dst_ip)
    }

    fn addr(&self, raw: u128) -> IpAddr {
        if self.v6 {
            IpAddr::V6(Ipv6Addr::from(raw))
        } else {
            IpAddr::V4(Ipv4Addr::from(raw as u32))
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            6 => "TCP".to_string(),
            17 => "UDP".to_string(),
            1 => "ICMP".to_string(),
            other => other.to_string(),
        };
        write!(
            f,
            "[{}:{}]:{}:[{}:{}]",
            self.src_addr(),
            self.src_port,
            proto,
            self.dst_addr(),
            self.dst_port
        )
    }
}

/// Direction of a packet relative to the flow that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowDirection {
    /// Same direction as the packet that created the flow
    #[default]
    Upstream,
    /// Reply direction
    Downstream,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_roundtrip() {
        let key = FlowKey::from_v4(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            12345,
            443,
            6,
        );
        let rev = key.reverse();
        assert_eq!(rev.src_port, 443);
        assert_eq!(rev.dst_addr(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(rev.reverse(), key);
        assert_ne!(rev, key);
    }

    #[test]
    fn test_display() {
        let key = FlowKey::from_v4(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            5353,
            53,
            17,
        );
        assert_eq!(key.to_string(), "[192.168.1.1:5353]:UDP:[10.0.0.1:53]");
    }

    #[test]
    fn test_mixed_family_rejected() {
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(FlowKey::from_addrs(v4, v6, 1, 2, 6).is_none());
        let key = FlowKey::from_addrs(v6, v6, 1, 2, 6).unwrap();
        assert!(key.v6);
        assert_eq!(key.src_addr(), v6);
    }
}
