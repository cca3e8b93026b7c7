//! IP Addresses with Scope Classification
//!
//! `InetAddress` wraps a socket address and adds the scope taxonomy the
//! transport cares about: self-awareness and path reset operate per
//! (family, scope), and some scopes are never learned as external
//! surfaces.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{WireError, WireResult};

/// Reach classification of an IP address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpScope {
    /// Unclassifiable (unspecified address)
    None,
    /// Loopback
    Loopback,
    /// Multicast
    Multicast,
    /// Link-local
    LinkLocal,
    /// RFC 1918 / ULA private space
    Private,
    /// Carrier-grade shared space (100.64/10)
    Shared,
    /// Publicly routable
    Global,
}

/// A transport-layer IP endpoint (address + port)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddress(SocketAddr);

impl InetAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn set_port(&mut self, port: u16) {
        self.0.set_port(port);
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn is_v4(&self) -> bool {
        self.0.is_ipv4()
    }

    /// Address-only equality, ignoring ports.
    ///
    /// NAT reboots reassign ports; paths that differ only by port are the
    /// same physical peer.
    pub fn ips_equal(&self, other: &InetAddress) -> bool {
        self.0.ip() == other.0.ip()
    }

    /// Classify the address reach
    pub fn scope(&self) -> IpScope {
        match self.0.ip() {
            IpAddr::V4(ip) => scope_v4(ip),
            IpAddr::V6(ip) => scope_v6(ip),
        }
    }

    /// Canonical wire form: `[4][ip4][port]` or `[6][ip16][port]`
    pub fn marshal(&self, out: &mut Vec<u8>) {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                out.push(4);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(6);
                out.extend_from_slice(&ip.octets());
            }
        }
        out.extend_from_slice(&self.0.port().to_be_bytes());
    }

    /// Decode from wire form, returning the address and bytes consumed
    pub fn unmarshal(data: &[u8]) -> WireResult<(Self, usize)> {
        if data.is_empty() {
            return Err(WireError::Truncated);
        }
        match data[0] {
            4 => {
                if data.len() < 7 {
                    return Err(WireError::Truncated);
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&data[1..5]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Self::new(IpAddr::V4(Ipv4Addr::from(ip)), port), 7))
            }
            6 => {
                if data.len() < 19 {
                    return Err(WireError::Truncated);
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Self::new(IpAddr::V6(Ipv6Addr::from(ip)), port), 19))
            }
            other => Err(WireError::InvalidPacket(format!(
                "unknown address family {}",
                other
            ))),
        }
    }
}

impl From<SocketAddr> for InetAddress {
    fn from(sa: SocketAddr) -> Self {
        Self(sa)
    }
}

impl From<InetAddress> for SocketAddr {
    fn from(a: InetAddress) -> Self {
        a.0
    }
}

impl std::fmt::Display for InetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InetAddress({})", self.0)
    }
}

impl std::str::FromStr for InetAddress {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|_| WireError::InvalidPacket(format!("bad socket address: {}", s)))
    }
}

fn scope_v4(ip: Ipv4Addr) -> IpScope {
    if ip.is_unspecified() {
        IpScope::None
    } else if ip.is_loopback() {
        IpScope::Loopback
    } else if ip.is_multicast() {
        IpScope::Multicast
    } else if ip.is_link_local() {
        IpScope::LinkLocal
    } else if ip.is_private() {
        IpScope::Private
    } else if is_shared_v4(ip) {
        IpScope::Shared
    } else {
        IpScope::Global
    }
}

fn scope_v6(ip: Ipv6Addr) -> IpScope {
    if ip.is_unspecified() {
        IpScope::None
    } else if ip.is_loopback() {
        IpScope::Loopback
    } else if ip.is_multicast() {
        IpScope::Multicast
    } else if (ip.segments()[0] & 0xffc0) == 0xfe80 {
        IpScope::LinkLocal
    } else if (ip.segments()[0] & 0xfe00) == 0xfc00 {
        IpScope::Private
    } else {
        IpScope::Global
    }
}

fn is_shared_v4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 100 && (o[1] & 0xc0) == 64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_roundtrip_v4() {
        let a: InetAddress = "203.0.113.10:793".parse().unwrap();
        let mut buf = Vec::new();
        a.marshal(&mut buf);
        let (b, n) = InetAddress::unmarshal(&buf).unwrap();
        assert_eq!(n, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn test_marshal_roundtrip_v6() {
        let a: InetAddress = "[2001:db8::1]:9993".parse().unwrap();
        let mut buf = Vec::new();
        a.marshal(&mut buf);
        let (b, n) = InetAddress::unmarshal(&buf).unwrap();
        assert_eq!(n, 19);
        assert_eq!(a, b);
    }

    #[test]
    fn test_scopes() {
        let cases: [(&str, IpScope); 7] = [
            ("127.0.0.1:1", IpScope::Loopback),
            ("10.1.2.3:1", IpScope::Private),
            ("169.254.0.5:1", IpScope::LinkLocal),
            ("100.64.9.9:1", IpScope::Shared),
            ("8.8.8.8:1", IpScope::Global),
            ("224.0.0.1:1", IpScope::Multicast),
            ("[fe80::1]:1", IpScope::LinkLocal),
        ];
        for (s, scope) in cases {
            let a: InetAddress = s.parse().unwrap();
            assert_eq!(a.scope(), scope, "{}", s);
        }
    }

    #[test]
    fn test_ips_equal_ignores_port() {
        let a: InetAddress = "192.168.1.1:100".parse().unwrap();
        let b: InetAddress = "192.168.1.1:200".parse().unwrap();
        assert!(a.ips_equal(&b));
        assert_ne!(a, b);
    }
}
