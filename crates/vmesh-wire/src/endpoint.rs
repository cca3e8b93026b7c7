//! Typed Transport Endpoints
//!
//! An `Endpoint` names one way to reach a node. IP/UDP is the only
//! dialable variant today; node-relay and Ethernet variants exist for
//! locator and bridging use, and tag space is reserved for stream,
//! WebRTC, and WireGuard transports.

use vmesh_crypto::{Address, Fingerprint};

use crate::error::{WireError, WireResult};
use crate::inet::InetAddress;

const TYPE_NIL: u8 = 0;
const TYPE_NODE: u8 = 1;
const TYPE_ETHERNET: u8 = 2;
const TYPE_INET_V4: u8 = 3;
const TYPE_INET_V6: u8 = 4;
// 5..=8 reserved: stream, HTTP tunnel, WebRTC, WireGuard
const TYPE_RESERVED_MAX: u8 = 8;

/// Maximum marshaled endpoint size
pub const ENDPOINT_MARSHAL_SIZE_MAX: usize = 64;

/// A typed network endpoint
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Empty / unset
    Nil,
    /// Reach via another vmesh node (relay)
    Node(Fingerprint),
    /// Raw Ethernet MAC (bridged links)
    Ethernet([u8; 6]),
    /// IP/UDP address
    Inet(InetAddress),
}

impl Endpoint {
    /// Wire type tag
    pub fn type_id(&self) -> u8 {
        match self {
            Endpoint::Nil => TYPE_NIL,
            Endpoint::Node(_) => TYPE_NODE,
            Endpoint::Ethernet(_) => TYPE_ETHERNET,
            Endpoint::Inet(a) => {
                if a.is_v4() {
                    TYPE_INET_V4
                } else {
                    TYPE_INET_V6
                }
            }
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Endpoint::Nil)
    }

    pub fn is_inet(&self) -> bool {
        matches!(self, Endpoint::Inet(_))
    }

    /// The IP address, if this is an IP endpoint
    pub fn inet_addr(&self) -> Option<InetAddress> {
        match self {
            Endpoint::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.push(self.type_id());
        match self {
            Endpoint::Nil => {}
            Endpoint::Node(fp) => {
                out.extend_from_slice(&fp.address.to_bytes());
                out.extend_from_slice(&fp.hash);
            }
            Endpoint::Ethernet(mac) => out.extend_from_slice(mac),
            Endpoint::Inet(a) => {
                // The family is implied by the type tag; marshal only the
                // address body.
                let mut tmp = Vec::with_capacity(19);
                a.marshal(&mut tmp);
                out.extend_from_slice(&tmp[1..]);
            }
        }
    }

    pub fn unmarshal(data: &[u8]) -> WireResult<(Self, usize)> {
        if data.is_empty() {
            return Err(WireError::Truncated);
        }
        match data[0] {
            TYPE_NIL => Ok((Endpoint::Nil, 1)),
            TYPE_NODE => {
                if data.len() < 1 + 5 + 48 {
                    return Err(WireError::Truncated);
                }
                let address = Address::from_slice(&data[1..6])?;
                let mut hash = [0u8; 48];
                hash.copy_from_slice(&data[6..54]);
                Ok((Endpoint::Node(Fingerprint { address, hash }), 54))
            }
            TYPE_ETHERNET => {
                if data.len() < 7 {
                    return Err(WireError::Truncated);
                }
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&data[1..7]);
                Ok((Endpoint::Ethernet(mac), 7))
            }
            TYPE_INET_V4 => {
                let mut tmp = Vec::with_capacity(7);
                tmp.push(4);
                tmp.extend_from_slice(data.get(1..7).ok_or(WireError::Truncated)?);
                let (a, _) = InetAddress::unmarshal(&tmp)?;
                Ok((Endpoint::Inet(a), 7))
            }
            TYPE_INET_V6 => {
                let mut tmp = Vec::with_capacity(19);
                tmp.push(6);
                tmp.extend_from_slice(data.get(1..19).ok_or(WireError::Truncated)?);
                let (a, _) = InetAddress::unmarshal(&tmp)?;
                Ok((Endpoint::Inet(a), 19))
            }
            t if t <= TYPE_RESERVED_MAX => Err(WireError::UnsupportedEndpointType(t)),
            t => Err(WireError::UnsupportedEndpointType(t)),
        }
    }

    /// Canonical ordering key: type tag, then body bytes lexicographically.
    ///
    /// Locator signing sorts by this so identical endpoint sets always
    /// produce identical signed bytes.
    pub fn canonical_cmp(&self, other: &Endpoint) -> std::cmp::Ordering {
        let mut a = Vec::with_capacity(ENDPOINT_MARSHAL_SIZE_MAX);
        let mut b = Vec::with_capacity(ENDPOINT_MARSHAL_SIZE_MAX);
        self.marshal(&mut a);
        other.marshal(&mut b);
        a.cmp(&b)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Nil => write!(f, "nil"),
            Endpoint::Node(fp) => write!(f, "node/{}", fp.address),
            Endpoint::Ethernet(mac) => write!(
                f,
                "eth/{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            Endpoint::Inet(a) => write!(f, "udp/{}", a),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmesh_crypto::Address;

    fn inet(s: &str) -> Endpoint {
        Endpoint::Inet(s.parse().unwrap())
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let fp = Fingerprint::of(Address::from_u64(0x1122334455), b"key");
        let endpoints = [
            Endpoint::Nil,
            Endpoint::Node(fp),
            Endpoint::Ethernet([1, 2, 3, 4, 5, 6]),
            inet("203.0.113.10:793"),
            inet("[2001:db8::2]:793"),
        ];
        for ep in endpoints {
            let mut buf = Vec::new();
            ep.marshal(&mut buf);
            let (back, n) = Endpoint::unmarshal(&buf).unwrap();
            assert_eq!(n, buf.len());
            assert_eq!(back, ep);
        }
    }

    #[test]
    fn test_reserved_type_rejected() {
        assert!(matches!(
            Endpoint::unmarshal(&[5, 0, 0]),
            Err(WireError::UnsupportedEndpointType(5))
        ));
        assert!(matches!(
            Endpoint::unmarshal(&[200]),
            Err(WireError::UnsupportedEndpointType(200))
        ));
    }

    #[test]
    fn test_canonical_ordering_is_stable() {
        let mut v = vec![inet("9.9.9.9:2"), inet("1.1.1.1:5"), Endpoint::Nil];
        v.sort_by(|a, b| a.canonical_cmp(b));
        let mut w = vec![inet("1.1.1.1:5"), Endpoint::Nil, inet("9.9.9.9:2")];
        w.sort_by(|a, b| a.canonical_cmp(b));
        assert_eq!(v, w);
        // Nil (tag 0) sorts first
        assert_eq!(v[0], Endpoint::Nil);
    }
}
