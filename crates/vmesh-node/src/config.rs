//! Node configuration

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A link on which encryption may be disabled because the physical
/// network is already trusted (e.g. a backplane). Packets arriving from
/// inside `network/prefix_len` carrying `id` in the MAC field are
/// accepted without a MAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPath {
    pub id: u64,
    pub network: IpAddr,
    pub prefix_len: u8,
}

impl TrustedPath {
    /// Whether an address falls inside this trusted network
    pub fn matches(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = 32u32.min(self.prefix_len as u32);
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = 128u32.min(self.prefix_len as u32);
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Default UDP port the host binds (advertised in locators)
    pub port: u16,

    /// Forward packets addressed to third parties (root/relay duty)
    pub allow_relay: bool,

    /// Enable aggressive NAT traversal (randomized port sweeps)
    pub nat_hostile: bool,

    /// Generate the hybrid (P-384) identity type for new identities
    pub hybrid_identity: bool,

    /// Load and persist peer records through the host state store
    pub cache_peers: bool,

    /// Links on which encryption is explicitly disabled
    pub trusted_paths: Vec<TrustedPath>,

    /// Software version advertised in HELLO (major, minor, revision)
    pub version: (u16, u16, u16),
}

impl NodeConfig {
    /// Version packed into a single u64 for the HELLO dictionary
    pub fn packed_version(&self) -> u64 {
        ((self.version.0 as u64) << 32) | ((self.version.1 as u64) << 16) | self.version.2 as u64
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: vmesh_wire::packet::DEFAULT_UDP_PORT,
            allow_relay: false,
            nat_hostile: false,
            hybrid_identity: false,
            cache_peers: true,
            trusted_paths: Vec::new(),
            version: (0, 2, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusted_path_matching() {
        let tp = TrustedPath {
            id: 42,
            network: "10.10.0.0".parse().unwrap(),
            prefix_len: 16,
        };
        assert!(tp.matches("10.10.3.4".parse().unwrap()));
        assert!(!tp.matches("10.11.3.4".parse().unwrap()));
        assert!(!tp.matches("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_packed_version() {
        let mut c = NodeConfig::default();
        c.version = (1, 2, 3);
        assert_eq!(c.packed_version(), (1u64 << 32) | (2 << 16) | 3);
    }

    #[test]
    fn test_default_port() {
        assert_eq!(NodeConfig::default().port, 793);
    }
}
