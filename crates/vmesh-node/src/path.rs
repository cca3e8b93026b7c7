//! Physical Paths
//!
//! A path is one (local socket, remote address) pairing. Paths are
//! canonicalized by the topology (one instance per key, shared by every
//! peer that uses it) and carry only atomics, so the hot receive path
//! never takes a lock here.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use vmesh_wire::InetAddress;

use crate::host::HostSystem;
use crate::PATH_ALIVE_TIMEOUT;

/// Latency value meaning "not yet measured"
const LATENCY_UNKNOWN: u32 = u32::MAX;

/// A (local socket, remote address) pair with liveness state
pub struct Path {
    local_socket: i64,
    address: InetAddress,
    last_send: AtomicI64,
    last_receive: AtomicI64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latency_ms: AtomicU32,
    /// Set by a self-awareness reset; cleared by the next receive
    demoted: AtomicBool,
}

impl Path {
    pub fn new(local_socket: i64, address: InetAddress) -> Self {
        Self {
            local_socket,
            address,
            last_send: AtomicI64::new(0),
            last_receive: AtomicI64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            latency_ms: AtomicU32::new(LATENCY_UNKNOWN),
            demoted: AtomicBool::new(false),
        }
    }

    pub fn local_socket(&self) -> i64 {
        self.local_socket
    }

    pub fn address(&self) -> &InetAddress {
        &self.address
    }

    /// Composite key used as a per-path hint (defragmenter budgets).
    /// Collisions are harmless; canonical lookup uses the full tuple.
    pub fn key(&self) -> u64 {
        path_key(self.local_socket, &self.address)
    }

    /// Record an inbound datagram of `bytes` at `now`
    pub fn received(&self, now: i64, bytes: usize) {
        self.last_receive.store(now, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.demoted.store(false, Ordering::Relaxed);
    }

    /// Record an outbound datagram of `bytes` at `now`
    pub fn sent(&self, now: i64, bytes: usize) {
        self.last_send.store(now, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Send a datagram on this path via the host and stamp last-send
    pub fn send(&self, host: &dyn HostSystem, data: &[u8], now: i64) {
        host.wire_send(self.local_socket, &self.address, data);
        self.sent(now, data.len());
    }

    pub fn last_send(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    /// Alive: received within the timeout and not demoted
    pub fn alive(&self, now: i64) -> bool {
        !self.demoted.load(Ordering::Relaxed)
            && (now - self.last_receive.load(Ordering::Relaxed)) < PATH_ALIVE_TIMEOUT
    }

    /// Mark not-alive until the next inbound datagram
    pub fn demote(&self) {
        self.demoted.store(true, Ordering::Relaxed);
    }

    /// Smoothed round-trip latency in milliseconds, if measured
    pub fn latency(&self) -> Option<u32> {
        match self.latency_ms.load(Ordering::Relaxed) {
            LATENCY_UNKNOWN => None,
            v => Some(v),
        }
    }

    /// Fold one measured round trip into the EWMA
    pub fn record_latency(&self, rtt_ms: u32) {
        let prev = self.latency_ms.load(Ordering::Relaxed);
        let next = if prev == LATENCY_UNKNOWN {
            rtt_ms
        } else {
            (prev * 3 + rtt_ms) / 4
        };
        self.latency_ms.store(next, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Path({} via socket {})", self.address, self.local_socket)
    }
}

/// Composite u64 hint for a (local socket, remote address) pair
pub fn path_key(local_socket: i64, address: &InetAddress) -> u64 {
    // FNV-1a over socket, address bytes, and port.
    let mut h: u64 = 0xcbf29ce484222325;
    let mut mix = |b: u8| {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    };
    for b in local_socket.to_le_bytes() {
        mix(b);
    }
    match address.ip() {
        std::net::IpAddr::V4(ip) => ip.octets().into_iter().for_each(&mut mix),
        std::net::IpAddr::V6(ip) => ip.octets().into_iter().for_each(&mut mix),
    }
    for b in address.port().to_le_bytes() {
        mix(b);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> InetAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_liveness_window() {
        let p = Path::new(1, addr("203.0.113.5:793"));
        assert!(!p.alive(1000));
        p.received(1000, 64);
        assert!(p.alive(1000 + PATH_ALIVE_TIMEOUT - 1));
        assert!(!p.alive(1000 + PATH_ALIVE_TIMEOUT));
    }

    #[test]
    fn test_demotion_cleared_by_receive() {
        let p = Path::new(1, addr("203.0.113.5:793"));
        p.received(1000, 10);
        p.demote();
        assert!(!p.alive(1001));
        p.received(1002, 10);
        assert!(p.alive(1003));
    }

    #[test]
    fn test_latency_ewma() {
        let p = Path::new(1, addr("203.0.113.5:793"));
        assert_eq!(p.latency(), None);
        p.record_latency(100);
        assert_eq!(p.latency(), Some(100));
        p.record_latency(20);
        assert_eq!(p.latency(), Some(80));
    }

    #[test]
    fn test_path_key_distinguishes() {
        let a = path_key(1, &addr("10.0.0.1:1"));
        let b = path_key(1, &addr("10.0.0.1:2"));
        let c = path_key(2, &addr("10.0.0.1:1"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, path_key(1, &addr("10.0.0.1:1")));
    }
}
