//! Topology: the Peer and Path Databases
//!
//! Canonicalizing maps: one `Peer` per address, one `Path` per
//! (local socket, remote address) pair, shared by reference everywhere.
//! Also owns the trusted root set, its ranked peer list, and the GC /
//! persistence pass that evicts idle entries through the host state
//! store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use vmesh_crypto::{Address, Fingerprint, Identity};
use vmesh_wire::{InetAddress, Locator};

use crate::host::StateObject;
use crate::node::Node;
use crate::path::Path;
use crate::peer::Peer;
use crate::{PATH_ALIVE_TIMEOUT, PEER_EVICT_TIMEOUT};

struct PeersInner {
    peers: HashMap<Address, Arc<Peer>>,
    roots: Vec<(Identity, Option<Locator>)>,
    /// Root peers ranked by latency, best first
    root_peers: Vec<Arc<Peer>>,
}

/// Serialized form of the root set
#[derive(Serialize, Deserialize)]
struct RootsRecord {
    roots: Vec<(String, Option<Vec<u8>>)>,
}

/// The peer and path databases
pub struct Topology {
    peers: RwLock<PeersInner>,
    paths: RwLock<HashMap<(i64, InetAddress), Arc<Path>>>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(PeersInner {
                peers: HashMap::new(),
                roots: Vec::new(),
                root_peers: Vec::new(),
            }),
            paths: RwLock::new(HashMap::new()),
        }
    }

    // --- peers --------------------------------------------------------------

    /// Look up a peer, optionally falling back to the host's cached
    /// record on a miss
    pub fn peer(&self, node: &Node, address: Address, load_from_cache: bool) -> Option<Arc<Peer>> {
        if let Some(p) = self.peers.read().peers.get(&address) {
            return Some(p.clone());
        }
        if !load_from_cache || !node.config().cache_peers {
            return None;
        }
        let loaded = self.load_cached(node, address)?;
        // Races resolve to the first-inserted entry.
        let mut inner = self.peers.write();
        Some(
            inner
                .peers
                .entry(address)
                .or_insert_with(|| Arc::new(loaded))
                .clone(),
        )
    }

    /// Insert a peer, returning the canonical entry (which may be a
    /// pre-existing or cached one — first insert wins)
    pub fn add_peer(&self, node: &Node, peer: Arc<Peer>) -> Arc<Peer> {
        let address = peer.address();
        {
            let inner = self.peers.read();
            if let Some(existing) = inner.peers.get(&address) {
                return existing.clone();
            }
        }
        let cached = if node.config().cache_peers {
            self.load_cached(node, address)
        } else {
            None
        };
        let mut inner = self.peers.write();
        inner
            .peers
            .entry(address)
            .or_insert_with(|| match cached {
                Some(c) => Arc::new(c),
                None => peer,
            })
            .clone()
    }

    fn load_cached(&self, node: &Node, address: Address) -> Option<Peer> {
        let blob = node.host().state_get(StateObject::Peer(address))?;
        match Peer::from_record(node.identity(), &blob, node.last_now()) {
            Ok(p) if p.address() == address => Some(p),
            _ => None,
        }
    }

    /// Find peers by the probe token we issued them
    pub fn peers_by_probe(&self, token: u32) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .peers
            .values()
            .filter(|p| p.local_probe() == token)
            .cloned()
            .collect()
    }

    /// Visit every peer
    pub fn each_peer(&self, mut f: impl FnMut(&Arc<Peer>)) {
        let peers: Vec<Arc<Peer>> = self.peers.read().peers.values().cloned().collect();
        for p in &peers {
            f(p);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().peers.len()
    }

    // --- paths --------------------------------------------------------------

    /// Canonical path for a (local socket, remote address) pair.
    /// Idempotent: all callers share one instance per key.
    pub fn path(&self, local_socket: i64, address: &InetAddress) -> Arc<Path> {
        {
            let paths = self.paths.read();
            if let Some(p) = paths.get(&(local_socket, *address)) {
                return p.clone();
            }
        }
        let mut paths = self.paths.write();
        paths
            .entry((local_socket, *address))
            .or_insert_with(|| Arc::new(Path::new(local_socket, *address)))
            .clone()
    }

    pub fn path_count(&self) -> usize {
        self.paths.read().len()
    }

    // --- roots --------------------------------------------------------------

    /// Add a trusted root. The locator, when present, must verify
    /// against the root identity.
    pub fn add_root(&self, node: &Node, identity: Identity, locator: Option<Locator>) -> bool {
        if identity == *node.identity() {
            return false;
        }
        if let Some(loc) = &locator {
            if !loc.verify(&identity) {
                return false;
            }
        }
        let work = {
            let mut inner = self.peers.write();
            if let Some(entry) = inner.roots.iter_mut().find(|(id, _)| *id == identity) {
                entry.1 = locator;
            } else {
                inner.roots.push((identity, locator));
            }
            self.update_root_peers(node, &mut inner)
        };
        self.apply_root_locators(node, work);
        self.write_root_list(node);
        true
    }

    /// Remove a root by fingerprint. An address-only fingerprint (zero
    /// hash) matches any key with that address.
    pub fn remove_root(&self, node: &Node, fp: &Fingerprint) -> bool {
        let (removed, work) = {
            let mut inner = self.peers.write();
            let before = inner.roots.len();
            inner.roots.retain(|(id, _)| {
                id.address() != fp.address || (fp.have_hash() && id.fingerprint() != *fp)
            });
            let removed = inner.roots.len() != before;
            let work = if removed {
                self.update_root_peers(node, &mut inner)
            } else {
                Vec::new()
            };
            (removed, work)
        };
        self.apply_root_locators(node, work);
        if removed {
            self.write_root_list(node);
        }
        removed
    }

    /// Whether an identity is a configured root
    pub fn is_root(&self, identity: &Identity) -> bool {
        self.peers.read().roots.iter().any(|(id, _)| id == identity)
    }

    /// The best (lowest latency) root peer
    pub fn root(&self) -> Option<Arc<Peer>> {
        self.peers.read().root_peers.first().cloned()
    }

    /// Re-sort root peers by measured latency
    pub fn rank_roots(&self) {
        let mut inner = self.peers.write();
        inner.root_peers.sort_by(root_rank);
    }

    /// Any root has an alive direct path
    pub fn any_root_alive(&self, now: i64) -> bool {
        let roots: Vec<Arc<Peer>> = self.peers.read().root_peers.clone();
        roots.iter().any(|r| r.direct_path(now).is_some())
    }

    /// Rebuild the root peer list: every root identity gets a live Peer
    /// entry. Returns the (peer, locator) pairs whose locators must be
    /// applied by the caller after the map lock is released (peer locks
    /// are below the peer-map lock in the acquisition order).
    fn update_root_peers(&self, node: &Node, inner: &mut PeersInner) -> Vec<(Arc<Peer>, Locator)> {
        let now = node.last_now();
        let mut rp = Vec::with_capacity(inner.roots.len());
        let mut work = Vec::new();
        let roots = inner.roots.clone();
        for (id, locator) in &roots {
            let peer = match inner.peers.get(&id.address()) {
                Some(p) if p.identity() == id => p.clone(),
                _ => match Peer::new(node.identity(), id.clone(), now) {
                    Ok(p) => {
                        let p = Arc::new(p);
                        inner.peers.insert(id.address(), p.clone());
                        p
                    }
                    Err(_) => continue,
                },
            };
            if let Some(loc) = locator {
                work.push((peer.clone(), loc.clone()));
            }
            rp.push(peer);
        }
        rp.sort_by(root_rank);
        inner.root_peers = rp;
        work
    }

    /// Install root locators and seed try-queues with their endpoints
    fn apply_root_locators(&self, node: &Node, work: Vec<(Arc<Peer>, Locator)>) {
        let now = node.last_now();
        for (peer, loc) in work {
            peer.set_locator(loc.clone());
            for ep in loc.endpoints() {
                peer.try_direct_path(now, *ep, false);
            }
        }
    }

    // --- persistence and GC --------------------------------------------------

    /// Load the root set from the host state store
    pub fn load_root_list(&self, node: &Node) {
        let Some(blob) = node.host().state_get(StateObject::Roots) else {
            return;
        };
        let Ok(record) = bincode::deserialize::<RootsRecord>(&blob) else {
            node.trace()
                .unexpected_error(0x39812344, "unreadable root list in state store".into());
            return;
        };
        let work = {
            let mut inner = self.peers.write();
            for (id_str, loc_bytes) in record.roots {
                let Ok(identity) = id_str.parse::<Identity>() else {
                    continue;
                };
                let locator = loc_bytes
                    .and_then(|b| Locator::unmarshal(&b).ok())
                    .map(|(loc, _)| loc);
                if !inner.roots.iter().any(|(id, _)| *id == identity) {
                    inner.roots.push((identity, locator));
                }
            }
            self.update_root_peers(node, &mut inner)
        };
        self.apply_root_locators(node, work);
    }

    fn write_root_list(&self, node: &Node) {
        let record = {
            let inner = self.peers.read();
            RootsRecord {
                roots: inner
                    .roots
                    .iter()
                    .map(|(id, loc)| {
                        (
                            id.to_string_with_private(false),
                            loc.as_ref().map(Locator::marshal),
                        )
                    })
                    .collect(),
            }
        };
        match bincode::serialize(&record) {
            Ok(blob) => {
                let _ = node.host().state_put(StateObject::Roots, Some(&blob));
            }
            Err(e) => node
                .trace()
                .unexpected_error(0x8a1cd013, format!("failed to serialize root list: {}", e)),
        }
    }

    /// GC pass: persist and evict idle non-root peers, drop unreferenced
    /// dead paths
    pub fn do_periodic_tasks(&self, node: &Node, now: i64) {
        let evicted: Vec<Arc<Peer>> = {
            let mut inner = self.peers.write();
            let root_addrs: Vec<Address> =
                inner.roots.iter().map(|(id, _)| id.address()).collect();
            let mut evicted = Vec::new();
            inner.peers.retain(|addr, peer| {
                let keep = (now - peer.last_receive()) <= PEER_EVICT_TIMEOUT
                    || root_addrs.contains(addr);
                if !keep {
                    evicted.push(peer.clone());
                }
                keep
            });
            evicted
        };
        if node.config().cache_peers {
            for peer in evicted {
                peer.save(node, now);
            }
        }

        let mut paths = self.paths.write();
        paths.retain(|_, p| Arc::strong_count(p) > 1 || (now - p.last_receive()) < PATH_ALIVE_TIMEOUT);
    }

    /// Persist every peer (shutdown path)
    pub fn save_all(&self, node: &Node, now: i64) {
        if !node.config().cache_peers {
            return;
        }
        self.each_peer(|p| p.save(node, now));
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

fn root_rank(a: &Arc<Peer>, b: &Arc<Peer>) -> std::cmp::Ordering {
    // Lowest latency first; unmeasured roots last.
    a.latency()
        .unwrap_or(u32::MAX)
        .cmp(&b.latency().unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_canonicalization() {
        let t = Topology::new();
        let addr: InetAddress = "203.0.113.5:793".parse().unwrap();
        let a = t.path(1, &addr);
        let b = t.path(1, &addr);
        assert!(Arc::ptr_eq(&a, &b));

        let c = t.path(2, &addr);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(t.path_count(), 2);
    }
}
