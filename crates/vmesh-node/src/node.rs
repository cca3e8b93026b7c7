//! The Embeddable Node
//!
//! `Node` wires the transport together: identity, topology, the VL1
//! dispatcher, the reply-expectation table, self-awareness, and the
//! trace emitter. The host drives it through the `process_*` entry
//! points from any thread; the node never blocks on I/O and never
//! spawns tasks of its own.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tracing::info;

use vmesh_crypto::{Address, Fingerprint, Identity, IdentityKind};
use vmesh_wire::packet::{self, CipherSuite, Verb, MAX_UDP_PAYLOAD};
use vmesh_wire::{BufPool, Endpoint, InetAddress, Locator};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::expect::Expect;
use crate::host::{Event, HostSystem, NoVl2, ResultCode, StateObject, Vl2Handler};
use crate::peer::Peer;
use crate::selfaware::SelfAwareness;
use crate::topology::Topology;
use crate::trace::Trace;
use crate::vl1::Vl1;
use crate::{BACKGROUND_TASK_INTERVAL, TOPOLOGY_GC_INTERVAL};

/// The transport node
pub struct Node {
    identity: Identity,
    config: NodeConfig,
    host: Arc<dyn HostSystem>,
    vl2: Arc<dyn Vl2Handler>,
    topology: Topology,
    vl1: Vl1,
    expect: Expect,
    self_awareness: SelfAwareness,
    trace: Trace,
    buf_pool: BufPool,
    online: AtomicBool,
    last_now: AtomicI64,
    last_topology_gc: AtomicI64,
}

impl Node {
    /// Construct a node. Loads (or generates and persists) the identity
    /// through the host state store, then restores the root set.
    pub fn new(
        host: Arc<dyn HostSystem>,
        vl2: Option<Arc<dyn Vl2Handler>>,
        config: NodeConfig,
        now: i64,
    ) -> NodeResult<Arc<Self>> {
        let identity = Self::load_or_generate_identity(&*host, &config, now)?;
        info!(address = %identity.address(), "node identity ready");

        let node = Arc::new(Self {
            identity,
            config,
            trace: Trace::new(host.clone()),
            host,
            vl2: vl2.unwrap_or_else(|| Arc::new(NoVl2)),
            topology: Topology::new(),
            vl1: Vl1::new(),
            expect: Expect::new(),
            self_awareness: SelfAwareness::new(),
            buf_pool: BufPool::default(),
            online: AtomicBool::new(false),
            last_now: AtomicI64::new(now),
            last_topology_gc: AtomicI64::new(now),
        });

        node.topology.load_root_list(&node);
        node.host.event(Event::Up);
        Ok(node)
    }

    fn load_or_generate_identity(
        host: &dyn HostSystem,
        config: &NodeConfig,
        _now: i64,
    ) -> NodeResult<Identity> {
        if let Some(bytes) = host.state_get(StateObject::IdentitySecret) {
            if let Some(id) = std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<Identity>().ok())
            {
                if id.has_private() && id.locally_validate() {
                    return Ok(id);
                }
            }
            // Fall through: an unreadable or invalid stored identity is
            // replaced, not fatal.
        }

        let kind = if config.hybrid_identity {
            IdentityKind::P384Hybrid
        } else {
            IdentityKind::Curve25519
        };
        let id = Identity::generate(kind);
        let secret = id.to_string_with_private(true);
        let public = id.to_string_with_private(false);
        if !host.state_put(StateObject::IdentitySecret, Some(secret.as_bytes()))
            || !host.state_put(StateObject::IdentityPublic, Some(public.as_bytes()))
        {
            return Err(NodeError::DataStore(
                "failed to persist newly generated identity".into(),
            ));
        }
        Ok(id)
    }

    // --- accessors used across the crate -------------------------------------

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn host(&self) -> &dyn HostSystem {
        &*self.host
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn expect(&self) -> &Expect {
        &self.expect
    }

    pub fn self_awareness(&self) -> &SelfAwareness {
        &self.self_awareness
    }

    pub fn buf_pool(&self) -> &BufPool {
        &self.buf_pool
    }

    pub fn vl2(&self) -> &dyn Vl2Handler {
        &*self.vl2
    }

    /// Most recent `now` seen by any entry point
    pub fn last_now(&self) -> i64 {
        self.last_now.load(Ordering::Relaxed)
    }

    /// Whether any root currently has an alive path
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    // --- entry points ---------------------------------------------------------

    /// Feed one received datagram into the transport
    pub fn process_wire_packet(
        &self,
        now: i64,
        local_socket: i64,
        from: &InetAddress,
        data: &[u8],
    ) -> ResultCode {
        self.last_now.store(now, Ordering::Relaxed);
        self.vl1.on_wire_packet(self, now, local_socket, from, data);
        ResultCode::Ok
    }

    /// Hand an outbound virtual network frame to the VL2 layer
    pub fn process_virtual_network_frame(
        &self,
        now: i64,
        network_id: u64,
        vlan_id: u16,
        frame: &[u8],
    ) -> ResultCode {
        self.last_now.store(now, Ordering::Relaxed);
        if self.vl2.outbound_frame(network_id, vlan_id, frame) {
            ResultCode::Ok
        } else {
            ResultCode::NetworkNotFound
        }
    }

    /// Periodic maintenance: peer pulses, WHOIS retries, expirations,
    /// topology GC, and online/offline edges. Returns the suggested
    /// time of the next call.
    pub fn process_background_tasks(&self, now: i64) -> i64 {
        self.last_now.store(now, Ordering::Relaxed);

        self.topology.rank_roots();
        self.topology.each_peer(|p| {
            let is_root = self.topology.is_root(p.identity());
            p.pulse(self, now, is_root);
        });

        self.vl1.send_pending_whois(self, now);
        self.vl1.gc(now);
        self.expect.gc(now);
        self.self_awareness.clean(now);

        if now - self.last_topology_gc.load(Ordering::Relaxed) >= TOPOLOGY_GC_INTERVAL {
            self.last_topology_gc.store(now, Ordering::Relaxed);
            self.topology.do_periodic_tasks(self, now);
        }

        let online = self.topology.any_root_alive(now);
        if online != self.online.swap(online, Ordering::Relaxed) {
            self.host.event(if online { Event::Online } else { Event::Offline });
        }

        now + BACKGROUND_TASK_INTERVAL
    }

    // --- operations -----------------------------------------------------------

    /// Add a trusted root, optionally with a signed locator describing
    /// where to reach it
    pub fn add_root(&self, identity: Identity, locator: Option<Locator>) -> bool {
        self.topology.add_root(self, identity, locator)
    }

    /// Remove a root by fingerprint
    pub fn remove_root(&self, fp: &Fingerprint) -> bool {
        self.topology.remove_root(self, fp)
    }

    /// Learn a peer identity out of band (e.g. from the application).
    /// The identity must pass local proof-of-work validation.
    pub fn add_peer_identity(&self, identity: Identity, now: i64) -> Option<Arc<Peer>> {
        if identity.address() == self.address() || !identity.locally_validate() {
            return None;
        }
        let peer = Peer::new(&self.identity, identity, now).ok()?;
        Some(self.topology.add_peer(self, Arc::new(peer)))
    }

    /// Send an ECHO to a known peer; the reply feeds path latency
    pub fn send_echo(&self, now: i64, to: Address, payload: &[u8]) -> bool {
        self.last_now.store(now, Ordering::Relaxed);
        let Some(peer) = self.topology.peer(self, to, true) else {
            return false;
        };
        self.vl1.send_echo(self, now, &peer, payload)
    }

    /// Send an opaque USER_MESSAGE to a known peer, fragmenting when it
    /// exceeds the datagram budget
    pub fn send_user_message(&self, now: i64, to: Address, type_id: u64, data: &[u8]) -> bool {
        self.last_now.store(now, Ordering::Relaxed);
        let Some(peer) = self.topology.peer(self, to, true) else {
            return false;
        };
        let mut pkt = packet::compose(to, self.address(), Verb::UserMessage);
        pkt.extend_from_slice(&type_id.to_be_bytes());
        pkt.extend_from_slice(data);
        let key = peer.send_key(now);
        packet::armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);

        if pkt.len() <= MAX_UDP_PAYLOAD {
            return peer.send(self, now, &pkt);
        }
        let Ok(frags) = packet::fragment(&pkt, MAX_UDP_PAYLOAD) else {
            return false;
        };
        for frag in &frags {
            if !peer.send(self, now, frag) {
                return false;
            }
        }
        true
    }

    /// Introduce two peers (root duty): tell `to` to try reaching
    /// `about` at `at`
    pub fn send_rendezvous(&self, now: i64, to: Address, about: Address, at: &InetAddress) -> bool {
        self.last_now.store(now, Ordering::Relaxed);
        let Some(peer) = self.topology.peer(self, to, true) else {
            return false;
        };
        let mut pkt = packet::compose(to, self.address(), Verb::Rendezvous);
        pkt.push(0); // flags
        pkt.extend_from_slice(&about.to_bytes());
        pkt.extend_from_slice(&at.port().to_be_bytes());
        match at.ip() {
            std::net::IpAddr::V4(ip) => {
                pkt.push(4);
                pkt.extend_from_slice(&ip.octets());
            }
            std::net::IpAddr::V6(ip) => {
                pkt.push(16);
                pkt.extend_from_slice(&ip.octets());
            }
        }
        let key = peer.send_key(now);
        packet::armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);
        peer.send(self, now, &pkt)
    }

    /// Sign and persist a locator advertising our endpoints
    pub fn create_locator(&self, now: i64, endpoints: &[Endpoint]) -> NodeResult<Locator> {
        let mut loc = Locator::new();
        for ep in endpoints {
            if !loc.add(*ep) {
                return Err(NodeError::BadParameter("too many endpoints".into()));
            }
        }
        loc.sign(now, &self.identity)?;
        let _ = self
            .host
            .state_put(StateObject::Locator, Some(&loc.marshal()));
        Ok(loc)
    }

    /// Drain and persist state; emits Down. The host must have quiesced
    /// its ingress threads before calling.
    pub fn shutdown(&self, now: i64) {
        self.last_now.store(now, Ordering::Relaxed);
        self.topology.save_all(self, now);
        self.host.event(Event::Down);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({})", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{PacketDropReason, TraceEvent};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory host: collects outbound datagrams and events
    struct TestHost {
        addr: InetAddress,
        outbox: Mutex<Vec<(i64, InetAddress, Vec<u8>)>>,
        events: Mutex<Vec<Event>>,
        state: Mutex<HashMap<StateObject, Vec<u8>>>,
    }

    impl TestHost {
        fn new(addr: &str) -> Arc<Self> {
            Arc::new(Self {
                addr: addr.parse().unwrap(),
                outbox: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                state: Mutex::new(HashMap::new()),
            })
        }

        fn drain(&self) -> Vec<(i64, InetAddress, Vec<u8>)> {
            std::mem::take(&mut *self.outbox.lock())
        }

        fn user_messages(&self) -> Vec<(Address, u64, Vec<u8>)> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    Event::UserMessage {
                        source,
                        type_id,
                        data,
                    } => Some((*source, *type_id, data.to_vec())),
                    _ => None,
                })
                .collect()
        }

        fn drop_reasons(&self) -> Vec<PacketDropReason> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    Event::Trace(TraceEvent::PacketDropped { reason, .. }) => Some(*reason),
                    _ => None,
                })
                .collect()
        }
    }

    impl HostSystem for TestHost {
        fn wire_send(&self, local_socket: i64, address: &InetAddress, data: &[u8]) {
            self.outbox
                .lock()
                .push((local_socket, *address, data.to_vec()));
        }

        fn state_put(&self, object: StateObject, data: Option<&[u8]>) -> bool {
            let mut state = self.state.lock();
            match data {
                Some(d) => {
                    state.insert(object, d.to_vec());
                }
                None => {
                    state.remove(&object);
                }
            }
            true
        }

        fn state_get(&self, object: StateObject) -> Option<Vec<u8>> {
            self.state.lock().get(&object).cloned()
        }

        fn event(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    struct Net {
        nodes: Vec<(Arc<Node>, Arc<TestHost>)>,
    }

    impl Net {
        fn node(addr: &str, config: NodeConfig, now: i64) -> (Arc<Node>, Arc<TestHost>) {
            let host = TestHost::new(addr);
            let node = Node::new(host.clone(), None, config, now).unwrap();
            (node, host)
        }

        /// Deliver queued datagrams between nodes until traffic stops
        fn pump(&self, now: i64) {
            for _ in 0..32 {
                let mut delivered = false;
                for (_, from_host) in &self.nodes {
                    for (_sock, to_addr, data) in from_host.drain() {
                        if let Some((to_node, _)) =
                            self.nodes.iter().find(|(_, h)| h.addr == to_addr)
                        {
                            to_node.process_wire_packet(now, 1, &from_host.addr, &data);
                            delivered = true;
                        }
                    }
                }
                if !delivered {
                    return;
                }
            }
        }
    }

    fn two_connected_nodes(now: i64) -> Net {
        let (a, ha) = Net::node("203.0.113.1:793", NodeConfig::default(), now);
        let (b, hb) = Net::node("203.0.113.2:793", NodeConfig::default(), now);

        // A knows B as a root reachable at B's address.
        let mut loc = Locator::new();
        loc.add(Endpoint::Inet(hb.addr));
        // The locator is built and signed by B's side in reality; here we
        // borrow B's identity since the test holds it.
        let b_id_full: Identity = String::from_utf8(
            hb.state.lock()[&StateObject::IdentitySecret].clone(),
        )
        .unwrap()
        .parse()
        .unwrap();
        loc.sign(now, &b_id_full).unwrap();
        assert!(a.add_root(b_id_full.to_string_with_private(false).parse().unwrap(), Some(loc)));

        let net = Net {
            nodes: vec![(a.clone(), ha), (b.clone(), hb)],
        };

        // A pulses (HELLO to B), then traffic settles.
        a.process_background_tasks(now);
        net.pump(now);
        net.nodes[0].0.process_background_tasks(now + 10);
        net.nodes[1].0.process_background_tasks(now + 10);
        net.pump(now + 10);
        net
    }

    #[test]
    fn test_cold_start_handshake_and_echo() {
        let now = 1_700_000_000_000;
        let net = two_connected_nodes(now);
        let (a, _) = &net.nodes[0];
        let (b, _) = &net.nodes[1];

        // Both sides ended with a peer entry and a direct path.
        let b_at_a = a.topology().peer(a, b.address(), false).expect("A knows B");
        let a_at_b = b.topology().peer(b, a.address(), false).expect("B knows A");
        assert!(b_at_a.direct_path(now + 20).is_some());
        assert!(a_at_b.direct_path(now + 20).is_some());
        // The handshake established ephemeral keys (remote version known
        // implies OK(HELLO) round trip completed).
        assert!(b_at_a.protocol_version() >= 11);
        assert!(a_at_b.protocol_version() >= 11);

        // ECHO round trip with payload equality, correlated via Expect.
        let path = b_at_a.direct_path(now + 20).unwrap();
        assert!(a.send_echo(now + 20, b.address(), &[0x01, 0x02, 0x03]));
        net.pump(now + 25);
        assert!(path.latency().is_some(), "OK(ECHO) payload matched and correlated");
    }

    #[test]
    fn test_fragmented_packet_out_of_order() {
        let now = 1_700_000_000_000;
        let net = two_connected_nodes(now);
        let (a, ha) = &net.nodes[0];
        let (b, hb) = &net.nodes[1];

        // A 5000-byte message must fragment.
        let payload = vec![0x5au8; 5000];
        assert!(a.send_user_message(now + 20, b.address(), 99, &payload));
        let frags: Vec<_> = ha.drain();
        assert_eq!(frags.len(), 4, "expected head plus three fragments");

        // Deliver in order 2, 0, 3, 1.
        for idx in [2usize, 0, 3, 1] {
            let (_, _, data) = &frags[idx];
            b.process_wire_packet(now + 21, 1, &ha.addr, data);
        }
        let messages = hb.user_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, a.address());
        assert_eq!(messages[0].1, 99);
        assert_eq!(messages[0].2, payload);

        // Redelivering a fragment never dispatches a second time.
        let (_, _, dup) = &frags[1];
        b.process_wire_packet(now + 22, 1, &ha.addr, dup);
        assert_eq!(hb.user_messages().len(), 1);
    }

    #[test]
    fn test_whois_via_root() {
        let now = 1_700_000_000_000;
        let (r, hr) = Net::node(
            "203.0.113.9:793",
            NodeConfig {
                allow_relay: true,
                ..NodeConfig::default()
            },
            now,
        );
        let (a, ha) = Net::node("203.0.113.10:793", NodeConfig::default(), now);
        let (c, hc) = Net::node("203.0.113.11:793", NodeConfig::default(), now);

        let r_id: Identity = String::from_utf8(hr.state.lock()[&StateObject::IdentitySecret].clone())
            .unwrap()
            .parse()
            .unwrap();
        let r_public: Identity = r_id.to_string_with_private(false).parse().unwrap();
        let mut loc = Locator::new();
        loc.add(Endpoint::Inet(hr.addr));
        loc.sign(now, &r_id).unwrap();

        assert!(a.add_root(r_public.clone(), Some(loc.clone())));
        assert!(c.add_root(r_public, Some(loc)));

        let net = Net {
            nodes: vec![(r.clone(), hr), (a.clone(), ha), (c.clone(), hc)],
        };
        for step in 0..4 {
            let t = now + step * 10;
            for (n, _) in &net.nodes {
                n.process_background_tasks(t);
            }
            net.pump(t);
        }

        // A learns C's identity out of band and sends it a message. With
        // no direct path, it relays through R; C does not know A yet and
        // must WHOIS the root first.
        let c_public: Identity = c.identity().to_string_with_private(false).parse().unwrap();
        assert!(a.add_peer_identity(c_public, now + 100).is_some());
        assert!(a.send_user_message(now + 100, c.address(), 7, b"via root"));

        for step in 0..6 {
            let t = now + 101 + step * crate::WHOIS_RETRY_DELAY;
            net.pump(t);
            for (n, _) in &net.nodes {
                n.process_background_tasks(t);
            }
        }
        net.pump(now + 200 + 6 * crate::WHOIS_RETRY_DELAY);

        let messages = net.nodes[2].1.user_messages();
        assert_eq!(messages.len(), 1, "queued packet replayed after OK(WHOIS)");
        assert_eq!(messages[0].0, a.address());
        assert_eq!(messages[0].2, b"via root");
    }

    #[test]
    fn test_rendezvous_drives_hole_punch() {
        let now = 1_700_000_000_000;
        let net = two_connected_nodes(now);
        let (a, ha) = &net.nodes[0];
        let (b, _) = &net.nodes[1];
        // B is A's root in this fixture, so a RENDEZVOUS from B is honored.

        let third = Identity::generate(IdentityKind::Curve25519);
        let third_public: Identity = third.to_string_with_private(false).parse().unwrap();
        a.add_peer_identity(third_public, now + 20).unwrap();

        let target: InetAddress = "203.0.113.77:793".parse().unwrap();
        assert!(b.send_rendezvous(now + 20, a.address(), third.address(), &target));
        net.pump(now + 21);

        // Within one pulse A opens toward the named endpoint.
        ha.drain();
        a.process_background_tasks(now + 30);
        let sent = ha.drain();
        assert!(
            sent.iter().any(|(_, to, _)| *to == target),
            "expected contact attempt toward the rendezvous endpoint"
        );
    }

    #[test]
    fn test_self_awareness_scope_reset() {
        let now = 1_700_000_000_000;
        // A with two roots; both see A at its original address first.
        let (r1, h1) = Net::node("198.51.100.1:793", NodeConfig::default(), now);
        let (r2, h2) = Net::node("198.51.100.2:793", NodeConfig::default(), now);
        let (a, ha) = Net::node("203.0.113.50:40000", NodeConfig::default(), now);

        for (root, hroot) in [(&r1, &h1), (&r2, &h2)] {
            let id: Identity =
                String::from_utf8(hroot.state.lock()[&StateObject::IdentitySecret].clone())
                    .unwrap()
                    .parse()
                    .unwrap();
            let mut loc = Locator::new();
            loc.add(Endpoint::Inet(hroot.addr));
            loc.sign(now, &id).unwrap();
            assert!(a.add_root(id.to_string_with_private(false).parse().unwrap(), Some(loc)));
            let _ = root;
        }

        let net = Net {
            nodes: vec![(a.clone(), ha.clone()), (r1.clone(), h1.clone()), (r2.clone(), h2.clone())],
        };
        for step in 0..4 {
            let t = now + step * 10;
            for (n, _) in &net.nodes {
                n.process_background_tasks(t);
            }
            net.pump(t);
        }
        let p1 = a.topology().peer(&a, r1.address(), false).unwrap();
        let p2 = a.topology().peer(&a, r2.address(), false).unwrap();
        assert!(p1.direct_path(now + 50).is_some());
        assert!(p2.direct_path(now + 50).is_some());

        // A's NAT rebinds: both roots now observe a different external
        // address. Drive a fresh HELLO exchange, delivering A's packets
        // from the new apparent address.
        let rebound: InetAddress = "192.0.2.99:41000".parse().unwrap();
        let t = now + 100;
        for (root, hroot) in [(&r1, &h1), (&r2, &h2)] {
            let peer = a.topology().peer(&a, root.address(), false).unwrap();
            ha.drain();
            peer.hello(&a, 1, &hroot.addr, t);
            for (_, _, data) in ha.drain() {
                root.process_wire_packet(t, 1, &rebound, &data);
            }
            // Root replies go back to the rebound address; deliver them
            // to A regardless (it is the same node behind the NAT).
            for (_, _, data) in hroot.drain() {
                a.process_wire_packet(t, 1, &hroot.addr, &data);
            }
        }

        // Quorum reached: prior public-scope paths are demoted.
        assert!(
            ha.events
                .lock()
                .iter()
                .any(|e| matches!(e, Event::Trace(TraceEvent::ResettingPathsInScope { .. }))),
            "expected a scope reset after two trusted reports"
        );
        // Probes were sent to attempt revival.
        assert!(!ha.drain().is_empty() || {
            a.process_background_tasks(t + 10);
            !ha.drain().is_empty()
        });
    }

    #[test]
    fn test_mac_tamper_dropped_without_reply() {
        let now = 1_700_000_000_000;
        let net = two_connected_nodes(now);
        let (a, ha) = &net.nodes[0];
        let (b, hb) = &net.nodes[1];

        assert!(a.send_user_message(now + 20, b.address(), 1, b"tamper me"));
        let mut sent = ha.drain();
        assert_eq!(sent.len(), 1);
        let (_, _, ref mut data) = sent[0];
        let last = data.len() - 1;
        data[last] ^= 0x01;

        hb.drain();
        hb.events.lock().clear();
        b.process_wire_packet(now + 21, 1, &ha.addr, data);

        assert!(hb.drop_reasons().contains(&PacketDropReason::MacFailed));
        assert!(hb.drain().is_empty(), "tampered packets are never answered");
        assert!(hb.user_messages().is_empty());
    }

    #[test]
    fn test_identity_persisted_and_reloaded() {
        let now = 1_700_000_000_000;
        let host = TestHost::new("203.0.113.3:793");
        let first = Node::new(host.clone(), None, NodeConfig::default(), now).unwrap();
        let addr = first.address();
        drop(first);

        let second = Node::new(host, None, NodeConfig::default(), now + 1000).unwrap();
        assert_eq!(second.address(), addr);
    }

    #[test]
    fn test_background_tasks_suggest_deadline() {
        let now = 1_700_000_000_000;
        let (a, _) = Net::node("203.0.113.4:793", NodeConfig::default(), now);
        assert_eq!(a.process_background_tasks(now), now + BACKGROUND_TASK_INTERVAL);
    }
}
