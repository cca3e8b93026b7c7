//! Remote Peers
//!
//! A `Peer` is everything this node knows about one remote node: its
//! identity, the permanent identity-derived key, rotating ephemeral
//! session keys, direct paths in preference order, queued endpoint
//! candidates for NAT traversal, rate gates, and traffic meters. Peers
//! are owned by the topology and shared by reference.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use vmesh_crypto::{kdf, Address, Identity, SymmetricKey};
use vmesh_wire::dictionary::{
    KEY_EPHEMERAL_KEY, KEY_PHYSICAL_DEST, KEY_PROBE_TOKEN, KEY_SOFTWARE_VERSION,
};
use vmesh_wire::packet::{self, CipherSuite, Verb, PROTOCOL_VERSION};
use vmesh_wire::{Dictionary, Endpoint, InetAddress, IpScope, Locator};

use crate::node::Node;
use crate::path::Path;
use crate::trace::TryReason;
use crate::{
    BFG1024_PORTS_PER_SWEEP, EPHEMERAL_KEY_TTL, EPHEMERAL_KEY_TTL_MESSAGES, MAX_PEER_PATHS,
    PATH_KEEPALIVE_PERIOD, PEER_ECHO_RATE_LIMIT, PEER_HELLO_INTERVAL, PEER_PRIORITIZE_PATHS_INTERVAL,
    PEER_PROBE_RATE_LIMIT, PEER_RECORD_STALE, PEER_WHOIS_RATE_LIMIT, TRY_QUEUE_CAP,
    TRY_QUEUE_ITEM_TIMEOUT,
};

struct EphemeralPair {
    secret: x25519_dalek::StaticSecret,
    public: x25519_dalek::PublicKey,
    created: i64,
}

struct TryItem {
    target: Endpoint,
    ts: i64,
    bfg1024: bool,
}

struct Inner {
    identity_key: Arc<SymmetricKey>,
    /// current, previous
    ephemeral: [Option<Arc<SymmetricKey>>; 2],
    ephemeral_pair: Option<EphemeralPair>,
    rekey_requested: bool,
    locator: Option<Locator>,
    /// Alive direct paths, best first
    paths: Vec<Arc<Path>>,
    /// Most recently learned endpoint per endpoint type, for bootstrap
    bootstrap: BTreeMap<u8, Endpoint>,
    try_queue: VecDeque<TryItem>,
    /// Token the remote issued to us; sent in our 4-byte probes
    remote_probe: u32,
    v_proto: u8,
    v_major: u16,
    v_minor: u16,
    v_revision: u16,
}

/// Cacheable subset of peer state, persisted through the host state store
#[derive(Serialize, Deserialize)]
struct PeerRecord {
    saved_at: i64,
    identity: String,
    locator: Option<Vec<u8>>,
    bootstrap: Vec<Vec<u8>>,
    version: (u8, u16, u16, u16),
}

/// State for one remote node
pub struct Peer {
    identity: Identity,
    /// Token we issued; the remote sends it in probes so we can match
    local_probe: u32,
    last_receive: AtomicI64,
    last_send: AtomicI64,
    last_sent_hello: AtomicI64,
    last_whois_received: AtomicI64,
    last_echo_received: AtomicI64,
    last_probe_received: AtomicI64,
    last_prioritized_paths: AtomicI64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    bytes_relayed: AtomicU64,
    /// Lowest latency across alive paths, refreshed on prioritization.
    /// Kept as an atomic so root ranking never takes the peer lock.
    best_latency: AtomicU32,
    inner: RwLock<Inner>,
}

impl Peer {
    /// Create a peer entry from a validated identity. Performs the
    /// identity key agreement; fails if `our` has no private key.
    pub fn new(our: &Identity, identity: Identity, now: i64) -> crate::NodeResult<Self> {
        let shared = our.agree(&identity)?;
        let identity_key = Arc::new(SymmetricKey::permanent(now, shared.session_key()));
        let local_probe = loop {
            let t: u32 = rand::thread_rng().gen();
            if t != 0 {
                break t;
            }
        };
        Ok(Self {
            identity,
            local_probe,
            last_receive: AtomicI64::new(0),
            last_send: AtomicI64::new(0),
            last_sent_hello: AtomicI64::new(0),
            last_whois_received: AtomicI64::new(0),
            last_echo_received: AtomicI64::new(0),
            last_probe_received: AtomicI64::new(0),
            last_prioritized_paths: AtomicI64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
            best_latency: AtomicU32::new(u32::MAX),
            inner: RwLock::new(Inner {
                identity_key,
                ephemeral: [None, None],
                ephemeral_pair: None,
                rekey_requested: false,
                locator: None,
                paths: Vec::new(),
                bootstrap: BTreeMap::new(),
                try_queue: VecDeque::new(),
                remote_probe: 0,
                v_proto: 0,
                v_major: 0,
                v_minor: 0,
                v_revision: 0,
            }),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Token we issued for this peer's probes
    pub fn local_probe(&self) -> u32 {
        self.local_probe
    }

    pub fn set_remote_probe(&self, token: u32) {
        self.inner.write().remote_probe = token;
    }

    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    pub fn locator(&self) -> Option<Locator> {
        self.inner.read().locator.clone()
    }

    /// Install a locator if it verifies against this peer's identity and
    /// is strictly newer than the stored one
    pub fn set_locator(&self, loc: Locator) -> bool {
        if !loc.verify(&self.identity) {
            return false;
        }
        let mut inner = self.inner.write();
        if let Some(existing) = &inner.locator {
            if loc.timestamp() <= existing.timestamp() {
                return false;
            }
        }
        inner.locator = Some(loc);
        true
    }

    pub fn set_remote_version(&self, proto: u8, major: u16, minor: u16, revision: u16) {
        let mut inner = self.inner.write();
        inner.v_proto = proto;
        inner.v_major = major;
        inner.v_minor = minor;
        inner.v_revision = revision;
    }

    /// Remote protocol version, 0 if not yet known
    pub fn protocol_version(&self) -> u8 {
        self.inner.read().v_proto
    }

    /// Permanent identity-derived key
    pub fn identity_key(&self) -> Arc<SymmetricKey> {
        self.inner.read().identity_key.clone()
    }

    /// Key to use for the next outbound packet: the current ephemeral if
    /// established and unexpired, otherwise the permanent key
    pub fn send_key(&self, now: i64) -> Arc<SymmetricKey> {
        let inner = self.inner.read();
        if let Some(e) = &inner.ephemeral[0] {
            if !e.expired(now) {
                return e.clone();
            }
        }
        inner.identity_key.clone()
    }

    /// Try to authenticate and decrypt an inbound packet, walking the
    /// key ladder: current ephemeral, previous ephemeral, permanent.
    /// Acceptance under the permanent key while an ephemeral session
    /// exists flags the peer for re-key.
    pub fn try_dearmor(&self, pkt: &mut [u8], suite: CipherSuite) -> bool {
        let (keys, had_ephemeral) = {
            let inner = self.inner.read();
            let mut keys: Vec<Arc<SymmetricKey>> = Vec::with_capacity(3);
            for e in inner.ephemeral.iter().flatten() {
                keys.push(e.clone());
            }
            let had_ephemeral = !keys.is_empty();
            keys.push(inner.identity_key.clone());
            (keys, had_ephemeral)
        };
        let last = keys.len() - 1;
        for (i, key) in keys.iter().enumerate() {
            if packet::dearmor(pkt, key.key(), suite) {
                if i == last && had_ephemeral {
                    self.inner.write().rekey_requested = true;
                }
                return true;
            }
        }
        false
    }

    /// Our current ephemeral public key for this peer, creating the pair
    /// if needed. Advertised in HELLO and OK(HELLO) dictionaries.
    pub fn ephemeral_public(&self, now: i64) -> [u8; 32] {
        let mut inner = self.inner.write();
        ensure_ephemeral_pair(&mut inner, now);
        *inner.ephemeral_pair.as_ref().expect("ensured").public.as_bytes()
    }

    /// Intake of the remote's ephemeral public key (from a HELLO or
    /// OK(HELLO) dictionary). Derives and installs the ephemeral session
    /// key; the prior key is kept for one rotation.
    pub fn receive_ephemeral(&self, their_public: &[u8; 32], now: i64) {
        let mut inner = self.inner.write();
        ensure_ephemeral_pair(&mut inner, now);
        let pair = inner.ephemeral_pair.as_ref().expect("ensured above");
        let dh = pair
            .secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(*their_public));

        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(dh.as_bytes());
        seed.extend_from_slice(inner.identity_key.key());
        let derived = kdf::kbkdf_hmac_sha384(&seed, kdf::LABEL_EPHEMERAL, 0, 0);
        let mut key = [0u8; 32];
        key.copy_from_slice(&derived[..32]);

        if let Some(current) = &inner.ephemeral[0] {
            if current.key() == &key {
                return;
            }
        }
        let fresh = Arc::new(SymmetricKey::new(
            now,
            key,
            EPHEMERAL_KEY_TTL,
            EPHEMERAL_KEY_TTL_MESSAGES,
        ));
        inner.ephemeral[1] = inner.ephemeral[0].take();
        inner.ephemeral[0] = Some(fresh);
        inner.rekey_requested = false;
    }

    // --- meters and rate gates ---------------------------------------------

    pub fn sent(&self, now: i64, bytes: usize) {
        self.last_send.store(now, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes relayed through this peer on behalf of others
    pub fn relayed(&self, _now: i64, bytes: usize) {
        self.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn rate_gate_whois(&self, now: i64) -> bool {
        rate_gate(&self.last_whois_received, now, PEER_WHOIS_RATE_LIMIT)
    }

    pub fn rate_gate_echo(&self, now: i64) -> bool {
        rate_gate(&self.last_echo_received, now, PEER_ECHO_RATE_LIMIT)
    }

    pub fn rate_gate_probe(&self, now: i64) -> bool {
        rate_gate(&self.last_probe_received, now, PEER_PROBE_RATE_LIMIT)
    }

    // --- paths -------------------------------------------------------------

    /// Best alive direct path, if any
    pub fn direct_path(&self, now: i64) -> Option<Arc<Path>> {
        self.inner
            .read()
            .paths
            .iter()
            .find(|p| p.alive(now))
            .cloned()
    }

    /// All currently tracked paths
    pub fn paths(&self) -> Vec<Arc<Path>> {
        self.inner.read().paths.clone()
    }

    /// Smallest measured latency across alive paths, as of the last
    /// prioritization pass
    pub fn latency(&self) -> Option<u32> {
        match self.best_latency.load(Ordering::Relaxed) {
            u32::MAX => None,
            v => Some(v),
        }
    }

    /// Re-sort paths by preference if the throttle interval has elapsed
    pub fn prioritize_paths(&self, now: i64) {
        if now - self.last_prioritized_paths.load(Ordering::Relaxed)
            < PEER_PRIORITIZE_PATHS_INTERVAL
        {
            return;
        }
        let mut inner = self.inner.write();
        self.prioritize_paths_locked(&mut inner, now);
    }

    fn prioritize_paths_locked(&self, inner: &mut Inner, now: i64) {
        self.last_prioritized_paths.store(now, Ordering::Relaxed);
        inner.paths.retain(|p| p.alive(now));
        // Stable under identical inputs: latency ascending (unknown
        // last), then most recent receive first.
        inner.paths.sort_by(|a, b| {
            let la = a.latency().unwrap_or(u32::MAX);
            let lb = b.latency().unwrap_or(u32::MAX);
            la.cmp(&lb)
                .then_with(|| b.last_receive().cmp(&a.last_receive()))
        });
        inner.paths.truncate(MAX_PEER_PATHS);
        let best = inner
            .paths
            .iter()
            .filter_map(|p| p.latency())
            .min()
            .unwrap_or(u32::MAX);
        self.best_latency.store(best, Ordering::Relaxed);
    }

    /// Per-packet accounting and path learning.
    ///
    /// Called for every fully authenticated packet from this peer. New
    /// paths are only learned from OK replies (which are Expect-guarded
    /// and replay-protected); any other verb on an unknown path triggers
    /// a HELLO to confirm the path end-to-end.
    #[allow(clippy::too_many_arguments)]
    pub fn received(
        &self,
        node: &Node,
        path: &Arc<Path>,
        hops: u8,
        packet_id: u64,
        payload_len: usize,
        verb: Verb,
        _in_re_verb: Verb,
        now: i64,
    ) {
        self.last_receive.store(now, Ordering::Relaxed);
        self.bytes_in.fetch_add(payload_len as u64, Ordering::Relaxed);

        if hops != 0 {
            return;
        }
        {
            let inner = self.inner.read();
            if inner.paths.iter().any(|p| Arc::ptr_eq(p, path)) {
                return;
            }
        }
        if !node
            .host()
            .path_check(self.address(), path.local_socket(), path.address())
        {
            return;
        }

        if verb == Verb::Ok {
            let mut inner = self.inner.write();
            if inner.paths.iter().any(|p| Arc::ptr_eq(p, path)) {
                return;
            }

            // A path to the same address that differs only by port is the
            // same peer behind a rebooted NAT; replace it in place.
            let mut replaced: Option<InetAddress> = None;
            if let Some(existing) = inner.paths.iter_mut().find(|p| {
                p.local_socket() == path.local_socket()
                    && p.address().is_v4() == path.address().is_v4()
                    && p.address().ips_equal(path.address())
            }) {
                replaced = Some(*existing.address());
                *existing = path.clone();
            } else {
                if inner.paths.len() >= MAX_PEER_PATHS {
                    // Evict the least recently active path.
                    let idx = inner
                        .paths
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, p)| p.last_receive())
                        .map(|(i, _)| i);
                    if let Some(idx) = idx {
                        replaced = Some(*inner.paths[idx].address());
                        inner.paths[idx] = path.clone();
                    }
                } else {
                    inner.paths.push(path.clone());
                }
            }
            self.prioritize_paths_locked(&mut inner, now);

            let ep = Endpoint::Inet(*path.address());
            inner.bootstrap.insert(ep.type_id(), ep);
            drop(inner);

            node.trace().learned_new_path(
                0x582fabdd,
                packet_id,
                self.address(),
                path.address(),
                replaced.as_ref(),
            );
        } else {
            let bytes = self.hello(node, path.local_socket(), path.address(), now);
            path.sent(now, bytes);
            node.trace().trying_new_path(
                0xb7747ddd,
                self.address(),
                &Endpoint::Inet(*path.address()),
                Some(path.address()),
                TryReason::PacketReceivedFromUnknownPath,
            );
        }
    }

    /// Send an armored packet to this peer: direct if a path is alive,
    /// otherwise via the current root with the inner destination already
    /// set to this peer so the root relays.
    pub fn send(&self, node: &Node, now: i64, data: &[u8]) -> bool {
        if let Some(via) = self.direct_path(now) {
            via.send(node.host(), data, now);
        } else {
            let Some(root) = node.topology().root() else {
                return false;
            };
            if root.address() == self.address() {
                return false;
            }
            let Some(via) = root.direct_path(now) else {
                return false;
            };
            via.send(node.host(), data, now);
            root.relayed(now, data.len());
        }
        self.sent(now, data.len());
        true
    }

    // --- HELLO and probes ---------------------------------------------------

    /// Compose and send a HELLO to a specific physical address.
    ///
    /// HELLO travels MAC'd but unencrypted (the handshake must work with
    /// no prior session), carries our full identity and the address we
    /// sent it to, and an encrypted metadata dictionary with the probe
    /// token and our ephemeral key. Authenticated end-to-end with an
    /// HMAC-SHA384 trailer.
    pub fn hello(&self, node: &Node, local_socket: i64, at: &InetAddress, now: i64) -> usize {
        let (key, eph_pub) = {
            let mut inner = self.inner.write();
            ensure_ephemeral_pair(&mut inner, now);
            (
                inner.identity_key.clone(),
                inner.ephemeral_pair.as_ref().expect("ensured").public,
            )
        };

        let mut pkt = packet::compose(self.address(), node.identity().address(), Verb::Hello);
        pkt.push(PROTOCOL_VERSION);
        let (v_major, v_minor, v_rev) = node.config().version;
        pkt.push(v_major as u8);
        pkt.push(v_minor as u8);
        pkt.extend_from_slice(&v_rev.to_be_bytes());
        pkt.extend_from_slice(&(now as u64).to_be_bytes());
        pkt.extend_from_slice(&node.identity().marshal(false));
        Endpoint::Inet(*at).marshal(&mut pkt);

        // The dictionary IV is the packet id, so assign it up front.
        let packet_id = key.next_message_iv();
        packet::set_packet_id(&mut pkt, packet_id);

        let mut dict = Dictionary::new();
        dict.set_endpoint(KEY_PHYSICAL_DEST, &Endpoint::Inet(*at));
        dict.set_u64(KEY_SOFTWARE_VERSION, node.config().packed_version());
        dict.set_u32(KEY_PROBE_TOKEN, self.local_probe);
        dict.set_bytes(KEY_EPHEMERAL_KEY, eph_pub.as_bytes().to_vec());
        let mut dict_bytes = dict.encode();
        crate::vl1::dict_crypt(key.key(), 0, packet_id, &mut dict_bytes);
        pkt.extend_from_slice(&(dict_bytes.len() as u16).to_be_bytes());
        pkt.extend_from_slice(&dict_bytes);

        let hmac_key = kdf::kbkdf_hmac_sha384(key.key(), kdf::LABEL_HELLO_HMAC, 0, 0);
        let tag = kdf::hmac_sha384(&hmac_key, &pkt[packet::HEADER_SIZE..]);
        pkt.extend_from_slice(&tag);

        packet::armor_with_id(&mut pkt, key.key(), CipherSuite::Poly1305None);

        node.expect().sending(packet_id, now);
        self.last_sent_hello.store(now, Ordering::Relaxed);
        node.host().wire_send(local_socket, at, &pkt);
        self.sent(now, pkt.len());
        pkt.len()
    }

    /// Send a minimal reachability probe to an address.
    ///
    /// When the remote has issued us a probe token this is a 4-byte
    /// datagram it can match against its peer table; otherwise (older
    /// peers, or pre-handshake) an armored NOP packet is sent instead.
    pub fn probe(&self, node: &Node, local_socket: i64, at: &InetAddress, now: i64) -> usize {
        let (remote_probe, proto, key) = {
            let inner = self.inner.read();
            (inner.remote_probe, inner.v_proto, inner.identity_key.clone())
        };
        let len = if remote_probe != 0 && (proto == 0 || proto >= 11) {
            node.host()
                .wire_send(local_socket, at, &remote_probe.to_be_bytes());
            packet::PROBE_LENGTH
        } else {
            let mut pkt = packet::compose(self.address(), node.identity().address(), Verb::Nop);
            packet::armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);
            node.host().wire_send(local_socket, at, &pkt);
            pkt.len()
        };
        self.sent(now, len);
        len
    }

    /// Queue a candidate endpoint to contact. Idempotent per endpoint;
    /// the pulse loop drains one candidate per interval.
    pub fn try_direct_path(&self, now: i64, target: Endpoint, bfg1024: bool) {
        if !target.is_inet() {
            return;
        }
        let mut inner = self.inner.write();
        for item in inner.try_queue.iter_mut() {
            if item.target == target {
                item.ts = now;
                item.bfg1024 = bfg1024;
                return;
            }
        }
        if inner.try_queue.len() >= TRY_QUEUE_CAP {
            inner.try_queue.pop_front();
        }
        inner.try_queue.push_back(TryItem {
            target,
            ts: now,
            bfg1024,
        });
    }

    /// Demote paths in an address scope and probe them for revival.
    /// Driven by self-awareness when our external surface changes.
    pub fn reset_within_scope(&self, node: &Node, scope: IpScope, v4: bool, now: i64) {
        let paths = self.paths();
        for p in paths {
            if p.address().is_v4() == v4 && p.address().scope() == scope {
                p.demote();
                let bytes = self.probe(node, p.local_socket(), p.address(), now);
                p.sent(now, bytes);
            }
        }
    }

    /// Periodic maintenance, called from the node's background pass.
    ///
    /// Re-prioritizes paths, keeps alive paths warm, refreshes HELLO on
    /// its interval (or sooner when a re-key is due), and works on
    /// establishing a direct path when none is alive.
    pub fn pulse(&self, node: &Node, now: i64, _is_root: bool) {
        enum Action {
            Hello { socket: i64, at: InetAddress, on_path: Option<Arc<Path>> },
            Keepalive(Arc<Path>),
            Probe { at: InetAddress, reason: TryReason },
            Sweep(InetAddress),
        }

        let mut actions: Vec<Action> = Vec::new();
        let mut hello_via_root = false;

        {
            let mut inner = self.inner.write();
            self.prioritize_paths_locked(&mut inner, now);

            let rekey_due = inner.rekey_requested
                || matches!(&inner.ephemeral[0], Some(k) if k.expiring_soon(now))
                || (inner.v_proto >= 11 && inner.ephemeral[0].is_none());
            let mut need_hello = rekey_due
                || (now - self.last_sent_hello.load(Ordering::Relaxed)) >= PEER_HELLO_INTERVAL;

            if inner.paths.is_empty() {
                // No direct paths: work on making one.
                let mut tried = false;
                while let Some(item) = inner.try_queue.pop_front() {
                    if now - item.ts > TRY_QUEUE_ITEM_TIMEOUT {
                        continue; // stale candidate
                    }
                    if let Some(at) = item.target.inet_addr() {
                        if item.bfg1024 && node.config().nat_hostile {
                            actions.push(Action::Sweep(at));
                        } else {
                            actions.push(Action::Probe {
                                at,
                                reason: TryReason::PushDirectPaths,
                            });
                        }
                        tried = true;
                        break; // one candidate per pulse
                    }
                }
                if !tried {
                    if let Some(at) = node.host().path_lookup(&self.identity) {
                        actions.push(Action::Probe {
                            at,
                            reason: TryReason::SuggestedAddress,
                        });
                        tried = true;
                    }
                }
                if !tried && !inner.bootstrap.is_empty() {
                    let pick = rand::thread_rng().gen_range(0..inner.bootstrap.len());
                    if let Some(ep) = inner.bootstrap.values().nth(pick) {
                        if let Some(at) = ep.inet_addr() {
                            actions.push(Action::Probe {
                                at,
                                reason: TryReason::BootstrapAddress,
                            });
                        }
                    }
                }
                if need_hello {
                    hello_via_root = true;
                }
            } else {
                for (i, p) in inner.paths.iter().enumerate() {
                    if i == 0 && need_hello {
                        need_hello = false;
                        actions.push(Action::Hello {
                            socket: p.local_socket(),
                            at: *p.address(),
                            on_path: Some(p.clone()),
                        });
                    } else if now - p.last_send() >= PATH_KEEPALIVE_PERIOD {
                        actions.push(Action::Keepalive(p.clone()));
                    }
                }
            }
        }

        for action in actions {
            match action {
                Action::Hello { socket, at, on_path } => {
                    let bytes = self.hello(node, socket, &at, now);
                    if let Some(p) = on_path {
                        p.sent(now, bytes);
                    }
                }
                Action::Keepalive(p) => {
                    p.send(node.host(), &[0u8], now);
                    self.sent(now, 1);
                }
                Action::Probe { at, reason } => {
                    node.trace().trying_new_path(
                        0x84a10000,
                        self.address(),
                        &Endpoint::Inet(at),
                        None,
                        reason,
                    );
                    // Until a handshake has completed there is nothing a
                    // bare probe could match; open with a full HELLO.
                    if self.protocol_version() == 0 {
                        self.hello(node, -1, &at, now);
                    } else {
                        self.probe(node, -1, &at, now);
                    }
                }
                Action::Sweep(at) => {
                    self.bfg1024_sweep(node, at, now);
                }
            }
        }

        if hello_via_root {
            let root = node.topology().root();
            if let Some(root) = root.filter(|r| r.address() != self.address()) {
                if let Some(via) = root.direct_path(now) {
                    let bytes = self.hello(node, via.local_socket(), via.address(), now);
                    via.sent(now, bytes);
                    root.relayed(now, bytes);
                }
            }
        }
    }

    /// Randomized port sweep against a symmetric NAT: probe many ports
    /// at the target address so that at least one pair of (our mapped
    /// port, their guessed port) collides.
    fn bfg1024_sweep(&self, node: &Node, at: InetAddress, now: i64) {
        let mut ports: Vec<u16> = (1..=1023).collect();
        let mut rng = rand::thread_rng();
        for i in (1..ports.len()).rev() {
            let j = rng.gen_range(0..=i);
            ports.swap(i, j);
        }
        let mut target = at;
        for port in ports.into_iter().take(BFG1024_PORTS_PER_SWEEP) {
            target.set_port(port);
            self.probe(node, -1, &target, now);
        }
    }

    // --- persistence --------------------------------------------------------

    /// Write the cacheable subset to the host state store
    pub fn save(&self, node: &Node, now: i64) {
        let record = {
            let inner = self.inner.read();
            PeerRecord {
                saved_at: now,
                identity: self.identity.to_string_with_private(false),
                locator: inner.locator.as_ref().map(Locator::marshal),
                bootstrap: inner
                    .bootstrap
                    .values()
                    .map(|ep| {
                        let mut b = Vec::new();
                        ep.marshal(&mut b);
                        b
                    })
                    .collect(),
                version: (inner.v_proto, inner.v_major, inner.v_minor, inner.v_revision),
            }
        };
        match bincode::serialize(&record) {
            Ok(blob) => {
                // Peer cache persistence is best-effort.
                let _ = node
                    .host()
                    .state_put(crate::host::StateObject::Peer(self.address()), Some(&blob));
            }
            Err(e) => node
                .trace()
                .unexpected_error(0xbc8861e0, format!("failed to serialize peer record: {}", e)),
        }
    }

    /// Rebuild a peer from a cached record. Stale records and records
    /// whose identity no longer agrees with ours are rejected.
    pub fn from_record(our: &Identity, data: &[u8], now: i64) -> crate::NodeResult<Self> {
        let record: PeerRecord = bincode::deserialize(data)
            .map_err(|e| crate::NodeError::DataStore(format!("bad peer record: {}", e)))?;
        if now - record.saved_at > PEER_RECORD_STALE {
            return Err(crate::NodeError::DataStore("stale peer record".into()));
        }
        let identity: Identity = record
            .identity
            .parse()
            .map_err(crate::NodeError::Crypto)?;
        let peer = Self::new(our, identity, now)?;
        {
            let mut inner = peer.inner.write();
            if let Some(loc_bytes) = record.locator {
                if let Ok((loc, _)) = Locator::unmarshal(&loc_bytes) {
                    if loc.verify(&peer.identity) {
                        inner.locator = Some(loc);
                    }
                }
            }
            for ep_bytes in record.bootstrap {
                if let Ok((ep, _)) = Endpoint::unmarshal(&ep_bytes) {
                    inner.bootstrap.insert(ep.type_id(), ep);
                }
            }
            inner.v_proto = record.version.0;
            inner.v_major = record.version.1;
            inner.v_minor = record.version.2;
            inner.v_revision = record.version.3;
        }
        Ok(peer)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer({})", self.address())
    }
}

fn rate_gate(gate: &AtomicI64, now: i64, interval: i64) -> bool {
    if now - gate.load(Ordering::Relaxed) >= interval {
        gate.store(now, Ordering::Relaxed);
        true
    } else {
        false
    }
}

/// Create or rotate our ephemeral X25519 pair. Rotation at half the key
/// TTL keeps the advertised public key ahead of key expiry.
fn ensure_ephemeral_pair(inner: &mut Inner, now: i64) {
    let rotate = match &inner.ephemeral_pair {
        None => true,
        Some(p) => now - p.created >= EPHEMERAL_KEY_TTL / 2,
    };
    if rotate {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        inner.ephemeral_pair = Some(EphemeralPair {
            secret,
            public,
            created: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmesh_crypto::IdentityKind;

    fn identity() -> Identity {
        Identity::generate(IdentityKind::Curve25519)
    }

    #[test]
    fn test_identity_key_agreement_symmetric() {
        let a = identity();
        let b = identity();
        let pa = Peer::new(&a, b.clone(), 1000).unwrap();
        let pb = Peer::new(&b, a.clone(), 1000).unwrap();
        assert_eq!(pa.identity_key().key(), pb.identity_key().key());
    }

    #[test]
    fn test_ephemeral_key_convergence() {
        let a = identity();
        let b = identity();
        let pa = Peer::new(&a, b.clone(), 1000).unwrap();
        let pb = Peer::new(&b, a.clone(), 1000).unwrap();

        // Each side generates a pair, then receives the other's public.
        let a_pub = {
            let mut inner = pa.inner.write();
            ensure_ephemeral_pair(&mut inner, 1000);
            *inner.ephemeral_pair.as_ref().unwrap().public.as_bytes()
        };
        let b_pub = {
            let mut inner = pb.inner.write();
            ensure_ephemeral_pair(&mut inner, 1000);
            *inner.ephemeral_pair.as_ref().unwrap().public.as_bytes()
        };
        pa.receive_ephemeral(&b_pub, 1001);
        pb.receive_ephemeral(&a_pub, 1001);

        let ka = pa.inner.read().ephemeral[0].as_ref().unwrap().clone();
        let kb = pb.inner.read().ephemeral[0].as_ref().unwrap().clone();
        assert_eq!(ka.key(), kb.key());
    }

    #[test]
    fn test_decrypt_key_ladder() {
        let a = identity();
        let b = identity();
        let pa = Peer::new(&a, b.clone(), 1000).unwrap();

        // Armor with the permanent key; dearmor through the ladder.
        let key = pa.identity_key();
        let mut pkt = packet::compose(b.address(), a.address(), Verb::Echo);
        pkt.extend_from_slice(b"ladder test");
        packet::armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);
        assert!(pa.try_dearmor(&mut pkt, CipherSuite::Poly1305Salsa2012));
        assert_eq!(&pkt[packet::HEADER_SIZE + 1..], b"ladder test");
    }

    #[test]
    fn test_permanent_key_acceptance_flags_rekey() {
        let a = identity();
        let b = identity();
        let pa = Peer::new(&a, b.clone(), 1000).unwrap();
        let pb = Peer::new(&b, a.clone(), 1000).unwrap();

        // Establish an ephemeral session.
        let b_pub = {
            let mut inner = pb.inner.write();
            ensure_ephemeral_pair(&mut inner, 1000);
            *inner.ephemeral_pair.as_ref().unwrap().public.as_bytes()
        };
        pa.receive_ephemeral(&b_pub, 1000);
        assert!(!pa.inner.read().rekey_requested);

        // A packet under the permanent key still decrypts, but flags the
        // session for re-key.
        let key = pa.identity_key();
        let mut pkt = packet::compose(b.address(), a.address(), Verb::Echo);
        packet::armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);
        assert!(pa.try_dearmor(&mut pkt, CipherSuite::Poly1305Salsa2012));
        assert!(pa.inner.read().rekey_requested);
    }

    #[test]
    fn test_locator_must_be_strictly_newer() {
        let a = identity();
        let b = identity();
        let pa = Peer::new(&a, b.clone(), 1000).unwrap();

        let mut loc1 = Locator::new();
        loc1.add(Endpoint::Inet("203.0.113.1:793".parse().unwrap()));
        loc1.sign(100, &b).unwrap();
        assert!(pa.set_locator(loc1.clone()));

        // Same timestamp: rejected.
        assert!(!pa.set_locator(loc1));

        let mut loc2 = Locator::new();
        loc2.add(Endpoint::Inet("203.0.113.2:793".parse().unwrap()));
        loc2.sign(200, &b).unwrap();
        assert!(pa.set_locator(loc2));

        // Signed by the wrong identity: rejected.
        let c = identity();
        let mut loc3 = Locator::new();
        loc3.add(Endpoint::Inet("203.0.113.3:793".parse().unwrap()));
        loc3.sign(300, &c).unwrap();
        assert!(!pa.set_locator(loc3));
    }

    #[test]
    fn test_try_queue_idempotent() {
        let a = identity();
        let b = identity();
        let p = Peer::new(&a, b, 1000).unwrap();
        let ep = Endpoint::Inet("203.0.113.10:793".parse().unwrap());
        p.try_direct_path(1000, ep, false);
        p.try_direct_path(1001, ep, true);
        let inner = p.inner.read();
        assert_eq!(inner.try_queue.len(), 1);
        assert!(inner.try_queue[0].bfg1024);
        assert_eq!(inner.try_queue[0].ts, 1001);
    }

    #[test]
    fn test_rate_gates() {
        let a = identity();
        let b = identity();
        let p = Peer::new(&a, b, 1000).unwrap();
        assert!(p.rate_gate_whois(10_000));
        assert!(!p.rate_gate_whois(10_100));
        assert!(p.rate_gate_whois(10_000 + PEER_WHOIS_RATE_LIMIT));
    }

    #[test]
    fn test_path_ordering_stable() {
        let a = identity();
        let b = identity();
        let p = Peer::new(&a, b, 1000).unwrap();

        let p1 = Arc::new(Path::new(1, "10.0.0.1:1".parse().unwrap()));
        let p2 = Arc::new(Path::new(1, "10.0.0.2:1".parse().unwrap()));
        let p3 = Arc::new(Path::new(1, "10.0.0.3:1".parse().unwrap()));
        p1.received(1000, 1);
        p2.received(1000, 1);
        p3.received(1000, 1);
        p1.record_latency(50);
        p2.record_latency(10);

        {
            let mut inner = p.inner.write();
            inner.paths = vec![p1.clone(), p2.clone(), p3.clone()];
            p.prioritize_paths_locked(&mut inner, 1001);
        }
        let ordered = p.paths();
        // Lowest latency first; unmeasured last.
        assert!(Arc::ptr_eq(&ordered[0], &p2));
        assert!(Arc::ptr_eq(&ordered[1], &p1));
        assert!(Arc::ptr_eq(&ordered[2], &p3));

        // Same inputs, same order.
        {
            let mut inner = p.inner.write();
            let mut again = vec![p3.clone(), p1.clone(), p2.clone()];
            std::mem::swap(&mut inner.paths, &mut again);
            p.prioritize_paths_locked(&mut inner, 10_002);
        }
        let reordered = p.paths();
        assert!(Arc::ptr_eq(&reordered[0], &p2));
        assert!(Arc::ptr_eq(&reordered[1], &p1));
        assert!(Arc::ptr_eq(&reordered[2], &p3));
    }
}
