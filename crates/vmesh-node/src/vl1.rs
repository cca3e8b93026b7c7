//! VL1 Dispatcher: the Packet Ingress Pipeline
//!
//! Every inbound datagram flows through here: path canonicalization,
//! probe fast-path, fragment reassembly, cipher-suite authentication and
//! decryption, WHOIS queuing for unknown sources, verb dispatch, and the
//! HELLO handshake. Malformed or unauthenticated input is dropped with a
//! trace and never answered.

use std::collections::HashMap;

use aes::cipher::{KeyIvInit as _, StreamCipher as _};
use bytes::Bytes;
use parking_lot::Mutex;

use vmesh_crypto::{kdf, Address, Identity, SymmetricKey};
use vmesh_wire::buf::Slice;
use vmesh_wire::dictionary::{
    KEY_EPHEMERAL_KEY, KEY_PHYSICAL_DEST, KEY_PROBE_TOKEN, KEY_SOFTWARE_VERSION,
};
use vmesh_wire::packet::{
    self, CipherSuite, Verb, ERROR_PAYLOAD_START, FRAGMENT_COUNTS_INDEX, FRAGMENT_HOPS_INDEX,
    FRAGMENT_PAYLOAD_START, HEADER_SIZE, MAX_PACKET_LENGTH, MIN_FRAGMENT_LENGTH,
    MIN_PACKET_LENGTH, OK_PAYLOAD_START, PAYLOAD_START, PROBE_LENGTH, PROTOCOL_VERSION,
    PROTOCOL_VERSION_MIN, VERB_MASK,
};
use vmesh_wire::{Assembled, Defragmenter, Dictionary, Endpoint, InetAddress, Locator};

use crate::host::Event;
use crate::node::Node;
use crate::path::Path;
use crate::peer::Peer;
use crate::trace::{PacketDropReason, TryReason};
use crate::{
    MAX_INCOMING_FRAGMENTS_PER_PATH, WHOIS_MAX_RETRIES, WHOIS_RETRY_DELAY,
};

type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

/// Queued ciphertexts per address at most
const WHOIS_QUEUE_PACKETS_PER_ADDRESS: usize = 8;

/// RENDEZVOUS / PUSH_DIRECT_PATHS flag requesting an aggressive sweep
const PATH_FLAG_BFG1024: u8 = 0x01;

struct WhoisQueueItem {
    packets: Vec<Vec<u8>>,
    last_retry: i64,
    retries: u32,
}

/// The ingress pipeline state
pub struct Vl1 {
    defrag: Defragmenter,
    whois_queue: Mutex<HashMap<Address, WhoisQueueItem>>,
    /// Outstanding ECHOes we sent: packet id -> (sent at, payload)
    echo_outstanding: Mutex<HashMap<u64, (i64, Vec<u8>)>>,
}

impl Vl1 {
    pub fn new() -> Self {
        Self {
            defrag: Defragmenter::new(MAX_INCOMING_FRAGMENTS_PER_PATH),
            whois_queue: Mutex::new(HashMap::new()),
            echo_outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Ingress entry point for one datagram
    pub fn on_wire_packet(
        &self,
        node: &Node,
        now: i64,
        local_socket: i64,
        from: &InetAddress,
        data: &[u8],
    ) {
        let path = node.topology().path(local_socket, from);
        path.received(now, data.len());

        // 4-byte probes identify a peer by the token we issued it and
        // answer with a full HELLO to restart the handshake cheaply.
        if data.len() == PROBE_LENGTH {
            let token = u32::from_be_bytes(data.try_into().unwrap());
            for peer in node.topology().peers_by_probe(token) {
                if peer.rate_gate_probe(now) {
                    let bytes = peer.hello(node, local_socket, from, now);
                    path.sent(now, bytes);
                }
            }
            return;
        }

        // Anything else below the fragment floor is a keepalive; the
        // path timestamp above is all it was for.
        if data.len() < MIN_FRAGMENT_LENGTH {
            return;
        }

        if packet::is_fragment(data) {
            let destination = packet::destination(data);
            if destination != node.identity().address() {
                self.relay(node, now, destination, data);
                return;
            }
            let counts = data[FRAGMENT_COUNTS_INDEX];
            let Some(slice) = Slice::from_datagram(node.buf_pool(), &data[FRAGMENT_PAYLOAD_START..])
            else {
                return;
            };
            match self.defrag.assemble(
                packet::packet_id(data),
                slice,
                counts & 0x0f,
                // High nibble is the fragment count minus one.
                (counts >> 4) + 1,
                now,
                path.key(),
            ) {
                Assembled::Complete(v) => {
                    let pkt = v.merge_copy();
                    v.recycle(node.buf_pool());
                    self.process_assembled(node, now, &path, pkt);
                }
                _ => {}
            }
        } else {
            if data.len() < MIN_PACKET_LENGTH {
                return;
            }
            let destination = packet::destination(data);
            if destination != node.identity().address() {
                self.relay(node, now, destination, data);
                return;
            }
            if packet::is_fragmented(data) {
                let Some(slice) = Slice::from_datagram(node.buf_pool(), data) else {
                    return;
                };
                match self.defrag.assemble(
                    packet::packet_id(data),
                    slice,
                    0,
                    0,
                    now,
                    path.key(),
                ) {
                    Assembled::Complete(v) => {
                        let pkt = v.merge_copy();
                        v.recycle(node.buf_pool());
                        self.process_assembled(node, now, &path, pkt);
                    }
                    _ => {}
                }
            } else {
                self.process_assembled(node, now, &path, data.to_vec());
            }
        }
    }

    /// Authenticate, decrypt, and dispatch one assembled packet
    fn process_assembled(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        mut pkt: Vec<u8>,
    ) {
        let trace = node.trace();
        if pkt.len() < MIN_PACKET_LENGTH || pkt.len() > MAX_PACKET_LENGTH {
            trace.packet_dropped(
                0x3df19990,
                0,
                None,
                Some(path.address()),
                0,
                0,
                PacketDropReason::MalformedPacket,
            );
            return;
        }

        let source = packet::source(&pkt);
        if source == node.identity().address() {
            return;
        }
        let packet_id = packet::packet_id(&pkt);
        let hops = packet::hops(&pkt);
        let verb_raw = packet::verb_byte(&pkt);
        let cipher = match packet::cipher_suite(&pkt) {
            Ok(c) => c,
            Err(_) => {
                trace.packet_dropped(
                    0x5b001099,
                    packet_id,
                    Some(source),
                    Some(path.address()),
                    hops,
                    verb_raw,
                    PacketDropReason::InvalidObject,
                );
                return;
            }
        };

        // HELLO must work with no prior session: both the MAC-only suite
        // and the trusted-path suite take the self-authenticating
        // handshake path before any peer lookup, so a brand-new peer
        // never detours through WHOIS to introduce itself.
        if (cipher == CipherSuite::Poly1305None || cipher == CipherSuite::None)
            && (verb_raw & VERB_MASK) == Verb::Hello as u8
        {
            self.handle_hello(node, now, path, pkt, false);
            return;
        }

        let Some(peer) = node.topology().peer(node, source, true) else {
            self.enqueue_whois(source, pkt);
            self.send_pending_whois(node, now);
            return;
        };

        let authenticated = match cipher {
            CipherSuite::Poly1305None | CipherSuite::Poly1305Salsa2012 => {
                peer.try_dearmor(&mut pkt, cipher)
            }
            CipherSuite::None => {
                let trusted = node.config().trusted_paths.iter().any(|tp| {
                    tp.id == packet::mac_field(&pkt) && tp.matches(path.address().ip())
                });
                if !trusted {
                    trace.packet_dropped(
                        0x2dfa910b,
                        packet_id,
                        Some(source),
                        Some(path.address()),
                        hops,
                        verb_raw,
                        PacketDropReason::NotTrustedPath,
                    );
                    return;
                }
                true
            }
        };
        if !authenticated {
            trace.packet_dropped(
                0xcc89c812,
                packet_id,
                Some(source),
                Some(path.address()),
                hops,
                verb_raw,
                PacketDropReason::MacFailed,
            );
            return;
        }

        // Decompression is only attempted on authenticated payloads.
        if packet::is_compressed(&pkt) {
            match lz4_flex::decompress_size_prepended(&pkt[PAYLOAD_START..]) {
                Ok(plain) if PAYLOAD_START + plain.len() <= MAX_PACKET_LENGTH => {
                    pkt.truncate(PAYLOAD_START);
                    pkt.extend_from_slice(&plain);
                    pkt[packet::VERB_INDEX] &= !packet::VERB_FLAG_COMPRESSED;
                }
                _ => {
                    trace.packet_dropped(
                        0xee9e4392,
                        packet_id,
                        Some(source),
                        Some(path.address()),
                        hops,
                        verb_raw,
                        PacketDropReason::InvalidCompressedData,
                    );
                    return;
                }
            }
        }

        let verb = match Verb::try_from(verb_raw) {
            Ok(v) => v,
            Err(_) => {
                trace.packet_dropped(
                    0xeeeeeff0,
                    packet_id,
                    Some(source),
                    Some(path.address()),
                    hops,
                    verb_raw,
                    PacketDropReason::UnrecognizedVerb,
                );
                return;
            }
        };

        let mut in_re_verb = Verb::Nop;
        let ok = match verb {
            Verb::Nop => true,
            Verb::Hello => {
                // HELLO performs its own accounting and replies; returning
                // false here keeps the generic per-packet accounting below
                // from running twice.
                self.handle_hello(node, now, path, pkt.clone(), true);
                false
            }
            Verb::Error => self.handle_error(node, now, path, &peer, &pkt, &mut in_re_verb),
            Verb::Ok => self.handle_ok(node, now, path, &peer, &pkt, hops, &mut in_re_verb),
            Verb::Whois => self.handle_whois(node, now, path, &peer, &pkt),
            Verb::Rendezvous => self.handle_rendezvous(node, now, path, &peer, &pkt),
            Verb::Echo => self.handle_echo(node, now, path, &peer, &pkt, packet_id),
            Verb::PushDirectPaths => self.handle_push_direct_paths(node, now, path, &peer, &pkt),
            Verb::UserMessage => self.handle_user_message(node, &peer, &pkt),
            Verb::Encap => true,
            Verb::Frame
            | Verb::ExtFrame
            | Verb::MulticastLike
            | Verb::NetworkCredentials
            | Verb::NetworkConfigRequest
            | Verb::NetworkConfig
            | Verb::MulticastGather
            | Verb::Multicast => node
                .vl2()
                .handle(peer.identity(), verb, &pkt[PAYLOAD_START..]),
        };

        if ok {
            peer.received(
                node,
                path,
                hops,
                packet_id,
                pkt.len().saturating_sub(PAYLOAD_START),
                verb,
                in_re_verb,
                now,
            );
        }
    }

    // --- relay ---------------------------------------------------------------

    /// Forward a packet addressed to a third party. Only when this node
    /// is configured as a relay/root; hop-limited.
    fn relay(&self, node: &Node, now: i64, destination: Address, data: &[u8]) {
        if !node.config().allow_relay {
            return;
        }
        let mut pkt = data.to_vec();
        let bumped = if packet::is_fragment(&pkt) {
            let hops = pkt[FRAGMENT_HOPS_INDEX] & 0x07;
            if hops + 1 >= packet::MAX_HOPS {
                None
            } else {
                pkt[FRAGMENT_HOPS_INDEX] = (pkt[FRAGMENT_HOPS_INDEX] & !0x07) | (hops + 1);
                Some(hops + 1)
            }
        } else {
            packet::bump_hops(&mut pkt)
        };
        if bumped.is_none() {
            return;
        }
        let Some(to_peer) = node.topology().peer(node, destination, false) else {
            return;
        };
        let Some(to_path) = to_peer.direct_path(now) else {
            return;
        };
        to_path.send(node.host(), &pkt, now);
        to_peer.relayed(now, pkt.len());
    }

    // --- WHOIS ---------------------------------------------------------------

    fn enqueue_whois(&self, source: Address, pkt: Vec<u8>) {
        let mut queue = self.whois_queue.lock();
        let item = queue.entry(source).or_insert_with(|| WhoisQueueItem {
            packets: Vec::new(),
            last_retry: 0,
            retries: 0,
        });
        if item.packets.len() < WHOIS_QUEUE_PACKETS_PER_ADDRESS {
            item.packets.push(pkt);
        }
    }

    /// Send WHOIS to the current root for every queued address whose
    /// retry gate has elapsed
    pub fn send_pending_whois(&self, node: &Node, now: i64) {
        let Some(root) = node.topology().root() else {
            return;
        };
        let Some(root_path) = root.direct_path(now) else {
            return;
        };

        let to_send: Vec<Address> = {
            let mut queue = self.whois_queue.lock();
            queue.retain(|_, item| item.retries <= WHOIS_MAX_RETRIES);
            queue
                .iter_mut()
                .filter(|(_, item)| now - item.last_retry >= WHOIS_RETRY_DELAY)
                .map(|(addr, item)| {
                    item.last_retry = now;
                    item.retries += 1;
                    *addr
                })
                .collect()
        };
        if to_send.is_empty() {
            return;
        }

        let key = root.send_key(now);
        // An address is 5 bytes; even the full queue fits one packet.
        for chunk in to_send.chunks(128) {
            let mut pkt = packet::compose(
                root.address(),
                node.identity().address(),
                Verb::Whois,
            );
            for addr in chunk {
                pkt.extend_from_slice(&addr.to_bytes());
            }
            let pid = packet::armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);
            node.expect().sending(pid, now);
            root_path.send(node.host(), &pkt, now);
            root.sent(now, pkt.len());
        }
    }

    /// Drop WHOIS queue entries that ran out of retries
    pub fn whois_gc(&self, _now: i64) {
        self.whois_queue
            .lock()
            .retain(|_, item| item.retries <= WHOIS_MAX_RETRIES);
    }

    /// Periodic expiry: reassembly window, WHOIS retries, stale echoes
    pub fn gc(&self, now: i64) {
        self.defrag.gc(now);
        self.whois_gc(now);
        self.echo_outstanding
            .lock()
            .retain(|_, (sent_at, _)| now - *sent_at <= crate::EXPECT_TTL);
    }

    /// Send an ECHO to a peer and register the reply correlation.
    /// Round trips feed the path latency estimate.
    pub fn send_echo(&self, node: &Node, now: i64, peer: &Peer, payload: &[u8]) -> bool {
        let mut pkt = packet::compose(peer.address(), node.identity().address(), Verb::Echo);
        pkt.extend_from_slice(payload);
        let key = peer.send_key(now);
        let pid = packet::armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);
        node.expect().sending(pid, now);
        self.echo_outstanding
            .lock()
            .insert(pid, (now, payload.to_vec()));
        peer.send(node, now, &pkt)
    }

    // --- HELLO ---------------------------------------------------------------

    /// The unauthenticated protocol entry point. Performs its own
    /// validation ladder; failures drop without creating a peer and
    /// never produce a reply.
    fn handle_hello(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        mut pkt: Vec<u8>,
        pre_authenticated: bool,
    ) {
        let packet_id = packet::packet_id(&pkt);
        let hops = packet::hops(&pkt);
        let source = packet::source(&pkt);
        let drop = |loc: u32, reason: PacketDropReason| {
            node.trace().packet_dropped(
                loc,
                packet_id,
                Some(source),
                Some(path.address()),
                hops,
                Verb::Hello as u8,
                reason,
            );
        };

        let mut p = PAYLOAD_START;
        let Some(proto) = rd_u8(&pkt, &mut p) else {
            return drop(0x2bdb0001, PacketDropReason::MalformedPacket);
        };
        if proto < PROTOCOL_VERSION_MIN {
            return drop(0xe8d12bad, PacketDropReason::PeerTooOld);
        }
        let Some(v_major) = rd_u8(&pkt, &mut p) else {
            return drop(0x2bdb0001, PacketDropReason::MalformedPacket);
        };
        let Some(v_minor) = rd_u8(&pkt, &mut p) else {
            return drop(0x2bdb0001, PacketDropReason::MalformedPacket);
        };
        let Some(v_revision) = rd_u16(&pkt, &mut p) else {
            return drop(0x2bdb0001, PacketDropReason::MalformedPacket);
        };
        let Some(timestamp) = rd_u64(&pkt, &mut p) else {
            return drop(0x2bdb0001, PacketDropReason::MalformedPacket);
        };

        let Ok((id, id_len)) = Identity::unmarshal(&pkt[p..]) else {
            return drop(0x707a9810, PacketDropReason::InvalidObject);
        };
        p += id_len;
        if source != id.address() {
            return drop(0x06aa9ff1, PacketDropReason::MacFailed);
        }

        // Identity decoded; resolve the session key.
        let existing = node.topology().peer(node, source, true);
        let key: std::sync::Arc<SymmetricKey> = match &existing {
            Some(peer) if *peer.identity() == id => peer.identity_key(),
            Some(_) => {
                // Address collision with a different key set. The work
                // function makes this prohibitive to forge; drop.
                return drop(0x46db8011, PacketDropReason::InvalidObject);
            }
            None => match node.identity().agree(&id) {
                Ok(shared) => {
                    std::sync::Arc::new(SymmetricKey::permanent(now, shared.session_key()))
                }
                Err(_) => return drop(0x46db8010, PacketDropReason::MacFailed),
            },
        };

        if !pre_authenticated {
            match packet::cipher_suite(&pkt) {
                Ok(CipherSuite::Poly1305None) => {
                    if !packet::dearmor(&mut pkt, key.key(), CipherSuite::Poly1305None) {
                        return drop(0x11bfff81, PacketDropReason::MacFailed);
                    }
                }
                // Trusted-path HELLO: no MAC; the MAC field carries a path
                // id that must match a configured trusted link.
                Ok(CipherSuite::None) => {
                    let trusted = node.config().trusted_paths.iter().any(|tp| {
                        tp.id == packet::mac_field(&pkt) && tp.matches(path.address().ip())
                    });
                    if !trusted {
                        return drop(0x2dfa910c, PacketDropReason::NotTrustedPath);
                    }
                }
                _ => return drop(0x11bfff81, PacketDropReason::MacFailed),
            }
        }

        // End-to-end HMAC trailer for modern peers.
        let mut packet_size = pkt.len();
        if proto >= 11 {
            if packet_size <= HEADER_SIZE + 48 {
                return drop(0x1000662a, PacketDropReason::MacFailed);
            }
            packet_size -= 48;
            let hmac_key = kdf::kbkdf_hmac_sha384(key.key(), kdf::LABEL_HELLO_HMAC, 0, 0);
            let expected = kdf::hmac_sha384(&hmac_key, &pkt[HEADER_SIZE..packet_size]);
            if !kdf::secure_eq(&expected, &pkt[packet_size..]) {
                return drop(0x1000662a, PacketDropReason::MacFailed);
            }
        }

        let Ok((observed, ep_len)) = Endpoint::unmarshal(&pkt[p..packet_size]) else {
            return drop(0x10001003, PacketDropReason::InvalidObject);
        };
        p += ep_len;

        let mut dict = Dictionary::new();
        if p < packet_size {
            let Some(dict_len) = rd_u16(&pkt[..packet_size], &mut p) else {
                return drop(0x0d0f0112, PacketDropReason::MalformedPacket);
            };
            let end = p + dict_len as usize;
            if end > packet_size {
                return drop(0x0d0f0112, PacketDropReason::MalformedPacket);
            }
            if dict_len > 0 {
                let mut ct = pkt[p..end].to_vec();
                dict_crypt(key.key(), 0, packet_id, &mut ct);
                match Dictionary::decode(&ct) {
                    Ok(d) => dict = d,
                    Err(_) => return drop(0x67192344, PacketDropReason::InvalidObject),
                }
            }
        }

        // Fully validated. Learn the peer if new; new identities must
        // pass the address proof-of-work.
        let peer = match existing {
            Some(peer) => peer,
            None => {
                if !id.locally_validate() {
                    return drop(0x2ff7a909, PacketDropReason::InvalidObject);
                }
                let Ok(fresh) = Peer::new(node.identity(), id.clone(), now) else {
                    return drop(0x46db8010, PacketDropReason::InvalidObject);
                };
                node.topology().add_peer(node, std::sync::Arc::new(fresh))
            }
        };

        peer.set_remote_version(proto, v_major as u16, v_minor as u16, v_revision);
        if let Some(token) = dict.get_u32(KEY_PROBE_TOKEN) {
            peer.set_remote_probe(token);
        }
        if let Some(eph) = dict.get_bytes(KEY_EPHEMERAL_KEY) {
            if let Ok(raw) = <[u8; 32]>::try_from(eph) {
                peer.receive_ephemeral(&raw, now);
            }
        }
        let _ = dict.get_u64(KEY_SOFTWARE_VERSION);

        if hops == 0 {
            let surface = dict
                .get_endpoint(KEY_PHYSICAL_DEST)
                .or(Some(observed))
                .and_then(|ep| ep.inet_addr());
            if let Some(surface) = surface {
                node.self_awareness().iam(
                    node,
                    id.address(),
                    path.local_socket(),
                    path.address(),
                    &surface,
                    node.topology().is_root(&id),
                    now,
                );
            }
        }

        self.send_ok_hello(node, now, path, &peer, packet_id, timestamp, proto);

        peer.received(
            node,
            path,
            hops,
            packet_id,
            pkt.len().saturating_sub(PAYLOAD_START),
            Verb::Hello,
            Verb::Nop,
            now,
        );
    }

    /// Compose and send OK(HELLO). Always under the permanent key: the
    /// requester may not share an ephemeral session yet.
    #[allow(clippy::too_many_arguments)]
    fn send_ok_hello(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        peer: &std::sync::Arc<Peer>,
        in_re_packet_id: u64,
        timestamp_echo: u64,
        their_proto: u8,
    ) {
        let key = peer.identity_key();
        let mut pkt = packet::compose_ok(
            peer.address(),
            node.identity().address(),
            Verb::Hello,
            in_re_packet_id,
        );
        pkt.extend_from_slice(&timestamp_echo.to_be_bytes());
        pkt.push(PROTOCOL_VERSION);
        let (v_major, v_minor, v_rev) = node.config().version;
        pkt.push(v_major as u8);
        pkt.push(v_minor as u8);
        pkt.extend_from_slice(&v_rev.to_be_bytes());
        Endpoint::Inet(*path.address()).marshal(&mut pkt);

        let pid = key.next_message_iv();
        packet::set_packet_id(&mut pkt, pid);

        let mut dict = Dictionary::new();
        dict.set_u64(KEY_SOFTWARE_VERSION, node.config().packed_version());
        dict.set_u32(KEY_PROBE_TOKEN, peer.local_probe());
        dict.set_bytes(KEY_EPHEMERAL_KEY, peer.ephemeral_public(now).to_vec());
        let mut dict_bytes = dict.encode();
        dict_crypt(key.key(), 1, pid, &mut dict_bytes);
        pkt.extend_from_slice(&(dict_bytes.len() as u16).to_be_bytes());
        pkt.extend_from_slice(&dict_bytes);

        if their_proto >= 11 {
            let hmac_key = kdf::kbkdf_hmac_sha384(key.key(), kdf::LABEL_HELLO_HMAC, 0, 1);
            let tag = kdf::hmac_sha384(&hmac_key, &pkt[HEADER_SIZE..]);
            pkt.extend_from_slice(&tag);
        }

        packet::armor_with_id(&mut pkt, key.key(), CipherSuite::Poly1305Salsa2012);
        path.send(node.host(), &pkt, now);
        peer.sent(now, pkt.len());
    }

    // --- OK / ERROR ----------------------------------------------------------

    fn handle_error(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        peer: &std::sync::Arc<Peer>,
        pkt: &[u8],
        in_re_verb: &mut Verb,
    ) -> bool {
        if pkt.len() < ERROR_PAYLOAD_START {
            node.trace().packet_dropped(
                0x3beb1947,
                packet::packet_id(pkt),
                Some(peer.address()),
                Some(path.address()),
                packet::hops(pkt),
                Verb::Error as u8,
                PacketDropReason::MalformedPacket,
            );
            return false;
        }
        let re_verb = Verb::try_from(pkt[PAYLOAD_START]).unwrap_or(Verb::Nop);
        let in_re_packet_id = u64::from_be_bytes(pkt[PAYLOAD_START + 1..OK_PAYLOAD_START].try_into().unwrap());
        if !node.expect().expecting(in_re_packet_id, now) {
            node.trace().packet_dropped(
                0x4c1f1ff7,
                packet::packet_id(pkt),
                Some(peer.address()),
                Some(path.address()),
                packet::hops(pkt),
                Verb::Error as u8,
                PacketDropReason::ReplyNotExpected,
            );
            return false;
        }
        *in_re_verb = re_verb;
        let code = packet::ErrorCode::try_from(pkt[OK_PAYLOAD_START]).ok();
        tracing::debug!(peer = %peer.address(), ?re_verb, ?code, "peer reported error");
        true
    }

    fn handle_ok(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        peer: &std::sync::Arc<Peer>,
        pkt: &[u8],
        hops: u8,
        in_re_verb: &mut Verb,
    ) -> bool {
        if pkt.len() < OK_PAYLOAD_START {
            node.trace().packet_dropped(
                0x4c1f1ff7,
                packet::packet_id(pkt),
                Some(peer.address()),
                Some(path.address()),
                hops,
                Verb::Ok as u8,
                PacketDropReason::MalformedPacket,
            );
            return false;
        }
        let re_verb = Verb::try_from(pkt[PAYLOAD_START]).unwrap_or(Verb::Nop);
        let in_re_packet_id = u64::from_be_bytes(pkt[PAYLOAD_START + 1..OK_PAYLOAD_START].try_into().unwrap());
        if !node.expect().expecting(in_re_packet_id, now) {
            node.trace().packet_dropped(
                0x4c1f1ff7,
                packet::packet_id(pkt),
                Some(peer.address()),
                Some(path.address()),
                hops,
                Verb::Ok as u8,
                PacketDropReason::ReplyNotExpected,
            );
            return false;
        }
        *in_re_verb = re_verb;

        match re_verb {
            Verb::Hello => self.handle_ok_hello(node, now, path, peer, pkt, hops),
            Verb::Whois => self.handle_ok_whois(node, now, path, pkt),
            Verb::Echo => {
                if let Some((sent_at, payload)) =
                    self.echo_outstanding.lock().remove(&in_re_packet_id)
                {
                    if &pkt[OK_PAYLOAD_START..] == payload.as_slice() {
                        path.record_latency((now - sent_at).max(0) as u32);
                    } else {
                        return false;
                    }
                }
                true
            }
            _ => true,
        }
    }

    fn handle_ok_hello(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        peer: &std::sync::Arc<Peer>,
        pkt: &[u8],
        hops: u8,
    ) -> bool {
        let key = peer.identity_key();
        let mut packet_size = pkt.len();

        // Responder appends the HMAC trailer because we are modern.
        if packet_size <= OK_PAYLOAD_START + 48 {
            return false;
        }
        packet_size -= 48;
        let hmac_key = kdf::kbkdf_hmac_sha384(key.key(), kdf::LABEL_HELLO_HMAC, 0, 1);
        let expected = kdf::hmac_sha384(&hmac_key, &pkt[HEADER_SIZE..packet_size]);
        if !kdf::secure_eq(&expected, &pkt[packet_size..]) {
            return false;
        }

        let mut p = OK_PAYLOAD_START;
        let Some(timestamp_echo) = rd_u64(&pkt[..packet_size], &mut p) else {
            return false;
        };
        let Some(proto) = rd_u8(&pkt[..packet_size], &mut p) else {
            return false;
        };
        let Some(v_major) = rd_u8(&pkt[..packet_size], &mut p) else {
            return false;
        };
        let Some(v_minor) = rd_u8(&pkt[..packet_size], &mut p) else {
            return false;
        };
        let Some(v_revision) = rd_u16(&pkt[..packet_size], &mut p) else {
            return false;
        };
        let Ok((observed, ep_len)) = Endpoint::unmarshal(&pkt[p..packet_size]) else {
            return false;
        };
        p += ep_len;

        let mut dict = Dictionary::new();
        if p < packet_size {
            let Some(dict_len) = rd_u16(&pkt[..packet_size], &mut p) else {
                return false;
            };
            let end = p + dict_len as usize;
            if end > packet_size {
                return false;
            }
            if dict_len > 0 {
                let mut ct = pkt[p..end].to_vec();
                dict_crypt(key.key(), 1, packet::packet_id(pkt), &mut ct);
                match Dictionary::decode(&ct) {
                    Ok(d) => dict = d,
                    Err(_) => return false,
                }
            }
        }

        peer.set_remote_version(proto, v_major as u16, v_minor as u16, v_revision);
        if let Some(token) = dict.get_u32(KEY_PROBE_TOKEN) {
            peer.set_remote_probe(token);
        }
        if let Some(eph) = dict.get_bytes(KEY_EPHEMERAL_KEY) {
            if let Ok(raw) = <[u8; 32]>::try_from(eph) {
                peer.receive_ephemeral(&raw, now);
            }
        }

        let rtt = (now - timestamp_echo as i64).max(0) as u32;
        path.record_latency(rtt);

        if hops == 0 {
            if let Some(surface) = observed.inet_addr() {
                node.self_awareness().iam(
                    node,
                    peer.address(),
                    path.local_socket(),
                    path.address(),
                    &surface,
                    node.topology().is_root(peer.identity()),
                    now,
                );
            }
        }
        true
    }

    /// Intake of OK(WHOIS): learn identities (and locators from modern
    /// roots), then replay any ciphertext queued for those addresses.
    fn handle_ok_whois(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        pkt: &[u8],
    ) -> bool {
        let mut p = OK_PAYLOAD_START;
        while p < pkt.len() {
            let Ok((id, id_len)) = Identity::unmarshal(&pkt[p..]) else {
                return false;
            };
            p += id_len;
            let mut locator = None;
            if p < pkt.len() {
                let Ok((loc, loc_len)) = Locator::unmarshal(&pkt[p..]) else {
                    return false;
                };
                p += loc_len;
                if loc.is_signed() {
                    locator = Some(loc);
                }
            }

            if !id.locally_validate() {
                continue;
            }
            let Ok(fresh) = Peer::new(node.identity(), id.clone(), now) else {
                continue;
            };
            let peer = node.topology().add_peer(node, std::sync::Arc::new(fresh));
            if let Some(loc) = locator {
                peer.set_locator(loc);
            }

            // Replay packets that were waiting on this identity.
            let queued = self
                .whois_queue
                .lock()
                .remove(&id.address())
                .map(|item| item.packets)
                .unwrap_or_default();
            for queued_pkt in queued {
                self.process_assembled(node, now, path, queued_pkt);
            }
        }
        true
    }

    // --- queries -------------------------------------------------------------

    fn handle_whois(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        peer: &std::sync::Arc<Peer>,
        pkt: &[u8],
    ) -> bool {
        if !peer.rate_gate_whois(now) {
            node.trace().packet_dropped(
                0x19f7194a,
                packet::packet_id(pkt),
                Some(peer.address()),
                Some(path.address()),
                packet::hops(pkt),
                Verb::Whois as u8,
                PacketDropReason::RateLimitExceeded,
            );
            return true;
        }
        let modern = peer.protocol_version() >= 11;
        let key = peer.send_key(now);
        let in_re_packet_id = packet::packet_id(pkt);

        let mut p = PAYLOAD_START;
        let mut reply: Option<Vec<u8>> = None;
        while p + 5 <= pkt.len() {
            let addr = match Address::from_slice(&pkt[p..p + 5]) {
                Ok(a) => a,
                Err(_) => return false,
            };
            p += 5;
            let Some(found) = node.topology().peer(node, addr, true) else {
                continue;
            };

            let out = reply.get_or_insert_with(|| {
                packet::compose_ok(
                    peer.address(),
                    node.identity().address(),
                    Verb::Whois,
                    in_re_packet_id,
                )
            });
            out.extend_from_slice(&found.identity().marshal(false));
            if modern {
                let loc = found.locator().unwrap_or_default();
                out.extend_from_slice(&loc.marshal());
            }

            // Responses span multiple packets rather than fragmenting.
            if out.len() + 1024 > packet::MAX_UDP_PAYLOAD {
                let mut full = reply.take().expect("just inserted");
                packet::armor(&mut full, &key, CipherSuite::Poly1305Salsa2012);
                path.send(node.host(), &full, now);
                peer.sent(now, full.len());
            }
        }
        if let Some(mut out) = reply {
            packet::armor(&mut out, &key, CipherSuite::Poly1305Salsa2012);
            path.send(node.host(), &out, now);
            peer.sent(now, out.len());
        }
        true
    }

    /// RENDEZVOUS is only honored from roots: it names a third party and
    /// a transport address to try for hole punching.
    fn handle_rendezvous(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        peer: &std::sync::Arc<Peer>,
        pkt: &[u8],
    ) -> bool {
        if !node.topology().is_root(peer.identity()) {
            return true;
        }
        let mut p = PAYLOAD_START;
        let Some(flags) = rd_u8(pkt, &mut p) else {
            return malformed_rendezvous(node, path, peer, pkt);
        };
        if p + 5 > pkt.len() {
            return malformed_rendezvous(node, path, peer, pkt);
        }
        let Ok(with_addr) = Address::from_slice(&pkt[p..p + 5]) else {
            return malformed_rendezvous(node, path, peer, pkt);
        };
        p += 5;
        let Some(port) = rd_u16(pkt, &mut p) else {
            return malformed_rendezvous(node, path, peer, pkt);
        };
        let Some(addr_len) = rd_u8(pkt, &mut p) else {
            return malformed_rendezvous(node, path, peer, pkt);
        };
        if port == 0 || p + addr_len as usize > pkt.len() {
            return malformed_rendezvous(node, path, peer, pkt);
        }
        let ip = match addr_len {
            4 => std::net::IpAddr::from(<[u8; 4]>::try_from(&pkt[p..p + 4]).unwrap()),
            16 => std::net::IpAddr::from(<[u8; 16]>::try_from(&pkt[p..p + 16]).unwrap()),
            _ => return malformed_rendezvous(node, path, peer, pkt),
        };
        let target = InetAddress::new(ip, port);

        if let Some(with) = node.topology().peer(node, with_addr, true) {
            let ep = Endpoint::Inet(target);
            with.try_direct_path(now, ep, flags & PATH_FLAG_BFG1024 != 0);
            node.trace().trying_new_path(
                0x55a19aaa,
                with.address(),
                &ep,
                Some(path.address()),
                TryReason::Rendezvous,
            );
        }
        true
    }

    fn handle_echo(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        peer: &std::sync::Arc<Peer>,
        pkt: &[u8],
        packet_id: u64,
    ) -> bool {
        if !peer.rate_gate_echo(now) {
            node.trace().packet_dropped(
                0x27878bc1,
                packet_id,
                Some(peer.address()),
                Some(path.address()),
                packet::hops(pkt),
                Verb::Echo as u8,
                PacketDropReason::RateLimitExceeded,
            );
            return true;
        }
        let mut out = packet::compose_ok(
            peer.address(),
            node.identity().address(),
            Verb::Echo,
            packet_id,
        );
        out.extend_from_slice(&pkt[PAYLOAD_START..]);
        let key = peer.send_key(now);
        packet::armor(&mut out, &key, CipherSuite::Poly1305Salsa2012);
        path.send(node.host(), &out, now);
        peer.sent(now, out.len());
        true
    }

    /// A list of (flags, extended attributes, endpoint) records, each a
    /// candidate for the peer's try-queue
    fn handle_push_direct_paths(
        &self,
        node: &Node,
        now: i64,
        path: &std::sync::Arc<Path>,
        peer: &std::sync::Arc<Peer>,
        pkt: &[u8],
    ) -> bool {
        let mut p = PAYLOAD_START;
        let Some(count) = rd_u16(pkt, &mut p) else {
            return false;
        };
        for _ in 0..count {
            let Some(flags) = rd_u8(pkt, &mut p) else {
                return false;
            };
            let Some(ext_len) = rd_u16(pkt, &mut p) else {
                return false;
            };
            if p + ext_len as usize > pkt.len() {
                return false;
            }
            p += ext_len as usize; // extended attributes: reserved
            let Ok((ep, ep_len)) = Endpoint::unmarshal(&pkt[p..]) else {
                node.trace().packet_dropped(
                    0xaed00118,
                    packet::packet_id(pkt),
                    Some(peer.address()),
                    Some(path.address()),
                    packet::hops(pkt),
                    Verb::PushDirectPaths as u8,
                    PacketDropReason::MalformedPacket,
                );
                return false;
            };
            p += ep_len;
            if ep.is_inet() {
                peer.try_direct_path(now, ep, flags & PATH_FLAG_BFG1024 != 0);
                node.trace().trying_new_path(
                    0xa5ab1a43,
                    peer.address(),
                    &ep,
                    Some(path.address()),
                    TryReason::PushDirectPaths,
                );
            }
        }
        true
    }

    fn handle_user_message(
        &self,
        node: &Node,
        peer: &std::sync::Arc<Peer>,
        pkt: &[u8],
    ) -> bool {
        let mut p = PAYLOAD_START;
        let Some(type_id) = rd_u64(pkt, &mut p) else {
            return false;
        };
        node.host().event(Event::UserMessage {
            source: peer.address(),
            type_id,
            data: Bytes::copy_from_slice(&pkt[p..]),
        });
        true
    }
}

impl Default for Vl1 {
    fn default() -> Self {
        Self::new()
    }
}

fn malformed_rendezvous(
    node: &Node,
    path: &std::sync::Arc<Path>,
    peer: &std::sync::Arc<Peer>,
    pkt: &[u8],
) -> bool {
    node.trace().packet_dropped(
        0x43e90ab3,
        packet::packet_id(pkt),
        Some(peer.address()),
        Some(path.address()),
        packet::hops(pkt),
        Verb::Rendezvous as u8,
        PacketDropReason::MalformedPacket,
    );
    false
}

/// AES-256-CTR over the metadata dictionary. The key is derived from the
/// session key with the dictionary label (`iter` 0 for requests, 1 for
/// replies); the IV is the packet id, so the MAC over the ciphertext
/// binds the dictionary to its packet.
pub(crate) fn dict_crypt(session_key: &[u8; 32], iter: u8, packet_id: u64, data: &mut [u8]) {
    let derived = kdf::kbkdf_hmac_sha384(session_key, kdf::LABEL_DICTIONARY, 0, iter);
    let mut key = [0u8; 32];
    key.copy_from_slice(&derived[..32]);
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&packet_id.to_be_bytes());
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(data);
}

fn rd_u8(pkt: &[u8], p: &mut usize) -> Option<u8> {
    let v = *pkt.get(*p)?;
    *p += 1;
    Some(v)
}

fn rd_u16(pkt: &[u8], p: &mut usize) -> Option<u16> {
    let b = pkt.get(*p..*p + 2)?;
    *p += 2;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn rd_u64(pkt: &[u8], p: &mut usize) -> Option<u64> {
    let b = pkt.get(*p..*p + 8)?;
    *p += 8;
    Some(u64::from_be_bytes(b.try_into().unwrap()))
}
