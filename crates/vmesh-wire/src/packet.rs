//! Packet Framing and the MAC/Cipher Pipeline
//!
//! Wire layout of a packet head (27-byte header, verb byte at 27):
//!
//! | off | len | field |
//! |-----|-----|-------|
//! | 0   | 8   | packet id / outer nonce |
//! | 8   | 5   | destination address |
//! | 13  | 5   | source address |
//! | 18  | 1   | flags:3 \| cipher:2 \| hops:3 |
//! | 19  | 8   | MAC (or trusted path id) |
//! | 27  | 1   | flags:3 \| verb:5 |
//!
//! Tail fragments reuse the destination field and signal themselves with
//! a 0xff discriminator where the source high byte would be.
//!
//! Armoring is encrypt-then-MAC: the per-packet key is the session key
//! mangled with the header's id/destination/source bytes (hops excluded,
//! they mutate in flight) and the packet length; Salsa20/12 keystream
//! block zero keys Poly1305; payload encryption starts at keystream
//! offset 64; the first 8 tag bytes land in the header.

use poly1305::universal_hash::KeyInit as _;
use poly1305::Poly1305;
use salsa20::cipher::{KeyIvInit as _, StreamCipher as _, StreamCipherSeek as _};
use salsa20::Salsa12;

use vmesh_crypto::{Address, SymmetricKey};

use crate::error::{WireError, WireResult};

/// Header length; also the start of the MAC'd/encrypted section
pub const HEADER_SIZE: usize = 27;

/// Offset of the verb byte
pub const VERB_INDEX: usize = 27;

/// Smallest valid unfragmented packet (header + verb)
pub const MIN_PACKET_LENGTH: usize = 28;

/// Smallest valid fragment (full fragment header)
pub const MIN_FRAGMENT_LENGTH: usize = 16;

/// Offset of the fragment discriminator byte
pub const FRAGMENT_INDICATOR_INDEX: usize = 13;

/// Discriminator value marking a tail fragment
pub const FRAGMENT_INDICATOR: u8 = 0xff;

/// Offset of the `((total - 1) << 4) | index` byte in a tail fragment.
/// The high nibble stores the fragment count minus one so the full
/// 2..=16 range fits in four bits.
pub const FRAGMENT_COUNTS_INDEX: usize = 14;

/// Offset of the hops byte in a tail fragment
pub const FRAGMENT_HOPS_INDEX: usize = 15;

/// First payload byte of a tail fragment
pub const FRAGMENT_PAYLOAD_START: usize = 16;

/// Largest assembled packet
pub const MAX_PACKET_LENGTH: usize = crate::buf::BUF_SIZE;

/// Default UDP payload budget per datagram
pub const MAX_UDP_PAYLOAD: usize = 1432;

/// Default UDP port
pub const DEFAULT_UDP_PORT: u16 = 793;

/// Physical MTU floor below which fragmentation cannot be avoided
pub const MIN_PHYSICAL_MTU: usize = 1400;

/// Virtual network MTU bounds
pub const MIN_VIRTUAL_MTU: usize = 1280;
pub const MAX_VIRTUAL_MTU: usize = 10000;

/// Length of a bare probe datagram
pub const PROBE_LENGTH: usize = 4;

/// Maximum relay hops
pub const MAX_HOPS: u8 = 7;

/// Flags byte: packet continues in fragments
pub const FLAG_FRAGMENTED: u8 = 0x40;

const HOPS_MASK: u8 = 0x07;
const CIPHER_SHIFT: u8 = 3;
const CIPHER_MASK: u8 = 0x03;

/// Verb byte: payload is LZ4 compressed
pub const VERB_FLAG_COMPRESSED: u8 = 0x80;

/// Verb byte: verb code mask
pub const VERB_MASK: u8 = 0x1f;

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 11;

/// Oldest protocol version accepted in HELLO
pub const PROTOCOL_VERSION_MIN: u8 = 8;

/// First payload byte after the verb
pub const PAYLOAD_START: usize = VERB_INDEX + 1;

/// Byte offset where OK/ERROR payloads begin (verb + in-re verb + in-re id)
pub const OK_PAYLOAD_START: usize = VERB_INDEX + 1 + 1 + 8;
pub const ERROR_PAYLOAD_START: usize = OK_PAYLOAD_START + 1;

/// Packet verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    Hello = 0x01,
    Error = 0x02,
    Ok = 0x03,
    Whois = 0x04,
    Rendezvous = 0x05,
    Frame = 0x06,
    ExtFrame = 0x07,
    Echo = 0x08,
    MulticastLike = 0x09,
    NetworkCredentials = 0x0a,
    NetworkConfigRequest = 0x0b,
    NetworkConfig = 0x0c,
    MulticastGather = 0x0d,
    PushDirectPaths = 0x10,
    UserMessage = 0x14,
    Multicast = 0x16,
    Encap = 0x17,
}

impl TryFrom<u8> for Verb {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value & VERB_MASK {
            0x00 => Ok(Self::Nop),
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Error),
            0x03 => Ok(Self::Ok),
            0x04 => Ok(Self::Whois),
            0x05 => Ok(Self::Rendezvous),
            0x06 => Ok(Self::Frame),
            0x07 => Ok(Self::ExtFrame),
            0x08 => Ok(Self::Echo),
            0x09 => Ok(Self::MulticastLike),
            0x0a => Ok(Self::NetworkCredentials),
            0x0b => Ok(Self::NetworkConfigRequest),
            0x0c => Ok(Self::NetworkConfig),
            0x0d => Ok(Self::MulticastGather),
            0x10 => Ok(Self::PushDirectPaths),
            0x14 => Ok(Self::UserMessage),
            0x16 => Ok(Self::Multicast),
            0x17 => Ok(Self::Encap),
            v => Err(WireError::UnrecognizedVerb(v)),
        }
    }
}

/// Outer cipher suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    /// Poly1305 MAC, payload in the clear (HELLO only)
    Poly1305None = 0,
    /// Poly1305 MAC over Salsa20/12-encrypted payload
    Poly1305Salsa2012 = 1,
    /// No MAC or encryption; MAC field carries a trusted path id
    None = 2,
}

impl TryFrom<u8> for CipherSuite {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(Self::Poly1305None),
            1 => Ok(Self::Poly1305Salsa2012),
            2 => Ok(Self::None),
            // 3 is reserved for an AES-class suite; not decoded.
            v => Err(WireError::UnsupportedCipherSuite(v)),
        }
    }
}

/// ERROR packet codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    InvalidRequest = 1,
    BadProtocolVersion = 2,
    ObjNotFound = 3,
    UnsupportedOperation = 4,
    NeedMembershipCertificate = 5,
    NetworkAccessDenied = 6,
}

impl TryFrom<u8> for ErrorCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            1 => Ok(Self::InvalidRequest),
            2 => Ok(Self::BadProtocolVersion),
            3 => Ok(Self::ObjNotFound),
            4 => Ok(Self::UnsupportedOperation),
            5 => Ok(Self::NeedMembershipCertificate),
            6 => Ok(Self::NetworkAccessDenied),
            v => Err(WireError::InvalidPacket(format!("unknown error code {}", v))),
        }
    }
}

// --- header field accessors -------------------------------------------------

pub fn packet_id(pkt: &[u8]) -> u64 {
    u64::from_be_bytes(pkt[0..8].try_into().unwrap())
}

pub fn set_packet_id(pkt: &mut [u8], id: u64) {
    pkt[0..8].copy_from_slice(&id.to_be_bytes());
}

pub fn destination(pkt: &[u8]) -> Address {
    Address::from_slice(&pkt[8..13]).expect("length checked by caller")
}

pub fn source(pkt: &[u8]) -> Address {
    Address::from_slice(&pkt[13..18]).expect("length checked by caller")
}

pub fn hops(pkt: &[u8]) -> u8 {
    pkt[18] & HOPS_MASK
}

/// Increment the hop count; `None` once the relay limit is reached
pub fn bump_hops(pkt: &mut [u8]) -> Option<u8> {
    let h = hops(pkt) + 1;
    if h >= MAX_HOPS {
        return None;
    }
    pkt[18] = (pkt[18] & !HOPS_MASK) | h;
    Some(h)
}

pub fn cipher_suite(pkt: &[u8]) -> WireResult<CipherSuite> {
    CipherSuite::try_from((pkt[18] >> CIPHER_SHIFT) & CIPHER_MASK)
}

pub fn is_fragmented(pkt: &[u8]) -> bool {
    pkt[18] & FLAG_FRAGMENTED != 0
}

pub fn set_fragmented(pkt: &mut [u8]) {
    pkt[18] |= FLAG_FRAGMENTED;
}

pub fn mac_field(pkt: &[u8]) -> u64 {
    u64::from_be_bytes(pkt[19..27].try_into().unwrap())
}

pub fn set_mac_field(pkt: &mut [u8], mac: u64) {
    pkt[19..27].copy_from_slice(&mac.to_be_bytes());
}

pub fn verb_byte(pkt: &[u8]) -> u8 {
    pkt[VERB_INDEX]
}

pub fn is_compressed(pkt: &[u8]) -> bool {
    pkt[VERB_INDEX] & VERB_FLAG_COMPRESSED != 0
}

/// Whether a datagram is a tail fragment
pub fn is_fragment(data: &[u8]) -> bool {
    data.len() > FRAGMENT_INDICATOR_INDEX && data[FRAGMENT_INDICATOR_INDEX] == FRAGMENT_INDICATOR
}

// --- composition ------------------------------------------------------------

/// Start a new packet: 27-byte header (id, flags, and MAC zeroed) plus
/// the verb byte. Payload is appended by the caller; `armor` finishes it.
pub fn compose(dest: Address, src: Address, verb: Verb) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_UDP_PAYLOAD);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&dest.to_bytes());
    out.extend_from_slice(&src.to_bytes());
    out.push(0);
    out.extend_from_slice(&[0u8; 8]);
    out.push(verb as u8);
    out
}

/// Append an OK reply preamble: in-re verb and in-re packet id
pub fn compose_ok(dest: Address, src: Address, in_re_verb: Verb, in_re_packet_id: u64) -> Vec<u8> {
    let mut out = compose(dest, src, Verb::Ok);
    out.push(in_re_verb as u8);
    out.extend_from_slice(&in_re_packet_id.to_be_bytes());
    out
}

/// Append an ERROR reply preamble
pub fn compose_error(
    dest: Address,
    src: Address,
    in_re_verb: Verb,
    in_re_packet_id: u64,
    code: ErrorCode,
) -> Vec<u8> {
    let mut out = compose(dest, src, Verb::Error);
    out.push(in_re_verb as u8);
    out.extend_from_slice(&in_re_packet_id.to_be_bytes());
    out.push(code as u8);
    out
}

// --- armor / dearmor --------------------------------------------------------

/// Derive the one-packet key: session key XOR header id/dest/src bytes
/// (0..18, hops byte excluded) with the packet length folded in.
fn per_packet_key(key: &[u8; 32], header: &[u8], packet_size: usize) -> [u8; 32] {
    let mut k = *key;
    for i in 0..18 {
        k[i] ^= header[i];
    }
    k[18] ^= (packet_size & 0xff) as u8;
    k[19] ^= ((packet_size >> 8) & 0xff) as u8;
    k
}

fn mac_and_cipher(
    key: &[u8; 32],
    pkt: &[u8],
) -> (Poly1305, Salsa12) {
    let ppk = per_packet_key(key, pkt, pkt.len());
    let nonce: [u8; 8] = pkt[0..8].try_into().unwrap();
    let mut salsa = Salsa12::new(&ppk.into(), &nonce.into());
    let mut mac_key = [0u8; 32];
    salsa.apply_keystream(&mut mac_key);
    // Payload keystream starts at the next 64-byte block boundary.
    salsa.seek(64u64);
    (Poly1305::new((&mac_key).into()), salsa)
}

/// Assign the packet id from the key's counter, encrypt (for the
/// Salsa20/12 suite), and write the MAC. Returns the packet id.
pub fn armor(pkt: &mut [u8], key: &SymmetricKey, suite: CipherSuite) -> u64 {
    let id = key.next_message_iv();
    set_packet_id(pkt, id);
    armor_with_id(pkt, key.key(), suite);
    id
}

/// Like [`armor`] but uses the packet id already present in the header.
/// For packets whose id must be known before the payload is final (the
/// HELLO dictionary IV is the packet id).
pub fn armor_with_id(pkt: &mut [u8], key: &[u8; 32], suite: CipherSuite) {
    pkt[18] = (pkt[18] & !(CIPHER_MASK << CIPHER_SHIFT)) | ((suite as u8) << CIPHER_SHIFT);

    if suite == CipherSuite::None {
        return;
    }

    let (poly, mut salsa) = mac_and_cipher(key, pkt);
    if suite == CipherSuite::Poly1305Salsa2012 {
        salsa.apply_keystream(&mut pkt[HEADER_SIZE..]);
    }
    let tag = poly.compute_unpadded(&pkt[HEADER_SIZE..]);
    let mac = u64::from_be_bytes(tag[0..8].try_into().unwrap());
    set_mac_field(pkt, mac);
}

/// Verify the MAC and decrypt in place. Returns false on MAC mismatch,
/// in which case the packet contents are untouched.
pub fn dearmor(pkt: &mut [u8], key: &[u8; 32], suite: CipherSuite) -> bool {
    if pkt.len() < MIN_PACKET_LENGTH {
        return false;
    }
    match suite {
        CipherSuite::None => true,
        CipherSuite::Poly1305None | CipherSuite::Poly1305Salsa2012 => {
            let (poly, mut salsa) = mac_and_cipher(key, pkt);
            let tag = poly.compute_unpadded(&pkt[HEADER_SIZE..]);
            let expected = u64::from_be_bytes(tag[0..8].try_into().unwrap());
            if expected != mac_field(pkt) {
                return false;
            }
            if suite == CipherSuite::Poly1305Salsa2012 {
                salsa.apply_keystream(&mut pkt[HEADER_SIZE..]);
            }
            true
        }
    }
}

/// Split an armored packet into head + tail fragments of at most
/// `fragment_size` payload bytes each.
pub fn fragment(pkt: &[u8], fragment_size: usize) -> WireResult<Vec<Vec<u8>>> {
    if pkt.len() <= fragment_size {
        return Ok(vec![pkt.to_vec()]);
    }
    if fragment_size <= FRAGMENT_PAYLOAD_START || pkt.len() < MIN_PACKET_LENGTH {
        return Err(WireError::InvalidPacket("fragment size too small".into()));
    }

    let tail_capacity = fragment_size - FRAGMENT_PAYLOAD_START;
    let remaining = pkt.len() - fragment_size;
    let tail_count = remaining.div_ceil(tail_capacity);
    let total = 1 + tail_count;
    if total > crate::fragment::MAX_FRAGMENTS {
        return Err(WireError::InvalidPacket(format!(
            "{} fragments exceeds maximum",
            total
        )));
    }

    let mut out = Vec::with_capacity(total);
    let mut head = pkt[..fragment_size].to_vec();
    set_fragmented(&mut head);
    out.push(head);

    let mut off = fragment_size;
    let mut index = 1u8;
    while off < pkt.len() {
        let end = (off + tail_capacity).min(pkt.len());
        let mut frag = Vec::with_capacity(FRAGMENT_PAYLOAD_START + (end - off));
        frag.extend_from_slice(&pkt[0..8]); // packet id
        frag.extend_from_slice(&pkt[8..13]); // destination
        frag.push(FRAGMENT_INDICATOR);
        frag.push((((total - 1) as u8) << 4) | index);
        frag.push(0); // hops
        frag.extend_from_slice(&pkt[off..end]);
        out.push(frag);
        off = end;
        index += 1;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: u64) -> Address {
        Address::from_u64(v)
    }

    fn test_key() -> SymmetricKey {
        SymmetricKey::permanent(1_700_000_000_000, [0x5a; 32])
    }

    #[test]
    fn test_header_fields() {
        let mut pkt = compose(addr(0x1111111111), addr(0x2222222222), Verb::Echo);
        pkt.extend_from_slice(b"payload");
        assert_eq!(destination(&pkt), addr(0x1111111111));
        assert_eq!(source(&pkt), addr(0x2222222222));
        assert_eq!(Verb::try_from(verb_byte(&pkt)).unwrap(), Verb::Echo);
        assert_eq!(hops(&pkt), 0);
        assert!(!is_fragmented(&pkt));
    }

    #[test]
    fn test_armor_dearmor_roundtrip() {
        let key = test_key();
        let mut pkt = compose(addr(0x1111111111), addr(0x2222222222), Verb::Echo);
        pkt.extend_from_slice(b"the payload bytes");
        let plain = pkt.clone();

        armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);
        assert_ne!(&pkt[HEADER_SIZE..], &plain[HEADER_SIZE..]);

        assert!(dearmor(&mut pkt, key.key(), CipherSuite::Poly1305Salsa2012));
        assert_eq!(&pkt[HEADER_SIZE..], &plain[HEADER_SIZE..]);
    }

    #[test]
    fn test_mac_tamper_rejected() {
        let key = test_key();
        let mut pkt = compose(addr(0x1111111111), addr(0x2222222222), Verb::Echo);
        pkt.extend_from_slice(b"data");
        armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);

        let last = pkt.len() - 1;
        pkt[last] ^= 0x01;
        assert!(!dearmor(&mut pkt, key.key(), CipherSuite::Poly1305Salsa2012));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = test_key();
        let mut pkt = compose(addr(0x1111111111), addr(0x2222222222), Verb::Echo);
        pkt.extend_from_slice(b"data");
        armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);
        assert!(!dearmor(&mut pkt, &[0x00; 32], CipherSuite::Poly1305Salsa2012));
    }

    #[test]
    fn test_hops_do_not_break_mac() {
        // Relays bump the hop count in flight; the MAC and per-packet key
        // must be insensitive to it.
        let key = test_key();
        let mut pkt = compose(addr(0x1111111111), addr(0x2222222222), Verb::Echo);
        pkt.extend_from_slice(b"data");
        armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);

        bump_hops(&mut pkt).unwrap();
        assert_eq!(hops(&pkt), 1);
        assert!(dearmor(&mut pkt, key.key(), CipherSuite::Poly1305Salsa2012));
    }

    #[test]
    fn test_poly1305_none_authenticates_plaintext() {
        let key = test_key();
        let mut pkt = compose(addr(0x1111111111), addr(0x2222222222), Verb::Hello);
        pkt.extend_from_slice(b"hello body");
        armor(&mut pkt, &key, CipherSuite::Poly1305None);

        // Payload still readable.
        assert_eq!(&pkt[HEADER_SIZE + 1..], b"hello body");
        assert!(dearmor(&mut pkt, key.key(), CipherSuite::Poly1305None));

        pkt[HEADER_SIZE + 2] ^= 0xff;
        assert!(!dearmor(&mut pkt, key.key(), CipherSuite::Poly1305None));
    }

    #[test]
    fn test_packet_ids_unique() {
        let key = test_key();
        let mut a = compose(addr(1 << 32), addr(2 << 32), Verb::Nop);
        let mut b = compose(addr(1 << 32), addr(2 << 32), Verb::Nop);
        let ia = armor(&mut a, &key, CipherSuite::Poly1305Salsa2012);
        let ib = armor(&mut b, &key, CipherSuite::Poly1305Salsa2012);
        assert_ne!(ia, ib);
    }

    #[test]
    fn test_fragment_layout() {
        let key = test_key();
        let mut pkt = compose(addr(0x1111111111), addr(0x2222222222), Verb::Frame);
        pkt.extend_from_slice(&vec![0xabu8; 5000]);
        armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);

        let frags = fragment(&pkt, MAX_UDP_PAYLOAD).unwrap();
        assert!(frags.len() >= 4);
        assert!(is_fragmented(&frags[0]));
        for (i, f) in frags.iter().enumerate().skip(1) {
            assert!(is_fragment(f));
            assert_eq!(packet_id(f), packet_id(&pkt));
            assert_eq!((f[FRAGMENT_COUNTS_INDEX] >> 4) + 1, frags.len() as u8);
            assert_eq!(f[FRAGMENT_COUNTS_INDEX] & 0x0f, i as u8);
        }

        // Reassemble manually and dearmor.
        let mut whole = frags[0].clone();
        for f in &frags[1..] {
            whole.extend_from_slice(&f[FRAGMENT_PAYLOAD_START..]);
        }
        // The head's fragmented flag is outside the MAC'd section.
        assert!(dearmor(&mut whole, key.key(), CipherSuite::Poly1305Salsa2012));
        assert_eq!(&whole[HEADER_SIZE + 1..], &vec![0xabu8; 5000][..]);
    }

    #[test]
    fn test_fragment_count_cap() {
        let pkt = vec![0u8; 16000];
        assert!(fragment(&pkt, 600).is_err());
    }

    #[test]
    fn test_fragment_maximum_count_roundtrip() {
        // Exactly 16 fragments: the count occupies the full 4-bit range.
        let key = test_key();
        let fragment_size = 100;
        let tail_capacity = fragment_size - FRAGMENT_PAYLOAD_START;
        let mut pkt = compose(addr(0x1111111111), addr(0x2222222222), Verb::Frame);
        let payload_len = fragment_size + 15 * tail_capacity - MIN_PACKET_LENGTH;
        pkt.extend_from_slice(&vec![0x77u8; payload_len]);
        armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012);

        let frags = fragment(&pkt, fragment_size).unwrap();
        assert_eq!(frags.len(), 16);
        for (i, f) in frags.iter().enumerate().skip(1) {
            assert_eq!((f[FRAGMENT_COUNTS_INDEX] >> 4) + 1, 16);
            assert_eq!(f[FRAGMENT_COUNTS_INDEX] & 0x0f, i as u8);
        }

        let mut whole = frags[0].clone();
        for f in &frags[1..] {
            whole.extend_from_slice(&f[FRAGMENT_PAYLOAD_START..]);
        }
        assert_eq!(whole.len(), pkt.len());
        assert!(dearmor(&mut whole, key.key(), CipherSuite::Poly1305Salsa2012));
        assert_eq!(&whole[HEADER_SIZE + 1..], &vec![0x77u8; payload_len][..]);

        // One more fragment would no longer fit the count nibble.
        let mut over = compose(addr(0x1111111111), addr(0x2222222222), Verb::Frame);
        over.extend_from_slice(&vec![0u8; payload_len + tail_capacity]);
        assert!(fragment(&over, fragment_size).is_err());
    }

    #[test]
    fn test_reserved_cipher_rejected() {
        let mut pkt = compose(addr(1 << 32), addr(2 << 32), Verb::Nop);
        pkt[18] |= 3 << CIPHER_SHIFT;
        assert!(cipher_suite(&pkt).is_err());
    }
}
