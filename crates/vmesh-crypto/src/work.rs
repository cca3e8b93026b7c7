//! Proof-of-Work Address Derivation
//!
//! Addresses are not free to mint: the 40-bit address of an identity is
//! taken from the tail of a memory-hard digest of its public key material,
//! and the digest must satisfy a difficulty criterion. Forging an identity
//! that collides with a given address therefore requires a large multiple
//! of the work spent generating one honestly.
//!
//! The construction: SHA-512 of the key material seeds a Salsa20 keystream
//! that fills a 2 MiB arena; a data-dependent mixing pass walks the arena
//! in 64-bit lanes; the final digest is SHA-512 over the seed and the
//! mixed arena.

use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use sha2::{Digest, Sha512};

use crate::address::Address;

/// Arena size for the memory-hard fill
const ARENA_SIZE: usize = 2 * 1024 * 1024;

/// Difficulty criterion: first digest byte must be below this
const CRITERION_FIRST_BYTE_LESS_THAN: u8 = 17;

/// Offset of the address bytes within the 64-byte digest
const ADDRESS_DIGEST_OFFSET: usize = 59;

/// Compute the memory-hard digest of public key material.
pub fn memory_hard_digest(key_material: &[u8]) -> [u8; 64] {
    let seed: [u8; 64] = Sha512::digest(key_material).into();

    let mut arena = vec![0u8; ARENA_SIZE];
    let key = salsa20::Key::from_slice(&seed[..32]);
    let nonce = salsa20::Nonce::from_slice(&seed[32..40]);
    let mut stream = Salsa20::new(key, nonce);
    stream.apply_keystream(&mut arena);

    // Data-dependent lane mixing. Each step's target index depends on the
    // running state, forcing the whole arena to stay resident.
    let lanes = ARENA_SIZE / 8;
    let mut x = u64::from_le_bytes(seed[..8].try_into().unwrap()) | 1;
    for i in 0..lanes {
        let j = (x as usize) % lanes;
        let a = load_lane(&arena, i);
        let b = load_lane(&arena, j);
        store_lane(&mut arena, i, b.wrapping_add(x).rotate_left(19));
        store_lane(&mut arena, j, a ^ x);
        x = x.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(31) ^ b;
    }

    let mut h = Sha512::new();
    h.update(seed);
    h.update(&arena);
    h.finalize().into()
}

/// Derive the address for public key material, if it satisfies the
/// proof-of-work criterion.
///
/// Returns `None` when the digest misses the difficulty target or the
/// resulting address is structurally invalid; identity generation draws a
/// fresh keypair and retries. A 0xff first byte is rejected along with
/// zero: on the wire that byte position doubles as the fragment
/// discriminator.
pub fn derive_address(key_material: &[u8]) -> Option<Address> {
    let digest = memory_hard_digest(key_material);
    if digest[0] >= CRITERION_FIRST_BYTE_LESS_THAN {
        return None;
    }
    let mut b = [0u8; 5];
    b.copy_from_slice(&digest[ADDRESS_DIGEST_OFFSET..ADDRESS_DIGEST_OFFSET + 5]);
    if b[0] == 0xff {
        return None;
    }
    let addr = Address::from_bytes(&b);
    addr.is_valid().then_some(addr)
}

#[inline]
fn load_lane(arena: &[u8], lane: usize) -> u64 {
    u64::from_le_bytes(arena[lane * 8..lane * 8 + 8].try_into().unwrap())
}

#[inline]
fn store_lane(arena: &mut [u8], lane: usize, v: u64) {
    arena[lane * 8..lane * 8 + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        let a = memory_hard_digest(b"key material");
        let b = memory_hard_digest(b"key material");
        assert_eq!(a, b);
        let c = memory_hard_digest(b"other material");
        assert_ne!(a, c);
    }

    #[test]
    fn test_derive_address_consistency() {
        // Whatever the outcome for a fixed input, it must be stable.
        assert_eq!(derive_address(b"fixed input"), derive_address(b"fixed input"));
    }

    #[test]
    fn test_derived_address_is_valid() {
        // Brute a few inputs until one passes, then check validity.
        for i in 0u32..4096 {
            if let Some(addr) = derive_address(&i.to_le_bytes()) {
                assert!(addr.is_valid());
                return;
            }
        }
        // ~1/16 of digests pass the criterion; 4096 misses would mean
        // the criterion check is broken.
        panic!("no input satisfied the work criterion");
    }
}
