//! Node Addresses and Fingerprints
//!
//! An `Address` is the 40-bit short identifier of a node, derived from its
//! public key via the proof-of-work hash in [`crate::work`]. A
//! `Fingerprint` pairs the address with a SHA-384 of the full public key
//! material and identifies an identity with cryptographic strength.

use sha2::{Digest, Sha384};

use crate::constants::{ADDRESS_SIZE, FINGERPRINT_HASH_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// The reserved broadcast address, never assigned to a node
pub const RESERVED_ADDRESS: u64 = 0xff_ff_ff_ff_ff;

/// A 40-bit node address
///
/// Stored in the least significant bits of a `u64`; the top 24 bits are
/// always zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    /// Create from a raw integer, masking to 40 bits
    pub fn from_u64(v: u64) -> Self {
        Self(v & RESERVED_ADDRESS)
    }

    /// Create from the canonical 5-byte big-endian form
    pub fn from_bytes(b: &[u8; ADDRESS_SIZE]) -> Self {
        Self(
            (b[0] as u64) << 32
                | (b[1] as u64) << 24
                | (b[2] as u64) << 16
                | (b[3] as u64) << 8
                | (b[4] as u64),
        )
    }

    /// Try to read an address from the start of a slice
    pub fn from_slice(b: &[u8]) -> CryptoResult<Self> {
        if b.len() < ADDRESS_SIZE {
            return Err(CryptoError::InvalidAddress);
        }
        let mut tmp = [0u8; ADDRESS_SIZE];
        tmp.copy_from_slice(&b[..ADDRESS_SIZE]);
        Ok(Self::from_bytes(&tmp))
    }

    /// Canonical 5-byte big-endian form
    pub fn to_bytes(self) -> [u8; ADDRESS_SIZE] {
        [
            (self.0 >> 32) as u8,
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    /// Raw integer value
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Whether this address may identify a node
    ///
    /// The first byte must be non-zero and the value must not be the
    /// reserved broadcast address.
    pub fn is_valid(self) -> bool {
        (self.0 >> 32) != 0 && self.0 != RESERVED_ADDRESS
    }

    /// Parse from 10 hex digits
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        if s.len() != ADDRESS_SIZE * 2 {
            return Err(CryptoError::InvalidAddress);
        }
        let v = u64::from_str_radix(s, 16).map_err(|_| CryptoError::InvalidAddress)?;
        Ok(Self::from_u64(v))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({:010x})", self.0)
    }
}

impl std::str::FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// An address plus a SHA-384 of the public key material that produced it
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub address: Address,
    pub hash: [u8; FINGERPRINT_HASH_SIZE],
}

impl Fingerprint {
    /// Compute the fingerprint of a public key blob
    pub fn of(address: Address, public_key_material: &[u8]) -> Self {
        let mut hash = [0u8; FINGERPRINT_HASH_SIZE];
        hash.copy_from_slice(&Sha384::digest(public_key_material));
        Self { address, hash }
    }

    /// Whether the hash portion is present (all-zero means address-only)
    pub fn have_hash(&self) -> bool {
        self.hash.iter().any(|b| *b != 0)
    }

    /// An address-only fingerprint with a zero hash
    pub fn address_only(address: Address) -> Self {
        Self {
            address,
            hash: [0u8; FINGERPRINT_HASH_SIZE],
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-", self.address)?;
        for b in &self.hash {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip() {
        let a = Address::from_u64(0x1a2b3c4d5e);
        assert_eq!(Address::from_bytes(&a.to_bytes()), a);
        assert_eq!(a.to_string(), "1a2b3c4d5e");
        assert_eq!("1a2b3c4d5e".parse::<Address>().unwrap(), a);
    }

    #[test]
    fn test_address_masks_high_bits() {
        let a = Address::from_u64(0xffff_1a2b_3c4d_5e);
        assert_eq!(a.to_u64(), 0x1a_2b_3c_4d_5e);
    }

    #[test]
    fn test_address_validity() {
        assert!(!Address::from_u64(RESERVED_ADDRESS).is_valid());
        assert!(!Address::from_u64(0x00_11_22_33_44).is_valid());
        assert!(Address::from_u64(0x11_22_33_44_55).is_valid());
    }

    #[test]
    fn test_fingerprint() {
        let addr = Address::from_u64(0x1122334455);
        let fp = Fingerprint::of(addr, b"some public key material");
        assert!(fp.have_hash());
        assert_eq!(fp, Fingerprint::of(addr, b"some public key material"));
        assert_ne!(fp, Fingerprint::of(addr, b"different material"));
        assert!(!Fingerprint::address_only(addr).have_hash());
    }
}
