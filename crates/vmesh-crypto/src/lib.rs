//! vmesh Cryptographic Primitives
//!
//! This crate provides the cryptographic core of the vmesh transport:
//! - Node identities (X25519 key agreement + Ed25519 signatures, with an
//!   optional NIST P-384 hybrid type)
//! - Proof-of-work address derivation
//! - Symmetric session keys with usage counters and TTL budgets
//! - Key derivation (KBKDF-HMAC-SHA384)

pub mod address;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod session;
pub mod work;

pub use address::{Address, Fingerprint};
pub use error::{CryptoError, CryptoResult};
pub use identity::{Identity, IdentityKind, SharedSecret};
pub use session::SymmetricKey;

/// Protocol constants
pub mod constants {
    /// Short node address size in bytes (40 bits)
    pub const ADDRESS_SIZE: usize = 5;

    /// Fingerprint hash size (SHA-384)
    pub const FINGERPRINT_HASH_SIZE: usize = 48;

    /// Symmetric session key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// Shared secret produced by identity key agreement
    pub const SHARED_SECRET_SIZE: usize = 48;

    /// X25519 public key size
    pub const X25519_KEY_SIZE: usize = 32;

    /// Ed25519 public key size
    pub const ED25519_PUBKEY_SIZE: usize = 32;

    /// Ed25519 signature size
    pub const ED25519_SIGNATURE_SIZE: usize = 64;

    /// P-384 compressed public key size (SEC1)
    pub const P384_PUBKEY_SIZE: usize = 49;

    /// P-384 ECDSA signature size (fixed r || s)
    pub const P384_SIGNATURE_SIZE: usize = 96;

    /// HMAC-SHA384 output size
    pub const HMAC_SHA384_SIZE: usize = 48;
}
