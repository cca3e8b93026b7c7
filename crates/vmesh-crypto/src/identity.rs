//! Node Identity
//!
//! An identity is a keypair bundle whose public half derives the node's
//! 40-bit address through the proof-of-work hash. Two kinds exist on the
//! wire:
//!
//! - `Curve25519` (type 0): X25519 key agreement + Ed25519 signatures
//! - `P384Hybrid` (type 1): type 0 material plus NIST P-384 ECDH + ECDSA
//!
//! Identities are equal iff their public key material is byte-equal.

use ed25519_dalek::{Signer as _, Verifier as _};
use p384::ecdsa::signature::{Signer as _, Verifier as _};
use p384::elliptic_curve::sec1::ToEncodedPoint as _;
use rand::rngs::OsRng;
use sha2::{Digest, Sha384};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::address::{Address, Fingerprint};
use crate::constants::{
    ADDRESS_SIZE, ED25519_PUBKEY_SIZE, ED25519_SIGNATURE_SIZE, P384_PUBKEY_SIZE,
    P384_SIGNATURE_SIZE, SHARED_SECRET_SIZE, X25519_KEY_SIZE,
};
use crate::error::{CryptoError, CryptoResult};
use crate::work;

/// Maximum marshaled identity size (hybrid, with private keys)
pub const IDENTITY_MARSHAL_SIZE_MAX: usize = 512;

/// Identity key type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdentityKind {
    /// X25519 + Ed25519
    Curve25519 = 0,
    /// X25519 + Ed25519 + P-384 ECDH/ECDSA
    P384Hybrid = 1,
}

impl TryFrom<u8> for IdentityKind {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Curve25519),
            1 => Ok(Self::P384Hybrid),
            _ => Err(CryptoError::InvalidIdentity(format!(
                "unknown identity type {}",
                value
            ))),
        }
    }
}

/// 48-byte shared secret from identity key agreement
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Full 48-byte secret
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.bytes
    }

    /// First 32 bytes, the session cipher key
    pub fn session_key(&self) -> [u8; 32] {
        let mut k = [0u8; 32];
        k.copy_from_slice(&self.bytes[..32]);
        k
    }
}

/// Private half of an identity
struct IdentitySecret {
    ed: ed25519_dalek::SigningKey,
    x: x25519_dalek::StaticSecret,
    p384_sig: Option<p384::ecdsa::SigningKey>,
    p384_dh: Option<p384::SecretKey>,
}

/// A node identity: public keys, derived address, optional private keys
pub struct Identity {
    kind: IdentityKind,
    address: Address,
    ed_pub: ed25519_dalek::VerifyingKey,
    x_pub: x25519_dalek::PublicKey,
    p384_sig_pub: Option<p384::ecdsa::VerifyingKey>,
    p384_dh_pub: Option<p384::PublicKey>,
    secret: Option<IdentitySecret>,
}

impl Identity {
    /// Generate a new identity of the given kind.
    ///
    /// CPU-bound: keypairs are drawn repeatedly until the memory-hard hash
    /// of the public material satisfies the address derivation criterion.
    pub fn generate(kind: IdentityKind) -> Self {
        loop {
            let ed = ed25519_dalek::SigningKey::generate(&mut OsRng);
            let x = x25519_dalek::StaticSecret::random_from_rng(OsRng);
            let (p384_sig, p384_dh) = match kind {
                IdentityKind::Curve25519 => (None, None),
                IdentityKind::P384Hybrid => (
                    Some(p384::ecdsa::SigningKey::random(&mut OsRng)),
                    Some(p384::SecretKey::random(&mut OsRng)),
                ),
            };

            let ed_pub = ed.verifying_key();
            let x_pub = x25519_dalek::PublicKey::from(&x);
            let p384_sig_pub = p384_sig.as_ref().map(|k| *k.verifying_key());
            let p384_dh_pub = p384_dh.as_ref().map(|k| k.public_key());

            let material =
                public_material(kind, &ed_pub, &x_pub, p384_sig_pub.as_ref(), p384_dh_pub.as_ref());
            if let Some(address) = work::derive_address(&material) {
                return Self {
                    kind,
                    address,
                    ed_pub,
                    x_pub,
                    p384_sig_pub,
                    p384_dh_pub,
                    secret: Some(IdentitySecret {
                        ed,
                        x,
                        p384_sig,
                        p384_dh,
                    }),
                };
            }
        }
    }

    /// Identity key type
    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    /// The node's 40-bit address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether the private half is present
    pub fn has_private(&self) -> bool {
        self.secret.is_some()
    }

    /// Canonical public key material (kind tag + concatenated public keys)
    pub fn public_key_bytes(&self) -> Vec<u8> {
        public_material(
            self.kind,
            &self.ed_pub,
            &self.x_pub,
            self.p384_sig_pub.as_ref(),
            self.p384_dh_pub.as_ref(),
        )
    }

    /// Fingerprint: address plus SHA-384 of public key material
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.address, &self.public_key_bytes())
    }

    /// Recompute the address from the public key and check it matches.
    ///
    /// Holds for every honestly generated identity; fails for forged or
    /// corrupted ones.
    pub fn locally_validate(&self) -> bool {
        work::derive_address(&self.public_key_bytes()) == Some(self.address)
    }

    /// Sign data with this identity's private key
    pub fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let secret = self.secret.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        match self.kind {
            IdentityKind::Curve25519 => Ok(secret.ed.sign(data).to_bytes().to_vec()),
            IdentityKind::P384Hybrid => {
                let sk = secret.p384_sig.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
                let sig: p384::ecdsa::Signature = sk.sign(data);
                Ok(sig.to_bytes().to_vec())
            }
        }
    }

    /// Verify a signature made by this identity
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match self.kind {
            IdentityKind::Curve25519 => {
                if signature.len() != ED25519_SIGNATURE_SIZE {
                    return false;
                }
                let mut raw = [0u8; ED25519_SIGNATURE_SIZE];
                raw.copy_from_slice(signature);
                let sig = ed25519_dalek::Signature::from_bytes(&raw);
                self.ed_pub.verify(data, &sig).is_ok()
            }
            IdentityKind::P384Hybrid => {
                if signature.len() != P384_SIGNATURE_SIZE {
                    return false;
                }
                let Some(vk) = self.p384_sig_pub.as_ref() else {
                    return false;
                };
                match p384::ecdsa::Signature::from_slice(signature) {
                    Ok(sig) => vk.verify(data, &sig).is_ok(),
                    Err(_) => false,
                }
            }
        }
    }

    /// Perform key agreement with another identity's public keys.
    ///
    /// Produces a 48-byte shared secret: SHA-384 of the X25519 output, or
    /// of the concatenated X25519 and P-384 ECDH outputs when both sides
    /// are hybrid identities. Both ends derive the same secret.
    pub fn agree(&self, other: &Identity) -> CryptoResult<SharedSecret> {
        let secret = self.secret.as_ref().ok_or(CryptoError::MissingPrivateKey)?;

        let dh_x = secret.x.diffie_hellman(&other.x_pub);

        let mut h = Sha384::new();
        h.update(dh_x.as_bytes());

        if self.kind == IdentityKind::P384Hybrid && other.kind == IdentityKind::P384Hybrid {
            let our_dh = secret.p384_dh.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
            let their_pub = other.p384_dh_pub.as_ref().ok_or(CryptoError::KeyAgreementFailed)?;
            let dh_p = p384::ecdh::diffie_hellman(our_dh.to_nonzero_scalar(), their_pub.as_affine());
            h.update(dh_p.raw_secret_bytes());
        }

        let mut bytes = [0u8; SHARED_SECRET_SIZE];
        bytes.copy_from_slice(&h.finalize());
        Ok(SharedSecret { bytes })
    }

    /// Marshal to canonical bytes
    pub fn marshal(&self, include_private: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(IDENTITY_MARSHAL_SIZE_MAX);
        out.extend_from_slice(&self.address.to_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(self.ed_pub.as_bytes());
        out.extend_from_slice(self.x_pub.as_bytes());
        if self.kind == IdentityKind::P384Hybrid {
            // unwraps justified: hybrid identities always carry P-384 keys
            let sig_pub = self.p384_sig_pub.as_ref().unwrap();
            out.extend_from_slice(sig_pub.to_encoded_point(true).as_bytes());
            let dh_pub = self.p384_dh_pub.as_ref().unwrap();
            out.extend_from_slice(dh_pub.to_encoded_point(true).as_bytes());
        }
        match (&self.secret, include_private) {
            (Some(secret), true) => {
                out.push(1);
                out.extend_from_slice(&secret.ed.to_bytes());
                out.extend_from_slice(&secret.x.to_bytes());
                if self.kind == IdentityKind::P384Hybrid {
                    out.extend_from_slice(&secret.p384_sig.as_ref().unwrap().to_bytes());
                    out.extend_from_slice(&secret.p384_dh.as_ref().unwrap().to_bytes());
                }
            }
            _ => out.push(0),
        }
        out
    }

    /// Unmarshal from bytes, returning the identity and bytes consumed
    pub fn unmarshal(data: &[u8]) -> CryptoResult<(Self, usize)> {
        if data.len() < ADDRESS_SIZE + 1 {
            return Err(CryptoError::InvalidIdentity("truncated".into()));
        }
        let address = Address::from_slice(data)?;
        if !address.is_valid() {
            return Err(CryptoError::InvalidAddress);
        }
        let kind = IdentityKind::try_from(data[ADDRESS_SIZE])?;
        let mut p = ADDRESS_SIZE + 1;

        let ed_pub = {
            let raw: [u8; ED25519_PUBKEY_SIZE] = read_array(data, &mut p)?;
            ed25519_dalek::VerifyingKey::from_bytes(&raw)
                .map_err(|_| CryptoError::InvalidPublicKey)?
        };
        let x_pub = {
            let raw: [u8; X25519_KEY_SIZE] = read_array(data, &mut p)?;
            x25519_dalek::PublicKey::from(raw)
        };
        let (p384_sig_pub, p384_dh_pub) = if kind == IdentityKind::P384Hybrid {
            let sig_raw: [u8; P384_PUBKEY_SIZE] = read_array(data, &mut p)?;
            let dh_raw: [u8; P384_PUBKEY_SIZE] = read_array(data, &mut p)?;
            (
                Some(
                    p384::ecdsa::VerifyingKey::from_sec1_bytes(&sig_raw)
                        .map_err(|_| CryptoError::InvalidPublicKey)?,
                ),
                Some(
                    p384::PublicKey::from_sec1_bytes(&dh_raw)
                        .map_err(|_| CryptoError::InvalidPublicKey)?,
                ),
            )
        } else {
            (None, None)
        };

        if p >= data.len() {
            return Err(CryptoError::InvalidIdentity("truncated".into()));
        }
        let have_private = data[p];
        p += 1;
        let secret = match have_private {
            0 => None,
            1 => {
                let ed_raw: [u8; 32] = read_array(data, &mut p)?;
                let x_raw: [u8; 32] = read_array(data, &mut p)?;
                let (p384_sig, p384_dh) = if kind == IdentityKind::P384Hybrid {
                    let sig_raw: [u8; 48] = read_array(data, &mut p)?;
                    let dh_raw: [u8; 48] = read_array(data, &mut p)?;
                    (
                        Some(
                            p384::ecdsa::SigningKey::from_slice(&sig_raw)
                                .map_err(|_| CryptoError::InvalidSecretKey)?,
                        ),
                        Some(
                            p384::SecretKey::from_slice(&dh_raw)
                                .map_err(|_| CryptoError::InvalidSecretKey)?,
                        ),
                    )
                } else {
                    (None, None)
                };
                Some(IdentitySecret {
                    ed: ed25519_dalek::SigningKey::from_bytes(&ed_raw),
                    x: x25519_dalek::StaticSecret::from(x_raw),
                    p384_sig,
                    p384_dh,
                })
            }
            _ => return Err(CryptoError::InvalidIdentity("bad private flag".into())),
        };

        Ok((
            Self {
                kind,
                address,
                ed_pub,
                x_pub,
                p384_sig_pub,
                p384_dh_pub,
                secret,
            },
            p,
        ))
    }

    /// String form: `address:type:publichex[:secrethex]`
    pub fn to_string_with_private(&self, include_private: bool) -> String {
        let full = self.marshal(include_private && self.secret.is_some());
        // Split the marshal at the private flag byte so the public and
        // secret halves render as separate fields.
        let pub_len = public_len(self.kind);
        let pub_hex = hex_encode(&full[ADDRESS_SIZE + 1..ADDRESS_SIZE + 1 + pub_len]);
        let mut s = format!("{}:{}:{}", self.address, self.kind as u8, pub_hex);
        let flag_at = ADDRESS_SIZE + 1 + pub_len;
        if full[flag_at] == 1 {
            s.push(':');
            s.push_str(&hex_encode(&full[flag_at + 1..]));
        }
        s
    }
}

impl std::str::FromStr for Identity {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() < 3 || fields.len() > 4 {
            return Err(CryptoError::InvalidIdentity("wrong field count".into()));
        }
        let address = Address::from_hex(fields[0])?;
        let kind_num: u8 = fields[1]
            .parse()
            .map_err(|_| CryptoError::InvalidIdentity("bad type field".into()))?;
        let kind = IdentityKind::try_from(kind_num)?;
        let pub_bytes = hex_decode(fields[2])?;
        if pub_bytes.len() != public_len(kind) {
            return Err(CryptoError::InvalidIdentity("bad public key length".into()));
        }

        let mut marshaled = Vec::new();
        marshaled.extend_from_slice(&address.to_bytes());
        marshaled.push(kind as u8);
        marshaled.extend_from_slice(&pub_bytes);
        if fields.len() == 4 {
            marshaled.push(1);
            marshaled.extend_from_slice(&hex_decode(fields[3])?);
        } else {
            marshaled.push(0);
        }

        let (id, consumed) = Identity::unmarshal(&marshaled)?;
        if consumed != marshaled.len() {
            return Err(CryptoError::InvalidIdentity("trailing bytes".into()));
        }
        Ok(id)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string_with_private(false))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({}, type {})", self.address, self.kind as u8)
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.public_key_bytes() == other.public_key_bytes()
    }
}

impl Eq for Identity {}

impl std::hash::Hash for Identity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            address: self.address,
            ed_pub: self.ed_pub,
            x_pub: self.x_pub,
            p384_sig_pub: self.p384_sig_pub,
            p384_dh_pub: self.p384_dh_pub,
            secret: self.secret.as_ref().map(|s| IdentitySecret {
                ed: s.ed.clone(),
                x: s.x.clone(),
                p384_sig: s.p384_sig.clone(),
                p384_dh: s.p384_dh.clone(),
            }),
        }
    }
}

fn public_material(
    kind: IdentityKind,
    ed_pub: &ed25519_dalek::VerifyingKey,
    x_pub: &x25519_dalek::PublicKey,
    p384_sig_pub: Option<&p384::ecdsa::VerifyingKey>,
    p384_dh_pub: Option<&p384::PublicKey>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + public_len(kind));
    out.push(kind as u8);
    out.extend_from_slice(ed_pub.as_bytes());
    out.extend_from_slice(x_pub.as_bytes());
    if let (Some(sig), Some(dh)) = (p384_sig_pub, p384_dh_pub) {
        out.extend_from_slice(sig.to_encoded_point(true).as_bytes());
        out.extend_from_slice(dh.to_encoded_point(true).as_bytes());
    }
    out
}

fn public_len(kind: IdentityKind) -> usize {
    match kind {
        IdentityKind::Curve25519 => ED25519_PUBKEY_SIZE + X25519_KEY_SIZE,
        IdentityKind::P384Hybrid => {
            ED25519_PUBKEY_SIZE + X25519_KEY_SIZE + 2 * P384_PUBKEY_SIZE
        }
    }
}

fn read_array<const N: usize>(data: &[u8], p: &mut usize) -> CryptoResult<[u8; N]> {
    if *p + N > data.len() {
        return Err(CryptoError::InvalidIdentity("truncated".into()));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&data[*p..*p + N]);
    *p += N;
    Ok(out)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> CryptoResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(CryptoError::SerializationError("odd hex length".into()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| CryptoError::SerializationError("invalid hex".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_validate() {
        let id = Identity::generate(IdentityKind::Curve25519);
        assert!(id.address().is_valid());
        assert!(id.locally_validate());
        assert!(id.has_private());
    }

    #[test]
    fn test_string_roundtrip() {
        let id = Identity::generate(IdentityKind::Curve25519);

        let public: Identity = id.to_string_with_private(false).parse().unwrap();
        assert_eq!(public.address(), id.address());
        assert_eq!(public, id);
        assert!(!public.has_private());
        assert!(public.locally_validate());

        let full: Identity = id.to_string_with_private(true).parse().unwrap();
        assert!(full.has_private());
        assert_eq!(full, id);
    }

    #[test]
    fn test_marshal_roundtrip() {
        let id = Identity::generate(IdentityKind::Curve25519);
        let bytes = id.marshal(true);
        let (back, consumed) = Identity::unmarshal(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(back, id);
        assert!(back.has_private());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate(IdentityKind::Curve25519);
        let sig = id.sign(b"message").unwrap();
        assert!(id.verify(b"message", &sig));
        assert!(!id.verify(b"other message", &sig));

        let mut bad = sig.clone();
        bad[0] ^= 0x01;
        assert!(!id.verify(b"message", &bad));
    }

    #[test]
    fn test_sign_requires_private() {
        let id = Identity::generate(IdentityKind::Curve25519);
        let public: Identity = id.to_string_with_private(false).parse().unwrap();
        assert!(matches!(
            public.sign(b"x"),
            Err(CryptoError::MissingPrivateKey)
        ));
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let a = Identity::generate(IdentityKind::Curve25519);
        let b = Identity::generate(IdentityKind::Curve25519);

        let k_ab = a.agree(&b).unwrap();
        let k_ba = b.agree(&a).unwrap();
        assert_eq!(k_ab.as_bytes(), k_ba.as_bytes());

        let c = Identity::generate(IdentityKind::Curve25519);
        assert_ne!(a.agree(&c).unwrap().as_bytes(), k_ab.as_bytes());
    }

    // The hybrid type is exercised sparingly: its generation loop runs
    // P-384 keygen inside the proof-of-work retry loop.
    #[test]
    #[ignore = "slow: hybrid generation re-runs P-384 keygen per work attempt"]
    fn test_hybrid_identity() {
        let a = Identity::generate(IdentityKind::P384Hybrid);
        let b = Identity::generate(IdentityKind::P384Hybrid);
        assert!(a.locally_validate());

        let sig = a.sign(b"data").unwrap();
        assert_eq!(sig.len(), P384_SIGNATURE_SIZE);
        assert!(a.verify(b"data", &sig));

        assert_eq!(
            a.agree(&b).unwrap().as_bytes(),
            b.agree(&a).unwrap().as_bytes()
        );
    }
}
