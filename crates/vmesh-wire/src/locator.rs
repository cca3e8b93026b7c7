//! Signed Locators
//!
//! A locator is a node's signed, timestamped advertisement of how to
//! reach it: up to eight endpoints, signed by the identity they describe.
//! Endpoints are sorted into canonical order before signing so that the
//! same endpoint set always yields the same signed bytes, and a stored
//! locator is only ever replaced by one with a strictly greater
//! timestamp.

use vmesh_crypto::{Fingerprint, Identity};

use crate::endpoint::Endpoint;
use crate::error::{WireError, WireResult};

/// Maximum endpoints a locator may carry
pub const LOCATOR_MAX_ENDPOINTS: usize = 8;

/// Maximum signature size (P-384 hybrid identities)
const SIGNATURE_SIZE_MAX: usize = 96;

/// A signed, timestamped set of endpoints for one node
#[derive(Clone, PartialEq, Eq)]
pub struct Locator {
    timestamp: i64,
    signer: Fingerprint,
    endpoints: Vec<Endpoint>,
    signature: Vec<u8>,
}

impl Locator {
    /// An unsigned, empty locator
    pub fn new() -> Self {
        Self {
            timestamp: 0,
            signer: Fingerprint::address_only(vmesh_crypto::Address::from_u64(0)),
            endpoints: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// Timestamp (doubles as the revision number)
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Fingerprint of the identity that signed this locator
    pub fn signer(&self) -> &Fingerprint {
        &self.signer
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// True once signed (timestamp is set by signing)
    pub fn is_signed(&self) -> bool {
        self.timestamp > 0 && !self.signature.is_empty()
    }

    /// Add an endpoint. Does not deduplicate; returns false when full.
    pub fn add(&mut self, ep: Endpoint) -> bool {
        if self.endpoints.len() >= LOCATOR_MAX_ENDPOINTS {
            return false;
        }
        self.endpoints.push(ep);
        true
    }

    /// Sign this locator.
    ///
    /// Sets the timestamp and signer, sorts endpoints into canonical
    /// order, and signs the canonical serialization. Requires the
    /// identity's private key.
    pub fn sign(&mut self, timestamp: i64, id: &Identity) -> WireResult<()> {
        if timestamp <= 0 {
            return Err(WireError::InvalidLocator("timestamp must be positive".into()));
        }
        self.timestamp = timestamp;
        self.signer = id.fingerprint();
        self.endpoints.sort_by(|a, b| a.canonical_cmp(b));
        let signed = self.marshal_internal(true);
        self.signature = id.sign(&signed)?;
        Ok(())
    }

    /// Verify validity and signature against the claimed identity.
    ///
    /// True iff the signer fingerprint matches `id` and the signature
    /// checks out over the canonical serialization.
    pub fn verify(&self, id: &Identity) -> bool {
        if !self.is_signed() || self.signer != id.fingerprint() {
            return false;
        }
        id.verify(&self.marshal_internal(true), &self.signature)
    }

    pub fn marshal(&self) -> Vec<u8> {
        self.marshal_internal(false)
    }

    fn marshal_internal(&self, exclude_signature: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.signer.address.to_bytes());
        out.extend_from_slice(&self.signer.hash);
        out.extend_from_slice(&(self.endpoints.len() as u16).to_be_bytes());
        for ep in &self.endpoints {
            ep.marshal(&mut out);
        }
        if !exclude_signature {
            out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
            out.extend_from_slice(&self.signature);
        }
        out
    }

    pub fn unmarshal(data: &[u8]) -> WireResult<(Self, usize)> {
        if data.len() < 8 + 5 + 48 + 2 {
            return Err(WireError::Truncated);
        }
        let timestamp = i64::from_be_bytes(data[..8].try_into().unwrap());
        let address = vmesh_crypto::Address::from_slice(&data[8..13])?;
        let mut hash = [0u8; 48];
        hash.copy_from_slice(&data[13..61]);
        let count = u16::from_be_bytes([data[61], data[62]]) as usize;
        if count > LOCATOR_MAX_ENDPOINTS {
            return Err(WireError::InvalidLocator(format!(
                "{} endpoints exceeds maximum",
                count
            )));
        }
        let mut p = 63;
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            let (ep, n) = Endpoint::unmarshal(data.get(p..).ok_or(WireError::Truncated)?)?;
            endpoints.push(ep);
            p += n;
        }
        if p + 2 > data.len() {
            return Err(WireError::Truncated);
        }
        let sig_len = u16::from_be_bytes([data[p], data[p + 1]]) as usize;
        p += 2;
        if sig_len > SIGNATURE_SIZE_MAX {
            return Err(WireError::InvalidLocator("oversized signature".into()));
        }
        if p + sig_len > data.len() {
            return Err(WireError::Truncated);
        }
        let signature = data[p..p + sig_len].to_vec();
        p += sig_len;
        Ok((
            Self {
                timestamp,
                signer: Fingerprint { address, hash },
                endpoints,
                signature,
            },
            p,
        ))
    }

    /// Hex string form of the full marshal
    pub fn to_hex_string(&self) -> String {
        self.marshal().iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse the hex string form
    pub fn from_hex_string(s: &str) -> WireResult<Self> {
        if s.len() % 2 != 0 {
            return Err(WireError::InvalidLocator("odd hex length".into()));
        }
        let bytes: Result<Vec<u8>, _> = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect();
        let bytes = bytes.map_err(|_| WireError::InvalidLocator("invalid hex".into()))?;
        let (loc, n) = Self::unmarshal(&bytes)?;
        if n != bytes.len() {
            return Err(WireError::InvalidLocator("trailing bytes".into()));
        }
        Ok(loc)
    }
}

impl Default for Locator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Locator(ts {}, {} endpoints, signer {})",
            self.timestamp,
            self.endpoints.len(),
            self.signer.address
        )
    }
}
