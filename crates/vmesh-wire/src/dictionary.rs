//! Metadata Dictionary
//!
//! A small length-prefixed key/value map carried inside HELLO and
//! OK(HELLO): repeated `[klen u8][key][vlen u16][value]` records with a
//! zero-length key terminating the stream. On the wire the whole encoding
//! is AES-CTR encrypted under a key derived from the session key; the
//! packet MAC covers the ciphertext.

use std::collections::BTreeMap;

use crate::endpoint::Endpoint;
use crate::error::{WireError, WireResult};

/// Dictionary key: the endpoint the sender observed this packet going to
pub const KEY_PHYSICAL_DEST: &str = "physical-dest";

/// Dictionary key: packed software version
pub const KEY_SOFTWARE_VERSION: &str = "software-version";

/// Dictionary key: 32-bit probe token issued to the recipient
pub const KEY_PROBE_TOKEN: &str = "probe-token";

/// Dictionary key: sender's current ephemeral X25519 public key
pub const KEY_EPHEMERAL_KEY: &str = "ephemeral-key";

const MAX_VALUE_LEN: usize = u16::MAX as usize;

/// An ordered key/value metadata map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_bytes(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.to_owned(), value.into());
    }

    pub fn set_u32(&mut self, key: &str, value: u32) {
        self.set_bytes(key, value.to_be_bytes().to_vec());
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set_bytes(key, value.to_be_bytes().to_vec());
    }

    pub fn set_endpoint(&mut self, key: &str, ep: &Endpoint) {
        let mut buf = Vec::new();
        ep.marshal(&mut buf);
        self.set_bytes(key, buf);
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        let b = self.get_bytes(key)?;
        Some(u32::from_be_bytes(b.try_into().ok()?))
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        let b = self.get_bytes(key)?;
        Some(u64::from_be_bytes(b.try_into().ok()?))
    }

    pub fn get_endpoint(&self, key: &str) -> Option<Endpoint> {
        let b = self.get_bytes(key)?;
        Endpoint::unmarshal(b).ok().map(|(ep, _)| ep)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        for (k, v) in &self.entries {
            debug_assert!(!k.is_empty() && k.len() <= u8::MAX as usize);
            debug_assert!(v.len() <= MAX_VALUE_LEN);
            out.push(k.len() as u8);
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(&(v.len() as u16).to_be_bytes());
            out.extend_from_slice(v);
        }
        out.push(0);
        out
    }

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        let mut entries = BTreeMap::new();
        let mut p = 0usize;
        loop {
            let klen = *data.get(p).ok_or(WireError::Truncated)? as usize;
            p += 1;
            if klen == 0 {
                break;
            }
            let key = data.get(p..p + klen).ok_or(WireError::Truncated)?;
            let key = std::str::from_utf8(key)
                .map_err(|_| WireError::InvalidPacket("non-UTF8 dictionary key".into()))?
                .to_owned();
            p += klen;
            let vlen_bytes = data.get(p..p + 2).ok_or(WireError::Truncated)?;
            let vlen = u16::from_be_bytes([vlen_bytes[0], vlen_bytes[1]]) as usize;
            p += 2;
            let value = data.get(p..p + vlen).ok_or(WireError::Truncated)?.to_vec();
            p += vlen;
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut d = Dictionary::new();
        d.set_u32(KEY_PROBE_TOKEN, 0xdeadbeef);
        d.set_u64(KEY_SOFTWARE_VERSION, 0x0001_0002_0003_0004);
        d.set_endpoint(
            KEY_PHYSICAL_DEST,
            &Endpoint::Inet("203.0.113.9:793".parse().unwrap()),
        );
        d.set_bytes(KEY_EPHEMERAL_KEY, vec![9u8; 32]);

        let enc = d.encode();
        let back = Dictionary::decode(&enc).unwrap();
        assert_eq!(back, d);
        assert_eq!(back.get_u32(KEY_PROBE_TOKEN), Some(0xdeadbeef));
        assert_eq!(back.get_u64(KEY_SOFTWARE_VERSION), Some(0x0001_0002_0003_0004));
        assert!(back.get_endpoint(KEY_PHYSICAL_DEST).is_some());
        assert_eq!(back.get_bytes(KEY_EPHEMERAL_KEY), Some(&[9u8; 32][..]));
    }

    #[test]
    fn test_empty() {
        let d = Dictionary::new();
        assert_eq!(d.encode(), vec![0]);
        assert!(Dictionary::decode(&[0]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_rejected() {
        let mut d = Dictionary::new();
        d.set_u32(KEY_PROBE_TOKEN, 1);
        let enc = d.encode();
        assert!(Dictionary::decode(&enc[..enc.len() - 2]).is_err());
        assert!(Dictionary::decode(&[]).is_err());
    }

    #[test]
    fn test_wrong_width_accessor() {
        let mut d = Dictionary::new();
        d.set_u64(KEY_SOFTWARE_VERSION, 7);
        assert_eq!(d.get_u32(KEY_SOFTWARE_VERSION), None);
    }
}
