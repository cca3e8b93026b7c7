//! Key Derivation
//!
//! A single KBKDF-HMAC-SHA384 primitive covers every derived key in the
//! protocol: HELLO HMAC keys, metadata dictionary encryption keys, and
//! ephemeral session keys. Labels keep the derivations domain-separated.

use hmac::{Hmac, Mac};
use sha2::Sha384;

use crate::constants::HMAC_SHA384_SIZE;

/// Label: HELLO / OK(HELLO) end-to-end HMAC key
pub const LABEL_HELLO_HMAC: u8 = b'H';

/// Label: metadata dictionary AES-CTR key
pub const LABEL_DICTIONARY: u8 = b'D';

/// Label: ephemeral session key from ephemeral DH + permanent key
pub const LABEL_EPHEMERAL: u8 = b'E';

/// Counter-mode KBKDF over HMAC-SHA384.
///
/// `label` names the derivation, `context` and `iter` distinguish
/// directions or rounds within it (e.g. iter 0 for a request HMAC key,
/// 1 for the reply).
pub fn kbkdf_hmac_sha384(key: &[u8], label: u8, context: u8, iter: u8) -> [u8; HMAC_SHA384_SIZE] {
    let mut mac = Hmac::<Sha384>::new_from_slice(key).expect("HMAC accepts any key length");
    // [counter=1][label][0x00][context][iter][output bits]
    mac.update(&1u32.to_be_bytes());
    mac.update(&[label, 0x00, context, iter]);
    mac.update(&384u32.to_be_bytes());
    let mut out = [0u8; HMAC_SHA384_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Plain HMAC-SHA384
pub fn hmac_sha384(key: &[u8], data: &[u8]) -> [u8; HMAC_SHA384_SIZE] {
    let mut mac = Hmac::<Sha384>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; HMAC_SHA384_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Constant-time equality for MAC comparison
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_separate_derivations() {
        let key = [0x42u8; 32];
        let a = kbkdf_hmac_sha384(&key, LABEL_HELLO_HMAC, 0, 0);
        let b = kbkdf_hmac_sha384(&key, LABEL_DICTIONARY, 0, 0);
        let c = kbkdf_hmac_sha384(&key, LABEL_HELLO_HMAC, 0, 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, kbkdf_hmac_sha384(&key, LABEL_HELLO_HMAC, 0, 0));
    }

    #[test]
    fn test_hmac_differs_by_key() {
        let x = hmac_sha384(&[1u8; 32], b"data");
        let y = hmac_sha384(&[2u8; 32], b"data");
        assert_ne!(x, y);
    }

    #[test]
    fn test_secure_eq() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"abcd"));
    }
}
