//! Symmetric Session Keys
//!
//! A `SymmetricKey` wraps raw key bytes together with a monotonically
//! increasing message counter and optional time/message TTL budgets. The
//! counter supplies the unique per-packet nonce; it must never be reused
//! for a given key instance. Permanent keys (identity-derived) have zero
//! TTLs and never expire; ephemeral keys expire on whichever budget runs
//! out first.

use std::sync::atomic::{AtomicU64, Ordering};

use zeroize::Zeroize;

use crate::constants::SYMMETRIC_KEY_SIZE;

/// A symmetric key with usage counter and TTL policy
pub struct SymmetricKey {
    secret: [u8; SYMMETRIC_KEY_SIZE],
    created: i64,
    nonce_base: u64,
    odometer: AtomicU64,
    ttl_ms: i64,
    ttl_messages: u64,
}

impl SymmetricKey {
    /// Create a key with explicit TTL budgets (zero = unlimited)
    pub fn new(now: i64, secret: [u8; SYMMETRIC_KEY_SIZE], ttl_ms: i64, ttl_messages: u64) -> Self {
        Self {
            secret,
            created: now,
            // Shift approximately the seconds since epoch into the most
            // significant 32 bits so counters never collide across key
            // instances created at different times.
            nonce_base: (now as u64) << 22,
            odometer: AtomicU64::new(0),
            ttl_ms,
            ttl_messages,
        }
    }

    /// Create a permanent (identity-derived) key
    pub fn permanent(now: i64, secret: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self::new(now, secret, 0, 0)
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.secret
    }

    /// Creation timestamp
    pub fn created(&self) -> i64 {
        self.created
    }

    /// Advance the usage counter and return the next unique message IV.
    ///
    /// Strictly increasing for a given key instance.
    pub fn next_message_iv(&self) -> u64 {
        self.nonce_base + self.odometer.fetch_add(1, Ordering::Relaxed)
    }

    /// Messages sent under this key so far
    pub fn messages_used(&self) -> u64 {
        self.odometer.load(Ordering::Relaxed)
    }

    /// True if this key should no longer be used
    pub fn expired(&self, now: i64) -> bool {
        self.ttl_ms > 0
            && ((now - self.created) >= self.ttl_ms || self.messages_used() >= self.ttl_messages)
    }

    /// True once half of either budget is consumed; time to re-key
    pub fn expiring_soon(&self, now: i64) -> bool {
        self.ttl_ms > 0
            && ((now - self.created) >= self.ttl_ms / 2
                || self.messages_used() >= self.ttl_messages / 2)
    }

    /// True for keys with no expiry budgets
    pub fn is_permanent(&self) -> bool {
        self.ttl_ms == 0
    }
}

impl Clone for SymmetricKey {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret,
            created: self.created,
            nonce_base: self.nonce_base,
            odometer: AtomicU64::new(self.odometer.load(Ordering::Relaxed)),
            ttl_ms: self.ttl_ms,
            ttl_messages: self.ttl_messages,
        }
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SymmetricKey(created {}, used {})",
            self.created,
            self.messages_used()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_strictly_increases() {
        let k = SymmetricKey::permanent(1_000_000, [7u8; 32]);
        let mut last = 0u64;
        for _ in 0..1000 {
            let iv = k.next_message_iv();
            assert!(iv > last);
            last = iv;
        }
    }

    #[test]
    fn test_permanent_never_expires() {
        let k = SymmetricKey::permanent(0, [0u8; 32]);
        assert!(k.is_permanent());
        assert!(!k.expired(i64::MAX / 2));
        assert!(!k.expiring_soon(i64::MAX / 2));
    }

    #[test]
    fn test_time_budget() {
        let k = SymmetricKey::new(1000, [0u8; 32], 10_000, 1 << 20);
        assert!(!k.expired(2000));
        assert!(k.expiring_soon(6001));
        assert!(k.expired(11_000));
    }

    #[test]
    fn test_message_budget() {
        let k = SymmetricKey::new(1000, [0u8; 32], 10_000, 4);
        assert!(!k.expired(1001));
        for _ in 0..4 {
            k.next_message_iv();
        }
        assert!(k.expired(1001));
    }

    #[test]
    fn test_nonce_base_separates_instances() {
        let a = SymmetricKey::permanent(1_000_000, [0u8; 32]);
        let b = SymmetricKey::permanent(2_000_000, [0u8; 32]);
        assert_ne!(a.next_message_iv(), b.next_message_iv());
    }
}
