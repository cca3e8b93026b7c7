//! Crypto errors

use thiserror::Error;

/// Cryptographic operation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material had the wrong length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Public key bytes did not decode to a valid key
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Secret key bytes did not decode to a valid key
    #[error("Invalid secret key")]
    InvalidSecretKey,

    /// Signature bytes were malformed
    #[error("Invalid signature")]
    InvalidSignature,

    /// Signature did not verify
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Operation requires a private key that is not present
    #[error("Identity has no private key")]
    MissingPrivateKey,

    /// Address failed validation against its public key
    #[error("Invalid address")]
    InvalidAddress,

    /// Identity failed structural validation
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Key agreement could not be performed
    #[error("Key agreement failed")]
    KeyAgreementFailed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
