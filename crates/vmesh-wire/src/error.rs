//! Wire format errors

use thiserror::Error;

/// Errors from wire encoding, decoding, and reassembly
#[derive(Debug, Error)]
pub enum WireError {
    /// Packet or object failed structural validation
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Input ended before the object did
    #[error("Truncated input")]
    Truncated,

    /// Endpoint type tag is reserved or unknown
    #[error("Unsupported endpoint type: {0}")]
    UnsupportedEndpointType(u8),

    /// Endpoint body failed to decode
    #[error("Invalid endpoint")]
    InvalidEndpoint,

    /// Locator already holds the maximum number of endpoints
    #[error("Locator endpoint list is full")]
    LocatorFull,

    /// Locator failed structural validation
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    /// Cipher suite tag is reserved or unknown
    #[error("Unsupported cipher suite: {0}")]
    UnsupportedCipherSuite(u8),

    /// Unknown verb code
    #[error("Unrecognized verb: {0:#04x}")]
    UnrecognizedVerb(u8),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] vmesh_crypto::CryptoError),
}

/// Result type for wire operations
pub type WireResult<T> = Result<T, WireError>;
