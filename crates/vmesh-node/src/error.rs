//! Node errors

use thiserror::Error;

/// Errors surfaced by node operations
#[derive(Debug, Error)]
pub enum NodeError {
    /// State store read or write failed
    #[error("Data store failure: {0}")]
    DataStore(String),

    /// A caller-supplied parameter was invalid
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wire error
    #[error("Wire error: {0}")]
    Wire(#[from] vmesh_wire::WireError),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] vmesh_crypto::CryptoError),
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
