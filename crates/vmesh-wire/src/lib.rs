//! vmesh Wire Types
//!
//! Everything that crosses the wire or is signed: typed network addresses
//! and endpoints, signed locators, the packet header and AEAD/MAC
//! pipeline, pooled I/O buffers, and fragment reassembly.

pub mod buf;
pub mod dictionary;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod inet;
pub mod locator;
pub mod packet;

pub use buf::{Buf, BufPool, PacketVector, Slice, BUF_SIZE};
pub use dictionary::Dictionary;
pub use endpoint::Endpoint;
pub use error::{WireError, WireResult};
pub use fragment::{Assembled, Defragmenter, MAX_FRAGMENTS};
pub use inet::{InetAddress, IpScope};
pub use locator::{Locator, LOCATOR_MAX_ENDPOINTS};
pub use packet::{CipherSuite, ErrorCode, Verb};
