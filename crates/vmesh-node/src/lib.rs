//! vmesh Transport Node
//!
//! The embeddable core of the vmesh peer-to-peer virtual network: it
//! turns raw datagrams handed in by the host into an authenticated,
//! encrypted overlay transport and maintains the peer, path, and root
//! databases behind it.
//!
//! The node owns no sockets and spawns no tasks. The host drives it
//! through three entry points (`process_wire_packet`,
//! `process_virtual_network_frame`, `process_background_tasks`) and
//! receives all output through the [`host::HostSystem`] callback trait.

pub mod config;
pub mod error;
pub mod expect;
pub mod host;
pub mod node;
pub mod path;
pub mod peer;
pub mod selfaware;
pub mod topology;
pub mod trace;
pub mod vl1;

pub use config::{NodeConfig, TrustedPath};
pub use error::{NodeError, NodeResult};
pub use host::{Event, HostSystem, ResultCode, StateObject, Vl2Handler};
pub use node::Node;
pub use peer::Peer;
pub use path::Path;

/// A path is alive if it received anything within this window
pub const PATH_ALIVE_TIMEOUT: i64 = 45_000;

/// Idle paths get a keepalive byte at this period
pub const PATH_KEEPALIVE_PERIOD: i64 = 20_000;

/// Full HELLO refresh interval per peer
pub const PEER_HELLO_INTERVAL: i64 = 120_000;

/// Minimum interval between path preference re-sorts
pub const PEER_PRIORITIZE_PATHS_INTERVAL: i64 = 5_000;

/// Maximum direct paths remembered per peer
pub const MAX_PEER_PATHS: usize = 16;

/// Inbound WHOIS rate gate per peer
pub const PEER_WHOIS_RATE_LIMIT: i64 = 1_000;

/// Inbound ECHO rate gate per peer
pub const PEER_ECHO_RATE_LIMIT: i64 = 500;

/// Inbound probe rate gate per peer
pub const PEER_PROBE_RATE_LIMIT: i64 = 1_000;

/// Retry interval for root-directed WHOIS queries
pub const WHOIS_RETRY_DELAY: i64 = 500;

/// WHOIS queue entries are abandoned after this many retries
pub const WHOIS_MAX_RETRIES: u32 = 10;

/// Ephemeral session key time budget
pub const EPHEMERAL_KEY_TTL: i64 = 600_000;

/// Ephemeral session key message budget
pub const EPHEMERAL_KEY_TTL_MESSAGES: u64 = 1 << 28;

/// Idle non-root peers are persisted and evicted after this
pub const PEER_EVICT_TIMEOUT: i64 = 600_000;

/// Cached peer records older than this are ignored on load
pub const PEER_RECORD_STALE: i64 = 30 * 24 * 3600 * 1000;

/// Reply correlation window
pub const EXPECT_TTL: i64 = 5_000;

/// Reply correlation table capacity (LRU)
pub const EXPECT_CAPACITY: usize = 512;

/// Fragment budget per path in the defragmenter
pub const MAX_INCOMING_FRAGMENTS_PER_PATH: usize = 32;

/// Ports probed per pulse during an aggressive NAT sweep
pub const BFG1024_PORTS_PER_SWEEP: usize = 128;

/// Endpoint candidates queued per peer
pub const TRY_QUEUE_CAP: usize = 32;

/// Candidate endpoints older than this are dropped from the try-queue
pub const TRY_QUEUE_ITEM_TIMEOUT: i64 = PATH_ALIVE_TIMEOUT;

/// External surface observations expire after this
pub const SELFAWARENESS_ENTRY_TIMEOUT: i64 = 300_000;

/// Distinct trusted reporters required to trigger a scope reset
pub const SELFAWARENESS_QUORUM: usize = 2;

/// Suggested spacing of `process_background_tasks` calls
pub const BACKGROUND_TASK_INTERVAL: i64 = 1_000;

/// Topology GC / persistence pass interval
pub const TOPOLOGY_GC_INTERVAL: i64 = 60_000;
