//! Host Callback Surface
//!
//! The node performs no I/O of its own. The embedding host implements
//! `HostSystem` and is the sole side-channel for sending datagrams,
//! persisting state blobs, delivering virtual network frames, and
//! receiving events.
//!
//! Contract: callbacks must not re-enter the same node from the calling
//! thread; the node may hold internal locks across a callback.

use bytes::Bytes;

use vmesh_crypto::{Address, Identity};
use vmesh_wire::InetAddress;

use crate::trace::TraceEvent;

/// Identifies an opaque state blob in the host's store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateObject {
    /// Our public identity
    IdentityPublic,
    /// Our full identity including secret keys (protect on disk)
    IdentitySecret,
    /// Our current signed locator
    Locator,
    /// Cached peer record, keyed by short address
    Peer(Address),
    /// Virtual network configuration, keyed by network id
    NetworkConfig(u64),
    /// The trusted root set
    Roots,
}

/// Events surfaced to the host
#[derive(Debug, Clone)]
pub enum Event {
    /// Node constructed and ready
    Up,
    /// At least one root is reachable
    Online,
    /// All roots have gone quiet
    Offline,
    /// Node is shutting down
    Down,
    /// Structured diagnostic event
    Trace(TraceEvent),
    /// A USER_MESSAGE arrived from an authenticated peer
    UserMessage {
        source: Address,
        type_id: u64,
        data: Bytes,
    },
}

/// Result codes returned by the `process_*` entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,
    // Fatal: the host should tear the node down.
    FatalOutOfMemory = 100,
    FatalDataStoreFailed = 101,
    FatalInternal = 102,
    // Non-fatal.
    NetworkNotFound = 1000,
    UnsupportedOperation = 1001,
    BadParameter = 1002,
}

impl ResultCode {
    pub fn is_fatal(self) -> bool {
        let v = self as u32;
        (100..1000).contains(&v)
    }
}

/// The host's callback surface
pub trait HostSystem: Send + Sync {
    /// Send a datagram. `local_socket` is the host's socket handle as
    /// previously seen on ingress, or -1 for "any".
    fn wire_send(&self, local_socket: i64, address: &InetAddress, data: &[u8]);

    /// Persist a state blob. `None` data deletes the object. Returns
    /// false on store failure; the node treats failure to persist
    /// identity material as fatal.
    fn state_put(&self, object: StateObject, data: Option<&[u8]>) -> bool;

    /// Fetch a state blob
    fn state_get(&self, object: StateObject) -> Option<Vec<u8>>;

    /// Deliver an event
    fn event(&self, event: Event);

    /// Whether a candidate path may be used for transport traffic.
    /// Hosts veto paths here (interface policy, blacklists).
    fn path_check(&self, _peer: Address, _local_socket: i64, _address: &InetAddress) -> bool {
        true
    }

    /// Suggest a physical address for a peer the node cannot reach.
    /// Consulted when no direct path and no queued candidates exist.
    fn path_lookup(&self, _peer: &Identity) -> Option<InetAddress> {
        None
    }
}

/// Seam to the virtual Ethernet layer above the transport.
///
/// Handlers are invoked with an authenticated peer and the decrypted
/// payload; everything beyond that is out of the transport's hands.
pub trait Vl2Handler: Send + Sync {
    /// Handle a VL2-owned verb. Returning false counts the packet as
    /// invalid for the source peer.
    fn handle(
        &self,
        source: &Identity,
        verb: vmesh_wire::Verb,
        payload: &[u8],
    ) -> bool;

    /// Outbound virtual network frame from the host's tap device.
    /// Returning false reports the network as unknown.
    fn outbound_frame(&self, _network_id: u64, _vlan_id: u16, _frame: &[u8]) -> bool {
        false
    }
}

/// Default VL2 seam: accepts and ignores everything
pub struct NoVl2;

impl Vl2Handler for NoVl2 {
    fn handle(&self, _source: &Identity, _verb: vmesh_wire::Verb, _payload: &[u8]) -> bool {
        true
    }
}
