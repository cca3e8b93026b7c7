//! Structured Diagnostics
//!
//! Drops, path discoveries, and internal faults are reported as typed
//! trace events through the host event callback, mirrored to `tracing`
//! logs. Every emission site carries a stable hex location id so a field
//! report can be tied to the exact code path that produced it.

use serde::Serialize;
use tracing::{debug, warn};

use crate::host::{Event, HostSystem};

/// Why an inbound packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PacketDropReason {
    MalformedPacket,
    MacFailed,
    RateLimitExceeded,
    InvalidObject,
    InvalidCompressedData,
    UnrecognizedVerb,
    ReplyNotExpected,
    NotTrustedPath,
    PeerTooOld,
}

/// Why a new candidate path is being tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TryReason {
    Rendezvous,
    PushDirectPaths,
    PacketReceivedFromUnknownPath,
    SuggestedAddress,
    BootstrapAddress,
}

/// A structured diagnostic event
#[derive(Debug, Clone, Serialize)]
pub enum TraceEvent {
    PacketDropped {
        location: u32,
        packet_id: u64,
        peer: Option<String>,
        from: Option<String>,
        hops: u8,
        verb: u8,
        reason: PacketDropReason,
    },
    TryingNewPath {
        location: u32,
        peer: String,
        target: String,
        trigger: Option<String>,
        reason: TryReason,
    },
    LearnedNewPath {
        location: u32,
        packet_id: u64,
        peer: String,
        new_address: String,
        replaced: Option<String>,
    },
    ResettingPathsInScope {
        location: u32,
        reporter: String,
        old_surface: String,
        new_surface: String,
        scope: String,
    },
    UnexpectedError {
        location: u32,
        message: String,
    },
}

/// Per-node trace emitter
pub struct Trace {
    host: std::sync::Arc<dyn HostSystem>,
}

impl Trace {
    pub fn new(host: std::sync::Arc<dyn HostSystem>) -> Self {
        Self { host }
    }

    fn emit(&self, ev: TraceEvent) {
        self.host.event(Event::Trace(ev));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn packet_dropped(
        &self,
        location: u32,
        packet_id: u64,
        peer: Option<vmesh_crypto::Address>,
        from: Option<&vmesh_wire::InetAddress>,
        hops: u8,
        verb: u8,
        reason: PacketDropReason,
    ) {
        debug!(location, packet_id, ?reason, "dropped inbound packet");
        self.emit(TraceEvent::PacketDropped {
            location,
            packet_id,
            peer: peer.map(|a| a.to_string()),
            from: from.map(|a| a.to_string()),
            hops,
            verb,
            reason,
        });
    }

    pub fn trying_new_path(
        &self,
        location: u32,
        peer: vmesh_crypto::Address,
        target: &vmesh_wire::Endpoint,
        trigger: Option<&vmesh_wire::InetAddress>,
        reason: TryReason,
    ) {
        debug!(peer = %peer, target = %target, ?reason, "trying new path");
        self.emit(TraceEvent::TryingNewPath {
            location,
            peer: peer.to_string(),
            target: target.to_string(),
            trigger: trigger.map(|a| a.to_string()),
            reason,
        });
    }

    pub fn learned_new_path(
        &self,
        location: u32,
        packet_id: u64,
        peer: vmesh_crypto::Address,
        new_address: &vmesh_wire::InetAddress,
        replaced: Option<&vmesh_wire::InetAddress>,
    ) {
        debug!(peer = %peer, address = %new_address, "learned new path");
        self.emit(TraceEvent::LearnedNewPath {
            location,
            packet_id,
            peer: peer.to_string(),
            new_address: new_address.to_string(),
            replaced: replaced.map(|a| a.to_string()),
        });
    }

    pub fn resetting_paths_in_scope(
        &self,
        location: u32,
        reporter: vmesh_crypto::Address,
        old_surface: &vmesh_wire::InetAddress,
        new_surface: &vmesh_wire::InetAddress,
        scope: vmesh_wire::IpScope,
    ) {
        warn!(
            reporter = %reporter,
            old = %old_surface,
            new = %new_surface,
            ?scope,
            "external address changed, resetting paths in scope"
        );
        self.emit(TraceEvent::ResettingPathsInScope {
            location,
            reporter: reporter.to_string(),
            old_surface: old_surface.to_string(),
            new_surface: new_surface.to_string(),
            scope: format!("{:?}", scope),
        });
    }

    pub fn unexpected_error(&self, location: u32, message: String) {
        warn!(location, message = %message, "unexpected error");
        self.emit(TraceEvent::UnexpectedError { location, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct CollectingHost {
        events: Mutex<Vec<Event>>,
    }

    impl HostSystem for CollectingHost {
        fn wire_send(&self, _: i64, _: &vmesh_wire::InetAddress, _: &[u8]) {}
        fn state_put(&self, _: crate::host::StateObject, _: Option<&[u8]>) -> bool {
            true
        }
        fn state_get(&self, _: crate::host::StateObject) -> Option<Vec<u8>> {
            None
        }
        fn event(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn test_events_reach_host() {
        let host = Arc::new(CollectingHost {
            events: Mutex::new(Vec::new()),
        });
        let trace = Trace::new(host.clone());
        trace.packet_dropped(
            0xcc89c812,
            7,
            None,
            None,
            0,
            0,
            PacketDropReason::MacFailed,
        );
        trace.unexpected_error(0x3df19990, "boom".into());

        let events = host.events.lock();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Trace(TraceEvent::PacketDropped { location, reason, .. }) => {
                assert_eq!(*location, 0xcc89c812);
                assert_eq!(*reason, PacketDropReason::MacFailed);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
