//! Self-Awareness: External Address Learning
//!
//! Peers report back the address they saw our packets come from (the
//! `physical-dest` field of HELLO and OK(HELLO)). This module records
//! those observations per (reporter, socket, reporter address, scope)
//! and, when enough distinct trusted reporters agree that our surface
//! in a scope has changed (a NAT rebind), demotes every path in that
//! scope and probes them so that only still-valid ones revive. Requiring
//! a quorum keeps one misbehaving reporter from resetting the node.

use std::collections::HashMap;

use parking_lot::Mutex;

use vmesh_crypto::Address;
use vmesh_wire::{InetAddress, IpScope};

use crate::node::Node;
use crate::{SELFAWARENESS_ENTRY_TIMEOUT, SELFAWARENESS_QUORUM};

#[derive(Clone, PartialEq, Eq, Hash)]
struct SurfaceKey {
    reporter: Address,
    local_socket: i64,
    reporter_address: InetAddress,
    scope: IpScope,
}

struct SurfaceEntry {
    surface: InetAddress,
    ts: i64,
    trusted: bool,
}

/// External surface observation table
pub struct SelfAwareness {
    entries: Mutex<HashMap<SurfaceKey, SurfaceEntry>>,
}

impl SelfAwareness {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `reporter` (at `reporter_address`, reaching us via
    /// `local_socket`) observed our external address as `my_address`.
    ///
    /// When a quorum of distinct trusted reporters asserts a surface
    /// that differs from what we previously believed for the scope, all
    /// peer paths in that scope are reset.
    #[allow(clippy::too_many_arguments)]
    pub fn iam(
        &self,
        node: &Node,
        reporter: Address,
        local_socket: i64,
        reporter_address: &InetAddress,
        my_address: &InetAddress,
        trusted: bool,
        now: i64,
    ) {
        let scope = my_address.scope();
        if scope != reporter_address.scope() {
            return;
        }
        if matches!(scope, IpScope::None | IpScope::Loopback | IpScope::Multicast) {
            return;
        }

        let key = SurfaceKey {
            reporter,
            local_socket,
            reporter_address: *reporter_address,
            scope,
        };

        let reset = {
            let mut entries = self.entries.lock();

            let changed = match entries.get(&key) {
                Some(prev) => {
                    (now - prev.ts) < SELFAWARENESS_ENTRY_TIMEOUT
                        && !prev.surface.ips_equal(my_address)
                }
                None => false,
            };
            let old_surface = entries.get(&key).map(|e| e.surface);
            entries.insert(
                key.clone(),
                SurfaceEntry {
                    surface: *my_address,
                    ts: now,
                    trusted,
                },
            );

            if !(trusted && changed) {
                None
            } else {
                // Count distinct trusted reporters currently asserting
                // this same new surface in this scope.
                let confirmations = entries
                    .iter()
                    .filter(|(k, e)| {
                        k.scope == scope
                            && e.trusted
                            && (now - e.ts) < SELFAWARENESS_ENTRY_TIMEOUT
                            && e.surface.ips_equal(my_address)
                    })
                    .map(|(k, _)| k.reporter)
                    .collect::<std::collections::HashSet<_>>()
                    .len();

                if confirmations >= SELFAWARENESS_QUORUM {
                    // Purge other reporters' entries in this scope so one
                    // flapping surface does not retrigger immediately.
                    entries.retain(|k, _| {
                        k.scope != scope || k.reporter_address == key.reporter_address
                    });
                    old_surface
                } else {
                    None
                }
            }
        };

        if let Some(old_surface) = reset {
            node.trace().resetting_paths_in_scope(
                0x9afff100,
                reporter,
                &old_surface,
                my_address,
                scope,
            );
            let v4 = my_address.is_v4();
            node.topology().each_peer(|p| {
                p.reset_within_scope(node, scope, v4, now);
            });
        }
    }

    /// Drop stale observations
    pub fn clean(&self, now: i64) {
        self.entries
            .lock()
            .retain(|_, e| (now - e.ts) < SELFAWARENESS_ENTRY_TIMEOUT);
    }

    /// Current external surface consensus: observed addresses with the
    /// number of reporters asserting each
    pub fn external_addresses(&self, now: i64) -> Vec<(InetAddress, usize)> {
        let entries = self.entries.lock();
        let mut counts: HashMap<InetAddress, usize> = HashMap::new();
        for e in entries.values() {
            if (now - e.ts) < SELFAWARENESS_ENTRY_TIMEOUT {
                *counts.entry(e.surface).or_default() += 1;
            }
        }
        let mut out: Vec<(InetAddress, usize)> = counts.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }
}

impl Default for SelfAwareness {
    fn default() -> Self {
        Self::new()
    }
}
