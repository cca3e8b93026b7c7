//! Fragment Reassembly
//!
//! Packets larger than one datagram arrive as a head plus up to fifteen
//! tail fragments, all sharing the head's 64-bit packet id. The
//! defragmenter collects slices per packet id and releases the completed
//! vector exactly once. Entries expire after the reassembly window, and a
//! per-path budget bounds the buffers any single path can pin.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::buf::{PacketVector, Slice};

/// Maximum fragments per packet (4-bit count field)
pub const MAX_FRAGMENTS: usize = 16;

/// Reassembly window in milliseconds
pub const REASSEMBLY_WINDOW: i64 = 5000;

/// Outcome of feeding one fragment to the defragmenter
pub enum Assembled {
    /// Packet complete; the vector holds all slices in order
    Complete(PacketVector),
    /// Fragment stored; more are needed
    Accepted,
    /// This fragment index was already received
    Duplicate,
    /// Index or total out of range, or totals disagree
    Invalid,
    /// The source path has too many fragments in flight
    TooManyForPath,
}

struct Entry {
    slices: Vec<Option<Slice>>,
    have: u16,
    total: u8,
    first_seen: i64,
    path_key: u64,
}

impl Entry {
    fn complete(&self) -> bool {
        self.total > 0 && self.have.count_ones() as usize == self.total as usize
    }
}

/// Reassembles fragmented packets keyed by packet id
pub struct Defragmenter {
    entries: Mutex<HashMap<u64, Entry>>,
    max_per_path: usize,
}

impl Defragmenter {
    pub fn new(max_per_path: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_per_path,
        }
    }

    /// Feed one fragment.
    ///
    /// The head (index 0) does not know the total; tails carry
    /// `(index, total)`. Completion requires the head plus all tails up
    /// to the advertised total.
    pub fn assemble(
        &self,
        packet_id: u64,
        slice: Slice,
        fragment_no: u8,
        total_fragments: u8,
        now: i64,
        path_key: u64,
    ) -> Assembled {
        if fragment_no as usize >= MAX_FRAGMENTS
            || total_fragments as usize > MAX_FRAGMENTS
            || (total_fragments > 0 && fragment_no >= total_fragments)
        {
            return Assembled::Invalid;
        }

        let mut entries = self.entries.lock();

        if !entries.contains_key(&packet_id) {
            let in_flight = entries
                .values()
                .filter(|e| e.path_key == path_key)
                .map(|e| e.have.count_ones() as usize)
                .sum::<usize>();
            if in_flight >= self.max_per_path {
                return Assembled::TooManyForPath;
            }
            entries.insert(
                packet_id,
                Entry {
                    slices: (0..MAX_FRAGMENTS).map(|_| None).collect(),
                    have: 0,
                    total: 0,
                    first_seen: now,
                    path_key,
                },
            );
        }

        let entry = entries.get_mut(&packet_id).expect("inserted above");

        if entry.have & (1 << fragment_no) != 0 {
            return Assembled::Duplicate;
        }
        if total_fragments > 0 {
            if entry.total > 0 && entry.total != total_fragments {
                entries.remove(&packet_id);
                return Assembled::Invalid;
            }
            entry.total = total_fragments;
        }

        entry.slices[fragment_no as usize] = Some(slice);
        entry.have |= 1 << fragment_no;

        if entry.complete() {
            let entry = entries.remove(&packet_id).expect("present");
            let mut out = PacketVector::new();
            for s in entry.slices.into_iter().take(entry.total as usize) {
                match s {
                    Some(s) => out.push(s),
                    // complete() guarantees all slots below total are set
                    None => return Assembled::Invalid,
                }
            }
            return Assembled::Complete(out);
        }

        Assembled::Accepted
    }

    /// Drop entries older than the reassembly window; returns the number
    /// dropped
    pub fn gc(&self, now: i64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now - e.first_seen < REASSEMBLY_WINDOW);
        before - entries.len()
    }

    /// Packets currently being reassembled
    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufPool;

    fn slice_of(pool: &BufPool, data: &[u8]) -> Slice {
        Slice::from_datagram(pool, data).unwrap()
    }

    #[test]
    fn test_out_of_order_assembly() {
        let pool = BufPool::default();
        let d = Defragmenter::new(64);

        // Four fragments delivered in order 2, 0, 3, 1.
        assert!(matches!(
            d.assemble(7, slice_of(&pool, b"CC"), 2, 4, 0, 1),
            Assembled::Accepted
        ));
        assert!(matches!(
            d.assemble(7, slice_of(&pool, b"AA"), 0, 0, 0, 1),
            Assembled::Accepted
        ));
        assert!(matches!(
            d.assemble(7, slice_of(&pool, b"DD"), 3, 4, 0, 1),
            Assembled::Accepted
        ));
        let result = d.assemble(7, slice_of(&pool, b"BB"), 1, 4, 0, 1);
        match result {
            Assembled::Complete(v) => {
                assert_eq!(v.merge_copy(), b"AABBCCDD");
            }
            _ => panic!("expected completion"),
        }
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn test_duplicate_after_completion_does_not_redispatch() {
        let pool = BufPool::default();
        let d = Defragmenter::new(64);

        d.assemble(9, slice_of(&pool, b"A"), 0, 0, 0, 1);
        let done = d.assemble(9, slice_of(&pool, b"B"), 1, 2, 0, 1);
        assert!(matches!(done, Assembled::Complete(_)));

        // Redelivery of a fragment for a completed packet opens a new
        // entry; it can never complete again without the other parts, so
        // the packet is not dispatched twice within the window.
        assert!(matches!(
            d.assemble(9, slice_of(&pool, b"B"), 1, 2, 1, 1),
            Assembled::Accepted
        ));
        assert!(matches!(
            d.assemble(9, slice_of(&pool, b"B"), 1, 2, 1, 1),
            Assembled::Duplicate
        ));
    }

    #[test]
    fn test_maximum_fragment_count() {
        let pool = BufPool::default();
        let d = Defragmenter::new(64);

        // 16 fragments, the most the count field can express.
        assert!(matches!(
            d.assemble(5, slice_of(&pool, b"f00"), 0, 0, 0, 1),
            Assembled::Accepted
        ));
        for i in 1..15u8 {
            assert!(matches!(
                d.assemble(5, slice_of(&pool, format!("f{:02}", i).as_bytes()), i, 16, 0, 1),
                Assembled::Accepted
            ));
        }
        match d.assemble(5, slice_of(&pool, b"f15"), 15, 16, 0, 1) {
            Assembled::Complete(v) => {
                assert_eq!(v.slice_count(), 16);
                let merged = v.merge_copy();
                assert!(merged.starts_with(b"f00"));
                assert!(merged.ends_with(b"f15"));
            }
            _ => panic!("expected completion at 16 fragments"),
        }
    }

    #[test]
    fn test_duplicate_fragment() {
        let pool = BufPool::default();
        let d = Defragmenter::new(64);
        d.assemble(1, slice_of(&pool, b"x"), 1, 3, 0, 1);
        assert!(matches!(
            d.assemble(1, slice_of(&pool, b"x"), 1, 3, 0, 1),
            Assembled::Duplicate
        ));
    }

    #[test]
    fn test_invalid_indices() {
        let pool = BufPool::default();
        let d = Defragmenter::new(64);
        assert!(matches!(
            d.assemble(1, slice_of(&pool, b"x"), 5, 3, 0, 1),
            Assembled::Invalid
        ));
        assert!(matches!(
            d.assemble(1, slice_of(&pool, b"x"), 0, 17, 0, 1),
            Assembled::Invalid
        ));
    }

    #[test]
    fn test_inconsistent_totals_poison_entry() {
        let pool = BufPool::default();
        let d = Defragmenter::new(64);
        d.assemble(1, slice_of(&pool, b"x"), 1, 4, 0, 1);
        assert!(matches!(
            d.assemble(1, slice_of(&pool, b"x"), 2, 5, 0, 1),
            Assembled::Invalid
        ));
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn test_per_path_budget() {
        let pool = BufPool::default();
        let d = Defragmenter::new(2);
        d.assemble(1, slice_of(&pool, b"x"), 0, 0, 0, 42);
        d.assemble(2, slice_of(&pool, b"x"), 0, 0, 0, 42);
        assert!(matches!(
            d.assemble(3, slice_of(&pool, b"x"), 0, 0, 0, 42),
            Assembled::TooManyForPath
        ));
        // A different path is unaffected.
        assert!(matches!(
            d.assemble(4, slice_of(&pool, b"x"), 0, 0, 0, 43),
            Assembled::Accepted
        ));
    }

    #[test]
    fn test_window_expiry() {
        let pool = BufPool::default();
        let d = Defragmenter::new(64);
        d.assemble(1, slice_of(&pool, b"x"), 0, 0, 1000, 1);
        assert_eq!(d.gc(1000 + REASSEMBLY_WINDOW - 1), 0);
        assert_eq!(d.gc(1000 + REASSEMBLY_WINDOW), 1);
        assert_eq!(d.pending(), 0);
    }
}
