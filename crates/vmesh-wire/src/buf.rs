//! Pooled I/O Buffers
//!
//! Datagram ingress is hot: buffers are fixed 16 KiB blocks drawn from a
//! per-node free list so steady-state operation allocates nothing. A
//! `PacketVector` is an ordered sequence of buffer slices that together
//! aspire to be one assembled packet; it is merged into a contiguous
//! buffer at authentication time.

use parking_lot::Mutex;

/// Fixed buffer capacity
pub const BUF_SIZE: usize = 16384;

/// A fixed-capacity I/O buffer
pub struct Buf {
    data: Box<[u8; BUF_SIZE]>,
}

impl Buf {
    /// A fresh zeroed buffer (prefer [`BufPool::get`])
    pub fn new() -> Self {
        Self {
            data: vec![0u8; BUF_SIZE].into_boxed_slice().try_into().unwrap(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

impl Default for Buf {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node free list of buffers
pub struct BufPool {
    free: Mutex<Vec<Buf>>,
    max_pooled: usize,
}

impl BufPool {
    /// Create a pool, pre-allocating `prealloc` buffers
    pub fn new(prealloc: usize, max_pooled: usize) -> Self {
        let mut free = Vec::with_capacity(prealloc);
        for _ in 0..prealloc {
            free.push(Buf::new());
        }
        Self {
            free: Mutex::new(free),
            max_pooled,
        }
    }

    /// Take a buffer from the pool, allocating if empty
    pub fn get(&self) -> Buf {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Return a buffer to the pool
    pub fn put(&self, buf: Buf) {
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    /// Buffers currently pooled
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for BufPool {
    fn default() -> Self {
        Self::new(16, 1024)
    }
}

/// A view into part of an owned buffer
pub struct Slice {
    pub buf: Buf,
    pub start: usize,
    pub end: usize,
}

impl Slice {
    /// Wrap an entire received datagram
    pub fn from_datagram(pool: &BufPool, data: &[u8]) -> Option<Self> {
        if data.len() > BUF_SIZE {
            return None;
        }
        let mut buf = pool.get();
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        Some(Self {
            buf,
            start: 0,
            end: data.len(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf.as_slice()[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// An ordered sequence of slices forming one (possibly fragmented) packet
#[derive(Default)]
pub struct PacketVector {
    slices: Vec<Slice>,
}

impl PacketVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(slice: Slice) -> Self {
        Self {
            slices: vec![slice],
        }
    }

    pub fn push(&mut self, slice: Slice) {
        self.slices.push(slice);
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Total bytes across all slices
    pub fn total_len(&self) -> usize {
        self.slices.iter().map(Slice::len).sum()
    }

    pub fn first(&self) -> Option<&Slice> {
        self.slices.first()
    }

    /// Concatenate all slices into one contiguous byte vector
    pub fn merge_copy(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for s in &self.slices {
            out.extend_from_slice(s.bytes());
        }
        out
    }

    /// Concatenate, then stream the bytes past `skip` through `f` in
    /// place. Used to combine reassembly with MAC + decrypt in one pass
    /// over the data.
    pub fn merge_map(&self, skip: usize, f: impl FnOnce(&mut [u8])) -> Vec<u8> {
        let mut out = self.merge_copy();
        if skip < out.len() {
            f(&mut out[skip..]);
        }
        out
    }

    /// Return all buffers to the pool
    pub fn recycle(self, pool: &BufPool) {
        for s in self.slices {
            pool.put(s.buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice_of(pool: &BufPool, data: &[u8]) -> Slice {
        Slice::from_datagram(pool, data).unwrap()
    }

    #[test]
    fn test_pool_reuse() {
        let pool = BufPool::new(2, 8);
        assert_eq!(pool.pooled(), 2);
        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.pooled(), 0);
        let c = pool.get(); // allocates
        pool.put(a);
        pool.put(b);
        pool.put(c);
        assert_eq!(pool.pooled(), 3);
    }

    #[test]
    fn test_pool_cap() {
        let pool = BufPool::new(0, 1);
        pool.put(Buf::new());
        pool.put(Buf::new());
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let pool = BufPool::default();
        let big = vec![0u8; BUF_SIZE + 1];
        assert!(Slice::from_datagram(&pool, &big).is_none());
    }

    #[test]
    fn test_merge_copy_preserves_order() {
        let pool = BufPool::default();
        let mut v = PacketVector::new();
        v.push(slice_of(&pool, b"hello "));
        v.push(slice_of(&pool, b"wire "));
        v.push(slice_of(&pool, b"world"));
        assert_eq!(v.total_len(), 16);
        assert_eq!(v.merge_copy(), b"hello wire world");
        v.recycle(&pool);
    }

    #[test]
    fn test_merge_map_transforms_past_skip() {
        let pool = BufPool::default();
        let mut v = PacketVector::new();
        v.push(slice_of(&pool, b"head"));
        v.push(slice_of(&pool, b"body"));
        let out = v.merge_map(4, |tail| {
            for b in tail.iter_mut() {
                *b = b.to_ascii_uppercase();
            }
        });
        assert_eq!(out, b"headBODY");
    }
}
