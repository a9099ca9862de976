//! Bounded, thread-safe pools of fixed-size memory blocks.
//!
//! A [`BlockPool`] lazily creates blocks up to a fixed capacity and recycles
//! released buffers. A [`MemoryContext`] bundles the heap and native pools of
//! one job execution and resolves a [`ChainingRule`] into an acquisition
//! order.

use std::sync::{Arc, Mutex};

use super::MemoryError;

/// Which pool a buffer was drawn from.
///
/// Chains must return every buffer to its origin pool, so the origin is
/// carried alongside the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// The pooled heap arena.
    Heap,
    /// The native (off-heap style) arena.
    Native,
}

/// Selects which pool serves the next block of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainingRule {
    /// Only the heap pool.
    #[default]
    Heap,
    /// Only the native pool.
    Native,
    /// The heap pool first, falling back to the native pool when exhausted.
    HeapThenNative,
}

struct PoolInner {
    free: Vec<Box<[u8]>>,
    created: usize,
    in_use: usize,
}

/// A bounded pool of fixed-size byte buffers.
///
/// Buffers are created lazily up to `capacity` and recycled on release.
/// Acquisition and release are guarded by a mutex; pools sit off the per-item
/// hot path (a chain touches its pool once per `block_bytes` of data).
pub struct BlockPool {
    block_bytes: usize,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl BlockPool {
    /// Creates a pool serving buffers of `block_bytes` bytes, at most
    /// `capacity` of them alive at once.
    ///
    /// # Panics
    ///
    /// Panics if `block_bytes` is zero.
    #[must_use]
    pub fn new(block_bytes: usize, capacity: usize) -> Self {
        assert!(block_bytes > 0, "block size must be > 0");
        Self {
            block_bytes,
            capacity,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                created: 0,
                in_use: 0,
            }),
        }
    }

    /// Returns the fixed buffer size of this pool.
    #[must_use]
    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    /// Returns the maximum number of buffers this pool may create.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of buffers currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").in_use
    }

    /// Returns the number of recycled buffers ready for reuse.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").free.len()
    }

    /// Acquires a buffer, recycling a released one when possible.
    ///
    /// Returns `None` when the pool is at capacity with nothing free.
    #[must_use]
    pub fn acquire(&self) -> Option<Box<[u8]>> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if let Some(buf) = inner.free.pop() {
            inner.in_use += 1;
            return Some(buf);
        }
        if inner.created < self.capacity {
            inner.created += 1;
            inner.in_use += 1;
            return Some(vec![0u8; self.block_bytes].into_boxed_slice());
        }
        None
    }

    /// Returns a buffer to the pool for reuse.
    ///
    /// Buffers of the wrong size are dropped instead of stored; that can only
    /// happen through misuse and is checked in debug builds.
    pub fn release(&self, buf: Box<[u8]>) {
        debug_assert_eq!(buf.len(), self.block_bytes, "foreign buffer released");
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.in_use > 0 {
            inner.in_use -= 1;
        }
        if buf.len() == self.block_bytes {
            inner.free.push(buf);
        } else {
            inner.created = inner.created.saturating_sub(1);
        }
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("pool lock poisoned");
        f.debug_struct("BlockPool")
            .field("block_bytes", &self.block_bytes)
            .field("capacity", &self.capacity)
            .field("created", &inner.created)
            .field("in_use", &inner.in_use)
            .finish()
    }
}

/// The heap and native pools of one job execution.
///
/// Cheap to clone; clones share the underlying pools.
#[derive(Clone, Debug)]
pub struct MemoryContext {
    heap: Arc<BlockPool>,
    native: Arc<BlockPool>,
}

impl MemoryContext {
    /// Creates a context over the given pools.
    #[must_use]
    pub fn new(heap: Arc<BlockPool>, native: Arc<BlockPool>) -> Self {
        Self { heap, native }
    }

    /// Returns the heap pool.
    #[must_use]
    pub fn heap_pool(&self) -> &Arc<BlockPool> {
        &self.heap
    }

    /// Returns the native pool.
    #[must_use]
    pub fn native_pool(&self) -> &Arc<BlockPool> {
        &self.native
    }

    /// Acquires a buffer following the chaining rule's pool order.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::PoolExhausted`] when every pool the rule allows
    /// is out of blocks.
    pub fn acquire(&self, rule: ChainingRule) -> Result<(Box<[u8]>, PoolKind), MemoryError> {
        let order: &[PoolKind] = match rule {
            ChainingRule::Heap => &[PoolKind::Heap],
            ChainingRule::Native => &[PoolKind::Native],
            ChainingRule::HeapThenNative => &[PoolKind::Heap, PoolKind::Native],
        };
        for &kind in order {
            if let Some(buf) = self.pool(kind).acquire() {
                return Ok((buf, kind));
            }
        }
        let last = self.pool(*order.last().expect("rule has at least one pool"));
        Err(MemoryError::PoolExhausted {
            in_use: last.in_use(),
            capacity: last.capacity(),
        })
    }

    /// Returns a buffer to the pool it came from.
    pub fn release(&self, buf: Box<[u8]>, kind: PoolKind) {
        self.pool(kind).release(buf);
    }

    fn pool(&self, kind: PoolKind) -> &BlockPool {
        match kind {
            PoolKind::Heap => &self.heap,
            PoolKind::Native => &self.native,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_recycles_released_buffers() {
        let pool = BlockPool::new(64, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(pool.acquire().is_none());

        pool.release(a);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.available(), 1);

        let c = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn heap_then_native_falls_back() {
        let heap = Arc::new(BlockPool::new(64, 1));
        let native = Arc::new(BlockPool::new(32, 1));
        let ctx = MemoryContext::new(heap, native);

        let (a, kind_a) = ctx.acquire(ChainingRule::HeapThenNative).unwrap();
        assert_eq!(kind_a, PoolKind::Heap);
        let (b, kind_b) = ctx.acquire(ChainingRule::HeapThenNative).unwrap();
        assert_eq!(kind_b, PoolKind::Native);
        assert!(matches!(
            ctx.acquire(ChainingRule::HeapThenNative),
            Err(MemoryError::PoolExhausted { .. })
        ));

        ctx.release(a, kind_a);
        ctx.release(b, kind_b);
        assert_eq!(ctx.heap_pool().in_use(), 0);
        assert_eq!(ctx.native_pool().in_use(), 0);
    }

    #[test]
    fn strict_rules_do_not_fall_back() {
        let heap = Arc::new(BlockPool::new(64, 0));
        let native = Arc::new(BlockPool::new(64, 1));
        let ctx = MemoryContext::new(heap, native);

        assert!(ctx.acquire(ChainingRule::Heap).is_err());
        let (buf, kind) = ctx.acquire(ChainingRule::Native).unwrap();
        assert_eq!(kind, PoolKind::Native);
        ctx.release(buf, kind);
    }
}
