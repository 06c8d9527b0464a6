//! Tagged pool allocation.
//!
//! Every bucket and entry node the table owns is carved out of a
//! `PoolAllocator` and labelled with a four-byte `PoolTag`, so a host can
//! attribute and audit the memory. Blocks handed out by `Pool` are linear
//! values: the only valid way to dispose of one is `Pool::free`, which runs
//! the value's destructor contract (returning it) and gives the memory back
//! under the same tag. Dropping a `Block` anywhere else panics.

use crate::error::TableError;
use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::alloc::{GlobalAlloc, System};
use std::sync::Arc;

/// Four-byte tag attached to every allocation for leak tracking.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PoolTag([u8; 4]);

impl PoolTag {
    pub const fn new(bytes: [u8; 4]) -> Self {
        PoolTag(bytes)
    }

    pub const fn as_bytes(&self) -> [u8; 4] {
        self.0
    }
}

/// Tag used when the host does not pick one.
pub const DEFAULT_POOL_TAG: PoolTag = PoolTag::new(*b"hMap");

impl fmt::Display for PoolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PoolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolTag({})", self)
    }
}

/// Source of tagged, non-paged memory.
///
/// # Safety
///
/// `allocate` must return either `None` or a pointer to a fresh block that is
/// valid for reads and writes of `layout.size()` bytes and aligned to
/// `layout.align()`. The block must stay valid until it is passed back to
/// `free` with the same layout and tag.
pub unsafe trait PoolAllocator: Send + Sync {
    /// Allocate a block, or `None` when the pool is exhausted.
    fn allocate(&self, layout: Layout, tag: PoolTag) -> Option<NonNull<u8>>;

    /// Return a block previously obtained from `allocate`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout` and `tag`, and must not be freed twice.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, tag: PoolTag);
}

unsafe impl<A: PoolAllocator + ?Sized> PoolAllocator for &A {
    #[inline]
    fn allocate(&self, layout: Layout, tag: PoolTag) -> Option<NonNull<u8>> {
        (**self).allocate(layout, tag)
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, tag: PoolTag) {
        (**self).free(ptr, layout, tag)
    }
}

unsafe impl<A: PoolAllocator + ?Sized> PoolAllocator for Arc<A> {
    #[inline]
    fn allocate(&self, layout: Layout, tag: PoolTag) -> Option<NonNull<u8>> {
        (**self).allocate(layout, tag)
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, tag: PoolTag) {
        (**self).free(ptr, layout, tag)
    }
}

/// Pool backed by the process allocator. The tag is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPool;

unsafe impl PoolAllocator for SystemPool {
    fn allocate(&self, layout: Layout, _tag: PoolTag) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: layout has a non-zero size.
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, _tag: PoolTag) {
        System.dealloc(ptr.as_ptr(), layout)
    }
}

/// Snapshot of `CountingPool` accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub allocations: u64,
    pub frees: u64,
    pub failures: u64,
    pub live_bytes: usize,
}

impl PoolStats {
    /// Blocks allocated and not yet freed.
    pub fn outstanding(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }
}

const UNLIMITED: u64 = u64::MAX;

/// Pool wrapper that counts traffic and can simulate exhaustion.
#[derive(Debug)]
pub struct CountingPool<A = SystemPool> {
    inner: A,
    allocations: AtomicU64,
    frees: AtomicU64,
    failures: AtomicU64,
    live_bytes: AtomicUsize,
    // Allocations still permitted before the pool reports exhaustion.
    remaining: AtomicU64,
}

impl CountingPool {
    pub fn new() -> Self {
        Self::wrap(SystemPool)
    }
}

impl Default for CountingPool {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PoolAllocator> CountingPool<A> {
    pub fn wrap(inner: A) -> Self {
        Self {
            inner,
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            live_bytes: AtomicUsize::new(0),
            remaining: AtomicU64::new(UNLIMITED),
        }
    }

    /// Allow at most `limit` further successful allocations; `None` lifts
    /// the limit.
    pub fn set_allocation_limit(&self, limit: Option<u64>) {
        self.remaining
            .store(limit.unwrap_or(UNLIMITED), Ordering::Release);
    }

    pub fn stats(&self) -> PoolStats {
        // A block is counted as allocated before it can be freed, so reading
        // `frees` first keeps it at or below `allocations`.
        let frees = self.frees.load(Ordering::Acquire);
        PoolStats {
            allocations: self.allocations.load(Ordering::Acquire),
            frees,
            failures: self.failures.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
        }
    }

    fn take_budget(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| match r {
                UNLIMITED => Some(r),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }
}

unsafe impl<A: PoolAllocator> PoolAllocator for CountingPool<A> {
    fn allocate(&self, layout: Layout, tag: PoolTag) -> Option<NonNull<u8>> {
        let block = if self.take_budget() {
            self.inner.allocate(layout, tag)
        } else {
            None
        };
        match block {
            Some(ptr) => {
                self.allocations.fetch_add(1, Ordering::AcqRel);
                self.live_bytes.fetch_add(layout.size(), Ordering::AcqRel);
                Some(ptr)
            }
            None => {
                self.failures.fetch_add(1, Ordering::AcqRel);
                None
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, tag: PoolTag) {
        self.inner.free(ptr, layout, tag);
        self.frees.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(layout.size(), Ordering::AcqRel);
    }
}

/// Allocator paired with the tag every block is charged to.
#[derive(Debug)]
pub(crate) struct Pool<A> {
    allocator: A,
    tag: PoolTag,
}

impl<A: PoolAllocator> Pool<A> {
    pub(crate) fn new(allocator: A, tag: PoolTag) -> Self {
        Self { allocator, tag }
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.allocator
    }

    pub(crate) fn tag(&self) -> PoolTag {
        self.tag
    }

    /// Move `value` into a fresh block. On exhaustion `value` is dropped.
    pub(crate) fn alloc<T>(&self, value: T) -> Result<Block<T>, TableError> {
        self.try_alloc(value).map_err(|(err, _)| err)
    }

    /// Like `alloc`, but hands `value` back when the pool is exhausted.
    pub(crate) fn try_alloc<T>(&self, value: T) -> Result<Block<T>, (TableError, T)> {
        let layout = Layout::new::<T>();
        debug_assert!(layout.size() != 0, "zero-sized pool blocks are not supported");
        let Some(raw) = self.allocator.allocate(layout, self.tag) else {
            log::warn!(
                "pool allocation of {} bytes failed (tag {})",
                layout.size(),
                self.tag
            );
            let err = TableError::AllocationFailure {
                tag: self.tag,
                size: layout.size(),
            };
            return Err((err, value));
        };
        let ptr = raw.cast::<T>();
        debug_assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
        // SAFETY: the allocator contract gives us a fresh, aligned block
        // large enough for `T`.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Block::new(ptr))
    }

    /// Give the block's memory back and hand its value to the caller.
    pub(crate) fn free<T>(&self, block: Block<T>) -> T {
        let ptr = block.into_raw();
        // SAFETY: `ptr` was produced by `alloc` on this pool, holds an
        // initialised `T`, and ownership was just taken from the block.
        unsafe {
            let value = ptr.as_ptr().read();
            self.allocator
                .free(ptr.cast(), Layout::new::<T>(), self.tag);
            value
        }
    }
}

/// Owned, linear pointer into pool memory.
pub(crate) struct Block<T> {
    ptr: NonNull<T>,
    _owns: PhantomData<T>,
}

unsafe impl<T: Send> Send for Block<T> {}
unsafe impl<T: Sync> Sync for Block<T> {}

impl<T> Block<T> {
    fn new(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _owns: PhantomData,
        }
    }

    /// Give up ownership without freeing.
    pub(crate) fn into_raw(self) -> NonNull<T> {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    /// # Safety
    ///
    /// `ptr` must come from `into_raw` and not have been reclaimed since.
    pub(crate) unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self::new(ptr)
    }
}

impl<T> Deref for Block<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: a live block always points at an initialised `T`.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for Block<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; `&mut self` gives exclusive access.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: fmt::Debug> fmt::Debug for Block<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Block").field(&**self).finish()
    }
}

impl<T> Drop for Block<T> {
    fn drop(&mut self) {
        // Fail fast on misuse: blocks go back through `Pool::free`. Skip the
        // check while unwinding so an unrelated panic does not abort.
        if !std::thread::panicking() {
            panic!("pool block dropped without Pool::free");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_display_is_ascii() {
        assert_eq!(DEFAULT_POOL_TAG.to_string(), "hMap");
        assert_eq!(PoolTag::new([b'a', 0, b'b', b' ']).to_string(), "a\\x00b\\x20");
        assert_eq!(format!("{:?}", DEFAULT_POOL_TAG), "PoolTag(hMap)");
    }

    /// Invariant: every successful allocation is matched by exactly one free,
    /// and live bytes return to zero.
    #[test]
    fn counting_pool_tracks_alloc_and_free() {
        let counting = CountingPool::new();
        let pool = Pool::new(&counting, DEFAULT_POOL_TAG);
        let a = pool.alloc(7u64).unwrap();
        let b = pool.alloc([1u32; 4]).unwrap();
        assert_eq!(*a, 7);
        let s = counting.stats();
        assert_eq!(s.allocations, 2);
        assert_eq!(s.live_bytes, 8 + 16);
        assert_eq!(s.outstanding(), 2);

        assert_eq!(pool.free(a), 7);
        assert_eq!(pool.free(b), [1u32; 4]);
        let s = counting.stats();
        assert_eq!(s.frees, 2);
        assert_eq!(s.live_bytes, 0);
        assert_eq!(s.outstanding(), 0);
    }

    /// Invariant: the allocation limit produces `AllocationFailure` carrying
    /// the pool tag and block size, and lifting it restores service.
    #[test]
    fn allocation_limit_injects_failure() {
        let counting = CountingPool::new();
        let tag = PoolTag::new(*b"test");
        let pool = Pool::new(&counting, tag);
        counting.set_allocation_limit(Some(1));

        let a = pool.alloc(1u32).unwrap();
        match pool.alloc(2u32) {
            Err(TableError::AllocationFailure { tag: t, size }) => {
                assert_eq!(t, tag);
                assert_eq!(size, 4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(counting.stats().failures, 1);

        counting.set_allocation_limit(None);
        let b = pool.alloc(3u32).unwrap();
        pool.free(a);
        pool.free(b);
        assert_eq!(counting.stats().outstanding(), 0);
    }

    #[test]
    fn try_alloc_returns_value_on_exhaustion() {
        let counting = CountingPool::new();
        let pool = Pool::new(&counting, DEFAULT_POOL_TAG);
        counting.set_allocation_limit(Some(0));
        let (err, value) = pool.try_alloc(String::from("kept")).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(value, "kept");
        assert_eq!(counting.stats().outstanding(), 0);
    }

    /// Invariant: `outstanding` never underflows, even for a snapshot whose
    /// frees were observed ahead of their allocations.
    #[test]
    fn outstanding_saturates_at_zero() {
        let skewed = PoolStats {
            allocations: 3,
            frees: 4,
            ..PoolStats::default()
        };
        assert_eq!(skewed.outstanding(), 0);
    }

    /// Invariant: stats read while other threads allocate and free never
    /// report more frees than allocations.
    #[test]
    fn concurrent_stats_stay_ordered() {
        let counting = CountingPool::new();
        let pool = Pool::new(&counting, DEFAULT_POOL_TAG);
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    for i in 0..5_000u64 {
                        let blk = pool.alloc(i).unwrap();
                        pool.free(blk);
                    }
                });
            }
            for _ in 0..5_000 {
                let st = counting.stats();
                assert!(st.frees <= st.allocations, "{:?}", st);
            }
        });
        assert_eq!(counting.stats().outstanding(), 0);
    }

    #[test]
    fn block_mutation_through_deref() {
        let pool = Pool::new(SystemPool, DEFAULT_POOL_TAG);
        let mut blk = pool.alloc(String::from("a")).unwrap();
        blk.push('b');
        assert_eq!(pool.free(blk), "ab");
    }

    #[test]
    fn dropping_block_without_free_panics() {
        let pool = Pool::new(SystemPool, DEFAULT_POOL_TAG);
        let blk = pool.alloc(5u8).unwrap();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(blk)));
        assert!(res.is_err(), "expected linear block drop to panic");
    }
}
