//! HashTable: fixed array of lazily created buckets, each a locked chain.
//!
//! Locking discipline
//! - The table guard is held only while testing and publishing a missing
//!   bucket pointer. The bucket block is allocated before the guard is
//!   taken; a caller that loses the race returns its block to the pool.
//! - Every chain scan or mutation runs under that bucket's guard. The chain
//!   lives inside the lock, so there is no way to reach it unguarded.
//! - Entry nodes are allocated before the bucket guard is taken and freed
//!   after it is released.
//! - The two guards are never held together.
//! - `len` changes together with the chain, under the same bucket guard,
//!   so an entry is always counted before it can be taken.
//!
//! Buckets are published once and stay allocated until the table is
//! cleaned up (`cleanup`, `clear`, or drop), all of which need exclusive
//! access. Shared references to published buckets are therefore valid for
//! as long as `&self` is.

use crate::chain::{Chain, Link};
use crate::error::{InsertError, TableError};
use crate::pool::{Block, Pool, PoolAllocator, PoolTag, SystemPool, DEFAULT_POOL_TAG};
use crate::spin_lock::{MappedSpinLockGuard, SpinLock, SpinLockGuard};
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Number of bucket slots. Fixed for the lifetime of every table.
pub const BUCKET_COUNT: usize = 1024;

/// Slot a key hashes to: `key mod BUCKET_COUNT`.
#[inline]
pub const fn bucket_index(key: u32) -> usize {
    (key % BUCKET_COUNT as u32) as usize
}

struct Bucket<V> {
    chain: SpinLock<Chain<V>>,
}

impl<V> Bucket<V> {
    fn new() -> Self {
        Self {
            chain: SpinLock::new(Chain::new()),
        }
    }
}

/// What a cleanup pass returned to the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSummary {
    pub buckets: usize,
    pub entries: usize,
}

/// Chained hash table from `u32` keys to caller-owned values.
///
/// Duplicate keys are kept in insertion order; lookups and removals act on
/// the earliest surviving entry for a key. All operations take `&self` and
/// may run concurrently.
pub struct HashTable<V, A: PoolAllocator = SystemPool> {
    create_lock: SpinLock<()>,
    slots: [AtomicPtr<Bucket<V>>; BUCKET_COUNT],
    len: AtomicUsize,
    pool: Pool<A>,
    // Owns the buckets behind `slots`; carries their Send/Sync.
    _owns: PhantomData<Block<Bucket<V>>>,
}

/// Read view of one entry returned by [`HashTable::find`].
///
/// The view holds its bucket's guard: no entry in that bucket can change
/// while it is alive, and every other operation on the same bucket waits
/// for it to drop. Calling back into the table for a key in the same bucket
/// while holding the view never returns.
pub struct EntryRef<'a, V> {
    link: MappedSpinLockGuard<'a, Link<V>>,
}

impl<'a, V> EntryRef<'a, V> {
    pub fn key(&self) -> u32 {
        self.link.key()
    }

    pub fn value(&self) -> &V {
        self.link.value()
    }
}

impl<'a, V: fmt::Debug> fmt::Debug for EntryRef<'a, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("key", &self.key())
            .field("value", self.value())
            .finish()
    }
}

impl<V> HashTable<V> {
    /// Empty table over the system pool with the default tag.
    pub fn new() -> Self {
        Self::new_in(SystemPool)
    }
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, A: PoolAllocator> HashTable<V, A> {
    pub fn new_in(allocator: A) -> Self {
        Self::with_tag_in(DEFAULT_POOL_TAG, allocator)
    }

    /// Empty table charging every block to `tag`. Performs no pool
    /// allocation.
    pub fn with_tag_in(tag: PoolTag, allocator: A) -> Self {
        Self {
            create_lock: SpinLock::new(()),
            slots: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            len: AtomicUsize::new(0),
            pool: Pool::new(allocator, tag),
            _owns: PhantomData,
        }
    }

    pub fn allocator(&self) -> &A {
        self.pool.allocator()
    }

    pub fn tag(&self) -> PoolTag {
        self.pool.tag()
    }

    /// Entries currently chained. Exact once concurrent writers are done.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots holding a bucket, empty or not.
    pub fn allocated_buckets(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.load(Ordering::Acquire).is_null())
            .count()
    }

    /// Entries chained in slot `index`, or `None` if it has no bucket.
    pub fn bucket_len(&self, index: usize) -> Option<usize> {
        if index >= BUCKET_COUNT {
            return None;
        }
        self.bucket(index).map(|b| b.chain.lock().len())
    }

    fn bucket(&self, index: usize) -> Option<&Bucket<V>> {
        let ptr = self.slots[index].load(Ordering::Acquire);
        // SAFETY: a published bucket stays allocated until `release_all`,
        // which needs `&mut self`.
        unsafe { ptr.as_ref() }
    }

    fn bucket_or_create(&self, index: usize) -> Result<&Bucket<V>, TableError> {
        if let Some(bucket) = self.bucket(index) {
            return Ok(bucket);
        }

        let fresh = self.pool.alloc(Bucket::new())?;
        let guard = self.create_lock.lock();
        let slot = &self.slots[index];
        let current = slot.load(Ordering::Acquire);
        if current.is_null() {
            let ptr = fresh.into_raw();
            slot.store(ptr.as_ptr(), Ordering::Release);
            drop(guard);
            log::trace!("created bucket {}", index);
            // SAFETY: just published; lives until `release_all`.
            return Ok(unsafe { &*ptr.as_ptr() });
        }
        drop(guard);

        log::trace!("lost creation race for bucket {}", index);
        self.pool.free(fresh);
        // SAFETY: non-null and published, see `bucket`.
        Ok(unsafe { &*current })
    }

    /// Append `value` under `key` at the tail of its bucket.
    ///
    /// On failure `value` comes back inside the error. A bucket created for
    /// the entry stays in place; the chain itself is unchanged.
    pub fn insert(&self, key: u32, value: V) -> Result<(), InsertError<V>> {
        let index = bucket_index(key);
        let bucket = match self.bucket_or_create(index) {
            Ok(bucket) => bucket,
            Err(error) => return Err(InsertError { error, value }),
        };
        let node = self
            .pool
            .try_alloc(Link::new(key, value))
            .map_err(|(error, link)| InsertError {
                error,
                value: link.into_value(),
            })?;

        let pushed = {
            let mut chain = bucket.chain.lock();
            let pushed = chain.push_back(node);
            if pushed.is_ok() {
                self.len.fetch_add(1, Ordering::Relaxed);
            }
            pushed
        };
        let Err(node) = pushed else {
            return Ok(());
        };

        log::warn!("chain storage for bucket {} could not grow", index);
        let error = TableError::AllocationFailure {
            tag: self.pool.tag(),
            size: mem::size_of::<Block<Link<V>>>(),
        };
        let value = self.pool.free(node).into_value();
        Err(InsertError { error, value })
    }

    /// Earliest entry for `key`, holding its bucket's guard.
    pub fn find(&self, key: u32) -> Option<EntryRef<'_, V>> {
        let bucket = self.bucket(bucket_index(key))?;
        SpinLockGuard::try_map(bucket.chain.lock(), |chain| {
            let k = chain.find(key)?;
            chain.get_mut(k)
        })
        .ok()
        .map(|link| EntryRef { link })
    }

    pub fn get(&self, key: u32) -> Option<V>
    where
        V: Clone,
    {
        self.find(key).map(|e| e.value().clone())
    }

    pub fn contains_key(&self, key: u32) -> bool {
        self.find(key).is_some()
    }

    /// Unlink the earliest entry for `key` and return its value. The bucket
    /// stays allocated even if its chain becomes empty.
    pub fn take(&self, key: u32) -> Option<V> {
        let bucket = self.bucket(bucket_index(key))?;
        let node = {
            let mut chain = bucket.chain.lock();
            let k = chain.find(key)?;
            let node = chain.unlink(k)?;
            self.len.fetch_sub(1, Ordering::Relaxed);
            node
        };
        Some(self.pool.free(node).into_value())
    }

    /// Drop the earliest entry for `key`. Returns `false`, changing nothing,
    /// if there is none.
    pub fn remove(&self, key: u32) -> bool {
        self.take(key).is_some()
    }

    /// Every entry, in slot order and then chain order.
    pub fn snapshot(&self) -> Vec<(u32, V)>
    where
        V: Clone,
    {
        let mut out = Vec::new();
        for index in 0..BUCKET_COUNT {
            if let Some(bucket) = self.bucket(index) {
                let chain = bucket.chain.lock();
                out.extend(chain.iter().map(|(k, v)| (k, v.clone())));
            }
        }
        out
    }

    /// Return every entry and bucket to the pool. The table stays usable.
    pub fn clear(&mut self) -> CleanupSummary {
        self.release_all()
    }

    /// Return every entry and bucket to the pool and retire the table.
    pub fn cleanup(mut self) -> CleanupSummary {
        self.release_all()
    }

    // Idempotent: slots are nulled as they are released, so a second pass
    // (e.g. `Drop` after `cleanup`) finds nothing to free.
    fn release_all(&mut self) -> CleanupSummary {
        let mut summary = CleanupSummary::default();
        for slot in self.slots.iter_mut() {
            let Some(ptr) = NonNull::new(mem::replace(slot.get_mut(), ptr::null_mut())) else {
                continue;
            };
            // SAFETY: non-null slots hold blocks published by
            // `bucket_or_create`; `&mut self` rules out other readers.
            let mut bucket = unsafe { Block::from_raw(ptr) };
            for node in bucket.chain.get_mut().drain() {
                self.pool.free(node);
                summary.entries += 1;
            }
            self.pool.free(bucket);
            summary.buckets += 1;
        }
        *self.len.get_mut() = 0;
        if summary.buckets > 0 {
            log::debug!(
                "released {} entries across {} buckets (tag {})",
                summary.entries,
                summary.buckets,
                self.pool.tag()
            );
        }
        summary
    }

    #[cfg(test)]
    fn assert_chains_consistent(&self) {
        for index in 0..BUCKET_COUNT {
            if let Some(bucket) = self.bucket(index) {
                bucket.chain.lock().assert_consistent();
            }
        }
    }
}

impl<V, A: PoolAllocator> Drop for HashTable<V, A> {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl<V, A: PoolAllocator> fmt::Debug for HashTable<V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTable")
            .field("len", &self.len())
            .field("allocated_buckets", &self.allocated_buckets())
            .field("tag", &self.tag())
            .finish()
    }
}
