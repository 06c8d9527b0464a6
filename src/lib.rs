//! pool-hashmap: a fixed-bucket chained hash table from `u32` keys to
//! caller-owned values, with storage drawn from a tagged pool allocator and
//! real per-bucket mutual exclusion.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: a table that can live in a privileged, non-paged context: every
//!   block is charged to a pool tag, allocation failure is an ordinary
//!   result, and concurrent callers never observe a chain mid-mutation.
//! - Layers:
//!   - `pool`: `PoolAllocator` seam plus `Pool`/`Block`, a linear owned
//!     pointer that must be handed back to the pool it came from.
//!   - `spin_lock`: `lock_api` mutex over a spinning raw lock; never parks.
//!   - `chain`: insertion-ordered doubly-linked list whose nodes live in a
//!     `SlotMap` arena and link by generational keys.
//!   - `hash_table`: 1024 lazily created buckets, each a `SpinLock<Chain>`.
//!
//! Constraints
//! - Bucket count is fixed at 1024 (`key % 1024`); no resizing, no
//!   rehashing. The table assumes the expected key cardinality is well below
//!   that, otherwise chains grow long.
//! - Duplicate keys are kept; lookups and removals act on the earliest
//!   surviving entry.
//! - Values are opaque: the table stores and returns them, never inspects
//!   them. A rejected insert hands its value back in `InsertError`.
//! - Buckets are never reclaimed when they empty; they are released only by
//!   a whole-table cleanup. Publication of a bucket pointer is therefore
//!   monotonic, which keeps the double-checked creation simple.
//!
//! Lifecycle
//! - Constructing a table is "initialise" and allocates nothing from the
//!   pool. `cleanup(self)` consumes the table, so use-after-cleanup does not
//!   compile; `Drop` performs the same release and is a no-op on slots that
//!   are already empty, so nothing is freed twice.
//!
//! Locking
//! - See `hash_table` for the discipline. In short: table guard only for
//!   bucket publication, bucket guard for every chain access, pool traffic
//!   outside both.

mod chain;
mod chain_proptest;
pub mod error;
pub mod hash_table;
pub mod pool;
pub mod spin_lock;

// Public surface
pub use error::{InsertError, TableError};
pub use hash_table::{bucket_index, CleanupSummary, EntryRef, HashTable, BUCKET_COUNT};
pub use pool::{CountingPool, PoolAllocator, PoolStats, PoolTag, SystemPool, DEFAULT_POOL_TAG};
pub use spin_lock::{RawSpinLock, SpinLock};
