//! Errors surfaced by table operations.

use crate::pool::PoolTag;
use core::fmt;

/// Failure of a table operation.
///
/// Lookups and removals that find nothing are not errors; they report
/// `None` / `false` instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    /// The pool returned no memory for a bucket or entry block.
    #[error("pool allocation of {size} bytes failed (tag {tag})")]
    AllocationFailure { tag: PoolTag, size: usize },
}

impl TableError {
    /// Whether retrying the operation later can succeed.
    ///
    /// Allocation failures leave the table consistent, so a caller may retry
    /// once memory pressure drops.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AllocationFailure { .. } => true,
        }
    }
}

/// A rejected insert. Carries the value back so the caller keeps ownership.
#[derive(thiserror::Error)]
#[error("insert rejected: {error}")]
pub struct InsertError<V> {
    #[source]
    pub error: TableError,
    pub value: V,
}

impl<V> InsertError<V> {
    pub fn is_recoverable(&self) -> bool {
        self.error.is_recoverable()
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

// Values may be opaque handles, so they are left out.
impl<V> fmt::Debug for InsertError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<V> From<InsertError<V>> for TableError {
    fn from(err: InsertError<V>) -> Self {
        err.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DEFAULT_POOL_TAG;
    use std::error::Error as _;

    #[test]
    fn insert_error_reports_cause_and_returns_value() {
        let err = InsertError {
            error: TableError::AllocationFailure {
                tag: DEFAULT_POOL_TAG,
                size: 32,
            },
            value: vec![1u8, 2],
        };
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "insert rejected: pool allocation of 32 bytes failed (tag hMap)"
        );
        assert!(err.source().is_some());
        assert_eq!(
            format!("{:?}", err),
            "InsertError { error: AllocationFailure { tag: PoolTag(hMap), size: 32 }, .. }"
        );
        assert_eq!(err.into_value(), vec![1, 2]);
    }
}
