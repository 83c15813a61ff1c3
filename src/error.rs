// ⚠️ Error Types - typed failures of the allocation core
// Administrative code and binaries use anyhow; the core returns these.

use thiserror::Error;

// ============================================================================
// DENOMINATIONS & DECOMPOSITION
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DenominationError {
    #[error("denomination set is empty")]
    Empty,

    #[error("denomination must be positive, got {0}")]
    NotPositive(u32),

    #[error("denomination {value} exceeds the maximum of {max}")]
    TooLarge { value: u32, max: u32 },

    #[error("denominations must be strictly descending ({previous} is followed by {next})")]
    NotDescending { previous: u32, next: u32 },

    #[error("smallest denomination must be 1, got {0}")]
    MissingUnit(u32),

    #[error(
        "greedy decomposition is not optimal for target {target}: greedy uses {greedy} cards, optimum is {optimal}"
    )]
    NonCanonical { target: u64, greedy: u64, optimal: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecomposeError {
    #[error("target must be positive, got {0}")]
    NonPositiveTarget(i64),

    #[error("target {target} cannot be decomposed ({remainder} left over)")]
    Unsolvable { target: i64, remainder: u64 },
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    /// The write lock could not be acquired within the busy timeout
    #[error("database is busy: {0}")]
    Busy(rusqlite::Error),

    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Busy(err)
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

// ============================================================================
// ALLOCATION
// ============================================================================

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("insufficient stock for denomination {denomination}: requested {requested}, available {available}")]
    InsufficientStock {
        denomination: u32,
        requested: u64,
        available: u64,
    },

    /// A selected card was taken by someone else before it could be marked
    #[error("card {code} was claimed concurrently")]
    Conflict { code: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AllocationError {
    /// Whether retrying the whole reservation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AllocationError::Conflict { .. } => true,
            AllocationError::Store(e) => e.is_busy(),
            AllocationError::InsufficientStock { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_errors_are_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err: StoreError = busy.into();
        assert!(err.is_busy());
        assert!(AllocationError::Store(err).is_retryable());

        let other: StoreError = rusqlite::Error::InvalidQuery.into();
        assert!(!other.is_busy());
    }

    #[test]
    fn test_insufficient_stock_is_final() {
        let err = AllocationError::InsufficientStock {
            denomination: 10,
            requested: 1,
            available: 0,
        };
        assert!(!err.is_retryable());
        assert!(AllocationError::Conflict { code: "X".to_string() }.is_retryable());
    }
}
