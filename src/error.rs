//! Error surface for the persistence and container layers.
//!
//! Every fallible public operation in this crate returns `Result<T, PmemError>`.
//! User-initiated errors (bad argument, duplicate worker) leave the structure
//! unchanged; transactional errors mean any in-flight transaction has already
//! been rolled back to its pre-`Work` state by the time the error is observed.

use core::fmt;

/// Unified error type for pool, transaction, lock and container operations.
#[derive(thiserror::Error, Debug)]
pub enum PmemError {
    /// Operation requires a transaction in the `Work` stage (or requires a
    /// pointer that actually belongs to the pool it's used against).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Transactional allocation failed; the enclosing transaction aborts.
    #[error("allocation failure: {0}")]
    Allocation(AllocError),

    /// Transactional free failed; the enclosing transaction aborts.
    #[error("free failure: {0}")]
    Free(FreeError),

    /// A `try_lock_for`/`try_lock_until` deadline elapsed before acquisition.
    #[error("lock acquisition timed out")]
    Timeout,

    /// EBR registration was attempted on a thread that already has a worker.
    #[error("thread already has a registered EBR worker")]
    DuplicateWorker,

    /// `snapshot`/`persist` failed inside a transaction.
    #[error("snapshot/persist failure: {0}")]
    SnapshotFailed(&'static str),
}

/// Reason a transactional allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    /// Number of bytes that were requested.
    pub requested: usize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not allocate {} bytes", self.requested)
    }
}

/// Reason a transactional free failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeError {
    /// Offset that the caller attempted to free.
    pub offset: u64,
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not free allocation at offset {}", self.offset)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, PmemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        let e = PmemError::Allocation(AllocError { requested: 64 });
        assert_eq!(e.to_string(), "allocation failure: could not allocate 64 bytes");

        let e = PmemError::Free(FreeError { offset: 128 });
        assert_eq!(e.to_string(), "free failure: could not free allocation at offset 128");

        assert_eq!(PmemError::Timeout.to_string(), "lock acquisition timed out");
        assert_eq!(
            PmemError::DuplicateWorker.to_string(),
            "thread already has a registered EBR worker"
        );
    }
}
