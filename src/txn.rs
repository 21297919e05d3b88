//! Transaction contract (§4.2).
//!
//! Transaction scope is a thread-associated stack of work phases, not a
//! pool-associated one: a thread may nest transactions (the inner scope just
//! pushes another `Work` frame) and [`MemoryPool::tx_stage`](crate::pool::MemoryPool::tx_stage)
//! always reports the calling thread's current phase regardless of which
//! pool is asking.

use std::cell::RefCell;
use std::ptr;

use crate::error::PmemError;
use crate::pool::{MemoryPool, PersistentPtr, TxStage};

thread_local! {
    static STAGE_STACK: RefCell<Vec<TxStage>> = RefCell::new(Vec::new());
}

/// The current thread's transaction stage (top of its stage stack, or
/// [`TxStage::None`] if no transaction is active).
pub fn current_stage() -> TxStage {
    STAGE_STACK.with(|s| s.borrow().last().copied().unwrap_or(TxStage::None))
}

fn push_stage(stage: TxStage) {
    STAGE_STACK.with(|s| s.borrow_mut().push(stage));
}

fn pop_stage() {
    STAGE_STACK.with(|s| {
        s.borrow_mut().pop();
    });
}

fn set_top(stage: TxStage) {
    STAGE_STACK.with(|s| {
        let mut s = s.borrow_mut();
        if let Some(top) = s.last_mut() {
            *top = stage;
        }
    });
}

/// One recorded undo-log entry: the address snapshotted and the bytes that
/// were there before the transaction's body started mutating it.
struct UndoEntry {
    addr: *mut u8,
    before: Vec<u8>,
}

// SAFETY: `UndoEntry` is only ever touched by the thread that created it,
// from inside the dynamic extent of `Transaction::run`.
unsafe impl Send for UndoEntry {}

/// A single transaction's mutable state: the undo log built up by
/// `snapshot` calls, consulted if the body returns an error.
pub struct Transaction<'p> {
    pool: &'p dyn MemoryPool,
    undo: RefCell<Vec<UndoEntry>>,
}

impl<'p> Transaction<'p> {
    /// Record the current bytes at `addr[..len]` so they can be restored on
    /// abort. Idempotent for ranges already fully covered by a prior
    /// snapshot in this same transaction.
    pub fn snapshot(&self, addr: *const u8, len: usize) -> Result<(), PmemError> {
        if current_stage() != TxStage::Work {
            return Err(PmemError::InvalidState("snapshot called outside transaction Work stage"));
        }
        let mut undo = self.undo.borrow_mut();
        let start = addr as usize;
        let end = start + len;
        let already_covered = undo.iter().any(|e| {
            let e_start = e.addr as usize;
            let e_end = e_start + e.before.len();
            e_start <= start && end <= e_end
        });
        if already_covered {
            return Ok(());
        }
        self.pool.snapshot(addr, len)?;
        let mut before = vec![0u8; len];
        unsafe { ptr::copy_nonoverlapping(addr, before.as_mut_ptr(), len) };
        undo.push(UndoEntry { addr: addr as *mut u8, before });
        Ok(())
    }

    /// Allocate inside this transaction. Valid only while the stage is
    /// `Work` (enforced by the pool itself).
    pub fn make_persistent(&self, size: usize, type_tag: &'static str) -> Result<PersistentPtr, PmemError> {
        self.pool.allocate(size, type_tag)
    }

    /// Free inside this transaction. Valid only while the stage is `Work`.
    pub fn delete_persistent(&self, ptr: PersistentPtr) -> Result<(), PmemError> {
        self.pool.free(ptr)
    }

    /// The pool this transaction is running against.
    pub fn pool(&self) -> &'p dyn MemoryPool {
        self.pool
    }

    fn rollback(&self) {
        let mut undo = self.undo.borrow_mut();
        // Replay most-recent-first so overlapping later snapshots restore
        // the oldest recorded bytes last, matching the order they'd be
        // undone if applied one at a time.
        while let Some(entry) = undo.pop() {
            unsafe { ptr::copy_nonoverlapping(entry.before.as_ptr(), entry.addr, entry.before.len()) };
            self.pool.persist(entry.addr, entry.before.len());
        }
    }
}

impl Transaction<'_> {
    /// Enter `Work` stage, run `body`, and commit on `Ok`.
    ///
    /// On `Err`, the stage transitions to `OnAbort`, every snapshot taken
    /// during the body is replayed (oldest bytes restored), `Finally` runs,
    /// and the stack unwinds back to the caller's prior stage before the
    /// error propagates. On `Ok`, the stage transitions through `OnCommit`
    /// (snapshots discarded) to `Committed`, `Finally` runs, and the value
    /// propagates.
    ///
    /// A crash at any point before reaching `Committed` is equivalent, on
    /// restart, to this function having returned `Err` and the undo log
    /// having already been discarded along with the rest of process memory
    /// — durable state is recovered by replaying whatever the *pool's own*
    /// on-disk undo log recorded via `snapshot`, not by this in-memory undo
    /// list, which only ever needs to survive until `run` returns.
    pub fn run<F, T>(pool: &dyn MemoryPool, body: F) -> Result<T, PmemError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, PmemError>,
    {
        push_stage(TxStage::Work);
        let tx = Transaction { pool, undo: RefCell::new(Vec::new()) };

        let result = body(&tx);

        match result {
            Ok(value) => {
                set_top(TxStage::OnCommit);
                pool.drain();
                tx.undo.borrow_mut().clear();
                set_top(TxStage::Committed);
                set_top(TxStage::Finally);
                pop_stage();
                Ok(value)
            }
            Err(err) => {
                set_top(TxStage::OnAbort);
                tx.rollback();
                set_top(TxStage::Finally);
                pop_stage();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::VolatilePool;

    #[test]
    fn commit_discards_snapshots() {
        let pool = VolatilePool::new();
        let mut value: u64 = 1;
        let result = Transaction::run(&pool, |tx| {
            tx.snapshot(&value as *const u64 as *const u8, 8)?;
            value = 2;
            Ok::<_, PmemError>(())
        });
        assert!(result.is_ok());
        assert_eq!(value, 2);
        assert_eq!(current_stage(), TxStage::None);
    }

    #[test]
    fn abort_replays_snapshot() {
        let pool = VolatilePool::new();
        let mut value: u64 = 1;
        let result: Result<(), PmemError> = Transaction::run(&pool, |tx| {
            tx.snapshot(&value as *const u64 as *const u8, 8)?;
            value = 2;
            Err(PmemError::InvalidState("forced abort"))
        });
        assert!(result.is_err());
        assert_eq!(value, 1, "abort must restore the pre-transaction bytes");
        assert_eq!(current_stage(), TxStage::None);
    }

    #[test]
    fn snapshot_outside_work_stage_is_invalid_state() {
        let pool = VolatilePool::new();
        // Build a transaction object without going through `run`, by
        // capturing the `Transaction` and calling `snapshot` after `run`
        // returns is not possible (the reference doesn't outlive `run`), so
        // instead verify that a nested, already-popped call sees `None`.
        assert_eq!(current_stage(), TxStage::None);
        let value = 1u64;
        let err = Transaction::run(&pool, |_tx| {
            // Stage is Work here; exit immediately, then probe afterward.
            Ok::<_, PmemError>(())
        });
        assert!(err.is_ok());
        assert_eq!(current_stage(), TxStage::None);
        let _ = value;
    }

    #[test]
    fn nested_transactions_push_and_pop_independently() {
        let pool = VolatilePool::new();
        let result = Transaction::run(&pool, |_outer| {
            assert_eq!(current_stage(), TxStage::Work);
            let inner = Transaction::run(&pool, |_inner| Ok::<_, PmemError>(42));
            assert_eq!(inner.unwrap(), 42);
            assert_eq!(current_stage(), TxStage::Work);
            Ok::<_, PmemError>(())
        });
        assert!(result.is_ok());
        assert_eq!(current_stage(), TxStage::None);
    }

    #[test]
    fn overlapping_snapshot_is_idempotent() {
        let pool = VolatilePool::new();
        let mut buf = [0u8; 16];
        let result: Result<(), PmemError> = Transaction::run(&pool, |tx| {
            tx.snapshot(buf.as_ptr(), 16)?;
            buf[0] = 1;
            // Overlapping sub-range snapshot must not record buf[0] = 1 as
            // the "before" state.
            tx.snapshot(buf.as_ptr(), 8)?;
            buf[1] = 2;
            Err(PmemError::InvalidState("forced abort"))
        });
        assert!(result.is_err());
        assert_eq!(buf, [0u8; 16]);
    }
}
