//! Epoch-based reclamation registry (§4.5).
//!
//! Workers enter a `critical` section while touching data that another
//! thread might concurrently unlink; a separate serialized path (`sync` /
//! `full_sync`) advances the global epoch once it observes that every
//! *active* worker has already caught up to it, and names which of the
//! three rotating epochs is now safe to reclaim. Three epochs are sufficient
//! because an object unlinked in epoch `e` cannot be referenced by a worker
//! still active in `e`, so it becomes reclaimable once the global epoch has
//! advanced twice past `e`.
//!
//! This mirrors the reference design directly: a worker's local-epoch word
//! doubles as its active flag (top bit set while inside `critical`), so a
//! single atomic load tells `sync` both whether a worker is active and which
//! epoch it's pinned to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::error::PmemError;

const ACTIVE_FLAG: usize = 1 << (usize::BITS - 1);
const EPOCHS_NUMBER: usize = 3;

/// Global epoch-based reclamation registry.
///
/// One `Ebr` is shared by every thread participating in the reclamation
/// scheme it backs (typically one per container instance). Each
/// participating thread calls [`Ebr::register_worker`] exactly once.
pub struct Ebr {
    global_epoch: AtomicUsize,
    workers: Mutex<HashMap<ThreadId, &'static AtomicUsize>>,
}

impl Ebr {
    /// Construct a fresh registry with no registered workers and the global
    /// epoch at 0.
    pub fn new() -> Self {
        Self { global_epoch: AtomicUsize::new(0), workers: Mutex::new(HashMap::new()) }
    }

    /// Register the calling thread as a worker. Only one worker may be
    /// registered per thread at a time; the returned [`Worker`]
    /// unregisters itself on drop.
    pub fn register_worker(&self) -> Result<Worker<'_>, PmemError> {
        let thread_id = std::thread::current().id();
        let mut workers = self.workers.lock().unwrap();
        if workers.contains_key(&thread_id) {
            return Err(PmemError::DuplicateWorker);
        }
        // Leaked so the `&'static` reference below remains valid for as
        // long as the map entry does; reclaimed explicitly in `Worker::drop`
        // once the entry is removed.
        let slot: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
        workers.insert(thread_id, slot);
        drop(workers);

        Ok(Worker { ebr: self, local_epoch: slot, thread_id })
    }

    /// Attempt to synchronize and announce a new epoch. Must not be called
    /// concurrently with another call to `sync` or with `staging_epoch` /
    /// `gc_epoch` from a different thread; callers serialize these among
    /// themselves (typically a single garbage-collector thread).
    ///
    /// Returns `true` if a new epoch was announced, `false` if some active
    /// worker has not yet caught up to the current epoch.
    pub fn sync(&self) -> bool {
        let current_epoch = self.global_epoch.load(Ordering::Acquire);
        let workers = self.workers.lock().unwrap();
        for local in workers.values() {
            let local_e = local.load(Ordering::Acquire);
            let active = local_e & ACTIVE_FLAG != 0;
            if active && local_e != (current_epoch | ACTIVE_FLAG) {
                return false;
            }
        }
        let next_epoch = (current_epoch + 1) % EPOCHS_NUMBER;
        self.global_epoch.store(next_epoch, Ordering::Release);
        log::trace!("ebr: advanced global epoch {current_epoch} -> {next_epoch}");
        true
    }

    /// Repeatedly call [`Self::sync`] until the epoch has advanced a full
    /// cycle (`EPOCHS_NUMBER` successful syncs), guaranteeing that any
    /// object unlinked before this call is now safe to reclaim.
    pub fn full_sync(&self) {
        let mut syncs = 0;
        while syncs < EPOCHS_NUMBER {
            if self.sync() {
                syncs += 1;
            }
        }
        log::debug!("ebr: full_sync completed a full cycle, gc_epoch now {}", self.gc_epoch());
    }

    /// The epoch objects unlinked right now should be staged under.
    pub fn staging_epoch(&self) -> usize {
        self.global_epoch.load(Ordering::Acquire)
    }

    /// The epoch that is currently safe to reclaim.
    pub fn gc_epoch(&self) -> usize {
        (self.global_epoch.load(Ordering::Acquire) + 1) % EPOCHS_NUMBER
    }
}

impl Default for Ebr {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread's registered handle into an [`Ebr`] registry.
///
/// Not `Send`: a worker's local-epoch slot is keyed by the registering
/// thread's id, and handing it to another thread would let that thread
/// report occupancy on the wrong thread's behalf.
pub struct Worker<'e> {
    ebr: &'e Ebr,
    local_epoch: &'static AtomicUsize,
    thread_id: ThreadId,
}

impl<'e> Worker<'e> {
    /// Run `f` inside a critical section: while `f` executes, this worker
    /// is recorded as active and pinned to the current global epoch, so a
    /// concurrent `sync` will not advance past it. Reclamation guarantees
    /// that nothing this worker observes during `f` is freed before `f`
    /// returns.
    pub fn critical<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let new_epoch = self.ebr.global_epoch.load(Ordering::Acquire) | ACTIVE_FLAG;
        self.local_epoch.store(new_epoch, Ordering::Release);
        let result = f();
        self.local_epoch.store(0, Ordering::Release);
        result
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        let mut workers = self.ebr.workers.lock().unwrap();
        if let Some(slot) = workers.remove(&self.thread_id) {
            // SAFETY: the map held the only remaining reference to this
            // leaked slot, and we've just removed it.
            unsafe {
                drop(Box::from_raw(slot as *const AtomicUsize as *mut AtomicUsize));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn single_worker_critical_section_does_not_block_sync() {
        let ebr = Ebr::new();
        let worker = ebr.register_worker().unwrap();
        worker.critical(|| {
            assert!(ebr.sync());
        });
    }

    #[test]
    fn duplicate_worker_registration_on_same_thread_errors() {
        let ebr = Ebr::new();
        let _w1 = ebr.register_worker().unwrap();
        let err = ebr.register_worker().unwrap_err();
        assert!(matches!(err, PmemError::DuplicateWorker));
    }

    #[test]
    fn dropped_worker_frees_its_slot_for_reregistration() {
        let ebr = Ebr::new();
        {
            let _w = ebr.register_worker().unwrap();
        }
        assert!(ebr.register_worker().is_ok());
    }

    #[test]
    fn sync_blocks_while_an_active_worker_is_behind() {
        let ebr = Arc::new(Ebr::new());
        let barrier = Arc::new(Barrier::new(2));

        let ebr2 = Arc::clone(&ebr);
        let barrier2 = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            let worker = ebr2.register_worker().unwrap();
            worker.critical(|| {
                barrier2.wait();
                // Hold the critical section open until the main thread has
                // observed that `sync` cannot advance past it.
                barrier2.wait();
            });
        });

        barrier.wait();
        assert!(!ebr.sync(), "sync must not advance while a worker is pinned to the current epoch");
        barrier.wait();
        handle.join().unwrap();
    }

    #[test]
    fn full_sync_advances_a_complete_cycle() {
        let ebr = Ebr::new();
        let staging_before = ebr.staging_epoch();
        ebr.full_sync();
        // After three successful syncs the epoch is back to the value it
        // started at (arithmetic mod 3), but gc_epoch must be the epoch
        // immediately following it.
        assert_eq!(ebr.staging_epoch(), staging_before);
        assert_eq!(ebr.gc_epoch(), (staging_before + 1) % EPOCHS_NUMBER);
    }
}
