//! Persistent mutex, shared mutex, timed mutex and condition variable (§4.2).
//!
//! Each lock embeds a durable *generation* word alongside its volatile state.
//! All-zero bytes (generation `0`, state `0`) are a valid un-held lock, which
//! is exactly what a freshly mapped, never-initialized persistent-memory
//! region contains. On first use after a restart, a lock compares its stored
//! generation against [`process_generation`] and lazily re-initializes its
//! volatile state if they differ — this is what makes it safe to reuse the
//! same durable bytes across process restarts without an explicit
//! construction step.
//!
//! The locking itself is built the same way the volatile locks in this crate
//! are: atomic state words with [`Backoff`]-governed spinning, not an OS
//! mutex — so `lock()` never suspends the thread. [`PCondvar`] is the one
//! primitive that must genuinely block, and is layered on a small internal
//! OS-backed wait/notify pair guarded by a sequence counter so that a
//! notification is never lost across the unlock/park race.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::backoff::Backoff;

/// Returns a 64-bit value unique to this process run. Every lock compares
/// its durable generation word against this value; a mismatch means the
/// bytes were last touched by a different process incarnation (including a
/// prior run before a crash) and must be lazily re-initialized.
pub fn process_generation() -> u64 {
    static GEN: OnceLock<u64> = OnceLock::new();
    *GEN.get_or_init(|| {
        use std::time::{SystemTime, UNIX_EPOCH};
        // Not required to be globally unique, only distinct from whatever
        // was durably stored by a *previous* run with overwhelming
        // probability; nanosecond process-start time suffices.
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(1).max(1)
    })
}

const UNLOCKED: usize = 0;
const LOCKED: usize = 1;

/// A persistent mutex: exclusive lock with durable generation word.
///
/// Also serves as the "timed mutex" named in §3/§4.2 — `try_lock_for` and
/// `try_lock_until` are inherent methods rather than a separate type, since
/// the source's `timed_mutex` differs from its plain `mutex` only in which
/// methods it exposes, not in its locking algorithm.
#[repr(C)]
pub struct PMutex<T: ?Sized> {
    generation: AtomicU64,
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

/// Type alias documenting the "timed mutex" named in the spec; identical
/// implementation to [`PMutex`], which always supports timed acquisition.
pub type PTimedMutex<T> = PMutex<T>;

unsafe impl<T: ?Sized + Send> Send for PMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for PMutex<T> {}

impl<T> PMutex<T> {
    /// Construct a fresh, unlocked persistent mutex tagged with the current
    /// process generation. Equivalent, bit-for-bit, to what
    /// `ensure_initialized` would produce from all-zero bytes.
    pub fn new(data: T) -> Self {
        Self {
            generation: AtomicU64::new(process_generation()),
            state: AtomicUsize::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Reinterpret a zeroed (or possibly stale-generation) durable region as
    /// a `PMutex`, lazily re-initializing if its generation is stale. This
    /// is the path a container takes when mapping in a persistent region
    /// left over from a previous process run.
    fn ensure_initialized(&self) {
        let current = process_generation();
        let stored = self.generation.load(Ordering::Acquire);
        if stored != current {
            // Racing threads may all observe a stale generation and all
            // attempt this; only one needs to win, the rest are no-ops.
            if self
                .generation
                .compare_exchange(stored, current, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.state.store(UNLOCKED, Ordering::Release);
            }
        }
    }

    /// Try to acquire without spinning.
    pub fn try_lock(&self) -> Option<PMutexGuard<'_, T>> {
        self.ensure_initialized();
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(PMutexGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire, blocking (via spin-backoff) until available.
    pub fn lock(&self) -> PMutexGuard<'_, T> {
        self.ensure_initialized();
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            backoff.spin();
        }
    }

    /// Try to acquire, giving up once `duration` has elapsed since the call.
    /// Never reports success after the deadline, and never returns a
    /// "timed out" result while still holding the lock.
    pub fn try_lock_for(&self, duration: Duration) -> Option<PMutexGuard<'_, T>> {
        self.try_lock_until(Instant::now() + duration)
    }

    /// As [`Self::try_lock_for`], but with an absolute deadline.
    pub fn try_lock_until(&self, deadline: Instant) -> Option<PMutexGuard<'_, T>> {
        self.ensure_initialized();
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return Some(guard);
            }
            if Instant::now() >= deadline {
                return None;
            }
            backoff.spin();
        }
    }

    /// True if currently locked (racy; for diagnostics only).
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }
}

/// RAII guard for [`PMutex`].
pub struct PMutexGuard<'a, T: ?Sized> {
    lock: &'a PMutex<T>,
}

impl<'a, T: ?Sized> PMutexGuard<'a, T> {
    /// The mutex this guard locks; used by [`PCondvar::wait`] to relock
    /// after the wait completes.
    pub fn source(&self) -> &'a PMutex<T> {
        self.lock
    }
}

impl<T: ?Sized> Deref for PMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}
impl<T: ?Sized> DerefMut for PMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
impl<T: ?Sized> Drop for PMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}

const SHARED_UNIT: usize = 2;
const WRITER_BIT: usize = 1;

/// A persistent shared/exclusive (reader-writer) mutex with the same
/// durable-generation lazy-reinit contract as [`PMutex`].
#[repr(C)]
pub struct PSharedMutex<T: ?Sized> {
    generation: AtomicU64,
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for PSharedMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for PSharedMutex<T> {}

impl<T> PSharedMutex<T> {
    /// Construct a fresh, unlocked persistent shared mutex.
    pub fn new(data: T) -> Self {
        Self {
            generation: AtomicU64::new(process_generation()),
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    fn ensure_initialized(&self) {
        let current = process_generation();
        let stored = self.generation.load(Ordering::Acquire);
        if stored != current
            && self
                .generation
                .compare_exchange(stored, current, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.state.store(0, Ordering::Release);
        }
    }

    /// Try to acquire a shared (read) lock without spinning.
    pub fn try_read(&self) -> Option<PSharedMutexReadGuard<'_, T>> {
        self.ensure_initialized();
        let state = self.state.load(Ordering::Relaxed);
        if state & WRITER_BIT != 0 {
            return None;
        }
        if self
            .state
            .compare_exchange(state, state + SHARED_UNIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(PSharedMutexReadGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire a shared (read) lock, spinning if necessary.
    pub fn read(&self) -> PSharedMutexReadGuard<'_, T> {
        self.ensure_initialized();
        let mut backoff = Backoff::new();
        loop {
            if let Some(g) = self.try_read() {
                return g;
            }
            backoff.spin();
        }
    }

    /// Try to acquire an exclusive (write) lock without spinning.
    pub fn try_write(&self) -> Option<PSharedMutexWriteGuard<'_, T>> {
        self.ensure_initialized();
        if self
            .state
            .compare_exchange(0, WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(PSharedMutexWriteGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire an exclusive (write) lock, spinning if necessary.
    pub fn write(&self) -> PSharedMutexWriteGuard<'_, T> {
        self.ensure_initialized();
        let mut backoff = Backoff::new();
        loop {
            if let Some(g) = self.try_write() {
                return g;
            }
            backoff.spin();
        }
    }

    /// Try to acquire an exclusive lock, giving up after `duration`.
    pub fn try_write_for(&self, duration: Duration) -> Option<PSharedMutexWriteGuard<'_, T>> {
        let deadline = Instant::now() + duration;
        let mut backoff = Backoff::new();
        loop {
            if let Some(g) = self.try_write() {
                return Some(g);
            }
            if Instant::now() >= deadline {
                return None;
            }
            backoff.spin();
        }
    }

    /// True if currently held exclusively (racy; diagnostics only).
    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER_BIT != 0
    }
}

/// RAII shared-read guard for [`PSharedMutex`].
pub struct PSharedMutexReadGuard<'a, T: ?Sized> {
    lock: &'a PSharedMutex<T>,
}
impl<T: ?Sized> Deref for PSharedMutexReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}
impl<T: ?Sized> Drop for PSharedMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(SHARED_UNIT, Ordering::Release);
    }
}

/// RAII exclusive-write guard for [`PSharedMutex`].
pub struct PSharedMutexWriteGuard<'a, T: ?Sized> {
    lock: &'a PSharedMutex<T>,
}
impl<T: ?Sized> Deref for PSharedMutexWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}
impl<T: ?Sized> DerefMut for PSharedMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
impl<T: ?Sized> Drop for PSharedMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER_BIT, Ordering::Release);
    }
}

/// A persistent condition variable.
///
/// Waits release the paired [`PMutex`] and block until notified, then
/// re-acquire it before returning — "atomically" in the sense that no
/// notification sent after the wait begins can be missed, which is ensured
/// by a monotonic sequence counter sampled before the mutex is released.
#[repr(C)]
pub struct PCondvar {
    generation: AtomicU64,
    seq: AtomicU64,
    gate: Mutex<()>,
    cv: Condvar,
}

impl Default for PCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl PCondvar {
    /// Construct a fresh condition variable tagged with the current process
    /// generation.
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(process_generation()),
            seq: AtomicU64::new(0),
            gate: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn ensure_initialized(&self) {
        let current = process_generation();
        let stored = self.generation.load(Ordering::Acquire);
        if stored != current {
            let _ = self.generation.compare_exchange(stored, current, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Release `guard`'s mutex, block until notified, then reacquire it and
    /// return the new guard.
    pub fn wait<'a, T>(&self, guard: PMutexGuard<'a, T>) -> PMutexGuard<'a, T> {
        self.ensure_initialized();
        let mutex = guard.source();
        let seq_before = self.seq.load(Ordering::Acquire);
        drop(guard);

        loop {
            if self.seq.load(Ordering::Acquire) != seq_before {
                break;
            }
            let g = self.gate.lock().unwrap();
            if self.seq.load(Ordering::Acquire) != seq_before {
                break;
            }
            // Bounded wait: even a missed notify (recorded between our
            // check above and `cv.wait_timeout` below) is bounded by this
            // timeout, so no wakeup is lost forever.
            let _ = self.cv.wait_timeout(g, Duration::from_millis(1)).unwrap();
        }
        mutex.lock()
    }

    /// Wake exactly one waiter.
    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        let _g = self.gate.lock().unwrap();
        self.cv.notify_one();
    }

    /// Wake all waiters.
    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        let _g = self.gate.lock().unwrap();
        self.cv.notify_all();
    }
}
