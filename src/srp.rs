//! Self-relative pointers.
//!
//! A self-relative pointer stores a reference as a byte offset from its own
//! storage address rather than as an absolute address. Because the offset is
//! computed at the moment of dereference (`addr(self) + off`), the exact same
//! bytes remain valid after the backing region is remapped at a different
//! base address — which is what happens every time a persistent-memory pool
//! is reopened.
//!
//! Bit 0 of the stored offset is reserved as a user tag (the skip list uses
//! it to distinguish a leaf link from an internal-node link in a tagged
//! union); it is opaque to this module.

use std::sync::atomic::{AtomicU64, Ordering};

const TAG_MASK: u64 = 1;
const OFFSET_MASK: u64 = !TAG_MASK;

/// A non-atomic self-relative pointer to `T`.
///
/// `Srp<T>` is not trivially relocatable: moving the bytes of an `Srp` to a
/// new address without calling [`Srp::rebase`] leaves it pointing at the
/// wrong target, because the stored offset is relative to the *old* address
/// of the pointer itself.
#[repr(transparent)]
#[derive(Debug)]
pub struct Srp<T> {
    off: u64,
    _marker: core::marker::PhantomData<*const T>,
}

impl<T> Clone for Srp<T> {
    fn clone(&self) -> Self {
        Srp { off: self.off, _marker: core::marker::PhantomData }
    }
}
impl<T> Copy for Srp<T> {}

impl<T> Default for Srp<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Srp<T> {
    /// The null self-relative pointer (`off == 0`).
    #[inline]
    pub const fn null() -> Self {
        Srp { off: 0, _marker: core::marker::PhantomData }
    }

    /// Build a pointer stored at `self_addr` that targets `target_addr`,
    /// with the given opaque user tag in bit 0.
    #[inline]
    pub fn encode(self_addr: usize, target_addr: Option<usize>, tag: bool) -> Self {
        let off = match target_addr {
            None => 0,
            Some(t) => {
                let delta = (t as i64).wrapping_sub(self_addr as i64) as u64;
                debug_assert_eq!(delta & TAG_MASK, 0, "target address must be even for tag bit to be free");
                delta | (tag as u64)
            }
        };
        Srp { off, _marker: core::marker::PhantomData }
    }

    /// True if this is the null pointer.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.off == 0
    }

    /// The opaque user tag stored in bit 0.
    #[inline]
    pub fn tag(&self) -> bool {
        (self.off & TAG_MASK) != 0
    }

    /// Returns a pointer with the same target but a different tag bit.
    #[inline]
    pub fn with_tag(&self, tag: bool) -> Self {
        if self.is_null() {
            return *self;
        }
        let off = (self.off & OFFSET_MASK) | (tag as u64);
        Srp { off, _marker: core::marker::PhantomData }
    }

    /// Dereference relative to `self_addr` (the address at which this `Srp`
    /// is itself stored), returning the target address or `None` if null.
    #[inline]
    pub fn load(&self, self_addr: usize) -> Option<usize> {
        if self.is_null() {
            None
        } else {
            Some((self_addr as i64).wrapping_add((self.off & OFFSET_MASK) as i64) as usize)
        }
    }

    /// Recompute this pointer so it targets the same absolute address after
    /// being moved from `old_self_addr` to `new_self_addr`. Required any
    /// time the bytes of an `Srp` are relocated (memcpy, struct move) rather
    /// than freshly constructed in place.
    #[inline]
    pub fn rebase(&mut self, old_self_addr: usize, new_self_addr: usize) {
        if let Some(target) = self.load(old_self_addr) {
            *self = Self::encode(new_self_addr, Some(target), self.tag());
        }
    }

    /// Raw stored offset word, including the tag bit. Used by callers that
    /// need to persist the bytes directly (e.g. inside a transaction
    /// snapshot).
    #[inline]
    pub fn raw(&self) -> u64 {
        self.off
    }

    /// Construct from a raw offset word previously obtained from [`Self::raw`].
    #[inline]
    pub fn from_raw(off: u64) -> Self {
        Srp { off, _marker: core::marker::PhantomData }
    }
}

impl<T> PartialEq for Srp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}
impl<T> Eq for Srp<T> {}

/// An atomically-updated self-relative pointer.
///
/// Loads use acquire ordering, stores use release ordering, matching the
/// ordering the containers rely on to publish a freshly linked node.
#[repr(transparent)]
pub struct AtomicSrp<T> {
    off: AtomicU64,
    _marker: core::marker::PhantomData<*const T>,
}

impl<T> core::fmt::Debug for AtomicSrp<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtomicSrp").field("off", &self.off.load(Ordering::Relaxed)).finish()
    }
}

impl<T> AtomicSrp<T> {
    /// A fresh atomic null pointer.
    #[inline]
    pub const fn null() -> Self {
        AtomicSrp { off: AtomicU64::new(0), _marker: core::marker::PhantomData }
    }

    /// Atomic acquire-load as an [`Srp`] snapshot.
    #[inline]
    pub fn load(&self, order: Ordering) -> Srp<T> {
        Srp::from_raw(self.off.load(order))
    }

    /// Atomic release-store of a precomputed [`Srp`].
    #[inline]
    pub fn store(&self, value: Srp<T>, order: Ordering) {
        self.off.store(value.raw(), order);
    }

    /// Store, then flush+fence the word through `pool.persist`. Used for the
    /// publication-critical pointer swings (§4.1, §5) where the write must
    /// be durable before the next dependent write proceeds.
    pub fn store_persist(&self, value: Srp<T>, pool: &dyn crate::pool::MemoryPool) {
        self.off.store(value.raw(), Ordering::Release);
        let addr = &self.off as *const AtomicU64 as *const u8;
        pool.persist(addr, core::mem::size_of::<u64>());
    }

    /// Compare-and-swap on the raw offset word.
    #[inline]
    pub fn compare_and_swap(&self, current: Srp<T>, new: Srp<T>, order: Ordering) -> Result<Srp<T>, Srp<T>> {
        match self.off.compare_exchange(current.raw(), new.raw(), order, Ordering::Acquire) {
            Ok(old) => Ok(Srp::from_raw(old)),
            Err(old) => Err(Srp::from_raw(old)),
        }
    }

    /// Add `delta` bytes to the stored offset, returning the previous
    /// [`Srp`]. Lets a caller walk an array of `T` relative to the same
    /// anchor without re-deriving the target address each time.
    #[inline]
    pub fn fetch_add(&self, delta: i64, order: Ordering) -> Srp<T> {
        let old = if delta >= 0 {
            self.off.fetch_add(delta as u64, order)
        } else {
            self.off.fetch_sub((-delta) as u64, order)
        };
        Srp::from_raw(old)
    }
}

unsafe impl<T: Send> Send for AtomicSrp<T> {}
unsafe impl<T: Send> Sync for AtomicSrp<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_round_trips() {
        let p: Srp<u64> = Srp::null();
        assert!(p.is_null());
        assert_eq!(p.load(0x1000), None);
    }

    #[test]
    fn encode_load_round_trip() {
        let self_addr = 0x2000usize;
        let target_addr = 0x2080usize;
        let p = Srp::<u64>::encode(self_addr, Some(target_addr), false);
        assert!(!p.is_null());
        assert_eq!(p.load(self_addr), Some(target_addr));
    }

    #[test]
    fn tag_bit_is_independent_of_target() {
        let p = Srp::<u64>::encode(0x2000, Some(0x2080), true);
        assert!(p.tag());
        assert_eq!(p.load(0x2000), Some(0x2080));

        let untagged = p.with_tag(false);
        assert!(!untagged.tag());
        assert_eq!(untagged.load(0x2000), Some(0x2080));
    }

    /// Invariant 5: rebasing by the same shift applied to both the pointer
    /// and its target leaves the dereferenced address unchanged.
    #[test]
    fn rebase_preserves_dereferenced_address_under_uniform_shift() {
        let self_addr = 0x4000usize;
        let target_addr = 0x4100usize;
        let mut p = Srp::<u64>::encode(self_addr, Some(target_addr), false);

        let shift = 0x9000i64;
        let new_self_addr = (self_addr as i64 + shift) as usize;
        let new_target_addr = (target_addr as i64 + shift) as usize;

        p.rebase(self_addr, new_self_addr);
        assert_eq!(p.load(new_self_addr), Some(new_target_addr));
    }

    #[test]
    fn atomic_store_load_round_trip() {
        let a: AtomicSrp<u64> = AtomicSrp::null();
        let self_addr = 0x8000usize;
        let p = Srp::encode(self_addr, Some(0x8040), false);
        a.store(p, Ordering::Release);
        assert_eq!(a.load(Ordering::Acquire), p);
    }

    #[test]
    fn atomic_compare_and_swap() {
        let a: AtomicSrp<u64> = AtomicSrp::null();
        let p1 = Srp::encode(0x100, Some(0x200), false);
        let p2 = Srp::encode(0x100, Some(0x300), false);

        assert!(a.compare_and_swap(Srp::null(), p1, Ordering::AcqRel).is_ok());
        assert_eq!(
            a.compare_and_swap(Srp::null(), p2, Ordering::AcqRel),
            Err(p1)
        );
        assert!(a.compare_and_swap(p1, p2, Ordering::AcqRel).is_ok());
        assert_eq!(a.load(Ordering::Acquire), p2);
    }
}
