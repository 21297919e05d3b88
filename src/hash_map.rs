//! Concurrent hash map with lazy split-rehashing buckets (§4.3).
//!
//! Buckets are addressed by a monotonic mask `m` (always a power of two
//! minus one); bucket `h & m` owns key `k` with hash `h`. Growing the map
//! never moves every bucket eagerly — each bucket carries a `rehashed` flag
//! and is split from its parent bucket (`h & m_parent`) the first time a
//! writer touches it after growth, which keeps any single `insert`/`erase`
//! call's latency independent of table size.
//!
//! A bucket's pending insert is staged in a durable `tmp_node` slot before
//! the head pointer is swung, and cleared only after the swing is persisted
//! — the two-step publish that lets [`ConcurrentHashMap::runtime_initialize`]
//! distinguish "crashed before publish" (discard the staged node) from
//! "crashed after publish" (the swing already happened; just clear the
//! slot). Every link a bucket stores — `head`, `tmp_node`, a node's `next`
//! — is an [`AtomicSrp`], never a raw process address; nodes themselves are
//! allocated and freed through the pool/transaction contract, never `Box`.

use std::hash::{Hash, Hasher};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::PmemError;
use crate::plock::PMutex;
use crate::pool::{MemoryPool, PersistentPtr};
use crate::rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::srp::{AtomicSrp, Srp};
use crate::txn::Transaction;

const FIRST_BIG_BLOCK: usize = 27;
const INITIAL_BUCKET_COUNT: usize = 8;

/// Whether a [`ConcurrentHashMap`] allows duplicate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMapKind {
    /// `insert` of an existing key is a no-op; returns the existing entry.
    Unique,
    /// `insert` always appends a new entry for the key.
    Multi,
}

/// Matches the teacher's `SimpleHasher` precisely: an FNV-ish multiplicative
/// hash that avoids pulling in a hashing crate for what is, here, an
/// internal implementation detail rather than a public hashing contract.
#[derive(Default)]
struct SimpleHasher {
    state: u64,
}

impl Hasher for SimpleHasher {
    fn finish(&self) -> u64 {
        self.state
    }
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state = self.state.wrapping_mul(31).wrapping_add(byte as u64);
        }
    }
}

fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = SimpleHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A hash-map node: its own mutex (serializes an `erase` against a reader
/// holding an accessor into it), its link to the next node in the chain, and
/// the key/value pair. Allocated only through [`allocate_node`].
struct Node<K, V> {
    mutex: PMutex<()>,
    next: AtomicSrp<Node<K, V>>,
    key: K,
    value: V,
}

fn persistent_ptr_for(pool: &dyn MemoryPool, addr: *const u8) -> PersistentPtr {
    PersistentPtr { uuid: pool.pool_from_address(addr), offset: addr as u64 }
}

fn allocate_node<K, V>(pool: &dyn MemoryPool, key: K, value: V) -> Result<*mut Node<K, V>, PmemError> {
    let persistent = pool.allocate(mem::size_of::<Node<K, V>>(), "hash_map::Node")?;
    let raw = unsafe { pool.resolve(persistent) } as *mut Node<K, V>;
    unsafe {
        ptr::write(raw, Node { mutex: PMutex::new(()), next: AtomicSrp::null(), key, value });
    }
    Ok(raw)
}

/// Free a node without reading its value out first (used when the value is
/// not needed, e.g. cancellation, `clear`, `Drop`).
fn free_node<K, V>(pool: &dyn MemoryPool, raw: *mut Node<K, V>) -> Result<(), PmemError> {
    unsafe { ptr::drop_in_place(raw) };
    pool.free(persistent_ptr_for(pool, raw as *const u8))
}

/// Free a node after moving its value out, for callers (`erase`) that must
/// return it.
fn free_node_take_value<K, V>(pool: &dyn MemoryPool, raw: *mut Node<K, V>) -> Result<V, PmemError> {
    let value = unsafe { ptr::read(&(*raw).value) };
    unsafe { ptr::drop_in_place(&mut (*raw).key) };
    pool.free(persistent_ptr_for(pool, raw as *const u8))?;
    Ok(value)
}

fn resolve_link<K, V>(field: &AtomicSrp<Node<K, V>>, value: Srp<Node<K, V>>) -> *mut Node<K, V> {
    match value.load(field as *const _ as usize) {
        Some(addr) => addr as *mut Node<K, V>,
        None => ptr::null_mut(),
    }
}

fn encode_link<K, V>(field: &AtomicSrp<Node<K, V>>, target: *mut Node<K, V>) -> Srp<Node<K, V>> {
    if target.is_null() {
        Srp::null()
    } else {
        Srp::encode(field as *const _ as usize, Some(target as usize), false)
    }
}

struct BucketInner<K, V> {
    rehashed: bool,
    head: AtomicSrp<Node<K, V>>,
    tmp_node: AtomicSrp<Node<K, V>>,
}

impl<K, V> BucketInner<K, V> {
    fn empty() -> Self {
        Self { rehashed: true, head: AtomicSrp::null(), tmp_node: AtomicSrp::null() }
    }

    fn unrehashed() -> Self {
        Self { rehashed: false, head: AtomicSrp::null(), tmp_node: AtomicSrp::null() }
    }
}

struct Bucket<K, V> {
    inner: RwLock<BucketInner<K, V>>,
}

impl<K, V> Bucket<K, V> {
    fn new(rehashed: bool) -> Self {
        let inner = if rehashed { BucketInner::empty() } else { BucketInner::unrehashed() };
        Self { inner: RwLock::new(inner) }
    }
}

/// A read accessor into a single hash-map entry. Holds the bucket's shared
/// lock for its entire lifetime, extending the entry's validity the way a
/// node-level mutex would in the persistent-memory original.
///
/// Field order matters: `guard` borrows `bucket`'s contents under a
/// lifetime extended to `'static`, so `guard` must be dropped before
/// `bucket` — Rust drops struct fields in declaration order, so `guard` is
/// listed first.
pub struct Accessor<K, V> {
    guard: RwLockReadGuard<'static, BucketInner<K, V>>,
    bucket: Arc<Bucket<K, V>>,
    key_ptr: *const K,
    value_ptr: *const V,
}

impl<K, V> Accessor<K, V> {
    /// The entry's key.
    pub fn key(&self) -> &K {
        unsafe { &*self.key_ptr }
    }
    /// The entry's value.
    pub fn value(&self) -> &V {
        unsafe { &*self.value_ptr }
    }
}

/// A write accessor into a single hash-map entry. Holds the bucket's
/// exclusive lock for its entire lifetime. Same field-order invariant as
/// [`Accessor`].
pub struct AccessorMut<K, V> {
    guard: RwLockWriteGuard<'static, BucketInner<K, V>>,
    bucket: Arc<Bucket<K, V>>,
    key_ptr: *const K,
    value_ptr: *mut V,
}

impl<K, V> AccessorMut<K, V> {
    /// The entry's key.
    pub fn key(&self) -> &K {
        unsafe { &*self.key_ptr }
    }
    /// The entry's value.
    pub fn value(&self) -> &V {
        unsafe { &*self.value_ptr }
    }
    /// The entry's value, mutably.
    pub fn value_mut(&mut self) -> &mut V {
        unsafe { &mut *self.value_ptr }
    }
}

/// A concurrent hash map addressed by a monotonically growing, lazily
/// split-rehashed bucket table. Node storage is pool-allocated; the bucket
/// table itself (like the teacher's segment directory) is ordinary process
/// memory — only the objects it ultimately points at, and the pointers
/// themselves, carry the durability contract.
pub struct ConcurrentHashMap<'p, K, V> {
    kind: HashMapKind,
    buckets: RwLock<Vec<Arc<Bucket<K, V>>>>,
    mask: AtomicUsize,
    size: AtomicUsize,
    grow_lock: Mutex<()>,
    pool: &'p dyn MemoryPool,
}

unsafe impl<'p, K: Send, V: Send> Send for ConcurrentHashMap<'p, K, V> {}
unsafe impl<'p, K: Send + Sync, V: Send + Sync> Sync for ConcurrentHashMap<'p, K, V> {}

impl<'p, K, V> ConcurrentHashMap<'p, K, V>
where
    K: Hash + Eq + Clone,
{
    /// Construct an empty map of the given kind, backed by `pool` for every
    /// node allocation.
    pub fn new(kind: HashMapKind, pool: &'p dyn MemoryPool) -> Self {
        let buckets = (0..INITIAL_BUCKET_COUNT).map(|_| Arc::new(Bucket::new(true))).collect();
        Self {
            kind,
            buckets: RwLock::new(buckets),
            mask: AtomicUsize::new(INITIAL_BUCKET_COUNT - 1),
            size: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            pool,
        }
    }

    /// Current entry count. May momentarily lag concurrent mutation.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// True if [`Self::size`] is zero.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn bucket_index(&self, hash: u64) -> usize {
        (hash as usize) & self.mask.load(Ordering::Acquire)
    }

    fn parent_index(index: usize) -> usize {
        if index == 0 {
            return 0;
        }
        let m_parent = (1usize << (usize::BITS - 1 - (index as usize).leading_zeros())) - 1;
        index & m_parent
    }

    /// Ensure the bucket at `index` has completed split-rehashing from its
    /// parent, migrating every node whose current mask places it at `index`.
    fn ensure_rehashed(&self, buckets: &[Arc<Bucket<K, V>>], index: usize) {
        {
            let guard = buckets[index].inner.read();
            if guard.rehashed {
                return;
            }
        }
        let parent = Self::parent_index(index);
        if parent == index {
            let mut guard = buckets[index].inner.write();
            guard.rehashed = true;
            return;
        }

        // Lock in ascending index order to avoid deadlocking against a
        // concurrent split-rehash of the same pair in the opposite order.
        let (low, high) = if parent < index { (parent, index) } else { (index, parent) };
        let mask = self.mask.load(Ordering::Acquire);
        let pool = self.pool;
        if low == parent {
            let mut parent_guard = buckets[low].inner.write();
            let mut target_guard = buckets[high].inner.write();
            if target_guard.rehashed {
                return;
            }
            Self::migrate(pool, &mut parent_guard, &mut target_guard, index, mask);
            target_guard.rehashed = true;
            log::trace!("hash_map: split-rehashed bucket {index} from parent {parent}");
        } else {
            let mut target_guard = buckets[low].inner.write();
            let mut parent_guard = buckets[high].inner.write();
            if target_guard.rehashed {
                return;
            }
            Self::migrate(pool, &mut parent_guard, &mut target_guard, index, mask);
            target_guard.rehashed = true;
            log::trace!("hash_map: split-rehashed bucket {index} from parent {parent}");
        }
    }

    fn migrate(pool: &dyn MemoryPool, parent: &mut BucketInner<K, V>, target: &mut BucketInner<K, V>, index: usize, mask: usize) {
        let mut remaining: *mut Node<K, V> = ptr::null_mut();
        let mut cursor = resolve_link(&parent.head, parent.head.load(Ordering::Acquire));
        while !cursor.is_null() {
            let next = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
            if (hash_key(unsafe { &(*cursor).key }) as usize) & mask == index {
                let old_target_head = resolve_link(&target.head, target.head.load(Ordering::Acquire));
                unsafe { (*cursor).next.store(encode_link(&(*cursor).next, old_target_head), Ordering::Release) };
                target.head.store(encode_link(&target.head, cursor), Ordering::Release);
            } else {
                unsafe { (*cursor).next.store(encode_link(&(*cursor).next, remaining), Ordering::Release) };
                remaining = cursor;
            }
            cursor = next;
        }
        parent.head.store(encode_link(&parent.head, remaining), Ordering::Release);
        pool.persist(&target.head as *const _ as *const u8, mem::size_of::<u64>());
        pool.persist(&parent.head as *const _ as *const u8, mem::size_of::<u64>());
    }

    /// Find an entry, returning a shared accessor if present.
    pub fn find(&self, key: &K) -> Option<Accessor<K, V>> {
        let hash = hash_key(key);
        let buckets_guard = self.buckets.read();
        let index = self.bucket_index(hash);
        self.ensure_rehashed(&buckets_guard, index);
        let bucket = Arc::clone(&buckets_guard[index]);
        drop(buckets_guard);

        // SAFETY: the `Bucket` behind `bucket` is heap-allocated by `Arc`
        // and does not move when `bucket` is moved into the `Accessor`
        // below; `Accessor` declares `guard` before `bucket` so the borrow
        // is dropped before the allocation it points into can be freed.
        let guard: RwLockReadGuard<'static, BucketInner<K, V>> =
            unsafe { std::mem::transmute(bucket.inner.read()) };
        let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
        while !cursor.is_null() {
            if unsafe { &(*cursor).key } == key {
                let key_ptr: *const K = unsafe { &(*cursor).key };
                let value_ptr: *const V = unsafe { &(*cursor).value };
                return Some(Accessor { guard, bucket, key_ptr, value_ptr });
            }
            cursor = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
        }
        None
    }

    /// Find an entry, returning an exclusive accessor if present.
    pub fn find_mut(&self, key: &K) -> Option<AccessorMut<K, V>> {
        let hash = hash_key(key);
        let buckets_guard = self.buckets.read();
        let index = self.bucket_index(hash);
        self.ensure_rehashed(&buckets_guard, index);
        let bucket = Arc::clone(&buckets_guard[index]);
        drop(buckets_guard);

        // SAFETY: see `find`; the same field-order invariant applies to
        // `AccessorMut`.
        let guard: RwLockWriteGuard<'static, BucketInner<K, V>> =
            unsafe { std::mem::transmute(bucket.inner.write()) };
        let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
        while !cursor.is_null() {
            if unsafe { &(*cursor).key } == key {
                let key_ptr: *const K = unsafe { &(*cursor).key };
                let value_ptr: *mut V = unsafe { &mut (*cursor).value };
                return Some(AccessorMut { guard, bucket, key_ptr, value_ptr });
            }
            cursor = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
        }
        None
    }

    /// Number of live entries equal to `key` (0 or 1 in [`HashMapKind::Unique`]).
    pub fn count(&self, key: &K) -> usize {
        let buckets_guard = self.buckets.read();
        let index = self.bucket_index(hash_key(key));
        self.ensure_rehashed(&buckets_guard, index);
        let guard = buckets_guard[index].inner.read();
        let mut n = 0;
        let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
        while !cursor.is_null() {
            if unsafe { &(*cursor).key } == key {
                n += 1;
            }
            cursor = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
        }
        n
    }

    /// Insert `key`/`value`. In [`HashMapKind::Unique`] mode, an existing
    /// key is left untouched and `false` is returned; in
    /// [`HashMapKind::Multi`] mode a new entry is always appended and `true`
    /// is returned.
    pub fn insert(&self, key: K, value: V) -> bool {
        let buckets_guard = self.buckets.read();
        let hash = hash_key(&key);
        let index = self.bucket_index(hash);
        self.ensure_rehashed(&buckets_guard, index);
        let bucket = Arc::clone(&buckets_guard[index]);
        drop(buckets_guard);

        let pool = self.pool;
        let guard = bucket.inner.write();
        if self.kind == HashMapKind::Unique {
            let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
            while !cursor.is_null() {
                if unsafe { &(*cursor).key } == &key {
                    return false;
                }
                cursor = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
            }
        }

        let old_head = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
        Transaction::run(pool, |_tx| {
            let node = allocate_node(pool, key, value)?;
            unsafe { (*node).next.store_persist(encode_link(&(*node).next, old_head), pool) };
            // Stage, persist, swing, persist, clear: the publish a crash
            // between any two of these steps must leave recoverable.
            guard.tmp_node.store_persist(encode_link(&guard.tmp_node, node), pool);
            guard.head.store_persist(encode_link(&guard.head, node), pool);
            guard.tmp_node.store_persist(Srp::null(), pool);
            Ok::<(), PmemError>(())
        })
        .expect("hash_map: transactional insert failed");
        drop(guard);

        self.size.fetch_add(1, Ordering::Relaxed);
        self.maybe_grow();
        true
    }

    /// Insert, overwriting the value if the key is already present (only
    /// meaningful in [`HashMapKind::Unique`] mode). Spec names no dedicated
    /// crash-recovery staging for this operation (unlike `insert`'s
    /// `tmp_node` protocol), so its publish is a single durable head swing.
    pub fn insert_or_assign(&self, key: K, value: V) {
        let buckets_guard = self.buckets.read();
        let index = self.bucket_index(hash_key(&key));
        self.ensure_rehashed(&buckets_guard, index);
        let bucket = Arc::clone(&buckets_guard[index]);
        drop(buckets_guard);

        let pool = self.pool;
        let guard = bucket.inner.write();
        let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
        while !cursor.is_null() {
            if unsafe { &(*cursor).key } == &key {
                unsafe { (*cursor).value = value };
                return;
            }
            cursor = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
        }

        let old_head = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
        Transaction::run(pool, |_tx| {
            let node = allocate_node(pool, key, value)?;
            unsafe { (*node).next.store_persist(encode_link(&(*node).next, old_head), pool) };
            guard.head.store_persist(encode_link(&guard.head, node), pool);
            Ok::<(), PmemError>(())
        })
        .expect("hash_map: transactional insert_or_assign failed");
        drop(guard);
        self.size.fetch_add(1, Ordering::Relaxed);
        self.maybe_grow();
    }

    /// Remove the first entry equal to `key`, returning its value if found.
    pub fn erase(&self, key: &K) -> Option<V> {
        let buckets_guard = self.buckets.read();
        let index = self.bucket_index(hash_key(key));
        self.ensure_rehashed(&buckets_guard, index);
        let bucket = Arc::clone(&buckets_guard[index]);
        drop(buckets_guard);

        let pool = self.pool;
        let guard = bucket.inner.write();

        // Walk with the address of the link that targets the candidate, so
        // a match can be spliced out by rewriting exactly that one field.
        let mut prev: *const AtomicSrp<Node<K, V>> = &guard.head;
        let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
        loop {
            if cursor.is_null() {
                return None;
            }
            if unsafe { &(*cursor).key } == key {
                break;
            }
            prev = unsafe { &(*cursor).next };
            cursor = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
        }

        // The node's own mutex serializes this unlink against a reader
        // already holding an `Accessor` into it.
        let node_guard = unsafe { (*cursor).mutex.lock() };
        let next = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
        let prev_ref = unsafe { &*prev };

        let value = Transaction::run(pool, |_tx| {
            prev_ref.store_persist(encode_link(prev_ref, next), pool);
            free_node_take_value(pool, cursor)
        })
        .expect("hash_map: transactional erase failed");

        drop(node_guard);
        drop(guard);
        self.size.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let buckets_guard = self.buckets.read();
        let pool = self.pool;
        Transaction::run(pool, |_tx| {
            for bucket in buckets_guard.iter() {
                let guard = bucket.inner.write();
                let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
                while !cursor.is_null() {
                    let next = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
                    free_node(pool, cursor)?;
                    cursor = next;
                }
                guard.head.store_persist(Srp::null(), pool);
                let tmp = resolve_link(&guard.tmp_node, guard.tmp_node.load(Ordering::Acquire));
                if !tmp.is_null() {
                    free_node(pool, tmp)?;
                    guard.tmp_node.store_persist(Srp::null(), pool);
                }
            }
            Ok::<(), PmemError>(())
        })
        .expect("hash_map: transactional clear failed");
        drop(buckets_guard);
        self.size.store(0, Ordering::Relaxed);
    }

    /// Force split-rehashing of every bucket, leaving none deferred.
    pub fn rehash(&self) {
        let buckets_guard = self.buckets.read();
        for index in 0..buckets_guard.len() {
            self.ensure_rehashed(&buckets_guard, index);
        }
    }

    /// Eagerly grow the bucket table until it has at least `n` buckets.
    pub fn reserve(&self, n: usize) {
        while self.buckets.read().len() < n {
            self.grow();
        }
    }

    fn maybe_grow(&self) {
        let mask = self.mask.load(Ordering::Relaxed);
        if self.size.load(Ordering::Relaxed) >= mask + 1 {
            self.grow();
        }
    }

    fn grow(&self) {
        let _serialize = self.grow_lock.lock().unwrap();
        let mut guard = self.buckets.write();
        let old_len = guard.len();
        if old_len == 0 {
            return;
        }
        // Segments at or beyond FIRST_BIG_BLOCK double in one step the
        // source way; below that, growth is simple doubling too, since the
        // segment-sizing distinction only matters for how the *storage* of
        // each segment is carved up, which this Vec-backed table elides.
        let _ = FIRST_BIG_BLOCK;
        let new_len = old_len * 2;
        guard.reserve(new_len - old_len);
        for _ in old_len..new_len {
            guard.push(Arc::new(Bucket::new(false)));
        }
        self.mask.store(new_len - 1, Ordering::Release);
        log::trace!("hash_map: grew bucket table {old_len} -> {new_len}");
    }

    /// Walk every bucket under its exclusive lock, skipping any bucket a
    /// live accessor already holds. No node relocation happens — pool node
    /// addresses must stay stable for any durable pointer referencing them
    /// — so this only validates/touches reachability rather than compacting
    /// storage.
    pub fn defragment(&self) {
        let buckets_guard = self.buckets.read();
        for bucket in buckets_guard.iter() {
            if let Some(guard) = bucket.inner.try_write() {
                let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
                while !cursor.is_null() {
                    cursor = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
                }
            }
        }
    }

    /// Stage `key`/`value` into a bucket's `tmp_node` slot without
    /// publishing it (never swinging `head`), as if a crash interrupted
    /// [`Self::insert`] right after staging. Exists only so integration
    /// tests can exercise [`Self::runtime_initialize`]'s discard path from
    /// outside this crate.
    #[cfg(feature = "testing")]
    pub fn inject_unpublished_tmp_node(&self, key: K, value: V) {
        let hash = hash_key(&key);
        let buckets_guard = self.buckets.read();
        let index = self.bucket_index(hash);
        self.ensure_rehashed(&buckets_guard, index);
        let bucket = Arc::clone(&buckets_guard[index]);
        drop(buckets_guard);
        let pool = self.pool;
        let guard = bucket.inner.write();
        Transaction::run(pool, |_tx| {
            let node = allocate_node(pool, key, value)?;
            guard.tmp_node.store_persist(encode_link(&guard.tmp_node, node), pool);
            Ok::<(), PmemError>(())
        })
        .expect("hash_map: inject_unpublished_tmp_node allocation failed");
    }

    /// Stage, link, and swing `key`/`value` into a bucket's head but leave
    /// `tmp_node` set, as if a crash interrupted [`Self::insert`] between
    /// the head swing and the final clear. Exists only so integration tests
    /// can exercise [`Self::runtime_initialize`]'s completion path from
    /// outside this crate.
    #[cfg(feature = "testing")]
    pub fn inject_published_tmp_node(&self, key: K, value: V) {
        let hash = hash_key(&key);
        let buckets_guard = self.buckets.read();
        let index = self.bucket_index(hash);
        self.ensure_rehashed(&buckets_guard, index);
        let bucket = Arc::clone(&buckets_guard[index]);
        drop(buckets_guard);
        let pool = self.pool;
        let guard = bucket.inner.write();
        let old_head = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
        Transaction::run(pool, |_tx| {
            let node = allocate_node(pool, key, value)?;
            unsafe { (*node).next.store_persist(encode_link(&(*node).next, old_head), pool) };
            guard.tmp_node.store_persist(encode_link(&guard.tmp_node, node), pool);
            guard.head.store_persist(encode_link(&guard.head, node), pool);
            Ok::<(), PmemError>(())
        })
        .expect("hash_map: inject_published_tmp_node allocation failed");
    }

    /// Recompute `size` by walking every bucket; also forces any deferred
    /// split-rehash. Callers run this once at process start, before
    /// concurrent traffic resumes, to recover from a crash mid-rehash or
    /// mid-publish.
    pub fn runtime_initialize(&self) {
        let buckets_guard = self.buckets.read();
        let pool = self.pool;
        let mut total = 0usize;
        for index in 0..buckets_guard.len() {
            self.ensure_rehashed(&buckets_guard, index);
            let guard = buckets_guard[index].inner.write();
            let tmp = resolve_link(&guard.tmp_node, guard.tmp_node.load(Ordering::Acquire));
            if !tmp.is_null() {
                let head = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
                if tmp == head {
                    // The head swing already happened before the crash;
                    // only the clear was missed.
                    guard.tmp_node.store_persist(Srp::null(), pool);
                    log::debug!("hash_map: completed a crash-after-publish insert in bucket {index}");
                } else {
                    // Never linked: the earlier crash happened before
                    // publication.
                    Transaction::run(pool, |_tx| free_node(pool, tmp))
                        .expect("hash_map: transactional tmp_node discard failed");
                    guard.tmp_node.store_persist(Srp::null(), pool);
                    log::debug!("hash_map: discarding unpublished tmp_node in bucket {index} during recovery");
                }
            }
            let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Acquire));
            while !cursor.is_null() {
                total += 1;
                cursor = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Acquire) });
            }
        }
        self.size.store(total, Ordering::Relaxed);
        log::debug!("hash_map: runtime_initialize recomputed size to {total}");
    }
}

impl<'p, K, V> Drop for ConcurrentHashMap<'p, K, V> {
    fn drop(&mut self) {
        let pool = self.pool;
        let buckets_guard = self.buckets.write();
        let _ = Transaction::run(pool, |_tx| {
            for bucket in buckets_guard.iter() {
                let guard = bucket.inner.write();
                let mut cursor = resolve_link(&guard.head, guard.head.load(Ordering::Relaxed));
                while !cursor.is_null() {
                    let next = resolve_link(unsafe { &(*cursor).next }, unsafe { (*cursor).next.load(Ordering::Relaxed) });
                    free_node(pool, cursor)?;
                    cursor = next;
                }
                let tmp = resolve_link(&guard.tmp_node, guard.tmp_node.load(Ordering::Relaxed));
                if !tmp.is_null() {
                    free_node(pool, tmp)?;
                }
            }
            Ok::<(), PmemError>(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::VolatilePool;

    #[test]
    fn insert_and_find_roundtrip() {
        let pool = VolatilePool::new();
        let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
        for k in 0..100u64 {
            map.insert(k, k * 10);
        }
        assert_eq!(map.size(), 100);
        for k in 0..100u64 {
            let a = map.find(&k).unwrap();
            assert_eq!(*a.value(), k * 10);
        }
    }

    #[test]
    fn unique_mode_rejects_duplicate_insert() {
        let pool = VolatilePool::new();
        let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
        assert!(map.insert(1, 1));
        assert!(!map.insert(1, 2));
        assert_eq!(map.find(&1).unwrap().value(), &1);
        assert_eq!(map.count(&1), 1);
    }

    #[test]
    fn multi_mode_appends_duplicates() {
        let pool = VolatilePool::new();
        let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Multi, &pool);
        assert!(map.insert(1, 1));
        assert!(map.insert(1, 2));
        assert_eq!(map.count(&1), 2);
    }

    #[test]
    fn erase_removes_the_entry() {
        let pool = VolatilePool::new();
        let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
        map.insert(5, 50);
        assert_eq!(map.erase(&5), Some(50));
        assert!(map.find(&5).is_none());
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn growth_preserves_all_entries() {
        let pool = VolatilePool::new();
        let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
        for k in 0..500u64 {
            map.insert(k, k);
        }
        for k in 0..500u64 {
            assert_eq!(map.find(&k).unwrap().value(), &k, "key {k} missing after growth");
        }
    }

    #[test]
    fn runtime_initialize_recomputes_size_and_clears_tmp_node() {
        let pool = VolatilePool::new();
        let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
        for k in 0..20u64 {
            map.insert(k, k);
        }
        map.runtime_initialize();
        assert_eq!(map.size(), 20);
    }

    #[cfg(feature = "testing")]
    #[test]
    fn runtime_initialize_discards_a_crash_before_publish() {
        let pool = VolatilePool::new();
        let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
        for k in 0..20u64 {
            map.insert(k, k);
        }
        map.inject_unpublished_tmp_node(999, 999);
        map.runtime_initialize();
        assert_eq!(map.size(), 20);
        assert!(map.find(&999).is_none(), "an unpublished staged node must not survive recovery");
    }

    #[cfg(feature = "testing")]
    #[test]
    fn runtime_initialize_completes_a_crash_after_publish() {
        let pool = VolatilePool::new();
        let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
        for k in 0..20u64 {
            map.insert(k, k);
        }
        map.inject_published_tmp_node(999, 999);
        map.runtime_initialize();
        assert_eq!(map.size(), 21);
        assert_eq!(map.find(&999).unwrap().value(), &999);
    }

    #[test]
    fn eight_threads_striping_keys_find_their_own_inserts() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let pool = VolatilePool::new();
        let map = StdArc::new(ConcurrentHashMap::<'_, u64, u64>::new(HashMapKind::Unique, &pool));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let map = StdArc::clone(&map);
            handles.push(thread::spawn(move || {
                let mut k = t;
                while k < 100 {
                    map.insert(k, k);
                    k += 8;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.size(), 100);
        for k in 0..100u64 {
            assert_eq!(map.find(&k).unwrap().value(), &k);
        }
    }
}
