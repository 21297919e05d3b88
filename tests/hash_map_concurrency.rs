//! Concurrent hash-map scenarios: multi-threaded insert/find, and
//! insert/erase churn followed by simulated-crash recovery.

use std::sync::Arc;
use std::thread;

use pmemkit::{ConcurrentHashMap, HashMapKind, VolatilePool};

#[test]
fn eight_threads_insert_and_find_disjoint_keys() {
    let pool = VolatilePool::new();
    let map = Arc::new(ConcurrentHashMap::<u64, u64>::new(HashMapKind::Unique, &pool));
    let mut handles = Vec::new();
    for t in 0..8u64 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let mut k = t;
            while k < 100 {
                assert!(map.insert(k, k * 2));
                k += 8;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(map.size(), 100);
    for k in 0..100u64 {
        let a = map.find(&k).expect("every inserted key must be findable");
        assert_eq!(*a.value(), k * 2);
    }
}

#[test]
fn churn_then_recovery_preserves_the_final_surviving_set() {
    let pool = VolatilePool::new();
    let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
    for k in 0..200u64 {
        map.insert(k, k);
    }
    // Churn: erase every third key, reinsert every fifth.
    for k in (0..200u64).step_by(3) {
        map.erase(&k);
    }
    for k in (0..200u64).step_by(5) {
        map.insert_or_assign(k, k + 1000);
    }

    let mut expected: Vec<u64> = (0..200u64).filter(|k| k % 3 != 0).collect();
    expected.sort_unstable();

    map.runtime_initialize();

    assert_eq!(map.size(), expected.len());
    for k in expected {
        let a = map.find(&k).unwrap_or_else(|| panic!("key {k} should have survived churn"));
        if k % 5 == 0 {
            assert_eq!(*a.value(), k + 1000);
        } else {
            assert_eq!(*a.value(), k);
        }
    }
}

#[cfg(feature = "testing")]
#[test]
fn runtime_initialize_discards_a_crash_before_publish() {
    let pool = VolatilePool::new();
    let map: ConcurrentHashMap<'_, u64, u64> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
    for k in 0..20u64 {
        map.insert(k, k);
    }
    // Emulate a crash between staging and publishing: a tmp_node with no
    // corresponding head swing.
    map.inject_unpublished_tmp_node(999, 999);

    map.runtime_initialize();

    assert_eq!(map.size(), 20);
    assert!(map.find(&999).is_none(), "an unpublished staged node must not survive recovery");
}
