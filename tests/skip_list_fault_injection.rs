//! Fault injection over the skip-list insert journal: simulate a restart
//! at an arbitrary point during `insert` (node linked at level 0 only,
//! journal entry still `InProgress`) and check that `runtime_initialize`
//! always restores invariant 4 (`size() == distance(begin(), end())`)
//! regardless of which key, height, or surrounding keys were in flight.

#![cfg(feature = "testing")]

use proptest::prelude::*;

use pmemkit::{ConcurrentSkipListMap, MapKind, VolatilePool};

proptest! {
    #[test]
    fn recovery_from_an_arbitrary_in_flight_insert_restores_the_size_invariant(
        base_keys in prop::collection::btree_set(0i64..500, 0..40),
        crashed_key in 0i64..500,
        height in 1usize..32,
    ) {
        let pool = VolatilePool::new();
        let map: ConcurrentSkipListMap<'_, i64, i64> = ConcurrentSkipListMap::new(MapKind::Unique, &pool);
        for &k in &base_keys {
            map.insert(k, k);
        }
        prop_assume!(!base_keys.contains(&crashed_key));

        map.inject_in_progress_insert(crashed_key, crashed_key, height);
        map.runtime_initialize();

        let iterated = map.iter_forward().count();
        prop_assert_eq!(map.size(), iterated, "size() must match distance(begin(), end()) after recovery");

        let mut expected: Vec<i64> = base_keys.into_iter().collect();
        expected.push(crashed_key);
        expected.sort_unstable();
        let got: Vec<i64> = map.iter_forward().map(|(k, _)| k).collect();
        prop_assert_eq!(got, expected);
    }
}
