//! Randomized property tests: containers checked against reference
//! `std` collections, and self-relative pointers checked under arbitrary
//! rebase sequences.

use std::collections::{BTreeMap, HashMap as StdHashMap};

use proptest::prelude::*;

use pmemkit::srp::Srp;
use pmemkit::{ConcurrentHashMap, ConcurrentSkipListMap, HashMapKind, MapKind, VolatilePool};

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, i32),
    Erase(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u16>(), any::<i32>()).prop_map(|(k, v)| Op::Insert(k, v)),
        any::<u16>().prop_map(Op::Erase),
    ]
}

proptest! {
    /// A `ConcurrentHashMap` in `Unique` mode tracks exactly the same
    /// key -> value mapping as a `StdHashMap` driven by the same op
    /// sequence (invariant 1: a unique-mode map's entries match its
    /// insert/erase history one-to-one).
    #[test]
    fn hash_map_matches_reference_under_random_ops(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let pool = VolatilePool::new();
        let map: ConcurrentHashMap<'_, u16, i32> = ConcurrentHashMap::new(HashMapKind::Unique, &pool);
        let mut reference: StdHashMap<u16, i32> = StdHashMap::new();

        for op in &ops {
            match *op {
                Op::Insert(k, v) => {
                    if reference.contains_key(&k) {
                        prop_assert!(!map.insert(k, v));
                    } else {
                        prop_assert!(map.insert(k, v));
                        reference.insert(k, v);
                    }
                }
                Op::Erase(k) => {
                    let expected = reference.remove(&k);
                    prop_assert_eq!(map.erase(&k), expected);
                }
            }
        }

        prop_assert_eq!(map.size(), reference.len());
        for (k, v) in &reference {
            prop_assert_eq!(map.find(k).as_ref().map(|a| *a.value()), Some(*v));
        }
    }

    /// A `ConcurrentSkipListMap` in `Unique` mode iterates in the same
    /// ascending key order as a `BTreeMap` built from the same surviving
    /// entries (invariant 4: `size() == distance(begin(), end())`, plus
    /// ordering).
    #[test]
    fn skip_list_matches_reference_order_under_random_ops(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let pool = VolatilePool::new();
        let map: ConcurrentSkipListMap<'_, u16, i32> = ConcurrentSkipListMap::new(MapKind::Unique, &pool);
        let mut reference: BTreeMap<u16, i32> = BTreeMap::new();

        for op in &ops {
            match *op {
                Op::Insert(k, v) => {
                    if reference.contains_key(&k) {
                        prop_assert!(!map.insert(k, v));
                    } else {
                        prop_assert!(map.insert(k, v));
                        reference.insert(k, v);
                    }
                }
                Op::Erase(k) => {
                    let expected = reference.remove(&k);
                    prop_assert_eq!(map.erase(&k), expected);
                }
            }
        }

        prop_assert_eq!(map.size(), reference.len());
        let got: Vec<(u16, i32)> = map.iter_forward().collect();
        let expected: Vec<(u16, i32)> = reference.into_iter().collect();
        prop_assert_eq!(got, expected);
    }

    /// Rebasing an `Srp` by an arbitrary shift applied uniformly to both
    /// its storage address and its target preserves the dereferenced
    /// address (invariant 5), for any combination of addresses and shift
    /// that doesn't overflow the tag-bit alignment requirement.
    #[test]
    fn srp_rebase_is_shift_invariant(
        self_addr in 0u64..(1u64 << 40),
        target_delta in 0u64..(1u64 << 20),
        shift in -(1i64 << 30)..(1i64 << 30),
    ) {
        let self_addr = (self_addr & !1) as usize;
        let target_addr = self_addr.wrapping_add((target_delta & !1) as usize);

        let mut p = Srp::<u64>::encode(self_addr, Some(target_addr), false);
        let new_self_addr = (self_addr as i64).wrapping_add(shift) as usize;
        let new_target_addr = (target_addr as i64).wrapping_add(shift) as usize;

        p.rebase(self_addr, new_self_addr);
        prop_assert_eq!(p.load(new_self_addr), Some(new_target_addr));
    }
}
