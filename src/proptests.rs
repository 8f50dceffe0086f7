use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::BTreeMap;

fn validate_list<P>(list: &SkipList<P>) {
    list.check_invariants();
}

/// Greatest key `<= key` in the oracle, mirroring `SkipList::search`.
fn oracle_search(m: &BTreeMap<u64, u64>, key: u64) -> Option<(u64, u64)> {
    m.range(..=key).next_back().map(|(k, v)| (*k, *v))
}

fn list_search(list: &SkipList<u64>, key: u64) -> Option<(u64, u64)> {
    let node = list.search(key);
    list.payload(node).map(|v| (list.key(node), *v))
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 4)]
    Insert(#[proptest(strategy = "0u64..256")] u64),
    #[proptest(weight = 3)]
    Remove(#[proptest(strategy = "0u64..256")] u64),
    #[proptest(weight = 3)]
    Search(#[proptest(strategy = "0u64..300")] u64),
    FirstKey,
}

/// One step of a unit being emitted. Gaps are at least 1 so offsets grow
/// strictly and no frame closes at offset 0.
#[derive(Clone, Debug, Arbitrary)]
enum Event {
    #[proptest(weight = 3)]
    Enter(
        #[proptest(strategy = "-4i64..64")] i64,
        #[proptest(strategy = "1u32..8")] u32,
    ),
    #[proptest(weight = 2)]
    Leave(#[proptest(strategy = "1u32..8")] u32),
}

#[derive(Debug)]
struct Frame {
    unique_id: i64,
    start: u32,
    end: Option<u32>,
    depth: usize,
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence_with_btreemap(
        seed in any::<u64>(),
        ops in prop::collection::vec(any::<Op>(), 0..=1000),
    ) {
        let mut list: SkipList<u64> = SkipList::with_seed(seed);
        let mut m: BTreeMap<u64, u64> = BTreeMap::new();

        for (step, op) in ops.into_iter().enumerate() {
            let value = step as u64;
            match op {
                Op::Insert(key) => {
                    // Duplicate keys are a caller bug, not a list behavior.
                    if m.contains_key(&key) {
                        continue;
                    }
                    list.insert(key, value).unwrap();
                    m.insert(key, value);
                }
                Op::Remove(key) => {
                    prop_assert_eq!(list.remove(key), m.remove(&key));
                }
                Op::Search(key) => {
                    prop_assert_eq!(list_search(&list, key), oracle_search(&m, key));
                    prop_assert_eq!(list.contains_key(key), m.contains_key(&key));
                }
                Op::FirstKey => {
                    let expected = m.keys().next().copied().unwrap_or(0);
                    prop_assert_eq!(list.firstkey(), expected);
                }
            }

            prop_assert_eq!(list.len(), m.len());
        }

        validate_list(&list);
        let got: Vec<(u64, u64)> = list.iter().map(|(k, v)| (k, *v)).collect();
        let expected: Vec<(u64, u64)> = m.into_iter().collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_removed_keys_behave_as_never_inserted(
        keys in prop::collection::btree_set(1u64..10_000, 1..200),
        pick in any::<prop::sample::Index>(),
    ) {
        let keys: Vec<u64> = keys.into_iter().collect();
        let victim = keys[pick.index(keys.len())];

        let mut with: SkipList<u64> = SkipList::new();
        let mut without: SkipList<u64> = SkipList::new();
        for &key in &keys {
            with.insert(key, key).unwrap();
            if key != victim {
                without.insert(key, key).unwrap();
            }
        }

        prop_assert_eq!(with.remove(victim), Some(victim));
        prop_assert_eq!(with.remove(victim), None);
        for at in [victim.saturating_sub(1), victim, victim + 1] {
            prop_assert_eq!(list_search(&with, at), list_search(&without, at));
        }
        validate_list(&with);
    }

    #[test]
    fn prop_traceback_matches_interval_oracle(
        events in prop::collection::vec(any::<Event>(), 0..=64),
        tail in 1u32..8,
        base in (1u64..1 << 40).prop_map(|b| b << 4),
    ) {
        let mut builder = CodemapBuilder::new();
        let mut frames: Vec<Frame> = Vec::new();
        let mut open: Vec<usize> = Vec::new();
        let mut cursor = 0u32;

        for event in events {
            match event {
                Event::Enter(unique_id, gap) => {
                    cursor += gap;
                    builder.enter_portal_frame(0, unique_id, cursor);
                    open.push(frames.len());
                    frames.push(Frame { unique_id, start: cursor, end: None, depth: open.len() });
                }
                Event::Leave(gap) => {
                    cursor += gap;
                    builder.leave_portal_frame(0, cursor);
                    if let Some(idx) = open.pop() {
                        frames[idx].end = Some(cursor);
                    }
                }
            }
        }
        let size = cursor + tail;

        let mut storage = CodemapStorage::new();
        storage.register_codemap(builder.get_final_bytecode(base, size)).unwrap();

        for offset in 0..=size {
            let mut active: Vec<&Frame> = frames
                .iter()
                .filter(|f| f.start <= offset && offset < f.end.unwrap_or(size))
                .collect();
            active.sort_by_key(|f| f.depth);
            let expected: Vec<i64> = if offset < size {
                active.iter().map(|f| f.unique_id).collect()
            } else {
                Vec::new()
            };

            let got = storage.unpack_traceback(base + u64::from(offset));
            prop_assert_eq!(&got, &expected, "offset {}", offset);
            prop_assert_eq!(storage.unpack_traceback(base + u64::from(offset)), got);
        }
        prop_assert!(storage.unpack_traceback(base - 1).is_empty());
    }
}

/// Visit every ordering of `keys`, one swap apart (Heap's algorithm).
fn for_each_order(keys: &[u64], mut f: impl FnMut(&[u64])) {
    let mut order = keys.to_vec();
    let mut counters = vec![0usize; order.len()];
    f(&order);
    let mut i = 1;
    while i < order.len() {
        if counters[i] < i {
            let j = if i % 2 == 0 { 0 } else { counters[i] };
            order.swap(j, i);
            f(&order);
            counters[i] += 1;
            i = 1;
        } else {
            counters[i] = 0;
            i += 1;
        }
    }
}

#[test]
fn exhaustive_insert_order_small_set() {
    let keys: Vec<u64> = vec![10, 20, 30, 40, 50, 60];

    let mut orders = 0;
    for_each_order(&keys, |order| {
        orders += 1;
        let mut list: SkipList<u64> = SkipList::new();
        let mut m: BTreeMap<u64, u64> = BTreeMap::new();

        for (i, &k) in order.iter().enumerate() {
            let v = i as u64;
            list.insert(k, v).unwrap();
            m.insert(k, v);
        }

        validate_list(&list);
        for at in 0..70 {
            assert_eq!(list_search(&list, at), oracle_search(&m, at), "at {at}");
        }
        assert_eq!(list.firstkey(), 10);
    });
    assert_eq!(orders, 720);
}

#[test]
fn exhaustive_remove_order_small_set() {
    let keys: Vec<u64> = vec![10, 20, 30, 40, 50, 60];

    for_each_order(&keys, |order| {
        // Fresh seed per order keeps tower shapes varied.
        let seed = order.iter().fold(0u64, |acc, k| acc * 7 + k);
        let mut list: SkipList<u64> = SkipList::with_seed(seed);
        let mut m: BTreeMap<u64, u64> = BTreeMap::new();
        for (i, k) in keys.iter().enumerate() {
            list.insert(*k, i as u64).unwrap();
            m.insert(*k, i as u64);
        }

        for &k in order {
            assert_eq!(list.remove(k), m.remove(&k));
            assert_eq!(list.len(), m.len());
            validate_list(&list);
            for at in [k - 1, k, k + 1] {
                assert_eq!(list_search(&list, at), oracle_search(&m, at));
            }
        }
        assert!(list.is_empty());
        assert_eq!(list.firstkey(), 0);
    });
}
