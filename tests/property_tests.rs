use genbtree::primitives::io::MemFileIo;
use genbtree::storage::btree::{BytesLayout, NoMonitor, U64Layout, ViolationCollector};
use genbtree::{Tree, TreeOptions};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Operation {
    Put { key: u64, value: u64 },
    Remove { key: u64 },
    Checkpoint,
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        6 => (0u64..400, any::<u64>()).prop_map(|(key, value)| Operation::Put { key, value }),
        3 => (0u64..400).prop_map(|key| Operation::Remove { key }),
        1 => Just(Operation::Checkpoint),
    ]
}

fn small_tree<L: genbtree::storage::btree::Layout>(page_size: usize) -> Tree<L> {
    let options = TreeOptions::default().page_size(page_size).checker_threads(1);
    Tree::open(Arc::new(MemFileIo::new()), options, Arc::new(NoMonitor)).unwrap()
}

fn assert_consistent<L: genbtree::storage::btree::Layout>(tree: &Tree<L>) {
    let collector = ViolationCollector::new();
    let clean = tree.consistency_check(&collector, false).unwrap();
    assert!(clean, "{:?}", collector.violations());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_matches_btreemap(
        ops in prop::collection::vec(arb_operation(), 1..600),
        ratio in 0.1f64..=1.0,
    ) {
        let tree: Tree<U64Layout> = small_tree(256);
        let mut model = BTreeMap::new();
        for op in ops {
            match op {
                Operation::Put { key, value } => {
                    let mut writer = tree.writer_with_ratio(ratio).unwrap();
                    writer.put(&key, &value).unwrap();
                    writer.close().unwrap();
                    model.insert(key, value);
                }
                Operation::Remove { key } => {
                    let mut writer = tree.writer_with_ratio(ratio).unwrap();
                    prop_assert_eq!(writer.remove(&key).unwrap(), model.remove(&key));
                    writer.close().unwrap();
                }
                Operation::Checkpoint => tree.checkpoint().unwrap(),
            }
        }
        let all: Vec<_> = tree.seek(&0, &u64::MAX).unwrap().collect::<Result<_, _>>().unwrap();
        let expected: Vec<_> = model.iter().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(all, expected);
        assert_consistent(&tree);
    }

    #[test]
    fn prop_range_seek_agrees_with_model(
        keys in prop::collection::btree_set(0u64..10_000, 0..500),
        from in 0u64..10_000,
        to in 0u64..10_000,
    ) {
        let tree: Tree<U64Layout> = small_tree(256);
        let mut writer = tree.writer().unwrap();
        for key in &keys {
            writer.put(key, &(key + 1)).unwrap();
        }
        writer.close().unwrap();

        let got: Vec<u64> = tree
            .seek(&from, &to)
            .unwrap()
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<Result<_, _>>()
            .unwrap();
        let expected: Vec<u64> = if from < to {
            keys.range(from..to).copied().collect()
        } else if from > to {
            keys.range(to + 1..=from).rev().copied().collect()
        } else {
            keys.get(&from).copied().into_iter().collect()
        };
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_removing_everything_collapses_to_one_leaf(
        keys in prop::collection::btree_set(any::<u64>(), 1..800),
    ) {
        let tree: Tree<U64Layout> = small_tree(256);
        let mut writer = tree.writer().unwrap();
        for key in &keys {
            writer.put(key, key).unwrap();
        }
        for key in keys.iter().rev() {
            prop_assert_eq!(writer.remove(key).unwrap(), Some(*key));
        }
        writer.close().unwrap();

        prop_assert_eq!(tree.seek(&0, &u64::MAX).unwrap().count(), 0);
        prop_assert_eq!(tree.get(&u64::MAX).unwrap(), None);
        let dump = tree.print_tree().unwrap();
        prop_assert!(!dump.contains("level 1:"), "{}", dump);
        assert_consistent(&tree);
    }

    #[test]
    fn prop_variable_entries_round_trip(
        entries in prop::collection::btree_map(
            prop::collection::vec(any::<u8>(), 1..24),
            prop::collection::vec(any::<u8>(), 0..450),
            1..120,
        ),
    ) {
        let tree: Tree<BytesLayout> = small_tree(512);
        let mut writer = tree.writer().unwrap();
        for (key, value) in &entries {
            writer.put(key, value).unwrap();
        }
        writer.close().unwrap();
        for (key, value) in &entries {
            let got = tree.get(key).unwrap();
            prop_assert_eq!(got.as_ref(), Some(value));
        }
        let keys: Vec<Vec<u8>> = tree
            .seek(&Vec::new(), &vec![0xFF; 32])
            .unwrap()
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<Result<_, _>>()
            .unwrap();
        prop_assert_eq!(keys, entries.keys().cloned().collect::<Vec<_>>());
        assert_consistent(&tree);
    }
}
