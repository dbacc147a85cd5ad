use genbtree::primitives::io::MemFileIo;
use genbtree::storage::btree::{NoMonitor, U64Layout, Violation, ViolationCollector};
use genbtree::{MultiRootTree, Result, TreeError, TreeOptions};
use std::sync::Arc;

fn options() -> TreeOptions {
    TreeOptions::default().page_size(256).checker_threads(2)
}

fn open(io: &MemFileIo) -> Result<MultiRootTree<U64Layout>> {
    MultiRootTree::open(Arc::new(io.clone()), options(), Arc::new(NoMonitor))
}

fn fill(tree: &MultiRootTree<U64Layout>, key: u64, entries: std::ops::Range<u64>) -> Result<()> {
    let data = tree.access(key)?;
    let mut writer = data.writer()?;
    for entry in entries {
        writer.put(&entry, &(entry + key))?;
    }
    writer.close()
}

fn entries(tree: &MultiRootTree<U64Layout>, key: u64) -> Result<Vec<(u64, u64)>> {
    tree.access(key)?.seek(&0, &u64::MAX)?.collect()
}

fn assert_consistent(tree: &MultiRootTree<U64Layout>) -> Result<()> {
    let collector = ViolationCollector::new();
    let clean = tree.consistency_check(&collector, false)?;
    assert_eq!(collector.violations(), Vec::new());
    assert!(clean);
    Ok(())
}

#[test]
fn data_trees_are_independent() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io)?;
    for key in [5, 1, 9] {
        tree.create(key)?;
    }
    fill(&tree, 1, 0..300)?;
    fill(&tree, 9, 100..150)?;

    assert_eq!(tree.root_keys()?, vec![1, 5, 9]);
    assert_eq!(entries(&tree, 1)?.len(), 300);
    assert_eq!(entries(&tree, 5)?, Vec::new());
    assert_eq!(entries(&tree, 9)?, (100..150).map(|e| (e, e + 9)).collect::<Vec<_>>());
    assert_eq!(tree.access(1)?.get(&42)?, Some(43));
    assert_eq!(tree.access(9)?.get(&42)?, None);
    assert_consistent(&tree)
}

#[test]
fn many_data_trees_split_the_root_mapping() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io)?;
    for key in (0..200u64).rev() {
        tree.create(key * 3)?;
    }
    tree.create(u64::MAX)?;
    let mut visited = Vec::new();
    tree.visit_all_roots(&mut |key| visited.push(key))?;
    let mut expected: Vec<_> = (0..200u64).map(|key| key * 3).collect();
    expected.push(u64::MAX);
    assert_eq!(visited, expected);
    assert!(tree.print_tree()?.starts_with("root mapping\n"));
    assert_consistent(&tree)
}

#[test]
fn lifecycle_errors() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io)?;
    tree.create(7)?;
    assert!(matches!(tree.create(7), Err(TreeError::DataTreeAlreadyExists(7))));
    assert!(matches!(tree.access(8).map(|_| ()), Err(TreeError::DataTreeNotFound(8))));
    assert!(matches!(tree.delete(8), Err(TreeError::DataTreeNotFound(8))));

    fill(&tree, 7, 0..10)?;
    assert!(matches!(tree.delete(7), Err(TreeError::DataTreeNotEmpty(7))));

    let data = tree.access(7)?;
    let writer = data.writer()?;
    assert!(matches!(tree.create(11), Err(TreeError::IllegalState(_))));
    drop(writer);

    let mut writer = data.writer()?;
    for entry in 0..10 {
        writer.remove(&entry)?;
    }
    writer.close()?;
    tree.delete(7)?;
    assert_eq!(tree.root_keys()?, Vec::<u64>::new());
    assert!(matches!(data.get(&1), Err(TreeError::DataTreeNotFound(7))));
    assert_consistent(&tree)
}

#[test]
fn deleted_trees_release_their_pages() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io)?;
    for round in 0..10u64 {
        tree.create(round)?;
        fill(&tree, round, 0..50)?;
        let data = tree.access(round)?;
        let mut writer = data.writer()?;
        for entry in 0..50 {
            writer.remove(&entry)?;
        }
        writer.close()?;
        tree.delete(round)?;
        tree.checkpoint()?;
    }
    let settled = tree.size_in_bytes()?;
    for round in 10..20u64 {
        tree.create(round)?;
        tree.delete(round)?;
        tree.checkpoint()?;
    }
    // Freed roots are reused; at most a free-list page may be added.
    assert!(tree.size_in_bytes()? <= settled + 2 * 256);
    assert_consistent(&tree)
}

#[test]
fn crash_discards_uncheckpointed_data_trees() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io)?;
    tree.create(1)?;
    fill(&tree, 1, 0..200)?;
    tree.checkpoint_with_header(b"one")?;

    tree.create(2)?;
    fill(&tree, 2, 0..200)?;
    fill(&tree, 1, 200..400)?;
    let crashed = io.snapshot();
    drop(tree);

    let tree = open(&crashed)?;
    assert!(tree.was_dirty_on_startup());
    assert_eq!(tree.header(), b"one");
    assert_eq!(tree.root_keys()?, vec![1]);
    assert_eq!(entries(&tree, 1)?, (0..200).map(|e| (e, e + 1)).collect::<Vec<_>>());

    let collector = ViolationCollector::new();
    assert!(!tree.consistency_check(&collector, true)?);
    assert_eq!(collector.violations(), vec![Violation::DirtyOnStartup]);

    tree.create(2)?;
    fill(&tree, 2, 0..20)?;
    tree.checkpoint()?;
    tree.close()?;

    let tree = open(&crashed)?;
    assert!(!tree.was_dirty_on_startup());
    assert_eq!(tree.root_keys()?, vec![1, 2]);
    assert_eq!(entries(&tree, 2)?.len(), 20);
    assert_consistent(&tree)
}

#[test]
fn parallel_writers_on_different_data_trees() -> Result<()> {
    let io = MemFileIo::new();
    let tree = Arc::new(open(&io)?);
    for key in 0..4 {
        tree.create(key)?;
    }
    let handles: Vec<_> = (0..4u64)
        .map(|key| {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || -> Result<()> {
                let data = tree.access(key)?;
                let mut writer = data.parallel_writer()?;
                for entry in 0..300 {
                    writer.put(&entry, &(entry + key))?;
                }
                writer.close()
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }
    for key in 0..4 {
        assert_eq!(entries(&tree, key)?.len(), 300);
    }
    assert_consistent(&tree)
}
