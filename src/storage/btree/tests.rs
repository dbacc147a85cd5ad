use super::checker::{Violation, ViolationCollector, MIN_TREE_NODE_ID};
use super::cleaner::{CleanupState, CrashCleaner, InlineExecutor, ThreadedExecutor};
use super::freelist::IdProvider;
use super::gspp::{self, GSP_SIZE};
use super::layout::{node_format, BytesLayout, Layout, U64Layout};
use super::merger::{Combine, KeepExisting, RemoveOnMatch};
use super::monitor::{CleanupStats, Monitor, NoMonitor};
use super::node::{
    child_at, header_pointer, is_tree_node, key_count, node_kind, set_header_pointer,
    set_key_count, HeaderPointer, Layer, NodeKind, PAGE_TYPE_FREELIST, PAGE_TYPE_OFFLOAD,
    PAGE_TYPE_OFFSET,
};
use super::tree::{overwrite_header, read_header, CleanupMode, Tree, TreeOptions};
use crate::primitives::io::{FileIo, MemFileIo};
use crate::primitives::pager::{PagedFile, PfMode};
use crate::types::{Generation, PageId, Result, TreeError};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SMALL_PAGE: usize = 256;

fn options() -> TreeOptions {
    TreeOptions::default()
        .page_size(SMALL_PAGE)
        .checker_threads(2)
}

fn open(io: &MemFileIo, options: TreeOptions) -> Result<Tree<U64Layout>> {
    Tree::open(Arc::new(io.clone()), options, Arc::new(NoMonitor))
}

fn fill(tree: &Tree<U64Layout>, keys: impl IntoIterator<Item = u64>) -> Result<()> {
    let mut writer = tree.writer()?;
    for key in keys {
        writer.put(&key, &(key * 10))?;
    }
    writer.close()
}

fn contents(tree: &Tree<U64Layout>) -> Result<Vec<(u64, u64)>> {
    tree.seek(&0, &u64::MAX)?.collect()
}

fn assert_consistent(tree: &Tree<U64Layout>) -> Result<()> {
    let collector = ViolationCollector::new();
    let clean = tree.consistency_check(&collector, false)?;
    assert_eq!(collector.violations(), Vec::new());
    assert!(clean);
    Ok(())
}

/// Checkpoints `committed`, then writes `lost` and flushes it without a
/// checkpoint. Returns the bytes that reached the file at that point.
fn crashed_file(committed: std::ops::Range<u64>, lost: std::ops::Range<u64>) -> Result<MemFileIo> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, committed.clone())?;
    tree.checkpoint()?;
    {
        let mut writer = tree.writer()?;
        for key in lost {
            writer.put(&key, &key)?;
        }
        for key in committed.step_by(7) {
            writer.remove(&key)?;
        }
        writer.close()?;
    }
    tree.core().file.flush()?;
    let crashed = io.snapshot();
    tree.close()?;
    Ok(crashed)
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<&'static str>>,
    stats: Mutex<Option<CleanupStats>>,
    fail_cleanup: AtomicBool,
}

impl Recorder {
    fn failing() -> Self {
        let recorder = Self::default();
        recorder.fail_cleanup.store(true, Ordering::SeqCst);
        recorder
    }

    fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

impl Monitor for Recorder {
    fn checkpoint_completed(&self) {
        self.events.lock().push("checkpoint");
    }

    fn cleanup_registered(&self) {
        self.events.lock().push("registered");
    }

    fn cleanup_started(&self) {
        self.events.lock().push("started");
    }

    fn cleanup_finished(&self, stats: &CleanupStats) -> Result<()> {
        *self.stats.lock() = Some(*stats);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(TreeError::IllegalState("injected cleanup failure"));
        }
        self.events.lock().push("finished");
        Ok(())
    }

    fn cleanup_closed(&self) {
        self.events.lock().push("closed");
    }

    fn cleanup_failed(&self, _error: &TreeError) {
        self.events.lock().push("failed");
    }
}

#[test]
fn empty_tree_has_no_entries() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    assert_eq!(contents(&tree)?, Vec::new());
    assert_eq!(tree.get(&5)?, None);
    assert!(!tree.was_dirty_on_startup());
    assert_consistent(&tree)
}

#[test]
fn sequential_inserts_split_into_multi_level_tree() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 0..1000)?;

    let stats = tree.stats();
    assert!(stats.leaf_splits > 0, "{stats:?}");
    assert!(stats.internal_splits > 0, "{stats:?}");
    assert!(stats.tree_growths > 1, "{stats:?}");
    let expected: Vec<_> = (0..1000).map(|k| (k, k * 10)).collect();
    assert_eq!(contents(&tree)?, expected);
    assert_eq!(tree.get(&517)?, Some(5170));
    assert_eq!(tree.get(&1000)?, None);
    assert_consistent(&tree)
}

#[test]
fn random_inserts_with_split_ratio_stay_ordered() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let mut reference = BTreeMap::new();
    let mut writer = tree.writer_with_ratio(0.9)?;
    for _ in 0..800 {
        let key = rng.gen_range(0..5000u64);
        writer.put(&key, &(key * 10))?;
        reference.insert(key, key * 10);
    }
    writer.close()?;
    assert_eq!(contents(&tree)?, reference.into_iter().collect::<Vec<_>>());
    assert_consistent(&tree)
}

#[test]
fn backward_seek_excludes_lower_bound() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 0..300)?;
    let keys: Vec<u64> = tree
        .seek(&250, &40)?
        .map(|entry| entry.map(|(key, _)| key))
        .collect::<Result<_>>()?;
    assert_eq!(keys, (41..=250).rev().collect::<Vec<_>>());

    let mut seeker = tree.allocate_seeker()?;
    seeker.seek(&77, &77);
    assert_eq!(seeker.next()?, Some((77, 770)));
    assert_eq!(seeker.next()?, None);
    seeker.seek(&5, &8);
    assert_eq!(seeker.collect::<Result<Vec<_>>>()?, vec![(5, 50), (6, 60), (7, 70)]);
    Ok(())
}

#[test]
fn removals_merge_leaves_and_collapse_root() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 0..500)?;
    {
        let mut writer = tree.writer()?;
        for key in (0..500).filter(|key| *key != 250) {
            assert_eq!(writer.remove(&key)?, Some(key * 10), "key {key}");
        }
        assert_eq!(writer.remove(&250_000)?, None);
        writer.close()?;
    }
    let stats = tree.stats();
    assert!(stats.leaf_merges > 0, "{stats:?}");
    assert!(stats.tree_shrinks > 0, "{stats:?}");
    assert_eq!(contents(&tree)?, vec![(250, 2500)]);

    let dump = tree.print_tree()?;
    assert!(dump.contains("level 0:"), "{dump}");
    assert!(!dump.contains("level 1:"), "{dump}");
    assert_consistent(&tree)
}

#[test]
fn interleaved_operations_match_btreemap() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    let mut rng = ChaCha8Rng::seed_from_u64(0xB7EE);
    let mut reference = BTreeMap::new();
    for round in 0..6 {
        let mut writer = tree.writer()?;
        for _ in 0..400 {
            let key = rng.gen_range(0..600u64);
            if rng.gen_bool(0.6) {
                let value = rng.gen::<u32>() as u64;
                writer.put(&key, &value)?;
                reference.insert(key, value);
            } else {
                assert_eq!(writer.remove(&key)?, reference.remove(&key));
            }
        }
        writer.close()?;
        if round % 2 == 1 {
            tree.checkpoint()?;
        }
        assert_eq!(contents(&tree)?, reference.clone().into_iter().collect::<Vec<_>>());
    }
    assert_consistent(&tree)
}

#[test]
fn mergers_decide_on_existing_keys() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    let mut writer = tree.writer()?;
    writer.put(&1, &10)?;
    writer.merge(&1, &5, &mut Combine::add())?;
    writer.merge(&1, &99, &mut KeepExisting)?;
    writer.merge(&2, &7, &mut KeepExisting)?;
    // A different value replaces; the same value removes.
    writer.merge(&2, &8, &mut RemoveOnMatch)?;
    writer.merge(&2, &8, &mut RemoveOnMatch)?;
    writer.merge(&3, &4, &mut RemoveOnMatch)?;
    writer.close()?;
    assert_eq!(contents(&tree)?, vec![(1, 15), (3, 4)]);
    Ok(())
}

#[test]
fn merge_removals_shrink_tree_to_one_leaf() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 0..1000)?;
    tree.checkpoint()?;
    assert!(tree.print_tree()?.contains("level 1:"));
    {
        let mut writer = tree.writer()?;
        for key in 1..1000u64 {
            writer.merge(&key, &(key * 10), &mut RemoveOnMatch)?;
        }
        writer.close()?;
    }
    let stats = tree.stats();
    assert!(stats.leaf_merges > 0, "{stats:?}");
    assert!(stats.tree_shrinks > 0, "{stats:?}");
    assert_eq!(contents(&tree)?, vec![(0, 0)]);
    let dump = tree.print_tree()?;
    assert!(!dump.contains("level 1:"), "{dump}");
    assert_consistent(&tree)
}

#[test]
fn large_values_are_offloaded_and_freed() -> Result<()> {
    let io = MemFileIo::new();
    let tree: Tree<BytesLayout> = Tree::open(
        Arc::new(io.clone()),
        TreeOptions::default().page_size(512).checker_threads(1),
        Arc::new(NoMonitor),
    )?;
    let big = vec![0xAB; 300];
    {
        let mut writer = tree.writer()?;
        for i in 0u8..20 {
            writer.put(&vec![i; 4], &big)?;
            writer.put(&vec![i, 1], &vec![i; 3])?;
        }
        writer.close()?;
    }
    assert_eq!(tree.get(&vec![7; 4])?, Some(big.clone()));
    assert_eq!(tree.get(&vec![7, 1])?, Some(vec![7; 3]));
    let collector = ViolationCollector::new();
    assert!(tree.consistency_check(&collector, false)?, "{:?}", collector.violations());

    let too_big = vec![0u8; tree.key_value_size_cap() + 1];
    let mut writer = tree.writer()?;
    assert!(matches!(
        writer.put(&vec![1], &too_big),
        Err(TreeError::InvalidArgument(_))
    ));
    for i in 0u8..20 {
        assert_eq!(writer.remove(&vec![i; 4])?, Some(big.clone()));
    }
    writer.close()?;
    let collector = ViolationCollector::new();
    assert!(tree.consistency_check(&collector, false)?, "{:?}", collector.violations());
    Ok(())
}

#[test]
fn partitions_concatenate_to_the_whole_range() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 0..2000)?;
    let partitions = tree.partitioned_seek(&100, &1900, 8)?;
    assert!(partitions.len() > 1 && partitions.len() <= 8, "{}", partitions.len());
    let mut keys = Vec::new();
    for seeker in partitions {
        for entry in seeker {
            keys.push(entry?.0);
        }
    }
    assert_eq!(keys, (100..1900).collect::<Vec<_>>());

    let single = tree.partitioned_seek(&10, &20, 1)?;
    assert_eq!(single.len(), 1);
    assert!(matches!(
        tree.partitioned_seek(&20, &10, 2),
        Err(TreeError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn level_seek_reads_root_separators() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 0..500)?;
    let mut cursor = tree.seek_level(&0u64.to_be_bytes(), &u64::MAX.to_be_bytes(), 0);
    let mut separators = Vec::new();
    while cursor.next()? {
        assert!(!cursor.at_leaf());
        separators.push(U64Layout::decode_key(cursor.key())?);
    }
    assert!(!separators.is_empty());
    assert!(separators.windows(2).all(|pair| pair[0] < pair[1]), "{separators:?}");
    Ok(())
}

#[test]
fn checkpoint_and_clean_close_survive_reopen() -> Result<()> {
    let io = MemFileIo::new();
    {
        let tree = open(&io, options().initial_header(b"v1".to_vec()))?;
        fill(&tree, 0..300)?;
        tree.checkpoint_with_header(b"v2")?;
        assert_eq!(tree.header(), b"v2".to_vec());
        tree.close()?;
        tree.close()?;
        assert!(matches!(tree.writer(), Err(TreeError::FileClosed)));
    }
    let tree = open(&io, options())?;
    assert!(!tree.was_dirty_on_startup());
    assert_eq!(tree.header(), b"v2".to_vec());
    assert_eq!(contents(&tree)?.len(), 300);
    assert_consistent(&tree)?;
    tree.close()?;

    let shared: Arc<dyn FileIo> = Arc::new(io.clone());
    assert_eq!(read_header(Arc::clone(&shared), SMALL_PAGE)?, b"v2".to_vec());
    overwrite_header(Arc::clone(&shared), SMALL_PAGE, b"v3")?;
    assert_eq!(read_header(Arc::clone(&shared), SMALL_PAGE)?, b"v3".to_vec());
    assert!(matches!(
        read_header(shared, 512),
        Err(TreeError::MetadataMismatch(_))
    ));

    let tree = open(&io, options())?;
    assert_eq!(tree.header(), b"v3".to_vec());
    assert!(!tree.was_dirty_on_startup());
    Ok(())
}

#[test]
fn mismatched_open_is_rejected() -> Result<()> {
    let io = MemFileIo::new();
    open(&io, options())?.close()?;
    assert!(matches!(
        open(&io, options().page_size(512)),
        Err(TreeError::MetadataMismatch(_))
    ));
    let bytes: Result<Tree<BytesLayout>> =
        Tree::open(Arc::new(io.clone()), options(), Arc::new(NoMonitor));
    assert!(matches!(bytes, Err(TreeError::MetadataMismatch(_))));
    assert!(matches!(
        open(&MemFileIo::new(), options().read_only(true)),
        Err(TreeError::IllegalState(_))
    ));
    Ok(())
}

#[test]
fn crash_discards_changes_after_last_checkpoint() -> Result<()> {
    let crashed = crashed_file(0..400, 1000..1400)?;
    let recorder = Arc::new(Recorder::default());
    let tree: Tree<U64Layout> = Tree::open(Arc::new(crashed.clone()), options(), recorder.clone())?;

    assert!(tree.was_dirty_on_startup());
    assert_eq!(tree.cleanup_state(), CleanupState::Finished);
    assert_eq!(recorder.events(), vec!["registered", "started", "finished"]);
    let stats = (*recorder.stats.lock()).unwrap_or_default();
    assert!(stats.cleaned_crash_pointers > 0, "{stats:?}");
    assert!(stats.tree_nodes > 0 && stats.tree_nodes <= stats.pages_visited);

    let expected: Vec<_> = (0..400).map(|k| (k, k * 10)).collect();
    assert_eq!(contents(&tree)?, expected);
    assert_consistent(&tree)?;
    let collector = ViolationCollector::new();
    assert!(!tree.consistency_check(&collector, true)?);
    assert_eq!(collector.violations(), vec![Violation::DirtyOnStartup]);

    fill(&tree, 400..450)?;
    tree.checkpoint()?;
    assert_eq!(contents(&tree)?.len(), 450);
    assert_consistent(&tree)?;
    tree.close()?;

    let tree = open(&crashed, options())?;
    assert!(!tree.was_dirty_on_startup());
    assert_eq!(contents(&tree)?.len(), 450);
    Ok(())
}

#[test]
fn read_only_open_of_crashed_file_sees_last_checkpoint() -> Result<()> {
    let crashed = crashed_file(0..200, 500..700)?;
    let before = crashed.snapshot();
    let tree = open(&crashed, options().read_only(true))?;
    assert!(tree.was_dirty_on_startup());
    assert_eq!(contents(&tree)?.len(), 200);
    assert!(matches!(tree.writer(), Err(TreeError::IllegalState(_))));
    assert!(matches!(tree.checkpoint(), Err(TreeError::IllegalState(_))));
    tree.close()?;

    let (mut a, mut b) = (vec![0; SMALL_PAGE * 3], vec![0; SMALL_PAGE * 3]);
    crashed.read_at(0, &mut a)?;
    before.read_at(0, &mut b)?;
    assert_eq!(a, b, "read-only open must not write");
    Ok(())
}

#[test]
fn failed_cleanup_blocks_writers_and_checkpoints() -> Result<()> {
    let crashed = crashed_file(0..300, 300..600)?;
    let recorder = Arc::new(Recorder::failing());
    {
        let tree: Tree<U64Layout> =
            Tree::open(Arc::new(crashed.clone()), options(), recorder.clone())?;
        assert!(matches!(tree.cleanup_state(), CleanupState::Failed(_)));
        assert_eq!(recorder.events(), vec!["registered", "started", "failed"]);
        assert!(matches!(tree.writer(), Err(TreeError::CleanupFailed(_))));
        assert!(matches!(tree.parallel_writer(), Err(TreeError::CleanupFailed(_))));
        assert!(matches!(tree.checkpoint(), Err(TreeError::CleanupFailed(_))));
        assert_eq!(contents(&tree)?.len(), 300);
        tree.close()?;
    }
    let tree = open(&crashed, options())?;
    assert!(tree.was_dirty_on_startup(), "a failed cleanup leaves the file dirty");
    assert_eq!(tree.cleanup_state(), CleanupState::Finished);
    assert_consistent(&tree)
}

#[test]
fn deferred_cleanup_runs_on_first_writer() -> Result<()> {
    let crashed = crashed_file(0..100, 100..300)?;
    let recorder = Arc::new(Recorder::default());
    let tree: Tree<U64Layout> = Tree::open(
        Arc::new(crashed.clone()),
        options().cleanup(CleanupMode::Deferred),
        recorder.clone(),
    )?;
    assert_eq!(tree.cleanup_state(), CleanupState::NotStarted);
    assert_eq!(recorder.events(), vec!["registered"]);
    assert_eq!(contents(&tree)?.len(), 100);

    fill(&tree, 1000..1010)?;
    assert_eq!(tree.cleanup_state(), CleanupState::Finished);
    assert_eq!(recorder.events(), vec!["registered", "started", "finished"]);
    tree.checkpoint()?;
    assert_eq!(contents(&tree)?.len(), 110);
    assert_consistent(&tree)
}

#[test]
fn close_before_deferred_cleanup_keeps_file_dirty() -> Result<()> {
    let crashed = crashed_file(0..100, 100..300)?;
    let recorder = Arc::new(Recorder::default());
    {
        let tree: Tree<U64Layout> = Tree::open(
            Arc::new(crashed.clone()),
            options().cleanup(CleanupMode::Deferred),
            recorder.clone(),
        )?;
        tree.close()?;
    }
    assert_eq!(recorder.events(), vec!["registered", "closed"]);
    let tree = open(&crashed, options())?;
    assert!(tree.was_dirty_on_startup());
    assert_eq!(contents(&tree)?.len(), 100);
    Ok(())
}

#[test]
fn background_cleanup_finishes_before_writers_run() -> Result<()> {
    let crashed = crashed_file(0..300, 300..900)?;
    let tree: Tree<U64Layout> = Tree::open_with_executor(
        Arc::new(crashed.clone()),
        options().cleanup(CleanupMode::Background),
        Arc::new(NoMonitor),
        Arc::new(ThreadedExecutor::new(3)),
    )?;
    fill(&tree, 2000..2010)?;
    assert_eq!(tree.cleanup_state(), CleanupState::Finished);
    tree.await_cleanup()?;
    tree.checkpoint()?;
    assert_eq!(contents(&tree)?.len(), 310);
    assert_consistent(&tree)
}

#[test]
fn writer_modes_exclude_each_other() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    let mut single = tree.writer()?;
    assert!(matches!(tree.writer(), Err(TreeError::IllegalState(_))));
    assert!(matches!(tree.parallel_writer(), Err(TreeError::IllegalState(_))));
    assert!(matches!(tree.close(), Err(TreeError::IllegalState(_))));
    single.put(&1, &1)?;
    single.close()?;
    assert!(matches!(single.close(), Err(TreeError::IllegalState(_))));
    assert!(matches!(single.put(&2, &2), Err(TreeError::IllegalState(_))));

    let mut first = tree.parallel_writer()?;
    let mut second = tree.parallel_writer()?;
    assert!(matches!(tree.writer(), Err(TreeError::IllegalState(_))));
    first.put(&3, &3)?;
    second.put(&4, &4)?;
    tree.checkpoint()?;
    first.close()?;
    second.close()?;
    assert!(matches!(first.put(&5, &5), Err(TreeError::IllegalState(_))));
    assert!(matches!(
        tree.writer_with_ratio(0.0),
        Err(TreeError::InvalidArgument(_))
    ));
    assert_eq!(contents(&tree)?, vec![(1, 1), (3, 3), (4, 4)]);
    tree.close()
}

#[test]
fn options_parse_from_toml() -> Result<()> {
    let parsed = TreeOptions::from_toml_str(
        r#"
        page_size = 4096
        cleanup = "background"
        cleanup_threads = 4
        split_ratio = 0.75
        "#,
    )?;
    assert_eq!(parsed.page_size, 4096);
    assert_eq!(parsed.cleanup, CleanupMode::Background);
    assert_eq!(parsed.cleanup_threads, 4);
    assert!(!parsed.read_only);
    assert!(matches!(
        TreeOptions::from_toml_str("page_size = \"big\""),
        Err(TreeError::Config(_))
    ));
    assert!(matches!(
        TreeOptions::from_toml_str("unknown = 1"),
        Err(TreeError::Config(_))
    ));
    assert!(matches!(
        TreeOptions::from_toml_str("page_size = 1000"),
        Err(TreeError::InvalidArgument(_))
    ));
    assert!(matches!(
        TreeOptions::from_toml_str("split_ratio = 1.5"),
        Err(TreeError::InvalidArgument(_))
    ));
    Ok(())
}

/// Writes a stable slot and a slot from crashed generation 6 into the pair
/// at `offset`.
fn crash_pair(page: &mut [u8], offset: usize, pointer: u64) {
    gspp::write_slot(page, offset, 4, pointer);
    gspp::write_slot(page, offset + GSP_SIZE, 6, pointer + 1);
}

#[test]
fn cleaner_zeroes_crashed_slots_of_tree_nodes_only() -> Result<()> {
    let io = MemFileIo::new();
    let file = PagedFile::open(Arc::new(io), SMALL_PAGE)?;
    let data = node_format::<U64Layout>(SMALL_PAGE)?;
    let formats = [Arc::clone(&data), node_format::<super::layout::RootMappingLayout>(SMALL_PAGE)?];
    let gen = Generation::new(5, 7)?;
    let header_offsets = [
        HeaderPointer::Left.offset(),
        HeaderPointer::Right.offset(),
        HeaderPointer::Successor.offset(),
    ];
    let mut expected = 0;
    // Pages 3 and 6 are internal, 4 and 5 are leaves.
    for (id, kind, keys, crashed_header) in [
        (3u64, NodeKind::Internal, 2usize, true),
        (4, NodeKind::Leaf, 0, true),
        (5, NodeKind::Leaf, 0, true),
        (6, NodeKind::Internal, 1, false),
    ] {
        let cursor = file.acquire(PageId(id), PfMode::Write)?;
        let mut page = cursor.write()?;
        data.initialize(&mut page, kind, Layer::Data, 5);
        set_key_count(&mut page, keys);
        if crashed_header {
            for offset in header_offsets {
                crash_pair(&mut page, offset, 40);
                expected += 1;
            }
        }
        if kind == NodeKind::Internal {
            for pos in 0..=keys {
                crash_pair(&mut page, data.child_offset(pos), 50 + pos as u64);
                expected += 1;
            }
        }
    }
    assert_eq!(expected, 14);
    // Pages 7 and 8 carry crash-looking bytes but are not tree nodes.
    for (id, page_type) in [(7u64, PAGE_TYPE_OFFLOAD), (8, PAGE_TYPE_FREELIST)] {
        let cursor = file.acquire(PageId(id), PfMode::Write)?;
        let mut page = cursor.write()?;
        page[PAGE_TYPE_OFFSET] = page_type;
        crash_pair(&mut page, HeaderPointer::Left.offset(), 60);
    }

    let cleaner = CrashCleaner::new(&file, formats.clone(), gen, 3..9);
    let stats = cleaner.clean(&InlineExecutor)?;
    assert_eq!(stats.pages_visited, 6);
    assert_eq!(stats.tree_nodes, 4);
    assert_eq!(stats.cleaned_crash_pointers, 14);

    let again = CrashCleaner::new(&file, formats.clone(), gen, 3..9)
        .with_chunk_pages(2)
        .clean(&ThreadedExecutor::new(2))?;
    assert_eq!(again.pages_visited, 6);
    assert_eq!(again.cleaned_crash_pointers, 0);

    let others = CrashCleaner::new(&file, formats, gen, 7..9).clean(&InlineExecutor)?;
    assert_eq!(
        (others.pages_visited, others.tree_nodes, others.cleaned_crash_pointers),
        (2, 0, 0)
    );

    let cursor = file.acquire(PageId(3), PfMode::Write)?;
    let page = cursor.read()?;
    assert_eq!(header_pointer(&page, HeaderPointer::Right, gen, PageId(3))?, Some(PageId(40)));
    assert_eq!(child_at(&*data, &page, 1, gen, PageId(3))?, PageId(51));
    drop(page);
    let cursor = file.acquire(PageId(7), PfMode::Write)?;
    let page = cursor.read()?;
    assert!(gspp::has_crashed(&page, HeaderPointer::Left.offset(), gen));
    Ok(())
}

/// First leaf holding at least `min_keys` keys.
fn find_leaf(tree: &Tree<U64Layout>, min_keys: usize) -> Result<PageId> {
    let core = tree.core();
    for id in MIN_TREE_NODE_ID.0..=core.freelist.last_id().0 {
        let cursor = core.file.acquire(PageId(id), PfMode::Write)?;
        let page = cursor.read()?;
        if is_tree_node(&page)
            && node_kind(&page) == Some(NodeKind::Leaf)
            && key_count(&page) >= min_keys
            && reachable(tree, PageId(id))?
        {
            return Ok(PageId(id));
        }
    }
    Err(TreeError::IllegalState("no leaf found"))
}

fn reachable(tree: &Tree<U64Layout>, id: PageId) -> Result<bool> {
    let collector = ViolationCollector::new();
    tree.consistency_check(&collector, false)?;
    Ok(!collector
        .violations()
        .iter()
        .any(|violation| *violation == Violation::UnusedPage(id)))
}

#[test]
fn checker_finds_keys_out_of_order() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 0..200)?;
    tree.checkpoint()?;
    let leaf = find_leaf(&tree, 2)?;
    {
        let cursor = tree.core().file.acquire(leaf, PfMode::Write)?;
        let mut page = cursor.write()?;
        let first = 112;
        let (a, b) = (page[first..first + 8].to_vec(), page[first + 8..first + 16].to_vec());
        page[first..first + 8].copy_from_slice(&b);
        page[first + 8..first + 16].copy_from_slice(&a);
    }
    let collector = ViolationCollector::new();
    assert!(!tree.consistency_check(&collector, false)?);
    assert!(collector
        .violations()
        .contains(&Violation::KeysOutOfOrderInNode(leaf, 1)));
    Ok(())
}

#[test]
fn checker_finds_unreasonable_key_count_and_leaks() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 0..200)?;
    let leaf = find_leaf(&tree, 1)?;
    let core = tree.core();
    let leaked = core.freelist.acquire_new_id(core.generation())?;
    {
        let cursor = core.file.acquire(leaf, PfMode::Write)?;
        let mut page = cursor.write()?;
        set_key_count(&mut page, 10_000);
    }
    let collector = ViolationCollector::new();
    assert!(!tree.consistency_check(&collector, false)?);
    let violations = collector.violations();
    assert!(violations.contains(&Violation::UnreasonableKeyCount(leaf, 10_000)), "{violations:?}");
    assert!(violations.contains(&Violation::UnusedPage(leaked)), "{violations:?}");
    Ok(())
}

#[test]
fn checker_reports_broken_sibling_pointer() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 0..200)?;
    tree.checkpoint()?;
    let leaf = find_leaf(&tree, 1)?;
    {
        let cursor = tree.core().file.acquire(leaf, PfMode::Write)?;
        let mut page = cursor.write()?;
        let (a, b) = gspp::slots(&page, HeaderPointer::Right.offset());
        let broken = if a.generation >= b.generation {
            HeaderPointer::Right.offset()
        } else {
            HeaderPointer::Right.offset() + GSP_SIZE
        };
        page[broken + 14] ^= 0xFF;
    }
    let collector = ViolationCollector::new();
    assert!(!tree.consistency_check(&collector, false)?);
    assert!(collector
        .violations()
        .iter()
        .any(|violation| matches!(violation, Violation::BrokenPointer(page, _) if *page == leaf)));
    Ok(())
}

/// Leftmost and rightmost leaves of a multi-leaf tree.
fn outer_leaves(tree: &Tree<U64Layout>) -> Result<(PageId, PageId)> {
    let core = tree.core();
    let gen = core.generation();
    let (mut leftmost, mut rightmost) = (None, None);
    for id in MIN_TREE_NODE_ID.0..=core.freelist.last_id().0 {
        let id = PageId(id);
        let (left, right) = {
            let cursor = core.file.acquire(id, PfMode::Write)?;
            let page = cursor.read()?;
            if !is_tree_node(&page) || node_kind(&page) != Some(NodeKind::Leaf) {
                continue;
            }
            (
                header_pointer(&page, HeaderPointer::Left, gen, id)?,
                header_pointer(&page, HeaderPointer::Right, gen, id)?,
            )
        };
        if !reachable(tree, id)? {
            continue;
        }
        if left.is_none() {
            leftmost = Some(id);
        }
        if right.is_none() {
            rightmost = Some(id);
        }
    }
    match (leftmost, rightmost) {
        (Some(left), Some(right)) if left != right => Ok((left, right)),
        _ => Err(TreeError::IllegalState("tree has a single leaf")),
    }
}

fn relink(
    tree: &Tree<U64Layout>,
    page: PageId,
    which: HeaderPointer,
    to: Option<PageId>,
) -> Result<()> {
    let core = tree.core();
    let cursor = core.file.acquire(page, PfMode::Write)?;
    let mut buf = cursor.write()?;
    set_header_pointer(&mut buf, which, to, core.generation(), page)
}

#[test]
fn seek_fails_on_sibling_loop_instead_of_spinning() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open(&io, options())?;
    fill(&tree, 1..300)?;
    tree.checkpoint()?;
    let (leftmost, rightmost) = outer_leaves(&tree)?;
    let scan = |from: u64, to: u64| -> Result<Vec<(u64, u64)>> { tree.seek(&from, &to)?.collect() };

    relink(&tree, rightmost, HeaderPointer::Right, Some(leftmost))?;
    let forward = scan(0, u64::MAX);
    assert!(matches!(forward, Err(TreeError::TreeInconsistency(_))), "{forward:?}");

    relink(&tree, rightmost, HeaderPointer::Right, Some(rightmost))?;
    let forward = scan(0, u64::MAX);
    assert!(matches!(forward, Err(TreeError::TreeInconsistency(_))), "{forward:?}");

    relink(&tree, rightmost, HeaderPointer::Right, None)?;
    relink(&tree, leftmost, HeaderPointer::Left, Some(rightmost))?;
    let backward = scan(u64::MAX, 0);
    assert!(matches!(backward, Err(TreeError::TreeInconsistency(_))), "{backward:?}");

    relink(&tree, leftmost, HeaderPointer::Left, None)?;
    let expected: Vec<_> = (1..300).rev().map(|k| (k, k * 10)).collect();
    assert_eq!(scan(u64::MAX, 0)?, expected);
    Ok(())
}
