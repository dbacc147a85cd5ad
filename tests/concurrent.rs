use genbtree::primitives::io::MemFileIo;
use genbtree::storage::btree::{NoMonitor, U64Layout, ViolationCollector};
use genbtree::{Result, Tree, TreeError, TreeOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const NUM_THREADS: usize = 4;
const KEYS_PER_THREAD: u64 = 500;

fn open() -> Result<Arc<Tree<U64Layout>>> {
    let io = MemFileIo::new();
    let options = TreeOptions::default().page_size(256).checker_threads(2);
    Ok(Arc::new(Tree::open(Arc::new(io), options, Arc::new(NoMonitor))?))
}

/// Keys seen by one pass must ascend and carry `key * 3` as value.
fn scan_is_sorted(tree: &Tree<U64Layout>) -> Result<usize> {
    let mut last = None;
    let mut seen = 0;
    for entry in tree.seek(&0, &u64::MAX)? {
        let (key, value) = entry?;
        assert_eq!(value, key * 3);
        if let Some(prev) = last {
            assert!(key > prev, "{key} after {prev}");
        }
        last = Some(key);
        seen += 1;
    }
    Ok(seen)
}

#[test]
fn readers_see_sorted_entries_during_writes() -> Result<()> {
    let tree = open()?;
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(NUM_THREADS + 1));

    let readers: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let done = Arc::clone(&done);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<usize> {
                barrier.wait();
                let mut passes = 0;
                while !done.load(Ordering::Acquire) {
                    scan_is_sorted(&tree)?;
                    passes += 1;
                }
                Ok(passes)
            })
        })
        .collect();

    barrier.wait();
    {
        let mut writer = tree.writer()?;
        for i in 0..4000u64 {
            let key = (i * 7919) % 4000;
            writer.put(&key, &(key * 3))?;
        }
        for key in (0..4000u64).step_by(5) {
            writer.remove(&key)?;
        }
        writer.close()?;
    }
    tree.checkpoint()?;
    done.store(true, Ordering::Release);

    for reader in readers {
        reader.join().expect("reader panicked")?;
    }
    assert_eq!(scan_is_sorted(&tree)?, 3200);
    Ok(())
}

/// One pass in either direction. Returns the keys divisible by 4 in the
/// order they were seen.
fn scan_stable_keys(tree: &Tree<U64Layout>, backward: bool) -> Result<Vec<u64>> {
    let seeker = if backward {
        tree.seek(&u64::MAX, &0)?
    } else {
        tree.seek(&0, &u64::MAX)?
    };
    let mut last: Option<u64> = None;
    let mut stable = Vec::new();
    for entry in seeker {
        let (key, value) = entry?;
        assert_eq!(value, key * 3);
        if let Some(prev) = last {
            assert_eq!(key > prev, !backward, "{key} after {prev}");
            assert_ne!(key, prev);
        }
        last = Some(key);
        if key % 4 == 0 {
            stable.push(key);
        }
    }
    Ok(stable)
}

#[test]
fn readers_in_both_directions_see_every_untouched_key() -> Result<()> {
    let tree = open()?;
    let stable: Vec<u64> = (1..1000u64).map(|k| k * 4).collect();
    {
        let mut writer = tree.writer()?;
        for key in &stable {
            writer.put(key, &(key * 3))?;
        }
        writer.close()?;
    }
    tree.checkpoint()?;

    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(NUM_THREADS + 1));
    let readers: Vec<_> = (0..NUM_THREADS)
        .map(|reader| {
            let tree = Arc::clone(&tree);
            let done = Arc::clone(&done);
            let barrier = Arc::clone(&barrier);
            let mut expected = stable.clone();
            let backward = reader % 2 == 1;
            if backward {
                expected.reverse();
            }
            thread::spawn(move || -> Result<usize> {
                barrier.wait();
                let mut passes = 0;
                loop {
                    assert_eq!(scan_stable_keys(&tree, backward)?, expected);
                    passes += 1;
                    if done.load(Ordering::Acquire) {
                        return Ok(passes);
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    for round in 0..8u64 {
        let mut writer = tree.writer()?;
        for key in (1..4000u64).filter(|key| key % 4 != 0) {
            writer.put(&key, &(key * 3))?;
        }
        for key in (1..4000u64).filter(|key| key % 4 != 0 && (key + round) % 3 != 0) {
            writer.remove(&key)?;
        }
        writer.close()?;
        if round % 2 == 1 {
            tree.checkpoint()?;
        }
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        let passes = reader.join().expect("reader panicked")?;
        assert!(passes > 0);
    }
    assert_eq!(scan_stable_keys(&tree, false)?, stable);
    let collector = ViolationCollector::new();
    assert!(tree.consistency_check(&collector, false)?, "{:?}", collector.violations());
    Ok(())
}

#[test]
fn parallel_writers_insert_disjoint_ranges() -> Result<()> {
    let tree = open()?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS as u64)
        .map(|thread_id| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                let mut writer = tree.parallel_writer()?;
                barrier.wait();
                for i in 0..KEYS_PER_THREAD {
                    let key = i * NUM_THREADS as u64 + thread_id;
                    writer.put(&key, &(key * 3))?;
                }
                writer.close()
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }

    let total = NUM_THREADS * KEYS_PER_THREAD as usize;
    assert_eq!(scan_is_sorted(&tree)?, total);
    let collector = ViolationCollector::new();
    assert!(tree.consistency_check(&collector, false)?, "{:?}", collector.violations());
    Ok(())
}

#[test]
fn single_writer_is_exclusive_across_threads() -> Result<()> {
    let tree = open()?;
    let writer = tree.writer()?;
    let other = Arc::clone(&tree);
    let attempt = thread::spawn(move || other.writer().map(|_| ()));
    let result = attempt.join().expect("thread panicked");
    assert!(matches!(result, Err(TreeError::IllegalState(_))));
    drop(writer);
    let mut writer = tree.writer()?;
    writer.close()
}

#[test]
fn checkpoints_interleave_with_seeks() -> Result<()> {
    let tree = open()?;
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let tree = Arc::clone(&tree);
        let done = Arc::clone(&done);
        thread::spawn(move || -> Result<()> {
            while !done.load(Ordering::Acquire) {
                scan_is_sorted(&tree)?;
            }
            Ok(())
        })
    };

    for round in 0..20u64 {
        let mut writer = tree.writer()?;
        for key in round * 100..(round + 1) * 100 {
            writer.put(&key, &(key * 3))?;
        }
        for key in (round * 100..(round + 1) * 100).step_by(4) {
            writer.remove(&key)?;
        }
        writer.close()?;
        tree.checkpoint()?;
    }
    done.store(true, Ordering::Release);
    reader.join().expect("reader panicked")?;

    assert_eq!(scan_is_sorted(&tree)?, 1500);
    let collector = ViolationCollector::new();
    assert!(tree.consistency_check(&collector, false)?, "{:?}", collector.violations());
    Ok(())
}
