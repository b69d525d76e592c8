//! Concurrent allocation stress tests
//!
//! Many writers share one hierarchy. Views go stale constantly, so the
//! allocators lose commit races and must keep searching without ever
//! overcommitting a directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tiered_blockstore::{
    Allocator, AllocatorKind, BlockStoreLocation, CapacityView, DirSpec, GreedyEvictor,
    RetryConfig, StorageHierarchy, TierSpec, TieredBlockStore,
};

fn build() -> Arc<StorageHierarchy> {
    let tier = |alias: &str, ordinal: u32, capacities: &[u64]| TierSpec {
        alias: alias.to_string(),
        ordinal,
        dirs: capacities
            .iter()
            .enumerate()
            .map(|(i, capacity)| DirSpec {
                path: PathBuf::from(format!("/data/{}/{}", alias, i)),
                capacity_bytes: *capacity,
            })
            .collect(),
    };
    Arc::new(
        StorageHierarchy::new(vec![
            tier("MEM", 0, &[10_000]),
            tier("SSD", 1, &[20_000, 20_000]),
            tier("HDD", 2, &[50_000]),
        ])
        .unwrap(),
    )
}

#[test]
fn test_concurrent_allocators_never_overcommit() {
    for kind in AllocatorKind::ALL {
        let h = build();
        let allocator = Arc::new(Allocator::new(kind, h.clone()));
        let placed = Arc::new(AtomicU64::new(0));
        let next_id = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|thread_id| {
                let h = h.clone();
                let allocator = allocator.clone();
                let placed = placed.clone();
                let next_id = next_id.clone();
                std::thread::spawn(move || {
                    let location = if thread_id % 2 == 0 {
                        BlockStoreLocation::any_tier()
                    } else {
                        BlockStoreLocation::any_dir_in_tier("SSD")
                    };
                    let size = 100 + 37 * thread_id as u64;
                    loop {
                        let mut view = CapacityView::new(&h, thread_id as u64);
                        let block_id = next_id.fetch_add(1, Ordering::Relaxed);
                        match allocator.allocate(&mut view, &location, block_id, size) {
                            Ok(temp) => {
                                placed.fetch_add(temp.size(), Ordering::Relaxed);
                            }
                            Err(err) => {
                                assert!(err.is_no_space());
                                break;
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for dir in h.dirs() {
            assert!(
                dir.committed_bytes() <= dir.capacity_bytes(),
                "{} overcommitted {}",
                kind,
                dir.id()
            );
        }
        assert_eq!(h.committed_bytes(), placed.load(Ordering::Relaxed));
        // SSD writers only stop once SSD is nearly full
        let ssd = h.tier("SSD").unwrap();
        assert!(ssd.capacity_bytes() - ssd.committed_bytes() < 100 + 37 * 7);
    }
}

#[test]
fn test_concurrent_specific_dir() {
    // Everyone fights for one directory; exactly capacity / size blocks fit
    let h = build();
    let allocator = Arc::new(Allocator::new(AllocatorKind::FirstFit, h.clone()));
    let successes = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..10u64)
        .map(|thread_id| {
            let h = h.clone();
            let allocator = allocator.clone();
            let successes = successes.clone();
            std::thread::spawn(move || {
                let location = BlockStoreLocation::specific("MEM", 0);
                for i in 0..50 {
                    let mut view = CapacityView::new(&h, thread_id);
                    if allocator
                        .allocate(&mut view, &location, thread_id * 1000 + i, 250)
                        .is_ok()
                    {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(successes.load(Ordering::Relaxed), 40);
    assert_eq!(h.tier("MEM").unwrap().committed_bytes(), 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_with_eviction() {
    let h = build();
    let store = Arc::new(
        TieredBlockStore::new(
            h.clone(),
            AllocatorKind::MaxFree,
            Arc::new(GreedyEvictor),
            RetryConfig {
                max_eviction_attempts: 8,
                timeout_ms: 10_000,
                backoff_ms: 0,
            },
        )
        .unwrap(),
    );

    let tasks: Vec<_> = (0..8u64)
        .map(|session| {
            let store = store.clone();
            tokio::spawn(async move {
                let location = BlockStoreLocation::any_dir_in_tier("SSD");
                let mut committed = 0;
                for i in 0..100 {
                    let block_id = session * 10_000 + i;
                    match store.create_block(session, block_id, &location, 900).await {
                        Ok(mut temp) => {
                            store.commit_block(&mut temp).unwrap();
                            committed += 1;
                        }
                        Err(err) => assert!(err.is_no_space()),
                    }
                }
                committed
            })
        })
        .collect();

    let mut committed = 0;
    for task in tasks {
        committed += task.await.unwrap();
    }

    // SSD holds 40_000 bytes, far less than 800 blocks of 900
    assert!(committed > 44);
    for dir in h.dirs() {
        assert!(dir.committed_bytes() <= dir.capacity_bytes());
        assert_eq!(dir.held_bytes(), 0);
        assert_eq!(dir.temp_block_count(), 0);
    }
    let meta = store.store_meta();
    assert_eq!(meta.committed_bytes, meta.blocks as u64 * 900);
}
