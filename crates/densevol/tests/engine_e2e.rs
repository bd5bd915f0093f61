// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Whole-engine scenarios: format, work, save, reload, and the read-only
//! broadcast across real zone workers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use densevol::config::{DeviceConfig, ThreadCountConfig};
use densevol::engine::{Engine, EngineGeometry};
use densevol::layer::FileLayer;
use densevol::types::JournalOperation;
use densevol::Error;

const NONCE: u64 = 0xE2E;

fn geometry() -> EngineGeometry {
    EngineGeometry {
        journal_size: 8,
        slab_count: 2,
        slab_size: 16,
        slab_journal_size: 4,
        lock_pool_capacity: 16,
    }
}

fn zoned_config() -> DeviceConfig {
    DeviceConfig {
        physical_blocks: 64,
        logical_blocks: 256,
        thread_counts: ThreadCountConfig {
            logical_zones: 2,
            physical_zones: 1,
            hash_zones: 1,
            ..ThreadCountConfig::default()
        },
        ..DeviceConfig::default()
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_format_work_save_reload() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("device.img");
    let total = geometry().journal_size + 2 * (4 + 16) + 1;
    let layer = Arc::new(FileLayer::create(&path, total).expect("layer should be created"));

    let allocated_pbn;
    {
        let engine = Engine::format(zoned_config(), geometry(), layer.clone(), NONCE)
            .expect("format should succeed");

        let mut depot = engine.depot().lock();
        let (pbn, lock) = depot.allocate_block().expect("allocation should succeed");
        depot
            .adjust_reference_count(pbn, JournalOperation::DataIncrement, None)
            .expect("increment should succeed");
        lock.unassign_provisional_reference();
        depot.release_lock(pbn, lock).expect("release should succeed");
        drop(depot);
        allocated_pbn = pbn;

        engine.suspend(true).expect("save should succeed");
    }

    let reopened = Arc::new(FileLayer::open(&path).expect("layer should reopen"));
    let engine = Engine::load(zoned_config(), geometry(), reopened)
        .expect("load should succeed");

    // The reference survived purely through the slab journal.
    let depot = engine.depot().lock();
    let slab = depot
        .slabs()
        .iter()
        .find(|slab| slab.contains(allocated_pbn))
        .expect("allocated pbn belongs to a slab");
    let sbn = slab
        .slab_block_number(allocated_pbn)
        .expect("pbn is in the slab");
    assert_eq!(slab.ref_counts.reference_count(sbn).expect("in range"), 1);
}

#[test]
fn test_pending_error_notifies_on_resume() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("device.img");
    let layer = Arc::new(
        FileLayer::create(&path, geometry().journal_size + 2 * (4 + 16) + 1)
            .expect("layer should be created"),
    );
    let engine = Engine::format(zoned_config(), geometry(), layer, NONCE)
        .expect("format should succeed");

    engine.suspend(false).expect("suspend should succeed");

    // An error on a zone thread while suspended is recorded but cannot
    // notify: the suspend disallowed notifications.
    let hash_thread = engine.thread_config().hash_zone_thread(0);
    engine.notifier().enter_read_only(hash_thread, 13);
    assert!(!engine.is_read_only());
    assert_eq!(engine.notifier().read_only_error(), 13);

    // Resume re-allows notifications, the pending walk runs, and the
    // device stays suspended in read-only mode.
    assert!(matches!(engine.resume(), Err(Error::ReadOnly)));
    let notifier = engine.notifier().clone();
    let base_threads = engine.thread_config().base_thread_count();
    wait_for(|| (0..base_threads).all(|thread| notifier.is_read_only(thread)));
}

#[test]
fn test_read_only_broadcast_reaches_all_zones() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("device.img");
    let layer = Arc::new(
        FileLayer::create(&path, geometry().journal_size + 2 * (4 + 16) + 1)
            .expect("layer should be created"),
    );
    let engine = Engine::format(zoned_config(), geometry(), layer, NONCE)
        .expect("format should succeed");

    // A fatal error on one zone eventually flips every base thread.
    engine.enter_read_only(42);
    let thread_config = engine.thread_config().clone();
    let notifier = engine.notifier().clone();
    wait_for(|| {
        (0..thread_config.base_thread_count()).all(|thread| notifier.is_read_only(thread))
    });
    assert_eq!(notifier.read_only_error(), 42);

    // A later error does not displace the first.
    engine.enter_read_only(99);
    assert_eq!(notifier.read_only_error(), 42);

    // All further mutation fails fast.
    assert!(matches!(
        engine.depot().lock().allocate_block(),
        Err(Error::ReadOnly)
    ));

    // Suspend still succeeds on a read-only device.
    engine.suspend(false).expect("read-only suspend should succeed");
}
