// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end recovery journal scenarios over a file-backed layer: crash,
//! rediscovery, and replay of the live journal range.

use std::sync::Arc;

use densevol::config::ThreadCountConfig;
use densevol::journal::format::{
    BlockMapSlot, RecoveryJournalEntry, RecoveryJournalState70, RECOVERY_ENTRIES_PER_BLOCK,
};
use densevol::journal::recovery::{validate_recovery_entry, RecoveryJournal};
use densevol::layer::{FileLayer, MetadataLayer};
use densevol::notifier::ReadOnlyNotifier;
use densevol::rt::ZoneSet;
use densevol::thread_config::ThreadConfig;
use densevol::types::{DataLocation, JournalOperation, MappingState};
use densevol::Error;

const NONCE: u64 = 0x5EED_CAFE;
const JOURNAL_SIZE: u64 = 8;
const ORIGIN: u64 = 1;

fn notifier() -> Arc<ReadOnlyNotifier> {
    let config = ThreadConfig::new(&ThreadCountConfig::default());
    let zones = Arc::new(ZoneSet::new(&config));
    ReadOnlyNotifier::new(false, 1, 0, zones)
}

fn open_journal(layer: Arc<dyn MetadataLayer>) -> RecoveryJournal {
    RecoveryJournal::new(
        layer,
        ORIGIN,
        JOURNAL_SIZE,
        NONCE,
        0,
        RecoveryJournalState70::default(),
        notifier(),
        0,
    )
    .expect("journal should construct")
}

fn mapping_entry(index: u64) -> RecoveryJournalEntry {
    RecoveryJournalEntry {
        operation: JournalOperation::DataIncrement,
        slot: BlockMapSlot {
            pbn: index % 16,
            slot: (index % 100) as u16,
        },
        mapping: DataLocation {
            pbn: 100 + index,
            state: MappingState::Uncompressed,
        },
        unmapping: DataLocation::unmapped(),
    }
}

#[test]
fn test_crash_loses_only_uncommitted_entries() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("journal.img");
    let layer: Arc<dyn MetadataLayer> =
        Arc::new(FileLayer::create(&path, 1 + JOURNAL_SIZE).expect("layer should be created"));

    {
        let mut journal = open_journal(layer.clone());
        // One full block commits on its own; a partial block follows.
        for i in 0..u64::from(RECOVERY_ENTRIES_PER_BLOCK) {
            journal
                .append_entry(mapping_entry(i), None)
                .expect("append should succeed");
        }
        journal
            .append_entry(mapping_entry(9999), None)
            .expect("append should succeed");
        // Crash: the journal is dropped without drain, losing the partial
        // tail block.
    }

    let journal = open_journal(
        Arc::new(FileLayer::open(&path).expect("layer should reopen")) as Arc<dyn MetadataLayer>,
    );
    let discovery = journal.find_head_and_tail().expect("scan should succeed");
    assert!(discovery.found_entries);
    assert_eq!(discovery.tail, 1);

    let entries = journal
        .read_block_entries(1)
        .expect("committed block should decode");
    assert_eq!(entries.len(), RECOVERY_ENTRIES_PER_BLOCK as usize);
    assert_eq!(entries[0], mapping_entry(0));
    // The uncommitted entry left no trace.
    assert!(entries.iter().all(|e| e.mapping.pbn != 100 + 9999));
}

#[test]
fn test_recovered_entries_validate_against_configuration() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("journal.img");
    let layer: Arc<dyn MetadataLayer> =
        Arc::new(FileLayer::create(&path, 1 + JOURNAL_SIZE).expect("layer should be created"));

    {
        let mut journal = open_journal(layer.clone());
        for i in 0..5 {
            journal
                .append_entry(mapping_entry(i), None)
                .expect("append should succeed");
        }
        journal.drain().expect("drain should succeed");
    }

    let journal = open_journal(layer);
    let discovery = journal.find_head_and_tail().expect("scan should succeed");
    assert!(discovery.found_entries);

    let is_data_block = |pbn: u64| pbn >= 100;
    for entry in journal
        .read_block_entries(discovery.tail)
        .expect("block should decode")
    {
        validate_recovery_entry(&entry, 1 << 20, &is_data_block)
            .expect("recovered entries should validate");
    }

    // The same entries against a smaller physical config are corrupt.
    let entry = mapping_entry(0);
    assert!(matches!(
        validate_recovery_entry(&entry, 4, &is_data_block),
        Err(Error::CorruptJournal(_))
    ));
}

#[test]
fn test_journal_wraps_and_stale_blocks_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("journal.img");
    let layer: Arc<dyn MetadataLayer> =
        Arc::new(FileLayer::create(&path, 1 + JOURNAL_SIZE).expect("layer should be created"));

    {
        let mut journal = open_journal(layer.clone());
        // Fill more blocks than the ring holds, releasing references so the
        // ring can reuse slots.
        for i in 0..u64::from(RECOVERY_ENTRIES_PER_BLOCK) * (JOURNAL_SIZE + 3) {
            journal
                .append_entry(mapping_entry(i), None)
                .expect("append should succeed");
            let sequence = journal.tail() - 1;
            journal.release_block_map_reference(sequence);
            journal.release_slab_journal_reference(sequence);
        }
        journal.drain().expect("drain should succeed");
    }

    let journal = open_journal(layer);
    let discovery = journal.find_head_and_tail().expect("scan should succeed");
    assert!(discovery.found_entries);
    // The newest generation won every slot it reached.
    assert_eq!(discovery.tail, JOURNAL_SIZE + 3);
    assert!(discovery.block_map_head <= discovery.tail);
    assert!(discovery.slab_journal_head <= discovery.tail);
}
