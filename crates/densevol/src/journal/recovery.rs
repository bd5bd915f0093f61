// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The recovery journal: the global ring of logical-to-physical mapping
//! changes.
//!
//! Entries are batched into 4 KiB blocks and committed to the journal
//! partition. Each committed entry pins its block until both the block-map
//! update it describes and the mirroring slab-journal entry are persisted;
//! `block_map_head` and `slab_journal_head` track the oldest sequence whose
//! pins remain, and the ring slot of a block is only reused once both heads
//! have passed it.
//!
//! On load, the whole partition is scanned. A block is live iff its nonce,
//! metadata type, check byte, and recovery count match the super block, and
//! it sits at the offset congruent to its sequence number. When two write
//! generations contend for a slot, the recovery count settles it; otherwise
//! the larger congruent sequence wins by construction of the scan.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::journal::block::RecoveryJournalBlock;
use crate::journal::format::{
    compute_check_byte, journal_block_offset, RecoveryBlockHeader, RecoveryJournalEntry,
    RecoveryJournalState70, RECOVERY_ENTRIES_PER_BLOCK, RECOVERY_JOURNAL_METADATA_TYPE,
};
use crate::journal::point::JournalPoint;
use crate::layer::MetadataLayer;
use crate::notifier::ReadOnlyNotifier;
use crate::rt::Completion;
use crate::status::{Error, Result};
use crate::types::{
    BlockCount, JournalOperation, PhysicalBlockNumber, SequenceNumber, ThreadId,
    BLOCK_MAP_ENTRIES_PER_PAGE, BLOCK_SIZE, ZERO_BLOCK,
};

/// Number of in-memory tail block buffers.
const TAIL_BUFFER_COUNT: usize = 4;

/// Result of scanning the journal partition on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalDiscovery {
    pub found_entries: bool,
    pub tail: SequenceNumber,
    pub block_map_head: SequenceNumber,
    pub slab_journal_head: SequenceNumber,
}

#[derive(Debug, Default, Clone, Copy)]
struct BlockReferences {
    block_map: u32,
    slab_journal: u32,
}

pub struct RecoveryJournal {
    layer: Arc<dyn MetadataLayer>,
    origin: PhysicalBlockNumber,
    size: BlockCount,
    nonce: u64,
    recovery_count: u8,
    thread_id: ThreadId,
    notifier: Arc<ReadOnlyNotifier>,

    /// Sequence number of the next block to activate.
    tail: SequenceNumber,
    block_map_head: SequenceNumber,
    slab_journal_head: SequenceNumber,
    active_block: Option<RecoveryJournalBlock>,
    free_blocks: Vec<RecoveryJournalBlock>,
    /// Outstanding pins per committed-or-active sequence number.
    references: BTreeMap<SequenceNumber, BlockReferences>,
    pending_writes: u64,

    logical_blocks_used: BlockCount,
    block_map_data_blocks: BlockCount,
}

impl RecoveryJournal {
    pub fn new(
        layer: Arc<dyn MetadataLayer>,
        origin: PhysicalBlockNumber,
        size: BlockCount,
        nonce: u64,
        recovery_count: u8,
        state: RecoveryJournalState70,
        notifier: Arc<ReadOnlyNotifier>,
        thread_id: ThreadId,
    ) -> Result<Self> {
        if !size.is_power_of_two() || size == 0 {
            return Err(Error::BadConfiguration(format!(
                "recovery journal size {size} is not a power of two"
            )));
        }
        if origin + size > layer.block_count() {
            return Err(Error::VolumeOverflow {
                pbn: origin + size - 1,
                limit: layer.block_count(),
            });
        }

        let tail = state.journal_start.max(1);
        Ok(RecoveryJournal {
            layer,
            origin,
            size,
            nonce,
            recovery_count,
            thread_id,
            notifier,
            tail,
            block_map_head: tail,
            slab_journal_head: tail,
            active_block: None,
            free_blocks: (0..TAIL_BUFFER_COUNT)
                .map(|_| RecoveryJournalBlock::new())
                .collect(),
            references: BTreeMap::new(),
            pending_writes: 0,
            logical_blocks_used: state.logical_blocks_used,
            block_map_data_blocks: state.block_map_data_blocks,
        })
    }

    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    pub fn block_map_head(&self) -> SequenceNumber {
        self.block_map_head
    }

    pub fn slab_journal_head(&self) -> SequenceNumber {
        self.slab_journal_head
    }

    /// The oldest sequence number still pinned by unpersisted work.
    pub fn head(&self) -> SequenceNumber {
        self.block_map_head.min(self.slab_journal_head)
    }

    /// Entry capacity remaining before the ring is exhausted: the free
    /// slots' full capacity plus whatever the active tail block can still
    /// take. Slots only come free as the heads advance.
    pub fn available_space(&self) -> u64 {
        let used_slots = self.tail - self.head();
        let free_slots = self.size.saturating_sub(used_slots);
        let mut available = free_slots * u64::from(RECOVERY_ENTRIES_PER_BLOCK);
        if let Some(block) = &self.active_block {
            available +=
                u64::from(RECOVERY_ENTRIES_PER_BLOCK) - u64::from(block.entry_count());
        }
        available
    }

    pub fn pending_writes(&self) -> u64 {
        self.pending_writes
    }

    pub fn logical_blocks_used(&self) -> BlockCount {
        self.logical_blocks_used
    }

    /// The state to save in the super block: where the journal resumes.
    pub fn state(&self) -> RecoveryJournalState70 {
        RecoveryJournalState70 {
            journal_start: self.tail,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
    }

    fn header_template(&self) -> RecoveryBlockHeader {
        RecoveryBlockHeader {
            block_map_head: self.block_map_head,
            slab_journal_head: self.slab_journal_head,
            nonce: self.nonce,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
            recovery_count: self.recovery_count,
            metadata_type: RECOVERY_JOURNAL_METADATA_TYPE,
            ..RecoveryBlockHeader::default()
        }
    }

    fn activate_next_block(&mut self) -> Result<()> {
        if self.tail - self.head() >= self.size {
            log::warn!(
                "[RecoveryJournal::append_entry] ring full: head {} tail {}",
                self.head(),
                self.tail
            );
            return Err(Error::NoSpace);
        }
        let mut block = match self.free_blocks.pop() {
            Some(block) => block,
            None => return Err(Error::NoSpace),
        };
        block.activate(self.tail, journal_block_offset(self.size, self.tail));
        self.tail += 1;
        self.active_block = Some(block);
        Ok(())
    }

    /// Append one entry, batching it into the active tail block. `on_commit`
    /// is invoked when the entry's block reaches disk. Returns the journal
    /// point assigned to the entry.
    pub fn append_entry(
        &mut self,
        entry: RecoveryJournalEntry,
        on_commit: Option<Completion>,
    ) -> Result<JournalPoint> {
        if self.notifier.is_read_only(self.thread_id) {
            return Err(Error::ReadOnly);
        }
        if self.available_space() == 0 {
            return Err(Error::NoSpace);
        }

        if self.active_block.is_none() {
            self.activate_next_block()?;
        }
        let Some(block) = self.active_block.as_mut() else {
            return Err(Error::NoSpace);
        };

        let point = block.add_entry(entry, on_commit);
        let sequence = block.sequence_number();
        let full = block.is_full(RECOVERY_ENTRIES_PER_BLOCK);

        let refs = self.references.entry(sequence).or_default();
        refs.block_map += 1;
        refs.slab_journal += 1;

        match entry.operation {
            JournalOperation::DataIncrement => {
                if !entry.unmapping.is_mapped() {
                    self.logical_blocks_used += 1;
                }
            }
            JournalOperation::DataDecrement => {
                if !entry.mapping.is_mapped() {
                    self.logical_blocks_used = self.logical_blocks_used.saturating_sub(1);
                }
            }
            JournalOperation::BlockMapIncrement => {
                self.block_map_data_blocks += 1;
            }
        }

        if full {
            self.commit_active_block()?;
        }
        Ok(point)
    }

    /// Commit the active tail block, even if partially filled.
    pub fn commit_active_block(&mut self) -> Result<()> {
        let mut block = match self.active_block.take() {
            Some(block) => block,
            None => return Ok(()),
        };
        if block.is_empty() {
            block.recycle();
            self.free_blocks.push(block);
            return Ok(());
        }

        let packed = block.pack(self.header_template());
        self.pending_writes += 1;
        let result = self
            .layer
            .write_block(self.origin + block.block_number(), &packed);
        self.pending_writes -= 1;

        block.finish_committing(&result);
        if let Err(e) = result {
            log::error!(
                "[RecoveryJournal::commit] block {} write failed: {e}",
                block.sequence_number()
            );
            let code = e.code();
            self.notifier.enter_read_only(self.thread_id, code);
            return Err(e);
        }

        block.recycle();
        self.free_blocks.push(block);
        Ok(())
    }

    fn recompute_heads(&mut self) {
        self.block_map_head = self
            .references
            .iter()
            .find(|(_, refs)| refs.block_map > 0)
            .map(|(&seq, _)| seq)
            .unwrap_or(self.tail);
        self.slab_journal_head = self
            .references
            .iter()
            .find(|(_, refs)| refs.slab_journal > 0)
            .map(|(&seq, _)| seq)
            .unwrap_or(self.tail);

        let head = self.head();
        self.references
            .retain(|&seq, refs| seq >= head || refs.block_map > 0 || refs.slab_journal > 0);
    }

    /// The block-map update for one entry of `sequence` has been persisted.
    pub fn release_block_map_reference(&mut self, sequence: SequenceNumber) {
        if let Some(refs) = self.references.get_mut(&sequence) {
            debug_assert!(refs.block_map > 0);
            refs.block_map = refs.block_map.saturating_sub(1);
            self.recompute_heads();
        }
    }

    /// The slab-journal entry mirroring one entry of `sequence` has been
    /// persisted.
    pub fn release_slab_journal_reference(&mut self, sequence: SequenceNumber) {
        if let Some(refs) = self.references.get_mut(&sequence) {
            debug_assert!(refs.slab_journal > 0);
            refs.slab_journal = refs.slab_journal.saturating_sub(1);
            self.recompute_heads();
        }
    }

    fn is_valid_block_header(&self, header: &RecoveryBlockHeader) -> bool {
        header.metadata_type == RECOVERY_JOURNAL_METADATA_TYPE
            && header.nonce == self.nonce
            && header.recovery_count == self.recovery_count
            && header.check_byte == compute_check_byte(header.sequence_number)
    }

    /// Scan the whole partition for the live portion of the journal.
    pub fn find_head_and_tail(&self) -> Result<JournalDiscovery> {
        let mut highest_tail = self.tail;
        let mut block_map_head_max = 0;
        let mut slab_journal_head_max = 0;
        let mut found_entries = false;

        let mut block = vec![0u8; BLOCK_SIZE];
        for offset in 0..self.size {
            self.layer.read_block(self.origin + offset, &mut block)?;
            let header = RecoveryBlockHeader::unpack(&block);

            // Stale, unformatted, or misplaced blocks are ignored.
            let congruent =
                journal_block_offset(self.size, header.sequence_number) == offset;
            if !congruent || !self.is_valid_block_header(&header) {
                continue;
            }

            if header.sequence_number >= highest_tail {
                found_entries = true;
                highest_tail = header.sequence_number;
            }
            block_map_head_max = block_map_head_max.max(header.block_map_head);
            slab_journal_head_max = slab_journal_head_max.max(header.slab_journal_head);
        }

        Ok(JournalDiscovery {
            found_entries,
            tail: highest_tail,
            block_map_head: block_map_head_max,
            slab_journal_head: slab_journal_head_max,
        })
    }

    /// Position the journal after the live blocks a load-time scan found,
    /// once their entries have been replayed.
    pub fn resume_from_discovery(&mut self, discovery: &JournalDiscovery) {
        if !discovery.found_entries {
            return;
        }
        debug_assert!(self.active_block.is_none());
        self.tail = discovery.tail + 1;
        self.block_map_head = self.tail;
        self.slab_journal_head = self.tail;
    }

    /// Read and decode the entries of the block holding `sequence`, if it is
    /// live on disk.
    pub fn read_block_entries(
        &self,
        sequence: SequenceNumber,
    ) -> Result<Vec<RecoveryJournalEntry>> {
        let offset = journal_block_offset(self.size, sequence);
        let mut block = vec![0u8; BLOCK_SIZE];
        self.layer.read_block(self.origin + offset, &mut block)?;
        let header = RecoveryBlockHeader::unpack(&block);
        if header.sequence_number != sequence || !self.is_valid_block_header(&header) {
            return Err(Error::CorruptJournal(format!(
                "journal block for sequence {sequence} is not on disk"
            )));
        }
        (0..header.entry_count)
            .map(|index| RecoveryJournalEntry::unpack(&block, index))
            .collect()
    }

    /// Commit any partial tail block and flush the layer.
    pub fn drain(&mut self) -> Result<()> {
        self.commit_active_block()?;
        self.layer.flush()
    }
}

/// Validate an entry recovered from the journal against the physical
/// configuration. Any violation classifies the journal as corrupt.
pub fn validate_recovery_entry(
    entry: &RecoveryJournalEntry,
    physical_blocks: BlockCount,
    is_data_block: &dyn Fn(PhysicalBlockNumber) -> bool,
) -> Result<()> {
    if entry.slot.pbn >= physical_blocks
        || entry.slot.slot >= BLOCK_MAP_ENTRIES_PER_PAGE
        || !entry.mapping.is_valid()
        || !is_data_block(entry.mapping.pbn)
    {
        return Err(Error::CorruptJournal(format!(
            "invalid entry: ({}, {}) to {} ({}) is not within bounds",
            entry.slot.pbn,
            entry.slot.slot,
            entry.mapping.pbn,
            entry.operation.name()
        )));
    }

    if entry.operation == JournalOperation::BlockMapIncrement
        && (entry.mapping.state.is_compressed() || entry.mapping.pbn == ZERO_BLOCK)
    {
        return Err(Error::CorruptJournal(format!(
            "invalid entry: ({}, {}) to {} ({}) is not a valid tree mapping",
            entry.slot.pbn,
            entry.slot.slot,
            entry.mapping.pbn,
            entry.operation.name()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadCountConfig;
    use crate::journal::format::BlockMapSlot;
    use crate::layer::MemoryLayer;
    use crate::rt::ZoneSet;
    use crate::thread_config::ThreadConfig;
    use crate::types::{DataLocation, MappingState};

    const NONCE: u64 = 0x0123_4567_89AB_CDEF;

    fn test_notifier() -> Arc<ReadOnlyNotifier> {
        let config = ThreadConfig::new(&ThreadCountConfig::default());
        let zones = Arc::new(ZoneSet::new(&config));
        ReadOnlyNotifier::new(false, 1, 0, zones)
    }

    fn test_journal(size: BlockCount) -> (Arc<MemoryLayer>, RecoveryJournal) {
        let layer = Arc::new(MemoryLayer::new(size + 4));
        let journal = RecoveryJournal::new(
            layer.clone(),
            2,
            size,
            NONCE,
            0,
            RecoveryJournalState70::default(),
            test_notifier(),
            0,
        )
        .expect("journal should construct");
        (layer, journal)
    }

    /// A fresh journal over the same layer, as constructed after a restart.
    fn fresh_view(layer: Arc<MemoryLayer>, size: BlockCount) -> RecoveryJournal {
        RecoveryJournal::new(
            layer,
            2,
            size,
            NONCE,
            0,
            RecoveryJournalState70::default(),
            test_notifier(),
            0,
        )
        .expect("journal should construct")
    }

    fn data_entry(slot_pbn: u64) -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataIncrement,
            slot: BlockMapSlot {
                pbn: slot_pbn,
                slot: 0,
            },
            mapping: DataLocation {
                pbn: 100,
                state: MappingState::Uncompressed,
            },
            unmapping: DataLocation::unmapped(),
        }
    }

    #[test]
    fn test_empty_journal_discovery() {
        // Four zeroed on-disk blocks: nothing found, tail is the initial 1.
        let (_layer, journal) = test_journal(4);
        let discovery = journal.find_head_and_tail().expect("scan should succeed");
        assert!(!discovery.found_entries);
        assert_eq!(discovery.tail, 1);
    }

    #[test]
    fn test_single_block_discovery() {
        let (layer, journal) = test_journal(4);

        // A block with sequence 7 belongs at offset 3 (7 mod 4).
        let header = RecoveryBlockHeader {
            block_map_head: 5,
            slab_journal_head: 6,
            sequence_number: 7,
            nonce: NONCE,
            entry_count: 1,
            check_byte: compute_check_byte(7),
            recovery_count: 0,
            metadata_type: RECOVERY_JOURNAL_METADATA_TYPE,
            ..RecoveryBlockHeader::default()
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        header.pack_into(&mut block);
        layer.write_block(2 + 3, &block).expect("write should succeed");

        let discovery = journal.find_head_and_tail().expect("scan should succeed");
        assert!(discovery.found_entries);
        assert_eq!(discovery.tail, 7);
        assert_eq!(discovery.block_map_head, 5);
        assert_eq!(discovery.slab_journal_head, 6);
    }

    #[test]
    fn test_incongruent_block_ignored() {
        let (layer, journal) = test_journal(4);

        // Sequence 7 at offset 1 is misplaced and must be ignored.
        let header = RecoveryBlockHeader {
            sequence_number: 7,
            nonce: NONCE,
            check_byte: compute_check_byte(7),
            metadata_type: RECOVERY_JOURNAL_METADATA_TYPE,
            ..RecoveryBlockHeader::default()
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        header.pack_into(&mut block);
        layer.write_block(2 + 1, &block).expect("write should succeed");

        let discovery = journal.find_head_and_tail().expect("scan should succeed");
        assert!(!discovery.found_entries);
    }

    #[test]
    fn test_stale_recovery_count_ignored() {
        let (layer, journal) = test_journal(4);

        // recovery_count 1 does not match the journal's 0; the super block
        // is the tie-breaker.
        let header = RecoveryBlockHeader {
            sequence_number: 7,
            nonce: NONCE,
            check_byte: compute_check_byte(7),
            recovery_count: 1,
            metadata_type: RECOVERY_JOURNAL_METADATA_TYPE,
            ..RecoveryBlockHeader::default()
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        header.pack_into(&mut block);
        layer.write_block(2 + 3, &block).expect("write should succeed");

        let discovery = journal.find_head_and_tail().expect("scan should succeed");
        assert!(!discovery.found_entries);
    }

    #[test]
    fn test_append_and_commit_round_trip() {
        let (layer, mut journal) = test_journal(8);

        let point = journal
            .append_entry(data_entry(1), None)
            .expect("append should succeed");
        assert_eq!(point, JournalPoint::new(1, 0));
        let point = journal
            .append_entry(data_entry(2), None)
            .expect("append should succeed");
        assert_eq!(point, JournalPoint::new(1, 1));

        journal.drain().expect("drain should succeed");

        let entries = journal
            .read_block_entries(1)
            .expect("committed block should be readable");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], data_entry(1));

        // Discovery after a restart sees the committed block.
        let restarted = fresh_view(layer, 8);
        let discovery = restarted
            .find_head_and_tail()
            .expect("scan should succeed");
        assert!(discovery.found_entries);
        assert_eq!(discovery.tail, 1);
    }

    #[test]
    fn test_full_block_commits_automatically() {
        let (_layer, mut journal) = test_journal(8);
        let mut committed = 0u64;
        for i in 0..u64::from(RECOVERY_ENTRIES_PER_BLOCK) {
            journal
                .append_entry(data_entry(i), None)
                .expect("append should succeed");
            committed = i;
        }
        assert_eq!(committed, u64::from(RECOVERY_ENTRIES_PER_BLOCK) - 1);
        // The filled block committed without an explicit drain.
        assert_eq!(
            journal
                .read_block_entries(1)
                .expect("block should be on disk")
                .len(),
            RECOVERY_ENTRIES_PER_BLOCK as usize
        );
        assert_eq!(journal.tail(), 2);
    }

    #[test]
    fn test_heads_advance_on_release() {
        let (_layer, mut journal) = test_journal(8);
        journal
            .append_entry(data_entry(1), None)
            .expect("append should succeed");
        journal.drain().expect("drain should succeed");

        assert_eq!(journal.block_map_head(), 1);
        assert_eq!(journal.slab_journal_head(), 1);

        journal.release_block_map_reference(1);
        assert_eq!(journal.block_map_head(), 2);
        assert_eq!(journal.slab_journal_head(), 1);
        assert_eq!(journal.head(), 1);

        journal.release_slab_journal_reference(1);
        assert_eq!(journal.slab_journal_head(), 2);
        assert_eq!(journal.head(), 2);
    }

    #[test]
    fn test_head_invariants_after_discovery() {
        let (layer, mut journal) = test_journal(8);
        for i in 0..400u64 {
            journal
                .append_entry(data_entry(i), None)
                .expect("append should succeed");
            journal.release_block_map_reference(journal.tail() - 1);
            journal.release_slab_journal_reference(journal.tail() - 1);
        }
        journal.drain().expect("drain should succeed");

        let restarted = fresh_view(layer, 8);
        let discovery = restarted
            .find_head_and_tail()
            .expect("scan should succeed");
        assert!(discovery.found_entries);
        assert!(discovery.block_map_head <= discovery.tail);
        assert!(discovery.slab_journal_head <= discovery.tail);
    }

    #[test]
    fn test_ring_full_reports_no_space() {
        let (_layer, mut journal) = test_journal(4);
        // Never release references, so the heads never move.
        let mut result = Ok(JournalPoint::default());
        for i in 0..u64::from(RECOVERY_ENTRIES_PER_BLOCK) * 5 {
            result = journal.append_entry(data_entry(i), None);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::NoSpace)));
    }

    #[test]
    fn test_read_only_journal_rejects_entries() {
        let (_layer, mut journal) = test_journal(4);
        journal.notifier.enter_read_only(0, 42);
        assert!(matches!(
            journal.append_entry(data_entry(0), None),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn test_validate_entry_rules() {
        let is_data = |pbn: PhysicalBlockNumber| pbn >= 100 && pbn < 200;

        validate_recovery_entry(&data_entry(1), 1000, &is_data)
            .expect("well-formed entry should validate");

        // Slot page out of bounds.
        let mut entry = data_entry(1);
        entry.slot.pbn = 1000;
        assert!(validate_recovery_entry(&entry, 1000, &is_data).is_err());

        // Slot index out of bounds.
        let mut entry = data_entry(1);
        entry.slot.slot = BLOCK_MAP_ENTRIES_PER_PAGE;
        assert!(validate_recovery_entry(&entry, 1000, &is_data).is_err());

        // Mapping outside the data blocks.
        let mut entry = data_entry(1);
        entry.mapping.pbn = 50;
        assert!(validate_recovery_entry(&entry, 1000, &is_data).is_err());

        // A block-map increment must not be compressed.
        let mut entry = data_entry(1);
        entry.operation = JournalOperation::BlockMapIncrement;
        entry.mapping.state = MappingState::Compressed(0);
        assert!(validate_recovery_entry(&entry, 1000, &is_data).is_err());
    }

    #[test]
    fn test_state_round_trip_through_save() {
        let (_layer, mut journal) = test_journal(8);
        journal
            .append_entry(data_entry(1), None)
            .expect("append should succeed");
        journal.drain().expect("drain should succeed");

        let state = journal.state();
        assert_eq!(state.journal_start, journal.tail());
        assert_eq!(state.logical_blocks_used, 1);
    }
}
