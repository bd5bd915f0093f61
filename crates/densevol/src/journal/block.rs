// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory recovery journal blocks.
//!
//! A block buffer moves through `Free -> Active -> Committing -> Committed`
//! and back to `Free` when its buffer is recycled for a later sequence
//! number. Commit waiters ride on the block and are released when its write
//! completes.

use crate::journal::format::{
    compute_check_byte, RecoveryBlockHeader, RecoveryJournalEntry, RECOVERY_JOURNAL_METADATA_TYPE,
};
use crate::journal::point::JournalPoint;
use crate::rt::{Completion, WaitQueue};
use crate::status::Result;
use crate::types::{BlockCount, JournalEntryCount, JournalOperation, SequenceNumber, BLOCK_SIZE};

/// Lifecycle state of a block buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Active,
    Committing,
    Committed,
}

pub struct RecoveryJournalBlock {
    state: BlockState,
    sequence_number: SequenceNumber,
    /// Ring offset of this block in the journal partition.
    block_number: BlockCount,
    entries: Vec<RecoveryJournalEntry>,
    has_block_map_increments: bool,
    commit_waiters: WaitQueue<Completion>,
}

impl RecoveryJournalBlock {
    pub fn new() -> Self {
        RecoveryJournalBlock {
            state: BlockState::Free,
            sequence_number: 0,
            block_number: 0,
            entries: Vec::new(),
            has_block_map_increments: false,
            commit_waiters: WaitQueue::new(),
        }
    }

    /// Reuse a free buffer for a new sequence number.
    pub fn activate(&mut self, sequence_number: SequenceNumber, block_number: BlockCount) {
        debug_assert_eq!(self.state, BlockState::Free);
        debug_assert!(self.entries.is_empty());
        self.state = BlockState::Active;
        self.sequence_number = sequence_number;
        self.block_number = block_number;
        self.has_block_map_increments = false;
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn block_number(&self) -> BlockCount {
        self.block_number
    }

    pub fn entry_count(&self) -> JournalEntryCount {
        self.entries.len() as JournalEntryCount
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self, entries_per_block: JournalEntryCount) -> bool {
        self.entry_count() >= entries_per_block
    }

    /// A dirty block has waiters whose entries are not yet acknowledged.
    pub fn is_dirty(&self) -> bool {
        self.commit_waiters.has_waiters()
    }

    /// Append an entry, returning the journal point it occupies.
    pub fn add_entry(
        &mut self,
        entry: RecoveryJournalEntry,
        on_commit: Option<Completion>,
    ) -> JournalPoint {
        debug_assert_eq!(self.state, BlockState::Active);
        let point = JournalPoint::new(self.sequence_number, self.entry_count());
        if entry.operation == JournalOperation::BlockMapIncrement {
            self.has_block_map_increments = true;
        }
        self.entries.push(entry);
        if let Some(waiter) = on_commit {
            self.commit_waiters.enqueue(waiter);
        }
        point
    }

    /// Pack the block for writing. `header` carries the journal-wide fields;
    /// the block fills in its own sequence, entry count, check byte, and
    /// block-map-increment flag.
    pub fn pack(&mut self, mut header: RecoveryBlockHeader) -> Vec<u8> {
        debug_assert_eq!(self.state, BlockState::Active);
        self.state = BlockState::Committing;

        header.sequence_number = self.sequence_number;
        header.entry_count = self.entry_count();
        header.check_byte = compute_check_byte(self.sequence_number);
        header.metadata_type = RECOVERY_JOURNAL_METADATA_TYPE;
        header.has_block_map_increments = self.has_block_map_increments;

        let mut block = vec![0u8; BLOCK_SIZE];
        header.pack_into(&mut block);
        for (index, entry) in self.entries.iter().enumerate() {
            entry.pack_into(&mut block, index as JournalEntryCount);
        }
        block
    }

    /// The block's write finished; release every commit waiter with
    /// `result` and mark the block committed.
    pub fn finish_committing(&mut self, result: &Result<()>) {
        debug_assert_eq!(self.state, BlockState::Committing);
        self.state = BlockState::Committed;
        let sequence_number = self.sequence_number;
        self.commit_waiters.notify_all(|waiter| {
            waiter(match result {
                Ok(()) => Ok(()),
                Err(e) => Err(crate::status::Error::CorruptJournal(format!(
                    "journal block {sequence_number} failed to commit: {e}"
                ))),
            })
        });
    }

    /// Recycle the buffer onto the free pool.
    pub fn recycle(&mut self) {
        debug_assert!(!self.is_dirty());
        self.state = BlockState::Free;
        self.sequence_number = 0;
        self.block_number = 0;
        self.entries.clear();
        self.has_block_map_increments = false;
    }
}

impl Default for RecoveryJournalBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::format::{BlockMapSlot, RecoveryBlockHeader};
    use crate::types::{DataLocation, MappingState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_entry() -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataIncrement,
            slot: BlockMapSlot { pbn: 10, slot: 3 },
            mapping: DataLocation {
                pbn: 200,
                state: MappingState::Uncompressed,
            },
            unmapping: DataLocation::unmapped(),
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut block = RecoveryJournalBlock::new();
        assert_eq!(block.state(), BlockState::Free);

        block.activate(5, 1);
        assert_eq!(block.state(), BlockState::Active);
        assert!(block.is_empty());

        let point = block.add_entry(sample_entry(), None);
        assert_eq!(point, JournalPoint::new(5, 0));
        let point = block.add_entry(sample_entry(), None);
        assert_eq!(point, JournalPoint::new(5, 1));

        let packed = block.pack(RecoveryBlockHeader::default());
        assert_eq!(block.state(), BlockState::Committing);
        let header = RecoveryBlockHeader::unpack(&packed);
        assert_eq!(header.sequence_number, 5);
        assert_eq!(header.entry_count, 2);
        assert_eq!(header.check_byte, compute_check_byte(5));

        block.finish_committing(&Ok(()));
        assert_eq!(block.state(), BlockState::Committed);

        block.recycle();
        assert_eq!(block.state(), BlockState::Free);
        assert!(block.is_empty());
    }

    #[test]
    fn test_commit_waiters_released_once() {
        let mut block = RecoveryJournalBlock::new();
        block.activate(1, 1);

        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired = fired.clone();
            block.add_entry(
                sample_entry(),
                Some(Box::new(move |result| {
                    result.expect("commit should succeed");
                    fired.fetch_add(1, Ordering::Relaxed);
                })),
            );
        }
        assert!(block.is_dirty());

        block.pack(RecoveryBlockHeader::default());
        block.finish_committing(&Ok(()));
        assert_eq!(fired.load(Ordering::Relaxed), 3);
        assert!(!block.is_dirty());
    }

    #[test]
    fn test_block_map_increment_sets_flag() {
        let mut block = RecoveryJournalBlock::new();
        block.activate(2, 0);
        let mut entry = sample_entry();
        entry.operation = JournalOperation::BlockMapIncrement;
        block.add_entry(entry, None);

        let packed = block.pack(RecoveryBlockHeader::default());
        assert!(RecoveryBlockHeader::unpack(&packed).has_block_map_increments);
    }
}
