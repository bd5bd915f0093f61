// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-slab journal ring.
//!
//! Each slab owns a small ring of blocks in the slab-journal partition.
//! Entries record reference-count changes; an adder fills the in-memory tail
//! block, which is committed when full or on drain. Waiters for entry
//! persistence ride the journal and are released as `next_commit` advances.
//!
//! On-disk sequence numbers within the ring form an arithmetic progression
//! modulo the ring size; a block whose header sequence is not congruent with
//! its offset is stale and ignored.

use std::sync::Arc;

use crate::journal::format::{
    compute_check_byte, journal_block_offset, SlabJournalBlockHeader, SlabJournalEntry,
    SLAB_JOURNAL_ENTRIES_PER_BLOCK, SLAB_JOURNAL_METADATA_TYPE,
};
use crate::journal::point::JournalPoint;
use crate::layer::MetadataLayer;
use crate::rt::{Completion, WaitQueue};
use crate::status::{Error, Result};
use crate::types::{
    BlockCount, JournalEntryCount, JournalOperation, PhysicalBlockNumber, SequenceNumber,
    BLOCK_SIZE,
};

struct CommitWaiter {
    point: JournalPoint,
    completion: Completion,
}

pub struct SlabJournal {
    layer: Arc<dyn MetadataLayer>,
    /// First block of this slab's ring in the slab-journal partition.
    origin: PhysicalBlockNumber,
    size: BlockCount,
    nonce: u64,
    head: SequenceNumber,
    tail: SequenceNumber,
    /// Sequence number of the next block whose write will complete; every
    /// entry before `(next_commit, 0)` is persisted.
    next_commit: SequenceNumber,
    tail_entries: Vec<SlabJournalEntry>,
    tail_has_block_map_increments: bool,
    entry_waiters: WaitQueue<CommitWaiter>,
}

impl SlabJournal {
    pub fn new(
        layer: Arc<dyn MetadataLayer>,
        origin: PhysicalBlockNumber,
        size: BlockCount,
        nonce: u64,
    ) -> Result<Self> {
        if !size.is_power_of_two() || size == 0 {
            return Err(Error::BadConfiguration(format!(
                "slab journal size {size} is not a power of two"
            )));
        }
        if origin + size > layer.block_count() {
            return Err(Error::VolumeOverflow {
                pbn: origin + size - 1,
                limit: layer.block_count(),
            });
        }
        Ok(SlabJournal {
            layer,
            origin,
            size,
            nonce,
            head: 1,
            tail: 1,
            next_commit: 1,
            tail_entries: Vec::new(),
            tail_has_block_map_increments: false,
            entry_waiters: WaitQueue::new(),
        })
    }

    pub fn size(&self) -> BlockCount {
        self.size
    }

    pub fn origin(&self) -> PhysicalBlockNumber {
        self.origin
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    pub fn next_commit(&self) -> SequenceNumber {
        self.next_commit
    }

    /// The journal point the next added entry will occupy.
    pub fn next_entry_point(&self) -> JournalPoint {
        JournalPoint::new(self.tail, self.tail_entries.len() as JournalEntryCount)
    }

    pub fn is_empty(&self) -> bool {
        self.tail == self.head && self.tail_entries.is_empty()
    }

    /// Restore the ring position after scrubbing discovered it.
    pub fn restore(&mut self, head: SequenceNumber, tail: SequenceNumber) {
        debug_assert!(self.tail_entries.is_empty());
        self.head = head;
        self.tail = tail;
        self.next_commit = tail;
    }

    /// Release ring slots now that reference counts up to `new_head` are
    /// durable.
    pub fn reap(&mut self, new_head: SequenceNumber) {
        debug_assert!(new_head >= self.head && new_head <= self.tail);
        self.head = new_head;
    }

    /// Append one entry, committing the tail block first if it is full.
    /// `on_commit` fires when the entry's block is persisted. Returns the
    /// point the entry occupies.
    pub fn add_entry(
        &mut self,
        operation: JournalOperation,
        sbn: u32,
        on_commit: Option<Completion>,
    ) -> Result<JournalPoint> {
        if self.tail_entries.len() as JournalEntryCount == SLAB_JOURNAL_ENTRIES_PER_BLOCK {
            self.commit_tail_block()?;
        }
        if self.tail - self.head >= self.size {
            log::warn!(
                "[SlabJournal::add_entry] ring full: head {} tail {}",
                self.head,
                self.tail
            );
            return Err(Error::NoSpace);
        }

        let point = self.next_entry_point();
        if operation == JournalOperation::BlockMapIncrement {
            self.tail_has_block_map_increments = true;
        }
        self.tail_entries.push(SlabJournalEntry { sbn, operation });
        if let Some(completion) = on_commit {
            self.entry_waiters.enqueue(CommitWaiter { point, completion });
        }
        Ok(point)
    }

    /// Commit the in-memory tail block, advancing `next_commit` and waking
    /// every waiter whose entry is now persisted.
    pub fn commit_tail_block(&mut self) -> Result<()> {
        if self.tail_entries.is_empty() {
            return Ok(());
        }

        let header = SlabJournalBlockHeader {
            head: self.head,
            sequence_number: self.tail,
            nonce: self.nonce,
            entry_count: self.tail_entries.len() as JournalEntryCount,
            check_byte: compute_check_byte(self.tail),
            metadata_type: SLAB_JOURNAL_METADATA_TYPE,
            has_block_map_increments: self.tail_has_block_map_increments,
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        header.pack_into(&mut block);
        for (index, entry) in self.tail_entries.iter().enumerate() {
            entry.pack_into(&mut block, index as JournalEntryCount);
        }

        let pbn = self.origin + journal_block_offset(self.size, self.tail);
        self.layer.write_block(pbn, &block)?;

        self.tail += 1;
        self.next_commit = self.tail;
        self.tail_entries.clear();
        self.tail_has_block_map_increments = false;

        let committed_before = JournalPoint::new(self.next_commit, 0);
        let mut persisted = self
            .entry_waiters
            .dequeue_matching(|waiter| waiter.point < committed_before);
        persisted.notify_all(|waiter| (waiter.completion)(Ok(())));
        Ok(())
    }

    /// Commit any partial tail block and flush.
    pub fn drain(&mut self) -> Result<()> {
        self.commit_tail_block()?;
        self.layer.flush()
    }

    /// Read the whole ring into `buffer` (resized to `size * BLOCK_SIZE`).
    pub fn read_ring(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.resize((self.size as usize) * BLOCK_SIZE, 0);
        for offset in 0..self.size {
            let start = (offset as usize) * BLOCK_SIZE;
            self.layer.read_block(
                self.origin + offset,
                &mut buffer[start..start + BLOCK_SIZE],
            )?;
        }
        Ok(())
    }

    /// Whether `header` describes a live block for this journal at ring
    /// offset `offset`.
    pub fn is_valid_block_header(
        &self,
        header: &SlabJournalBlockHeader,
        offset: BlockCount,
    ) -> bool {
        header.metadata_type == SLAB_JOURNAL_METADATA_TYPE
            && header.nonce == self.nonce
            && header.check_byte == compute_check_byte(header.sequence_number)
            && header.entry_count <= SLAB_JOURNAL_ENTRIES_PER_BLOCK
            && journal_block_offset(self.size, header.sequence_number) == offset
    }
}
