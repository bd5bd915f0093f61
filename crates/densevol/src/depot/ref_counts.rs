// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-slab reference counts.
//!
//! One byte per data block: 0 is free, 1..=254 are exact counts, and 255
//! marks a provisional reference held by exactly one PBN lock during an
//! in-flight write. Every mutation carries a journal point; the stored
//! watermark is monotone non-decreasing, which makes journal replay a pure
//! fold regardless of how many times a prefix is reapplied.

use std::sync::Arc;

use crate::journal::format::SlabJournalEntry;
use crate::journal::point::JournalPoint;
use crate::notifier::ReadOnlyNotifier;
use crate::status::{Error, Result};
use crate::types::{BlockCount, JournalOperation, SlabBlockNumber, ThreadId};

/// Largest exact reference count.
pub const MAXIMUM_REFERENCE_COUNT: u8 = 254;

/// Sentinel for a provisionally referenced block.
pub const PROVISIONAL_REFERENCE_COUNT: u8 = 255;

/// A free block.
pub const EMPTY_REFERENCE_COUNT: u8 = 0;

pub struct RefCounts {
    counters: Vec<u8>,
    free_blocks: BlockCount,
    slab_journal_point: JournalPoint,
    /// Set when the owning slab is wired to a device; replay during load
    /// reports errors to the scrubber instead.
    notifier: Option<(Arc<ReadOnlyNotifier>, ThreadId)>,
}

impl RefCounts {
    pub fn new(block_count: BlockCount) -> Self {
        RefCounts {
            counters: vec![EMPTY_REFERENCE_COUNT; block_count as usize],
            free_blocks: block_count,
            slab_journal_point: JournalPoint::default(),
            notifier: None,
        }
    }

    pub fn set_notifier(&mut self, notifier: Arc<ReadOnlyNotifier>, thread_id: ThreadId) {
        self.notifier = Some((notifier, thread_id));
    }

    pub fn block_count(&self) -> BlockCount {
        self.counters.len() as BlockCount
    }

    pub fn free_block_count(&self) -> BlockCount {
        self.free_blocks
    }

    /// The number of blocks with at least one reference (provisional
    /// included).
    pub fn allocated_count(&self) -> BlockCount {
        self.counters
            .iter()
            .filter(|&&c| c != EMPTY_REFERENCE_COUNT)
            .count() as BlockCount
    }

    pub fn slab_journal_point(&self) -> JournalPoint {
        self.slab_journal_point
    }

    pub fn reference_count(&self, sbn: SlabBlockNumber) -> Result<u8> {
        self.counters
            .get(sbn as usize)
            .copied()
            .ok_or_else(|| corrupt_sbn(sbn, self.block_count()))
    }

    /// The first free block at or after `hint`, if any.
    pub fn find_free_block(&self, hint: SlabBlockNumber) -> Option<SlabBlockNumber> {
        let start = (hint as usize).min(self.counters.len());
        self.counters[start..]
            .iter()
            .position(|&c| c == EMPTY_REFERENCE_COUNT)
            .map(|offset| (start + offset) as SlabBlockNumber)
            .or_else(|| {
                self.counters[..start]
                    .iter()
                    .position(|&c| c == EMPTY_REFERENCE_COUNT)
                    .map(|index| index as SlabBlockNumber)
            })
    }

    /// Reserve a free block for an in-flight write. The count must be zero;
    /// the sentinel marks that exactly one PBN lock owns the reservation.
    pub fn provisionally_reference(
        &mut self,
        sbn: SlabBlockNumber,
        lock: Option<&crate::depot::pbn_lock::PbnLock>,
    ) -> Result<()> {
        let count = self.reference_count(sbn)?;
        if count != EMPTY_REFERENCE_COUNT {
            return Err(Error::LockError(format!(
                "cannot provisionally reference slab block {sbn} with count {count}"
            )));
        }
        self.counters[sbn as usize] = PROVISIONAL_REFERENCE_COUNT;
        self.free_blocks -= 1;
        if let Some(lock) = lock {
            lock.assign_provisional_reference();
        }
        Ok(())
    }

    /// Drop a provisional reference without it ever becoming real.
    pub fn release_provisional_reference(&mut self, sbn: SlabBlockNumber) -> Result<()> {
        let count = self.reference_count(sbn)?;
        if count != PROVISIONAL_REFERENCE_COUNT {
            return Err(Error::LockError(format!(
                "slab block {sbn} has no provisional reference to release (count {count})"
            )));
        }
        self.counters[sbn as usize] = EMPTY_REFERENCE_COUNT;
        self.free_blocks += 1;
        Ok(())
    }

    fn apply_operation(
        &mut self,
        sbn: SlabBlockNumber,
        operation: JournalOperation,
    ) -> Result<u8> {
        let count = self.reference_count(sbn)?;
        let new_count = match operation {
            JournalOperation::DataIncrement | JournalOperation::BlockMapIncrement => match count {
                // A provisional reference becomes the first real one.
                PROVISIONAL_REFERENCE_COUNT => 1,
                EMPTY_REFERENCE_COUNT => {
                    self.free_blocks -= 1;
                    1
                }
                MAXIMUM_REFERENCE_COUNT => return Err(Error::RefCountOverflow { sbn }),
                n => n + 1,
            },
            JournalOperation::DataDecrement => match count {
                EMPTY_REFERENCE_COUNT => {
                    return Err(Error::CorruptJournal(format!(
                        "decrement of free slab block {sbn}"
                    )))
                }
                // Decrementing a provisional reference abandons the write.
                PROVISIONAL_REFERENCE_COUNT | 1 => {
                    self.free_blocks += 1;
                    EMPTY_REFERENCE_COUNT
                }
                n => n - 1,
            },
        };
        self.counters[sbn as usize] = new_count;
        Ok(new_count)
    }

    /// Apply one reference-count change at `journal_point`, which must lie
    /// strictly after the current watermark. On overflow the read-only
    /// notifier is driven before the error propagates.
    pub fn adjust_reference_count(
        &mut self,
        sbn: SlabBlockNumber,
        operation: JournalOperation,
        journal_point: JournalPoint,
    ) -> Result<u8> {
        if journal_point <= self.slab_journal_point {
            return Err(Error::InvalidAdminState(format!(
                "refcount update at {journal_point:?} is behind {:?}",
                self.slab_journal_point
            )));
        }
        match self.apply_operation(sbn, operation) {
            Ok(count) => {
                self.slab_journal_point = journal_point;
                Ok(count)
            }
            Err(e) => {
                if let (Error::RefCountOverflow { .. }, Some((notifier, thread))) =
                    (&e, &self.notifier)
                {
                    log::error!(
                        "[RefCounts::adjust_reference_count] overflow at slab block {sbn}"
                    );
                    notifier.enter_read_only(*thread, e.code());
                }
                Err(e)
            }
        }
    }

    /// Replay one slab-journal entry during scrubbing. Idempotent: an entry
    /// at or before the watermark returns success without mutating.
    pub fn replay_reference_count_change(
        &mut self,
        journal_point: JournalPoint,
        entry: SlabJournalEntry,
    ) -> Result<()> {
        if journal_point <= self.slab_journal_point {
            return Ok(());
        }
        self.apply_operation(entry.sbn, entry.operation)?;
        self.slab_journal_point = journal_point;
        Ok(())
    }

    /// Forget everything; used before a full rebuild.
    pub fn reset_to_zero(&mut self) {
        self.counters.fill(EMPTY_REFERENCE_COUNT);
        self.free_blocks = self.block_count();
        self.slab_journal_point = JournalPoint::default();
    }
}

fn corrupt_sbn(sbn: SlabBlockNumber, size: BlockCount) -> Error {
    Error::CorruptJournal(format!(
        "slab block number {sbn} out of bounds (slab size {size})"
    ))
}
