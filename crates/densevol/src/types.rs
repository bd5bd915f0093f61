// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core type aliases and on-media primitives shared by every subsystem.
//!
//! All block addressing is in units of 4 KiB physical blocks. Sequence
//! numbers are never zero: zero is reserved so that an all-zero (unformatted)
//! journal block can never masquerade as a valid one.

/// Index of a 4 KiB block on the physical backing store.
pub type PhysicalBlockNumber = u64;

/// Index of a 4 KiB block in the logical address space.
pub type LogicalBlockNumber = u64;

/// Monotone journal sequence number. Valid sequence numbers start at 1.
pub type SequenceNumber = u64;

/// A count of blocks.
pub type BlockCount = u64;

/// Index of a data block within a single slab.
pub type SlabBlockNumber = u32;

/// A count of slabs.
pub type SlabCount = u32;

/// A count of zones of one kind (logical, physical, or hash).
pub type ZoneCount = u8;

/// Identifier of a worker thread (and its work queue).
pub type ThreadId = u16;

/// A count of worker threads.
pub type ThreadCount = u16;

/// Index of an entry within one journal block.
pub type JournalEntryCount = u16;

/// Fixed block size of the engine, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// The well-known physical address of the zero block. Reads of a logical
/// block mapped here return all zeroes; it is never allocated.
pub const ZERO_BLOCK: PhysicalBlockNumber = 0;

/// Marker for an absent optional thread (e.g. no bio-ack thread configured).
pub const INVALID_THREAD_ID: ThreadId = ThreadId::MAX;

/// Number of mapping slots in one block-map page.
pub const BLOCK_MAP_ENTRIES_PER_PAGE: u16 = 812;

/// The kind of reference-count change recorded by a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalOperation {
    /// A new reference to a data block.
    DataIncrement,
    /// A dropped reference to a data block.
    DataDecrement,
    /// A new reference taken by a block-map page.
    BlockMapIncrement,
}

impl JournalOperation {
    pub fn to_u8(self) -> u8 {
        match self {
            JournalOperation::DataIncrement => 0,
            JournalOperation::DataDecrement => 1,
            JournalOperation::BlockMapIncrement => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(JournalOperation::DataIncrement),
            1 => Some(JournalOperation::DataDecrement),
            2 => Some(JournalOperation::BlockMapIncrement),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JournalOperation::DataIncrement => "data increment",
            JournalOperation::DataDecrement => "data decrement",
            JournalOperation::BlockMapIncrement => "block map increment",
        }
    }

    pub fn is_increment(self) -> bool {
        !matches!(self, JournalOperation::DataDecrement)
    }
}

/// How a logical block's contents are represented at its physical location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingState {
    /// The logical block is not mapped.
    Unmapped,
    /// The block occupies its physical block whole.
    Uncompressed,
    /// The block is one compressed fragment; the payload is its slot (0..=13).
    Compressed(u8),
}

impl MappingState {
    pub fn to_u8(self) -> u8 {
        match self {
            MappingState::Unmapped => 0,
            MappingState::Uncompressed => 1,
            MappingState::Compressed(slot) => 2 + slot,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MappingState::Unmapped),
            1 => Some(MappingState::Uncompressed),
            2..=15 => Some(MappingState::Compressed(value - 2)),
            _ => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, MappingState::Compressed(_))
    }
}

/// A physical location plus the mapping state stored with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLocation {
    pub pbn: PhysicalBlockNumber,
    pub state: MappingState,
}

impl DataLocation {
    pub fn unmapped() -> Self {
        DataLocation {
            pbn: ZERO_BLOCK,
            state: MappingState::Unmapped,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.state != MappingState::Unmapped
    }

    /// A location is representable on disk iff it is either unmapped at any
    /// address, or the zero block without a compression fragment.
    pub fn is_valid(&self) -> bool {
        if self.pbn == ZERO_BLOCK {
            return !self.state.is_compressed();
        }
        self.is_mapped()
    }
}
