// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bit-exact on-disk journal formats.
//!
//! All multi-byte fields are little-endian. Unused header bytes are zero.
//! Both journals store a check byte derived from the sequence number and the
//! device nonce in every block header, so a stale or unformatted block can
//! never be mistaken for a current one.

use crate::status::{Error, Result};
use crate::types::{
    BlockCount, DataLocation, JournalEntryCount, JournalOperation, MappingState,
    PhysicalBlockNumber, SequenceNumber, BLOCK_SIZE,
};

/// Metadata type tag for recovery journal blocks.
pub const RECOVERY_JOURNAL_METADATA_TYPE: u8 = 1;

/// Metadata type tag for slab journal blocks.
pub const SLAB_JOURNAL_METADATA_TYPE: u8 = 2;

/// Size of the packed recovery journal block header.
pub const RECOVERY_BLOCK_HEADER_SIZE: usize = 64;

/// Size of one packed recovery journal entry.
pub const RECOVERY_ENTRY_SIZE: usize = 24;

/// Number of entries in one full recovery journal block (derived).
pub const RECOVERY_ENTRIES_PER_BLOCK: JournalEntryCount =
    ((BLOCK_SIZE - RECOVERY_BLOCK_HEADER_SIZE) / RECOVERY_ENTRY_SIZE) as JournalEntryCount;

/// Size of the packed slab journal block header.
pub const SLAB_JOURNAL_HEADER_SIZE: usize = 32;

/// Size of one packed slab journal entry.
pub const SLAB_JOURNAL_ENTRY_SIZE: usize = 4;

/// Number of entries in one full slab journal block (derived).
pub const SLAB_JOURNAL_ENTRIES_PER_BLOCK: JournalEntryCount =
    ((BLOCK_SIZE - SLAB_JOURNAL_HEADER_SIZE) / SLAB_JOURNAL_ENTRY_SIZE) as JournalEntryCount;

/// Physical block numbers are stored in 48 bits on disk.
const PBN_MASK: u64 = (1 << 48) - 1;

/// Derive the check byte for a block with the given sequence number.
pub fn compute_check_byte(sequence_number: SequenceNumber) -> u8 {
    ((sequence_number & 0x7F) as u8) | 0x80
}

/// The ring offset of the journal block holding `sequence_number`. Journal
/// sizes are powers of two, so the modulus is a mask.
pub fn journal_block_offset(
    journal_size: BlockCount,
    sequence_number: SequenceNumber,
) -> BlockCount {
    debug_assert!(journal_size.is_power_of_two());
    sequence_number & (journal_size - 1)
}

fn put_u16(block: &mut [u8], offset: usize, value: u16) {
    block[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(block: &mut [u8], offset: usize, value: u64) {
    block[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(block: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&block[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

fn get_u32(block: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&block[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(block: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&block[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

// ============================================================================
// Recovery journal block format
// ============================================================================

/// Unpacked header of one recovery journal block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryBlockHeader {
    pub block_map_head: SequenceNumber,
    pub slab_journal_head: SequenceNumber,
    pub sequence_number: SequenceNumber,
    pub nonce: u64,
    pub logical_blocks_used: BlockCount,
    pub block_map_data_blocks: BlockCount,
    pub entry_count: JournalEntryCount,
    pub check_byte: u8,
    pub recovery_count: u8,
    pub metadata_type: u8,
    pub has_block_map_increments: bool,
}

impl RecoveryBlockHeader {
    /// Pack this header into the first [`RECOVERY_BLOCK_HEADER_SIZE`] bytes
    /// of `block`, zeroing the reserved bytes.
    pub fn pack_into(&self, block: &mut [u8]) {
        block[..RECOVERY_BLOCK_HEADER_SIZE].fill(0);
        put_u64(block, 0, self.block_map_head);
        put_u64(block, 8, self.slab_journal_head);
        put_u64(block, 16, self.sequence_number);
        put_u64(block, 24, self.nonce);
        put_u64(block, 32, self.logical_blocks_used);
        put_u64(block, 40, self.block_map_data_blocks);
        put_u16(block, 48, self.entry_count);
        block[50] = self.check_byte;
        block[51] = self.recovery_count;
        block[52] = self.metadata_type;
        block[53] = u8::from(self.has_block_map_increments);
    }

    pub fn unpack(block: &[u8]) -> Self {
        RecoveryBlockHeader {
            block_map_head: get_u64(block, 0),
            slab_journal_head: get_u64(block, 8),
            sequence_number: get_u64(block, 16),
            nonce: get_u64(block, 24),
            logical_blocks_used: get_u64(block, 32),
            block_map_data_blocks: get_u64(block, 40),
            entry_count: get_u16(block, 48),
            check_byte: block[50],
            recovery_count: block[51],
            metadata_type: block[52],
            has_block_map_increments: block[53] != 0,
        }
    }
}

/// Where a mapping lives in the block map: the page's physical block plus
/// the slot index within the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockMapSlot {
    pub pbn: PhysicalBlockNumber,
    pub slot: u16,
}

/// One logical-to-physical mapping change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryJournalEntry {
    pub operation: JournalOperation,
    pub slot: BlockMapSlot,
    pub mapping: DataLocation,
    pub unmapping: DataLocation,
}

fn entry_offset(index: JournalEntryCount) -> usize {
    RECOVERY_BLOCK_HEADER_SIZE + (index as usize) * RECOVERY_ENTRY_SIZE
}

impl RecoveryJournalEntry {
    /// Pack into the entry slot `index` of `block`. Three little-endian
    /// words: the block-map slot, the new mapping (carrying the operation),
    /// and the old mapping.
    pub fn pack_into(&self, block: &mut [u8], index: JournalEntryCount) {
        let offset = entry_offset(index);
        let slot_word = ((self.slot.pbn & PBN_MASK) << 16) | u64::from(self.slot.slot);
        let mapping_word = ((self.mapping.pbn & PBN_MASK) << 16)
            | (u64::from(self.operation.to_u8()) << 8)
            | u64::from(self.mapping.state.to_u8());
        let unmapping_word =
            ((self.unmapping.pbn & PBN_MASK) << 16) | u64::from(self.unmapping.state.to_u8());
        put_u64(block, offset, slot_word);
        put_u64(block, offset + 8, mapping_word);
        put_u64(block, offset + 16, unmapping_word);
    }

    pub fn unpack(block: &[u8], index: JournalEntryCount) -> Result<Self> {
        let offset = entry_offset(index);
        let slot_word = get_u64(block, offset);
        let mapping_word = get_u64(block, offset + 8);
        let unmapping_word = get_u64(block, offset + 16);

        let operation = JournalOperation::from_u8(((mapping_word >> 8) & 0xFF) as u8)
            .ok_or_else(|| {
                Error::CorruptJournal(format!(
                    "entry {index} has invalid operation {}",
                    (mapping_word >> 8) & 0xFF
                ))
            })?;
        let mapping_state =
            MappingState::from_u8((mapping_word & 0xFF) as u8).ok_or_else(|| {
                Error::CorruptJournal(format!("entry {index} has invalid mapping state"))
            })?;
        let unmapping_state =
            MappingState::from_u8((unmapping_word & 0xFF) as u8).ok_or_else(|| {
                Error::CorruptJournal(format!("entry {index} has invalid unmapping state"))
            })?;

        Ok(RecoveryJournalEntry {
            operation,
            slot: BlockMapSlot {
                pbn: slot_word >> 16,
                slot: (slot_word & 0xFFFF) as u16,
            },
            mapping: DataLocation {
                pbn: mapping_word >> 16,
                state: mapping_state,
            },
            unmapping: DataLocation {
                pbn: unmapping_word >> 16,
                state: unmapping_state,
            },
        })
    }
}

// ============================================================================
// Slab journal block format
// ============================================================================

/// Unpacked header of one slab journal block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabJournalBlockHeader {
    /// The oldest sequence number still needed when this block was written.
    pub head: SequenceNumber,
    pub sequence_number: SequenceNumber,
    pub nonce: u64,
    pub entry_count: JournalEntryCount,
    pub check_byte: u8,
    pub metadata_type: u8,
    pub has_block_map_increments: bool,
}

impl SlabJournalBlockHeader {
    pub fn pack_into(&self, block: &mut [u8]) {
        block[..SLAB_JOURNAL_HEADER_SIZE].fill(0);
        put_u64(block, 0, self.head);
        put_u64(block, 8, self.sequence_number);
        put_u64(block, 16, self.nonce);
        put_u16(block, 24, self.entry_count);
        block[26] = self.check_byte;
        block[27] = self.metadata_type;
        block[28] = u8::from(self.has_block_map_increments);
    }

    pub fn unpack(block: &[u8]) -> Self {
        SlabJournalBlockHeader {
            head: get_u64(block, 0),
            sequence_number: get_u64(block, 8),
            nonce: get_u64(block, 16),
            entry_count: get_u16(block, 24),
            check_byte: block[26],
            metadata_type: block[27],
            has_block_map_increments: block[28] != 0,
        }
    }
}

/// One reference-count change within a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub sbn: u32,
    pub operation: JournalOperation,
}

fn slab_entry_offset(index: JournalEntryCount) -> usize {
    SLAB_JOURNAL_HEADER_SIZE + (index as usize) * SLAB_JOURNAL_ENTRY_SIZE
}

impl SlabJournalEntry {
    /// Pack into entry slot `index`: a little-endian u32 with the operation
    /// in the low two bits and the slab block number above it.
    pub fn pack_into(&self, block: &mut [u8], index: JournalEntryCount) {
        debug_assert!(self.sbn < (1 << 30));
        let word = (self.sbn << 2) | u32::from(self.operation.to_u8());
        put_u32(block, slab_entry_offset(index), word);
    }

    pub fn unpack(block: &[u8], index: JournalEntryCount) -> Result<Self> {
        let word = get_u32(block, slab_entry_offset(index));
        let operation = JournalOperation::from_u8((word & 0x3) as u8).ok_or_else(|| {
            Error::CorruptJournal(format!("slab journal entry {index} has invalid operation"))
        })?;
        Ok(SlabJournalEntry {
            sbn: word >> 2,
            operation,
        })
    }
}

// ============================================================================
// Versioned component state
// ============================================================================

/// A component format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionNumber {
    pub major: u32,
    pub minor: u32,
}

/// Component id of the recovery journal state in the super block.
pub const RECOVERY_JOURNAL_COMPONENT_ID: u32 = 2;

/// The current recovery journal state layout.
pub const RECOVERY_JOURNAL_STATE_VERSION: VersionNumber = VersionNumber { major: 7, minor: 0 };

const COMPONENT_HEADER_SIZE: usize = 20;
const RECOVERY_JOURNAL_STATE_SIZE: usize = 24;

/// Total encoded size of the recovery journal state, header included.
pub const RECOVERY_JOURNAL_STATE_ENCODED_SIZE: usize =
    COMPONENT_HEADER_SIZE + RECOVERY_JOURNAL_STATE_SIZE;

/// The recovery journal state as written to the super block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryJournalState70 {
    /// Sequence number at which the journal resumes.
    pub journal_start: SequenceNumber,
    pub logical_blocks_used: BlockCount,
    pub block_map_data_blocks: BlockCount,
}

impl RecoveryJournalState70 {
    /// Encode with a component header `{id, version, payload size}` followed
    /// by the three payload words.
    pub fn encode_into(&self, buffer: &mut [u8]) {
        put_u32(buffer, 0, RECOVERY_JOURNAL_COMPONENT_ID);
        put_u32(buffer, 4, RECOVERY_JOURNAL_STATE_VERSION.major);
        put_u32(buffer, 8, RECOVERY_JOURNAL_STATE_VERSION.minor);
        put_u64(buffer, 12, RECOVERY_JOURNAL_STATE_SIZE as u64);
        put_u64(buffer, 20, self.journal_start);
        put_u64(buffer, 28, self.logical_blocks_used);
        put_u64(buffer, 36, self.block_map_data_blocks);
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < RECOVERY_JOURNAL_STATE_ENCODED_SIZE {
            return Err(Error::CorruptJournal(
                "recovery journal state is truncated".to_string(),
            ));
        }
        let id = get_u32(buffer, 0);
        if id != RECOVERY_JOURNAL_COMPONENT_ID {
            return Err(Error::CorruptJournal(format!(
                "expected recovery journal component, found id {id}"
            )));
        }
        let version = VersionNumber {
            major: get_u32(buffer, 4),
            minor: get_u32(buffer, 8),
        };
        if version != RECOVERY_JOURNAL_STATE_VERSION {
            return Err(Error::CorruptJournal(format!(
                "unsupported recovery journal state version {}.{}",
                version.major, version.minor
            )));
        }
        let size = get_u64(buffer, 12);
        if size != RECOVERY_JOURNAL_STATE_SIZE as u64 {
            return Err(Error::CorruptJournal(format!(
                "recovery journal state has wrong size {size}"
            )));
        }
        Ok(RecoveryJournalState70 {
            journal_start: get_u64(buffer, 20),
            logical_blocks_used: get_u64(buffer, 28),
            block_map_data_blocks: get_u64(buffer, 36),
        })
    }
}
