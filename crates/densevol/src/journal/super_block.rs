// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The super block: format version, nonce, partition table, and the saved
//! recovery journal state.
//!
//! Version policy: versions [`MIN_VERSION`]..=[`CURRENT_VERSION`] load and
//! are rewritten at the current version on the next save. A version above
//! the current one (even within [`MAX_VERSION`]) is logged and refused; the
//! engine never silently downgrades an on-disk layout.

use crate::journal::format::{RecoveryJournalState70, RECOVERY_JOURNAL_STATE_ENCODED_SIZE};
use crate::status::{Error, Result};
use crate::types::{BlockCount, PhysicalBlockNumber, BLOCK_SIZE};

/// "densevol" in ASCII, little-endian.
pub const SUPER_BLOCK_MAGIC: u64 = u64::from_le_bytes(*b"densevol");

pub const MIN_VERSION: u32 = 1;
pub const CURRENT_VERSION: u32 = 3;
pub const MAX_VERSION: u32 = 7;

/// The fixed partitions of the physical layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionId {
    BlockMap,
    RecoveryJournal,
    SlabJournals,
    SlabData,
}

impl PartitionId {
    pub fn to_u8(self) -> u8 {
        match self {
            PartitionId::BlockMap => 0,
            PartitionId::RecoveryJournal => 1,
            PartitionId::SlabJournals => 2,
            PartitionId::SlabData => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PartitionId::BlockMap),
            1 => Some(PartitionId::RecoveryJournal),
            2 => Some(PartitionId::SlabJournals),
            3 => Some(PartitionId::SlabData),
            _ => None,
        }
    }
}

/// One entry of the partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRecord {
    pub id: PartitionId,
    pub offset: PhysicalBlockNumber,
    pub count: BlockCount,
}

const PARTITION_RECORD_SIZE: usize = 24;
const PARTITION_TABLE_OFFSET: usize = 32;
const MAX_PARTITIONS: usize = 8;

/// The decoded super block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u32,
    pub nonce: u64,
    /// Incremented on every recovery; used to disambiguate journal blocks
    /// written before and after a crash.
    pub recovery_count: u8,
    pub partitions: Vec<PartitionRecord>,
    pub journal_state: RecoveryJournalState70,
}

fn put_u32(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(block: &mut [u8], offset: usize, value: u64) {
    block[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
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

impl SuperBlock {
    pub fn new(nonce: u64, partitions: Vec<PartitionRecord>) -> Self {
        SuperBlock {
            version: CURRENT_VERSION,
            nonce,
            recovery_count: 0,
            partitions,
            journal_state: RecoveryJournalState70::default(),
        }
    }

    pub fn partition(&self, id: PartitionId) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| p.id == id)
    }

    /// Encode into a full 4 KiB block. Always writes the current version.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.partitions.len() <= MAX_PARTITIONS);
        let mut block = vec![0u8; BLOCK_SIZE];
        put_u64(&mut block, 0, SUPER_BLOCK_MAGIC);
        put_u32(&mut block, 8, CURRENT_VERSION);
        put_u32(&mut block, 12, self.partitions.len() as u32);
        put_u64(&mut block, 16, self.nonce);
        block[24] = self.recovery_count;

        let mut offset = PARTITION_TABLE_OFFSET;
        for partition in &self.partitions {
            put_u64(&mut block, offset, u64::from(partition.id.to_u8()));
            put_u64(&mut block, offset + 8, partition.offset);
            put_u64(&mut block, offset + 16, partition.count);
            offset = partition_end(offset);
        }

        let state_offset = PARTITION_TABLE_OFFSET + MAX_PARTITIONS * PARTITION_RECORD_SIZE;
        self.journal_state
            .encode_into(&mut block[state_offset..state_offset + RECOVERY_JOURNAL_STATE_ENCODED_SIZE]);
        block
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() != BLOCK_SIZE {
            return Err(Error::BadConfiguration(
                "super block must be one full block".to_string(),
            ));
        }
        let magic = get_u64(block, 0);
        if magic != SUPER_BLOCK_MAGIC {
            return Err(Error::CorruptJournal(format!(
                "super block magic mismatch ({magic:#x})"
            )));
        }

        let version = get_u32(block, 8);
        if version < MIN_VERSION || version > MAX_VERSION {
            log::error!("[SuperBlock::decode] unsupported format version {version}");
            return Err(Error::CorruptJournal(format!(
                "unsupported super block version {version}"
            )));
        }
        if version > CURRENT_VERSION {
            log::error!(
                "[SuperBlock::decode] format version {version} is newer than supported \
                 version {CURRENT_VERSION}; refusing to downgrade"
            );
            return Err(Error::CorruptJournal(format!(
                "super block version {version} is newer than supported"
            )));
        }

        let partition_count = get_u32(block, 12) as usize;
        if partition_count > MAX_PARTITIONS {
            return Err(Error::CorruptJournal(format!(
                "partition table has {partition_count} entries"
            )));
        }

        let mut partitions = Vec::with_capacity(partition_count);
        let mut offset = PARTITION_TABLE_OFFSET;
        for index in 0..partition_count {
            let raw_id = get_u64(block, offset);
            let id = u8::try_from(raw_id)
                .ok()
                .and_then(PartitionId::from_u8)
                .ok_or_else(|| {
                    Error::CorruptJournal(format!(
                        "partition {index} has unknown id {raw_id}"
                    ))
                })?;
            partitions.push(PartitionRecord {
                id,
                offset: get_u64(block, offset + 8),
                count: get_u64(block, offset + 16),
            });
            offset = partition_end(offset);
        }

        let state_offset = PARTITION_TABLE_OFFSET + MAX_PARTITIONS * PARTITION_RECORD_SIZE;
        let journal_state = RecoveryJournalState70::decode(
            &block[state_offset..state_offset + RECOVERY_JOURNAL_STATE_ENCODED_SIZE],
        )?;

        Ok(SuperBlock {
            version,
            nonce: get_u64(block, 16),
            recovery_count: block[24],
            partitions,
            journal_state,
        })
    }
}

fn partition_end(offset: usize) -> usize {
    offset + PARTITION_RECORD_SIZE
}
