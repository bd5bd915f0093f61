// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One slab: a contiguous run of data blocks with its own reference counts
//! and journal.

use crate::admin::state::{AdminState, AdminStateCode};
use crate::depot::ref_counts::RefCounts;
use crate::depot::slab_journal::SlabJournal;
use crate::status::{Error, Result};
use crate::types::{BlockCount, PhysicalBlockNumber, SlabBlockNumber, SlabCount};

/// Recovery status of a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabStatus {
    /// Reference counts are accurate.
    Rebuilt,
    /// The slab journal must be replayed before the slab is usable.
    RequiresScrubbing,
    /// Same, but the slab is needed urgently (e.g. for allocation).
    RequiresHighPriorityScrubbing,
}

pub struct Slab {
    slab_number: SlabCount,
    /// First data block of the slab.
    start: PhysicalBlockNumber,
    /// One past the last data block.
    end: PhysicalBlockNumber,
    pub journal: SlabJournal,
    pub ref_counts: RefCounts,
    pub status: SlabStatus,
    pub admin_state: AdminState,
    pub was_queued_for_scrubbing: bool,
}

impl Slab {
    pub fn new(
        slab_number: SlabCount,
        start: PhysicalBlockNumber,
        end: PhysicalBlockNumber,
        journal: SlabJournal,
    ) -> Self {
        let block_count = end - start;
        Slab {
            slab_number,
            start,
            end,
            journal,
            ref_counts: RefCounts::new(block_count),
            status: SlabStatus::RequiresScrubbing,
            admin_state: AdminState::new(AdminStateCode::Loading),
            was_queued_for_scrubbing: false,
        }
    }

    pub fn slab_number(&self) -> SlabCount {
        self.slab_number
    }

    pub fn start(&self) -> PhysicalBlockNumber {
        self.start
    }

    pub fn end(&self) -> PhysicalBlockNumber {
        self.end
    }

    pub fn block_count(&self) -> BlockCount {
        self.end - self.start
    }

    pub fn contains(&self, pbn: PhysicalBlockNumber) -> bool {
        pbn >= self.start && pbn < self.end
    }

    /// Translate an absolute PBN into this slab's block index.
    pub fn slab_block_number(&self, pbn: PhysicalBlockNumber) -> Result<SlabBlockNumber> {
        if !self.contains(pbn) {
            return Err(Error::VolumeOverflow {
                pbn,
                limit: self.end,
            });
        }
        Ok((pbn - self.start) as SlabBlockNumber)
    }

    pub fn pbn_for(&self, sbn: SlabBlockNumber) -> PhysicalBlockNumber {
        self.start + u64::from(sbn)
    }

    /// Whether the slab can satisfy allocations and refcount updates.
    pub fn is_clean(&self) -> bool {
        self.status == SlabStatus::Rebuilt
    }

    pub fn mark_clean(&mut self) {
        self.status = SlabStatus::Rebuilt;
        self.admin_state = AdminState::new(AdminStateCode::Normal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::MemoryLayer;
    use std::sync::Arc;

    fn test_slab() -> Slab {
        let layer = Arc::new(MemoryLayer::new(8));
        let journal = SlabJournal::new(layer, 0, 8, 7).expect("journal should construct");
        Slab::new(3, 100, 164, journal)
    }

    #[test]
    fn test_geometry() {
        let slab = test_slab();
        assert_eq!(slab.block_count(), 64);
        assert!(slab.contains(100));
        assert!(slab.contains(163));
        assert!(!slab.contains(164));
        assert!(!slab.contains(99));
    }

    #[test]
    fn test_sbn_translation() {
        let slab = test_slab();
        assert_eq!(slab.slab_block_number(100).expect("in range"), 0);
        assert_eq!(slab.slab_block_number(163).expect("in range"), 63);
        assert_eq!(slab.pbn_for(5), 105);
        assert!(matches!(
            slab.slab_block_number(164),
            Err(Error::VolumeOverflow { .. })
        ));
    }

    #[test]
    fn test_new_slab_requires_scrubbing() {
        let mut slab = test_slab();
        assert_eq!(slab.status, SlabStatus::RequiresScrubbing);
        assert!(!slab.is_clean());

        slab.mark_clean();
        assert!(slab.is_clean());
        assert!(slab.admin_state.is_normal());
    }
}
