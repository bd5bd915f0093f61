// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The slab depot: the physical-block allocator.
//!
//! Physical space is partitioned into equal power-of-two slabs, each with
//! its own journal and reference counts. Allocation reserves a free block
//! with a provisional reference owned by a PBN write lock; the reference
//! becomes real when the write commits through the slab journal, or is
//! released with the lock if the write abandons.

pub mod lock_pool;
pub mod pbn_lock;
pub mod ref_counts;
pub mod scrubber;
pub mod slab;
pub mod slab_journal;

use std::sync::Arc;

use crate::depot::lock_pool::PbnLockPool;
use crate::depot::pbn_lock::{PbnLock, PbnLockType};
use crate::depot::scrubber::SlabScrubber;
use crate::depot::slab::{Slab, SlabStatus};
use crate::depot::slab_journal::SlabJournal;
use crate::journal::point::JournalPoint;
use crate::layer::MetadataLayer;
use crate::notifier::ReadOnlyNotifier;
use crate::rt::Completion;
use crate::status::{Error, Result};
use crate::types::{
    BlockCount, JournalOperation, PhysicalBlockNumber, SlabCount, ThreadId, ZERO_BLOCK,
};

/// Geometry of the depot's partitions.
#[derive(Debug, Clone, Copy)]
pub struct SlabDepotConfig {
    /// First data block.
    pub first_block: PhysicalBlockNumber,
    pub slab_count: SlabCount,
    /// Data blocks per slab; a power of two.
    pub slab_size: BlockCount,
    /// First block of the slab-journal partition.
    pub journal_origin: PhysicalBlockNumber,
    /// Journal blocks per slab; a power of two.
    pub slab_journal_size: BlockCount,
    pub lock_pool_capacity: usize,
}

pub struct SlabDepot {
    slabs: Vec<Slab>,
    first_block: PhysicalBlockNumber,
    last_block: PhysicalBlockNumber,
    slab_size: BlockCount,
    lock_pool: PbnLockPool,
    pub scrubber: SlabScrubber,
    notifier: Arc<ReadOnlyNotifier>,
    thread_id: ThreadId,
    /// Round-robin starting slab for allocation.
    allocation_cursor: usize,
}

impl SlabDepot {
    pub fn new(
        layer: Arc<dyn MetadataLayer>,
        config: SlabDepotConfig,
        nonce: u64,
        notifier: Arc<ReadOnlyNotifier>,
        thread_id: ThreadId,
    ) -> Result<Self> {
        if !config.slab_size.is_power_of_two() || config.slab_size == 0 {
            return Err(Error::BadConfiguration(format!(
                "slab size {} is not a power of two",
                config.slab_size
            )));
        }
        let last_block =
            config.first_block + u64::from(config.slab_count) * config.slab_size;
        if last_block > layer.block_count() {
            return Err(Error::VolumeOverflow {
                pbn: last_block - 1,
                limit: layer.block_count(),
            });
        }

        let mut slabs = Vec::with_capacity(config.slab_count as usize);
        for index in 0..config.slab_count {
            let start = config.first_block + u64::from(index) * config.slab_size;
            let journal_origin =
                config.journal_origin + u64::from(index) * config.slab_journal_size;
            let journal = SlabJournal::new(
                layer.clone(),
                journal_origin,
                config.slab_journal_size,
                nonce,
            )?;
            let mut slab = Slab::new(index, start, start + config.slab_size, journal);
            slab.ref_counts.set_notifier(notifier.clone(), thread_id);
            slabs.push(slab);
        }

        Ok(SlabDepot {
            slabs,
            first_block: config.first_block,
            last_block,
            slab_size: config.slab_size,
            lock_pool: PbnLockPool::new(config.lock_pool_capacity),
            scrubber: SlabScrubber::new(config.slab_journal_size, notifier.clone(), thread_id),
            notifier,
            thread_id,
            allocation_cursor: 0,
        })
    }

    pub fn slab_count(&self) -> SlabCount {
        self.slabs.len() as SlabCount
    }

    pub fn slabs(&self) -> &[Slab] {
        &self.slabs
    }

    pub fn slab(&self, index: SlabCount) -> &Slab {
        &self.slabs[index as usize]
    }

    pub fn lock_pool(&self) -> &PbnLockPool {
        &self.lock_pool
    }

    pub fn free_block_count(&self) -> BlockCount {
        self.slabs
            .iter()
            .map(|slab| slab.ref_counts.free_block_count())
            .sum()
    }

    fn slab_index_for_pbn(&self, pbn: PhysicalBlockNumber) -> Result<usize> {
        if pbn < self.first_block || pbn >= self.last_block {
            return Err(Error::VolumeOverflow {
                pbn,
                limit: self.last_block,
            });
        }
        Ok(((pbn - self.first_block) / self.slab_size) as usize)
    }

    /// Whether `pbn` may appear as a data mapping: the zero block or any
    /// block inside some slab.
    pub fn is_physical_data_block(&self, pbn: PhysicalBlockNumber) -> bool {
        pbn == ZERO_BLOCK || (pbn >= self.first_block && pbn < self.last_block)
    }

    fn read_only(&self) -> Result<()> {
        if self.notifier.is_read_only(self.thread_id) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Allocate a free block: borrow a write lock, reserve the block with a
    /// provisional reference, and hand both back to the caller. Scrubs
    /// waiting slabs at high priority when no clean slab has space.
    pub fn allocate_block(&mut self) -> Result<(PhysicalBlockNumber, Arc<PbnLock>)> {
        self.read_only()?;
        match self.try_allocate() {
            Err(Error::NoSpace) if self.scrubber.has_slabs_to_scrub() => {
                let SlabDepot { scrubber, slabs, .. } = self;
                scrubber.scrub_high_priority_slabs(true, slabs)?;
                self.try_allocate()
            }
            result => result,
        }
    }

    fn try_allocate(&mut self) -> Result<(PhysicalBlockNumber, Arc<PbnLock>)> {
        let slab_total = self.slabs.len();
        for probe in 0..slab_total {
            let index = (self.allocation_cursor + probe) % slab_total;
            if !self.slabs[index].is_clean() {
                continue;
            }
            let Some(sbn) = self.slabs[index].ref_counts.find_free_block(0) else {
                continue;
            };

            let lock = self.lock_pool.borrow(PbnLockType::Write)?;
            let slab = &mut self.slabs[index];
            if let Err(e) = slab.ref_counts.provisionally_reference(sbn, Some(&lock)) {
                self.lock_pool.return_lock(lock);
                return Err(e);
            }
            self.allocation_cursor = index;
            return Ok((self.slabs[index].pbn_for(sbn), lock));
        }
        Err(Error::NoSpace)
    }

    /// Release a PBN lock back to the pool, dropping any provisional
    /// reference it still owns.
    pub fn release_lock(&mut self, pbn: PhysicalBlockNumber, lock: Arc<PbnLock>) -> Result<()> {
        if lock.has_provisional_reference() {
            let index = self.slab_index_for_pbn(pbn)?;
            let slab = &mut self.slabs[index];
            let sbn = slab.slab_block_number(pbn)?;
            lock.release_provisional_reference(sbn, &mut slab.ref_counts)?;
        }
        self.lock_pool.return_lock(lock);
        Ok(())
    }

    /// Record one reference-count change: append the slab-journal entry,
    /// then apply it to the reference counts at the entry's journal point.
    /// `on_commit` fires when the slab-journal block persists.
    pub fn adjust_reference_count(
        &mut self,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
        on_commit: Option<Completion>,
    ) -> Result<u8> {
        self.read_only()?;
        let index = self.slab_index_for_pbn(pbn)?;
        let slab = &mut self.slabs[index];
        if !slab.is_clean() {
            return Err(Error::InvalidAdminState(format!(
                "slab {} has not been scrubbed",
                slab.slab_number()
            )));
        }
        let sbn = slab.slab_block_number(pbn)?;
        let point = slab.journal.add_entry(operation, sbn, on_commit)?;
        slab.ref_counts.adjust_reference_count(sbn, operation, point)
    }

    /// The journal point the next change to `pbn`'s slab will occupy.
    pub fn next_journal_point(&self, pbn: PhysicalBlockNumber) -> Result<JournalPoint> {
        let index = self.slab_index_for_pbn(pbn)?;
        Ok(self.slabs[index].journal.next_entry_point())
    }

    /// Queue every slab that still requires scrubbing.
    pub fn register_all_for_scrubbing(&mut self) {
        let SlabDepot { scrubber, slabs, .. } = self;
        for index in 0..slabs.len() {
            if slabs[index].status == SlabStatus::RequiresScrubbing {
                scrubber.register_slab(slabs, index, false);
            }
        }
    }

    /// Replay every slab journal into its reference counts. The depot is
    /// not usable for allocation until this completes.
    pub fn scrub_all_slabs(&mut self) -> Result<()> {
        self.register_all_for_scrubbing();
        let SlabDepot { scrubber, slabs, .. } = self;
        scrubber.scrub_slabs(slabs)
    }

    /// Commit every slab journal's partial tail block and flush.
    pub fn drain(&mut self) -> Result<()> {
        let mut first_error = None;
        for slab in &mut self.slabs {
            if let Err(e) = slab.journal.drain() {
                log::error!(
                    "[SlabDepot::drain] slab {} journal drain failed: {e}",
                    slab.slab_number()
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
