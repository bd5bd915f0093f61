// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The slab scrubber: replays slab journals into reference counts on load.
//!
//! Slabs wait on two lists, high-priority first. Scrubbing a slab scans its
//! journal ring for the live sequence range, replays every entry through the
//! idempotent reference-count fold, and marks the slab clean. An error
//! enters read-only mode and is preserved while the remaining cleanup
//! completes; the caller then observes `ReadOnly`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::admin::state::{AdminState, AdminStateCode};
use crate::depot::slab::{Slab, SlabStatus};
use crate::journal::format::{journal_block_offset, SlabJournalBlockHeader, SlabJournalEntry};
use crate::journal::point::JournalPoint;
use crate::notifier::ReadOnlyNotifier;
use crate::rt::{Completion, WaitQueue};
use crate::status::{Error, Result};
use crate::types::{BlockCount, SequenceNumber, ThreadId, BLOCK_SIZE};

pub struct SlabScrubber {
    high_priority_slabs: VecDeque<usize>,
    slabs: VecDeque<usize>,
    /// Read buffer sized to one slab journal.
    journal_data: Vec<u8>,
    slab_count: AtomicU64,
    high_priority_only: bool,
    admin_state: AdminState,
    waiters: WaitQueue<Completion>,
    notifier: Arc<ReadOnlyNotifier>,
    thread_id: ThreadId,
    /// First error code observed during the current scrub pass.
    first_error: Option<u32>,
}

impl SlabScrubber {
    pub fn new(
        slab_journal_size: BlockCount,
        notifier: Arc<ReadOnlyNotifier>,
        thread_id: ThreadId,
    ) -> Self {
        SlabScrubber {
            high_priority_slabs: VecDeque::new(),
            slabs: VecDeque::new(),
            journal_data: vec![0u8; (slab_journal_size as usize) * BLOCK_SIZE],
            slab_count: AtomicU64::new(0),
            high_priority_only: false,
            admin_state: AdminState::new(AdminStateCode::Suspended),
            waiters: WaitQueue::new(),
            notifier,
            thread_id,
            first_error: None,
        }
    }

    /// Number of slabs registered and not yet scrubbed clean. Counted at
    /// most once per slab.
    pub fn slab_count(&self) -> u64 {
        self.slab_count.load(Ordering::Relaxed)
    }

    pub fn first_error_code(&self) -> Option<u32> {
        self.first_error
    }

    pub fn has_slabs_to_scrub(&self) -> bool {
        !self.high_priority_slabs.is_empty() || !self.slabs.is_empty()
    }

    fn next_slab_index(&self) -> Option<usize> {
        self.high_priority_slabs
            .front()
            .or_else(|| self.slabs.front())
            .copied()
    }

    fn remove_from_lists(&mut self, index: usize) {
        self.high_priority_slabs.retain(|&i| i != index);
        self.slabs.retain(|&i| i != index);
    }

    /// Queue `slabs[index]` for scrubbing. Only effective while the slab
    /// still requires scrubbing; each slab is counted at most once.
    pub fn register_slab(&mut self, slabs: &mut [Slab], index: usize, high_priority: bool) {
        let slab = &mut slabs[index];
        if slab.status != SlabStatus::RequiresScrubbing {
            return;
        }

        self.remove_from_lists(index);
        if !slab.was_queued_for_scrubbing {
            self.slab_count.fetch_add(1, Ordering::Relaxed);
            slab.was_queued_for_scrubbing = true;
        }

        if high_priority {
            slab.status = SlabStatus::RequiresHighPriorityScrubbing;
            self.high_priority_slabs.push_back(index);
        } else {
            self.slabs.push_back(index);
        }
    }

    /// Park a waiter until some slab comes clean. Fails through the waiter
    /// with `ReadOnly` in read-only mode, or `NoSpace` when the scrubber is
    /// quiescent and can free nothing further.
    pub fn enqueue_clean_slab_waiter(&mut self, waiter: Completion) {
        if self.notifier.is_read_only(self.thread_id) {
            waiter(Err(Error::ReadOnly));
            return;
        }
        if self.admin_state.is_quiescent() {
            waiter(Err(Error::NoSpace));
            return;
        }
        self.waiters.enqueue(waiter);
    }

    fn notify_clean_slab_waiters(&mut self) {
        self.waiters.notify_all(|waiter| waiter(Ok(())));
    }

    /// Scrub every registered slab, high-priority first.
    pub fn scrub_slabs(&mut self, slabs: &mut [Slab]) -> Result<()> {
        let _ = self.admin_state.resume_if_quiescent();
        self.first_error = None;

        loop {
            self.notify_clean_slab_waiters();
            if self.notifier.is_read_only(self.thread_id) {
                self.first_error.get_or_insert(Error::ReadOnly.code());
                break;
            }

            let Some(index) = self.next_slab_index() else {
                self.high_priority_only = false;
                break;
            };
            if self.high_priority_only && self.high_priority_slabs.is_empty() {
                self.high_priority_only = false;
                break;
            }
            if self.admin_state.is_draining() {
                // Stopping takes effect between slabs.
                break;
            }

            self.remove_from_lists(index);
            match self.scrub_slab(&mut slabs[index]) {
                Ok(()) => {
                    self.slab_count.fetch_sub(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::error!(
                        "[SlabScrubber::scrub_slabs] slab {} failed: {e}",
                        slabs[index].slab_number()
                    );
                    let code = e.code();
                    self.notifier.enter_read_only(self.thread_id, code);
                    self.first_error.get_or_insert(code);
                    self.slab_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        self.finish_scrubbing()
    }

    /// Scrub registered slabs but stop once the high-priority list drains.
    /// With `at_least_one`, promotes one normal slab if no high-priority
    /// slab is queued.
    pub fn scrub_high_priority_slabs(
        &mut self,
        at_least_one: bool,
        slabs: &mut [Slab],
    ) -> Result<()> {
        if at_least_one && self.high_priority_slabs.is_empty() {
            if let Some(index) = self.next_slab_index() {
                self.register_slab(slabs, index, true);
            }
        }
        self.high_priority_only = true;
        self.scrub_slabs(slabs)
    }

    /// Request that scrubbing stop after the slab currently in progress.
    pub fn stop_scrubbing(&mut self) {
        if !self.admin_state.is_quiescent() {
            self.admin_state.start_draining(AdminStateCode::Suspending);
        }
    }

    /// Resume a stopped scrubber if it has work.
    pub fn resume_scrubbing(&mut self, slabs: &mut [Slab]) -> Result<()> {
        if !self.has_slabs_to_scrub() {
            return Ok(());
        }
        self.admin_state.resume_if_quiescent()?;
        self.scrub_slabs(slabs)
    }

    fn finish_scrubbing(&mut self) -> Result<()> {
        if !self.admin_state.finish_draining() {
            self.admin_state = AdminState::new(AdminStateCode::Suspended);
        }
        // Waiters can only be notified after draining finishes, or they
        // would requeue immediately.
        self.notify_clean_slab_waiters();

        match self.first_error {
            None => Ok(()),
            Some(_) => Err(Error::ReadOnly),
        }
    }

    /// Find the live range of one slab's journal and replay it.
    fn scrub_slab(&mut self, slab: &mut Slab) -> Result<()> {
        slab.admin_state.start_operation(AdminStateCode::Scrubbing)?;
        slab.journal.read_ring(&mut self.journal_data)?;

        let ring_size = slab.journal.size();
        let mut newest: Option<SlabJournalBlockHeader> = None;
        for offset in 0..ring_size {
            let header = self.block_header(offset);
            if !slab.journal.is_valid_block_header(&header, offset) {
                continue;
            }
            if newest
                .map(|n| header.sequence_number > n.sequence_number)
                .unwrap_or(true)
            {
                newest = Some(header);
            }
        }

        let Some(newest) = newest else {
            // Nothing was ever committed; the slab is trivially clean.
            slab.admin_state
                .start_operation(AdminStateCode::SaveForScrubbing)?;
            slab.mark_clean();
            return Ok(());
        };

        let head = newest.head;
        let tail = newest.sequence_number + 1;
        for sequence in head..tail {
            self.replay_block(slab, sequence)?;
        }
        slab.journal.restore(head, tail);

        // The refcounts are now accurate to the end of the replayed journal.
        slab.admin_state
            .start_operation(AdminStateCode::SaveForScrubbing)?;
        slab.mark_clean();
        Ok(())
    }

    fn block_header(&self, offset: BlockCount) -> SlabJournalBlockHeader {
        let start = (offset as usize) * BLOCK_SIZE;
        SlabJournalBlockHeader::unpack(&self.journal_data[start..start + BLOCK_SIZE])
    }

    fn replay_block(&mut self, slab: &mut Slab, sequence: SequenceNumber) -> Result<()> {
        let offset = journal_block_offset(slab.journal.size(), sequence);
        let start = (offset as usize) * BLOCK_SIZE;
        let block = &self.journal_data[start..start + BLOCK_SIZE];
        let header = SlabJournalBlockHeader::unpack(block);

        if header.sequence_number != sequence
            || !slab.journal.is_valid_block_header(&header, offset)
        {
            return Err(Error::CorruptJournal(format!(
                "slab journal block for slab {} was invalid",
                slab.slab_number()
            )));
        }

        let max_sbn = slab.block_count();
        for index in 0..header.entry_count {
            let entry = SlabJournalEntry::unpack(block, index)?;
            if u64::from(entry.sbn) >= max_sbn {
                return Err(Error::CorruptJournal(format!(
                    "slab journal entry ({sequence}, {index}) had invalid offset {} \
                     in slab (size {max_sbn} blocks)",
                    entry.sbn
                )));
            }
            let point = JournalPoint::new(sequence, index);
            slab.ref_counts
                .replay_reference_count_change(point, entry)
                .map_err(|e| {
                    Error::CorruptJournal(format!(
                        "slab journal entry ({sequence}, {index}) ({} of offset {}) \
                         could not be applied in slab {}: {e}",
                        entry.operation.name(),
                        entry.sbn,
                        slab.slab_number()
                    ))
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadCountConfig;
    use crate::depot::slab_journal::SlabJournal;
    use crate::layer::MemoryLayer;
    use crate::rt::ZoneSet;
    use crate::thread_config::ThreadConfig;
    use crate::types::JournalOperation;

    const NONCE: u64 = 0xBEEF;

    fn test_notifier() -> Arc<ReadOnlyNotifier> {
        let config = ThreadConfig::new(&ThreadCountConfig::default());
        let zones = Arc::new(ZoneSet::new(&config));
        ReadOnlyNotifier::new(false, 1, 0, zones)
    }

    fn slab_with_journal(layer: Arc<MemoryLayer>, origin: u64) -> Slab {
        let journal =
            SlabJournal::new(layer, origin, 4, NONCE).expect("journal should construct");
        Slab::new(0, 1000, 1064, journal)
    }

    /// Write two increments through a live slab journal, then forget the
    /// in-memory state, as a crash would.
    fn populate_journal(layer: &Arc<MemoryLayer>, origin: u64) {
        let mut journal = SlabJournal::new(layer.clone(), origin, 4, NONCE)
            .expect("journal should construct");
        journal
            .add_entry(JournalOperation::DataIncrement, 0, None)
            .expect("add should succeed");
        journal
            .add_entry(JournalOperation::DataIncrement, 1, None)
            .expect("add should succeed");
        journal.drain().expect("drain should succeed");
    }

    #[test]
    fn test_scrub_replays_journal() {
        let layer = Arc::new(MemoryLayer::new(8));
        populate_journal(&layer, 0);

        let mut slabs = vec![slab_with_journal(layer, 0)];
        let mut scrubber = SlabScrubber::new(4, test_notifier(), 0);
        scrubber.register_slab(&mut slabs, 0, false);
        assert_eq!(scrubber.slab_count(), 1);

        scrubber
            .scrub_slabs(&mut slabs)
            .expect("scrub should succeed");
        assert_eq!(scrubber.slab_count(), 0);
        assert!(slabs[0].is_clean());
        assert_eq!(slabs[0].ref_counts.reference_count(0).expect("in range"), 1);
        assert_eq!(slabs[0].ref_counts.reference_count(1).expect("in range"), 1);
        assert_eq!(slabs[0].ref_counts.reference_count(2).expect("in range"), 0);
        assert_eq!(
            slabs[0].ref_counts.slab_journal_point(),
            JournalPoint::new(1, 1)
        );
    }

    #[test]
    fn test_two_scrub_runs_agree() {
        let layer = Arc::new(MemoryLayer::new(8));
        populate_journal(&layer, 0);

        let mut results = Vec::new();
        for _ in 0..2 {
            let mut slabs = vec![slab_with_journal(layer.clone(), 0)];
            let mut scrubber = SlabScrubber::new(4, test_notifier(), 0);
            scrubber.register_slab(&mut slabs, 0, false);
            scrubber
                .scrub_slabs(&mut slabs)
                .expect("scrub should succeed");
            results.push((
                slabs[0].ref_counts.reference_count(0).expect("in range"),
                slabs[0].ref_counts.reference_count(1).expect("in range"),
                slabs[0].ref_counts.slab_journal_point(),
            ));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], (1, 1, JournalPoint::new(1, 1)));
    }

    #[test]
    fn test_empty_journal_scrubs_clean() {
        let layer = Arc::new(MemoryLayer::new(8));
        let mut slabs = vec![slab_with_journal(layer, 0)];
        let mut scrubber = SlabScrubber::new(4, test_notifier(), 0);
        scrubber.register_slab(&mut slabs, 0, false);

        scrubber
            .scrub_slabs(&mut slabs)
            .expect("scrub should succeed");
        assert!(slabs[0].is_clean());
        assert_eq!(slabs[0].ref_counts.allocated_count(), 0);
    }

    #[test]
    fn test_register_counts_each_slab_once() {
        let layer = Arc::new(MemoryLayer::new(8));
        let mut slabs = vec![slab_with_journal(layer, 0)];
        let mut scrubber = SlabScrubber::new(4, test_notifier(), 0);

        scrubber.register_slab(&mut slabs, 0, false);
        assert_eq!(scrubber.slab_count(), 1);

        // Re-registering at high priority moves the slab but counts once.
        scrubber.register_slab(&mut slabs, 0, true);
        assert_eq!(scrubber.slab_count(), 1);

        // Already high-priority: registration is a no-op.
        scrubber.register_slab(&mut slabs, 0, true);
        assert_eq!(scrubber.slab_count(), 1);
        assert_eq!(scrubber.high_priority_slabs.len(), 1);
        assert!(scrubber.slabs.is_empty());
    }

    #[test]
    fn test_high_priority_scrubbed_first() {
        let layer = Arc::new(MemoryLayer::new(16));
        populate_journal(&layer, 0);
        populate_journal(&layer, 4);

        let mut slabs = vec![
            slab_with_journal(layer.clone(), 0),
            slab_with_journal(layer, 4),
        ];
        let mut scrubber = SlabScrubber::new(4, test_notifier(), 0);
        scrubber.register_slab(&mut slabs, 0, false);
        scrubber.register_slab(&mut slabs, 1, true);

        assert_eq!(scrubber.next_slab_index(), Some(1));
        scrubber
            .scrub_slabs(&mut slabs)
            .expect("scrub should succeed");
        assert!(slabs[0].is_clean());
        assert!(slabs[1].is_clean());
    }

    #[test]
    fn test_high_priority_only_stops_at_normal_slabs() {
        let layer = Arc::new(MemoryLayer::new(16));
        let mut slabs = vec![
            slab_with_journal(layer.clone(), 0),
            slab_with_journal(layer, 4),
        ];
        let mut scrubber = SlabScrubber::new(4, test_notifier(), 0);
        scrubber.register_slab(&mut slabs, 0, false);
        scrubber.register_slab(&mut slabs, 1, true);

        scrubber
            .scrub_high_priority_slabs(false, &mut slabs)
            .expect("scrub should succeed");
        assert!(slabs[1].is_clean());
        assert!(!slabs[0].is_clean());
        assert!(scrubber.has_slabs_to_scrub());
        assert!(!scrubber.high_priority_only);
    }

    #[test]
    fn test_at_least_one_promotes_a_normal_slab() {
        let layer = Arc::new(MemoryLayer::new(8));
        let mut slabs = vec![slab_with_journal(layer, 0)];
        let mut scrubber = SlabScrubber::new(4, test_notifier(), 0);
        scrubber.register_slab(&mut slabs, 0, false);

        scrubber
            .scrub_high_priority_slabs(true, &mut slabs)
            .expect("scrub should succeed");
        assert!(slabs[0].is_clean());
        assert!(!scrubber.has_slabs_to_scrub());
    }

    #[test]
    fn test_corrupt_journal_enters_read_only() {
        let layer = Arc::new(MemoryLayer::new(16));
        populate_journal(&layer, 0);
        populate_journal(&layer, 4);

        // Corrupt the first slab's journal: a valid header claiming entries
        // beyond the slab.
        let mut journal = SlabJournal::new(layer.clone(), 0, 4, NONCE)
            .expect("journal should construct");
        journal
            .add_entry(JournalOperation::DataIncrement, 60_000, None)
            .expect("add should succeed");
        journal.drain().expect("drain should succeed");

        let notifier = test_notifier();
        let mut slabs = vec![
            slab_with_journal(layer.clone(), 0),
            slab_with_journal(layer, 4),
        ];
        let mut scrubber = SlabScrubber::new(4, notifier.clone(), 0);
        scrubber.register_slab(&mut slabs, 0, false);
        scrubber.register_slab(&mut slabs, 1, false);

        let result = scrubber.scrub_slabs(&mut slabs);
        assert!(matches!(result, Err(Error::ReadOnly)));
        assert_eq!(
            scrubber.first_error_code(),
            Some(Error::CorruptJournal(String::new()).code())
        );
        assert!(notifier.is_read_only(0));
        assert_eq!(scrubber.slab_count(), 1);
    }

    #[test]
    fn test_clean_slab_waiters() {
        let layer = Arc::new(MemoryLayer::new(8));
        let mut slabs = vec![slab_with_journal(layer, 0)];
        let notifier = test_notifier();
        let mut scrubber = SlabScrubber::new(4, notifier.clone(), 0);
        scrubber.register_slab(&mut slabs, 0, false);

        // The scrubber starts suspended, so a waiter is refused for space.
        let refused = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let refused_flag = refused.clone();
        scrubber.enqueue_clean_slab_waiter(Box::new(move |result| {
            assert!(matches!(result, Err(Error::NoSpace)));
            refused_flag.store(true, Ordering::Relaxed);
        }));
        assert!(refused.load(Ordering::Relaxed));

        // In read-only mode waiters fail fast.
        notifier.enter_read_only(0, 42);
        let rejected = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let rejected_flag = rejected.clone();
        scrubber.enqueue_clean_slab_waiter(Box::new(move |result| {
            assert!(matches!(result, Err(Error::ReadOnly)));
            rejected_flag.store(true, Ordering::Relaxed);
        }));
        assert!(rejected.load(Ordering::Relaxed));
    }

    #[test]
    fn test_stop_scrubbing_takes_effect_between_slabs() {
        let layer = Arc::new(MemoryLayer::new(16));
        let mut slabs = vec![
            slab_with_journal(layer.clone(), 0),
            slab_with_journal(layer, 4),
        ];
        let mut scrubber = SlabScrubber::new(4, test_notifier(), 0);
        scrubber.register_slab(&mut slabs, 0, false);
        scrubber.register_slab(&mut slabs, 1, false);

        // A scrubber that is asked to stop before starting scrubs nothing.
        let _ = scrubber.admin_state.resume_if_quiescent();
        scrubber.stop_scrubbing();
        scrubber
            .scrub_slabs(&mut slabs)
            .expect("stopped scrub should succeed");
        assert!(!slabs[0].is_clean());
        assert!(scrubber.has_slabs_to_scrub());

        // Resuming finishes the work.
        scrubber
            .resume_scrubbing(&mut slabs)
            .expect("resume should succeed");
        assert!(slabs[0].is_clean());
        assert!(slabs[1].is_clean());
    }
}
