// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Short-lived locks on physical block numbers.
//!
//! A lock's holder-side fields are only touched by the owning physical
//! zone's thread and sit behind an uncontended mutex; the increment-claim
//! path is lock-free atomics because claims may arrive from any zone.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::depot::ref_counts::RefCounts;
use crate::status::Result;
use crate::types::SlabBlockNumber;

/// The type of a PBN lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PbnLockType {
    #[default]
    Read,
    Write,
    CompressedWrite,
    BlockMapWrite,
}

#[derive(Debug, Default)]
struct LockHolderState {
    lock_type: PbnLockType,
    /// The number of data writes holding or sharing this lock.
    holder_count: u32,
    /// Compressed-fragment writers sharing the lock while they acquire
    /// their reference to the PBN.
    fragment_locks: u8,
    /// Whether the locked PBN has been provisionally referenced on behalf
    /// of the lock holder.
    has_provisional_reference: bool,
}

/// A lock on one physical block number.
#[derive(Debug, Default)]
pub struct PbnLock {
    holder: Mutex<LockHolderState>,
    /// For read locks, the number of references that were available on the
    /// locked block when the lock was acquired.
    increment_limit: AtomicU32,
    /// The number of claims attempted over the lifetime of the lock. Each
    /// claim increments this first, so it can exceed the limit.
    increments_claimed: AtomicU32,
}

impl PbnLock {
    /// Reinitialize a zeroed lock with its type. Called when the lock is
    /// borrowed from the pool.
    pub fn initialize(&self, lock_type: PbnLockType) {
        let mut holder = self.holder.lock();
        *holder = LockHolderState {
            lock_type,
            ..LockHolderState::default()
        };
        self.increment_limit.store(0, Ordering::Release);
        self.increments_claimed.store(0, Ordering::Release);
    }

    /// Zero every field. Called when the lock returns to the pool.
    pub fn reset(&self) {
        self.initialize(PbnLockType::default());
    }

    pub fn lock_type(&self) -> PbnLockType {
        self.holder.lock().lock_type
    }

    pub fn is_read_lock(&self) -> bool {
        self.lock_type() == PbnLockType::Read
    }

    pub fn holder_count(&self) -> u32 {
        self.holder.lock().holder_count
    }

    pub fn set_holder_count(&self, count: u32) {
        self.holder.lock().holder_count = count;
    }

    pub fn acquire_fragment_lock(&self) {
        self.holder.lock().fragment_locks += 1;
    }

    pub fn release_fragment_lock(&self) {
        let mut holder = self.holder.lock();
        debug_assert!(holder.fragment_locks > 0);
        holder.fragment_locks = holder.fragment_locks.saturating_sub(1);
    }

    /// Whether nothing holds or shares the lock any longer.
    pub fn may_release(&self) -> bool {
        let holder = self.holder.lock();
        holder.holder_count == 0 && holder.fragment_locks == 0
    }

    /// Downgrade a write lock to a read lock in place. The holder count is
    /// cleared; the caller is responsible for setting the new count and the
    /// increment limit.
    pub fn downgrade_to_read(&self) {
        let mut holder = self.holder.lock();
        debug_assert_ne!(holder.lock_type, PbnLockType::Read);
        holder.lock_type = PbnLockType::Read;
        holder.holder_count = 0;
    }

    /// Set how many additional references the locked block can take before
    /// its reference count would overflow.
    pub fn set_increment_limit(&self, limit: u32) {
        self.increment_limit.store(limit, Ordering::Release);
    }

    pub fn increment_limit(&self) -> u32 {
        self.increment_limit.load(Ordering::Acquire)
    }

    pub fn increments_claimed(&self) -> u32 {
        self.increments_claimed.load(Ordering::Acquire)
    }

    /// Try to claim one of the available reference-count increments on a
    /// read lock. Lock-free; may be called from any zone. A successful claim
    /// guarantees one increment can be made without overflowing the PBN's
    /// reference count.
    pub fn claim_increment(&self) -> bool {
        let claim_number = self.increments_claimed.fetch_add(1, Ordering::AcqRel) + 1;
        claim_number <= self.increment_limit.load(Ordering::Acquire)
    }

    pub fn has_provisional_reference(&self) -> bool {
        self.holder.lock().has_provisional_reference
    }

    /// Inform the lock that it is responsible for a provisional reference.
    pub fn assign_provisional_reference(&self) {
        let mut holder = self.holder.lock();
        debug_assert!(
            !holder.has_provisional_reference,
            "lock already has a provisional reference"
        );
        holder.has_provisional_reference = true;
    }

    /// Inform the lock that it is no longer responsible for a provisional
    /// reference.
    pub fn unassign_provisional_reference(&self) {
        self.holder.lock().has_provisional_reference = false;
    }

    /// If this lock still owns a provisional reference on `sbn`, release it
    /// back to the slab's reference counts. Called when the lock is
    /// released.
    pub fn release_provisional_reference(
        &self,
        sbn: SlabBlockNumber,
        ref_counts: &mut RefCounts,
    ) -> Result<()> {
        if !self.has_provisional_reference() {
            return Ok(());
        }
        ref_counts.release_provisional_reference(sbn)?;
        self.unassign_provisional_reference();
        Ok(())
    }
}
