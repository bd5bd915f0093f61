// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-capacity pool of PBN locks.
//!
//! Every lock is allocated up front; the hot path never allocates. Idle
//! locks are owned by the pool's free list, borrowed locks are owned by the
//! caller, and a returned lock must be the last live reference.

use std::sync::Arc;

use crate::depot::pbn_lock::{PbnLock, PbnLockType};
use crate::status::{Error, Result};

pub struct PbnLockPool {
    capacity: usize,
    borrowed: usize,
    idle: Vec<Arc<PbnLock>>,
}

impl PbnLockPool {
    pub fn new(capacity: usize) -> Self {
        PbnLockPool {
            capacity,
            borrowed: 0,
            idle: (0..capacity).map(|_| Arc::new(PbnLock::default())).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn borrowed(&self) -> usize {
        self.borrowed
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Borrow a lock, initialized with `lock_type`. Pools do not grow on
    /// demand, so this fails when every lock is on loan.
    pub fn borrow(&mut self, lock_type: PbnLockType) -> Result<Arc<PbnLock>> {
        let lock = match self.idle.pop() {
            Some(lock) => lock,
            None => {
                log::error!("[PbnLockPool::borrow] no free PBN locks left to borrow");
                return Err(Error::LockError(
                    "no free PBN locks left to borrow".to_string(),
                ));
            }
        };
        self.borrowed += 1;
        lock.initialize(lock_type);
        Ok(lock)
    }

    /// Return a borrowed lock. It must be the last live reference; the lock
    /// is zeroed before rejoining the idle list.
    pub fn return_lock(&mut self, lock: Arc<PbnLock>) {
        debug_assert!(self.borrowed > 0, "shouldn't return more than borrowed");
        if Arc::strong_count(&lock) != 1 {
            log::error!(
                "[PbnLockPool::return_lock] returned lock still has {} references",
                Arc::strong_count(&lock)
            );
        }
        lock.reset();
        self.borrowed = self.borrowed.saturating_sub(1);
        self.idle.push(lock);
    }
}

impl Drop for PbnLockPool {
    fn drop(&mut self) {
        if self.borrowed != 0 {
            log::error!(
                "[PbnLockPool::drop] {} locks are still on loan",
                self.borrowed
            );
        }
    }
}
