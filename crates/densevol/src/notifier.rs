// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read-only mode entry and notification.
//!
//! Any zone may report an unrecoverable metadata error. The first error wins
//! a CAS on the stored error word; the winner then starts a notification walk
//! that visits every base thread in order, marking it read-only and invoking
//! its registered listeners exactly once. Each listener invocation is a
//! separately queued step on the zone's own worker, so other queued work
//! interleaves with the walk.
//!
//! State word transitions (values documented on the constants):
//! `MAY_NOTIFY -> NOTIFYING -> NOTIFIED`, with `MAY_NOT_NOTIFY` reachable
//! only from `MAY_NOTIFY` while the admin thread has notifications disabled.
//! `NOTIFIED` is absorbing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::rt::{Completion, ZoneSet};
use crate::status::{name_for_code, Error, SUCCESS_CODE};
use crate::types::{ThreadCount, ThreadId};

/// Notifications are allowed but not in progress.
const MAY_NOTIFY: u32 = 0;
/// A notification walk is in progress.
const NOTIFYING: u32 = 1;
/// Notifications are not allowed (admin has them disabled).
const MAY_NOT_NOTIFY: u32 = 2;
/// A notification walk has completed.
const NOTIFIED: u32 = 3;

/// A callback invoked on its registered thread when the device goes
/// read-only.
pub type ReadOnlyListener = Arc<dyn Fn() + Send + Sync + 'static>;

struct ThreadData {
    /// Each thread keeps its own notion of read-only so the flag can be
    /// checked without cross-thread synchronization. Knowledge of the
    /// transition therefore does not arrive simultaneously on all threads.
    is_read_only: AtomicBool,
    listeners: Mutex<Vec<ReadOnlyListener>>,
}

/// One-shot transition of all zones into read-only mode on fatal error.
pub struct ReadOnlyNotifier {
    read_only_error: AtomicU32,
    state: AtomicU32,
    admin_thread: ThreadId,
    threads: Vec<ThreadData>,
    waiter: Mutex<Option<Completion>>,
    zones: Arc<ZoneSet>,
}

impl ReadOnlyNotifier {
    pub fn new(
        is_read_only: bool,
        base_thread_count: ThreadCount,
        admin_thread: ThreadId,
        zones: Arc<ZoneSet>,
    ) -> Arc<Self> {
        let threads = (0..base_thread_count)
            .map(|_| ThreadData {
                is_read_only: AtomicBool::new(is_read_only),
                listeners: Mutex::new(Vec::new()),
            })
            .collect();
        Arc::new(ReadOnlyNotifier {
            read_only_error: AtomicU32::new(if is_read_only {
                Error::ReadOnly.code()
            } else {
                SUCCESS_CODE
            }),
            state: AtomicU32::new(if is_read_only { NOTIFIED } else { MAY_NOTIFY }),
            admin_thread,
            threads,
            waiter: Mutex::new(None),
            zones,
        })
    }

    /// Whether `thread` has observed the read-only transition.
    pub fn is_read_only(&self, thread: ThreadId) -> bool {
        self.threads[thread as usize]
            .is_read_only
            .load(Ordering::Acquire)
    }

    /// The code of the error that put the device into read-only mode, or
    /// `SUCCESS_CODE` if it never has been.
    pub fn read_only_error(&self) -> u32 {
        self.read_only_error.load(Ordering::Acquire)
    }

    /// Register a callback to run on `thread` when the device goes
    /// read-only. Listeners fire in registration order.
    pub fn register_listener(&self, thread: ThreadId, listener: ReadOnlyListener) {
        self.threads[thread as usize].listeners.lock().push(listener);
    }

    /// Put the device into read-only mode, recording `error_code` as the
    /// cause if no other thread got there first. Callable from any zone;
    /// `caller` is the calling zone's thread id.
    pub fn enter_read_only(self: &Arc<Self>, caller: ThreadId, error_code: u32) {
        let data = &self.threads[caller as usize];
        if data.is_read_only.load(Ordering::Acquire) {
            // This thread has already gone read-only.
            return;
        }
        data.is_read_only.store(true, Ordering::Release);

        if self
            .read_only_error
            .compare_exchange(
                SUCCESS_CODE,
                error_code,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Another thread is already driving read-only entry.
            return;
        }

        if self
            .state
            .compare_exchange(MAY_NOTIFY, NOTIFYING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Start the walk on the lowest-numbered thread. If the state was
            // MAY_NOT_NOTIFY the stored error stays pending for a later
            // allow_read_only_mode_entry() to pick up.
            self.dispatch_walk_step(0, 0);
        }
    }

    fn dispatch_walk_step(self: &Arc<Self>, thread: ThreadId, listener_index: usize) {
        let notifier = Arc::clone(self);
        let submitted = self
            .zones
            .submit(thread, move || notifier.walk_step(thread, listener_index));
        if !submitted {
            log::error!("[ReadOnlyNotifier] zone {thread} unavailable for notification");
        }
    }

    /// One step of the notification walk. Runs on `thread`'s own worker.
    fn walk_step(self: Arc<Self>, thread: ThreadId, listener_index: usize) {
        let data = &self.threads[thread as usize];
        if listener_index == 0 {
            data.is_read_only.store(true, Ordering::Release);
            if thread == 0 {
                let code = self.read_only_error();
                log::error!(
                    "[ReadOnlyNotifier] unrecoverable error ({}): entering read-only mode",
                    name_for_code(code)
                );
            }
        }

        let listener = data.listeners.lock().get(listener_index).cloned();
        if let Some(listener) = listener {
            listener();
            // Yield the zone between listeners.
            self.dispatch_walk_step(thread, listener_index + 1);
            return;
        }

        let next = thread + 1;
        if (next as usize) < self.threads.len() {
            self.dispatch_walk_step(next, 0);
            return;
        }

        // Past the last zone; finish on the admin thread.
        let admin = self.admin_thread;
        let notifier = Arc::clone(&self);
        if !self.zones.submit(admin, move || notifier.finish_notification()) {
            log::error!("[ReadOnlyNotifier] admin zone unavailable to finish notification");
        }
    }

    /// Complete a walk: mark the notifier NOTIFIED and release any parked
    /// admin waiter. Runs on the admin thread.
    fn finish_notification(self: Arc<Self>) {
        self.state.store(NOTIFIED, Ordering::Release);
        if let Some(waiter) = self.waiter.lock().take() {
            waiter(Ok(()));
        }
    }

    /// Prevent any new notification from starting, waiting out one already
    /// in progress. `parent` is completed once no notification can be
    /// running. Must be called on the admin thread.
    pub fn wait_until_not_entering_read_only_mode(&self, parent: Completion) {
        let mut waiter = self.waiter.lock();
        if waiter.is_some() {
            drop(waiter);
            parent(Err(Error::ComponentBusy));
            return;
        }

        let state = self.state.load(Ordering::Acquire);
        if state == MAY_NOT_NOTIFY || state == NOTIFIED {
            drop(waiter);
            parent(Ok(()));
            return;
        }

        if self
            .state
            .compare_exchange(
                MAY_NOTIFY,
                MAY_NOT_NOTIFY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            // No notification was in progress, and now none may start.
            drop(waiter);
            parent(Ok(()));
            return;
        }

        // A notification is in progress; park until it finishes. The walk
        // cannot finish while the admin thread is in this method, so there
        // is no race with finish_notification.
        *waiter = Some(parent);
    }

    /// Re-enable notifications, performing one immediately if an error was
    /// recorded while they were disallowed. Must be called on the admin
    /// thread.
    pub fn allow_read_only_mode_entry(self: &Arc<Self>, parent: Completion) {
        let mut waiter = self.waiter.lock();
        if waiter.is_some() {
            drop(waiter);
            parent(Err(Error::ComponentBusy));
            return;
        }

        if self
            .state
            .compare_exchange(
                MAY_NOT_NOTIFY,
                MAY_NOTIFY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Notifications were already allowed or complete.
            drop(waiter);
            parent(Ok(()));
            return;
        }

        if self.read_only_error() == SUCCESS_CODE {
            drop(waiter);
            parent(Ok(()));
            return;
        }

        // An error arrived while notifications were disallowed. If this CAS
        // fails, a racing enter_read_only() observed MAY_NOTIFY first and
        // has already started the walk.
        if self
            .state
            .compare_exchange(MAY_NOTIFY, NOTIFYING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            drop(waiter);
            parent(Ok(()));
            return;
        }

        *waiter = Some(parent);
        drop(waiter);
        self.dispatch_walk_step(0, 0);
    }
}
