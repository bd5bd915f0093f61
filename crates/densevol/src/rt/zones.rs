// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-zone worker threads.
//!
//! Each configured thread id gets one OS thread draining a FIFO queue of
//! closures. Every core entity is owned by exactly one zone; cross-entity
//! operations are dispatched as closures onto the owning zone's queue, so a
//! zone's state is only ever mutated from its own thread.

use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::thread_config::ThreadConfig;
use crate::types::{ThreadCount, ThreadId};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// The set of worker threads for one device instance.
pub struct ZoneSet {
    senders: Vec<Sender<Task>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ZoneSet {
    /// Spawn one worker per thread id in `config`, named after its queue.
    pub fn new(config: &ThreadConfig) -> Self {
        let count = config.thread_count().max(config.base_thread_count());
        let mut senders = Vec::with_capacity(count as usize);
        let mut handles = Vec::with_capacity(count as usize);
        for id in 0..count {
            let (sender, receiver) = channel::unbounded::<Task>();
            let name = config.thread_name(id);
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .unwrap_or_else(|e| panic!("failed to spawn worker thread {name}: {e}"));
            senders.push(sender);
            handles.push(handle);
        }
        ZoneSet {
            senders,
            handles: Mutex::new(handles),
        }
    }

    pub fn thread_count(&self) -> ThreadCount {
        self.senders.len() as ThreadCount
    }

    /// Enqueue `task` on the worker for `thread`. Returns false if the zone
    /// set is shutting down or the thread id is out of range.
    pub fn submit(&self, thread: ThreadId, task: impl FnOnce() + Send + 'static) -> bool {
        match self.senders.get(thread as usize) {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => {
                log::debug!("[ZoneSet::submit] no worker for thread {thread}");
                false
            }
        }
    }

    /// Run `task` on the worker for `thread` and wait for its result.
    pub fn run_blocking<R: Send + 'static>(
        &self,
        thread: ThreadId,
        task: impl FnOnce() -> R + Send + 'static,
    ) -> R {
        let (tx, rx) = channel::bounded(1);
        let submitted = self.submit(thread, move || {
            let _ = tx.send(task());
        });
        assert!(submitted, "zone worker {thread} is gone");
        rx.recv().expect("zone worker dropped result channel")
    }

    /// Wait until every queued task on every worker has run.
    pub fn quiesce(&self) {
        for thread in 0..self.thread_count() {
            self.run_blocking(thread, || {});
        }
    }
}

impl Drop for ZoneSet {
    fn drop(&mut self) {
        self.senders.clear();
        let current = std::thread::current().id();
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            if handle.thread().id() == current {
                // The last reference was dropped from inside a worker;
                // detach rather than join ourselves.
                continue;
            }
            if handle.join().is_err() {
                log::error!("[ZoneSet::drop] worker thread panicked");
            }
        }
    }
}
