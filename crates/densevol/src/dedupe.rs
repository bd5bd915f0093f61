// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Contract with the deduplication index.
//!
//! The engine submits one request per write carrying the 16-byte record
//! name of the block's contents; the index eventually answers with a
//! physical-block advice or nothing. The engine never assumes timeliness: a
//! request outstanding past the configured timeout is treated as "no
//! advice" and the write proceeds without deduplication.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{DataLocation, MappingState, PhysicalBlockNumber};

/// The operations the engine issues against the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeOperation {
    /// Look up the name and record this write's location as its advice.
    Post,
    /// Look up the name without updating the index.
    Query,
    /// Overwrite the advice recorded for the name.
    Update,
}

/// Content hash of one 4 KiB block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordName(pub [u8; 16]);

/// A request submitted to the index.
#[derive(Debug, Clone, Copy)]
pub struct DedupeRequest {
    pub operation: DedupeOperation,
    pub name: RecordName,
    /// The location this write is headed to, offered as new advice for
    /// `Post` and `Update`.
    pub new_advice: Option<DataLocation>,
}

/// Advice returned by the index: where a byte-identical block already
/// lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupeAdvice {
    pub pbn: PhysicalBlockNumber,
    pub state: MappingState,
}

/// Completion invoked by the index: `None` means no advice.
pub type AdviceCallback = Box<dyn FnOnce(Option<DedupeAdvice>) + Send + 'static>;

/// The index as the engine sees it.
pub trait DedupeIndex: Send + Sync {
    /// Submit a request; `callback` fires exactly once, on any thread.
    fn enqueue(&self, request: DedupeRequest, callback: AdviceCallback);
}

/// Timeouts for index queries, checked by a periodic timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupeTimeoutConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DedupeTimeoutConfig {
    fn default() -> Self {
        DedupeTimeoutConfig {
            timeout_ms: 5000,
            poll_interval_ms: 1000,
        }
    }
}

/// Counter of timed-out index requests, reported at a coarse interval so a
/// wedged index does not flood the log.
#[derive(Debug, Default)]
pub struct DedupeTimeoutCounter {
    timeouts: AtomicU64,
    reported: AtomicU64,
}

impl DedupeTimeoutCounter {
    const REPORT_INTERVAL: u64 = 1000;

    pub fn record_timeout(&self) {
        let total = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        let reported = self.reported.load(Ordering::Relaxed);
        if total - reported >= Self::REPORT_INTERVAL
            && self
                .reported
                .compare_exchange(reported, total, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            log::warn!("[DedupeTimeoutCounter] {total} dedupe queries timed out so far");
        }
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

/// An index that never has advice. Used when deduplication is disabled.
pub struct DisabledIndex;

impl DedupeIndex for DisabledIndex {
    fn enqueue(&self, _request: DedupeRequest, callback: AdviceCallback) {
        callback(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_disabled_index_answers_no_advice() {
        let index = DisabledIndex;
        let answered = Arc::new(AtomicBool::new(false));
        let flag = answered.clone();
        index.enqueue(
            DedupeRequest {
                operation: DedupeOperation::Query,
                name: RecordName([7u8; 16]),
                new_advice: None,
            },
            Box::new(move |advice| {
                assert!(advice.is_none());
                flag.store(true, Ordering::Relaxed);
            }),
        );
        assert!(answered.load(Ordering::Relaxed));
    }

    #[test]
    fn test_timeout_counter_counts() {
        let counter = DedupeTimeoutCounter::default();
        for _ in 0..10 {
            counter.record_timeout();
        }
        assert_eq!(counter.timeout_count(), 10);
    }

    #[test]
    fn test_default_timeouts() {
        let config = DedupeTimeoutConfig::default();
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.poll_interval_ms, 1000);
    }
}
