// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Static assignment of zones to worker threads.
//!
//! Thread ids are assigned sequentially: admin/journal (one id), packer, then
//! the logical, physical, and hash zones, then dedupe, the optional bio-ack
//! thread, cpu, and finally the bio submission threads. If all three zone
//! counts are zero, a single thread serves logical, physical, hash, packer,
//! and journal duty (a dev-only configuration).

use crate::config::ThreadCountConfig;
use crate::types::{ThreadCount, ThreadId, ZoneCount, INVALID_THREAD_ID};

#[derive(Debug, Clone)]
pub struct ThreadConfig {
    logical_threads: Vec<ThreadId>,
    physical_threads: Vec<ThreadId>,
    hash_zone_threads: Vec<ThreadId>,
    bio_threads: Vec<ThreadId>,
    admin_thread: ThreadId,
    journal_thread: ThreadId,
    packer_thread: ThreadId,
    dedupe_thread: ThreadId,
    bio_ack_thread: ThreadId,
    cpu_thread: ThreadId,
    /// Threads visited by the read-only notifier: admin/journal, packer, and
    /// the zone threads. Always a prefix of the id space.
    base_thread_count: ThreadCount,
    thread_count: ThreadCount,
}

fn assign_thread_ids(next_thread: &mut ThreadCount, zone_count: ZoneCount) -> Vec<ThreadId> {
    (0..zone_count)
        .map(|_| {
            let id = *next_thread;
            *next_thread += 1;
            id
        })
        .collect()
}

impl ThreadConfig {
    pub fn new(counts: &ThreadCountConfig) -> Self {
        let mut next_thread: ThreadCount = 0;

        let zone_total = counts.logical_zones as ThreadCount
            + counts.physical_zones as ThreadCount
            + counts.hash_zones as ThreadCount;

        let config = if zone_total == 0 {
            // One thread shared by logical, physical, hash, packer, journal.
            let shared = next_thread;
            next_thread += 1;
            ThreadConfig {
                logical_threads: vec![shared],
                physical_threads: vec![shared],
                hash_zone_threads: vec![shared],
                bio_threads: Vec::new(),
                admin_thread: shared,
                journal_thread: shared,
                packer_thread: shared,
                dedupe_thread: 0,
                bio_ack_thread: INVALID_THREAD_ID,
                cpu_thread: 0,
                base_thread_count: 1,
                thread_count: 0,
            }
        } else {
            let admin_thread = next_thread;
            let journal_thread = next_thread;
            next_thread += 1;
            let packer_thread = next_thread;
            next_thread += 1;
            let logical_threads = assign_thread_ids(&mut next_thread, counts.logical_zones);
            let physical_threads = assign_thread_ids(&mut next_thread, counts.physical_zones);
            let hash_zone_threads = assign_thread_ids(&mut next_thread, counts.hash_zones);
            ThreadConfig {
                logical_threads,
                physical_threads,
                hash_zone_threads,
                bio_threads: Vec::new(),
                admin_thread,
                journal_thread,
                packer_thread,
                dedupe_thread: 0,
                bio_ack_thread: INVALID_THREAD_ID,
                cpu_thread: 0,
                base_thread_count: zone_total + 2,
                thread_count: 0,
            }
        };

        let mut config = config;
        config.dedupe_thread = next_thread;
        next_thread += 1;
        config.bio_ack_thread = if counts.bio_ack_threads > 0 {
            let id = next_thread;
            next_thread += 1;
            id
        } else {
            INVALID_THREAD_ID
        };
        config.cpu_thread = next_thread;
        next_thread += 1;
        config.bio_threads = (0..counts.bio_threads)
            .map(|_| {
                let id = next_thread;
                next_thread += 1;
                id
            })
            .collect();
        config.thread_count = next_thread;
        config
    }

    pub fn logical_zone_count(&self) -> ZoneCount {
        self.logical_threads.len() as ZoneCount
    }

    pub fn physical_zone_count(&self) -> ZoneCount {
        self.physical_threads.len() as ZoneCount
    }

    pub fn hash_zone_count(&self) -> ZoneCount {
        self.hash_zone_threads.len() as ZoneCount
    }

    pub fn logical_thread(&self, zone: ZoneCount) -> ThreadId {
        self.logical_threads[zone as usize]
    }

    pub fn physical_thread(&self, zone: ZoneCount) -> ThreadId {
        self.physical_threads[zone as usize]
    }

    pub fn hash_zone_thread(&self, zone: ZoneCount) -> ThreadId {
        self.hash_zone_threads[zone as usize]
    }

    pub fn bio_thread(&self, index: usize) -> ThreadId {
        self.bio_threads[index]
    }

    pub fn admin_thread(&self) -> ThreadId {
        self.admin_thread
    }

    pub fn journal_thread(&self) -> ThreadId {
        self.journal_thread
    }

    pub fn packer_thread(&self) -> ThreadId {
        self.packer_thread
    }

    pub fn dedupe_thread(&self) -> ThreadId {
        self.dedupe_thread
    }

    pub fn bio_ack_thread(&self) -> ThreadId {
        self.bio_ack_thread
    }

    pub fn cpu_thread(&self) -> ThreadId {
        self.cpu_thread
    }

    pub fn base_thread_count(&self) -> ThreadCount {
        self.base_thread_count
    }

    pub fn thread_count(&self) -> ThreadCount {
        self.thread_count
    }

    fn zone_thread_name(
        threads: &[ThreadId],
        id: ThreadId,
        prefix: &str,
    ) -> Option<String> {
        let first = *threads.first()?;
        if id < first {
            return None;
        }
        let index = (id - first) as usize;
        if index < threads.len() {
            Some(format!("{prefix}{index}"))
        } else {
            None
        }
    }

    /// Name for the work queue served by `id`, used to label worker threads.
    pub fn thread_name(&self, id: ThreadId) -> String {
        if self.base_thread_count == 1 && id == 0 {
            return "reqQ".to_string();
        }
        if id == self.journal_thread {
            return "journalQ".to_string();
        }
        if id == self.packer_thread {
            return "packerQ".to_string();
        }
        if id == self.dedupe_thread {
            return "dedupeQ".to_string();
        }
        if id == self.bio_ack_thread {
            return "ackQ".to_string();
        }
        if id == self.cpu_thread {
            return "cpuQ".to_string();
        }
        if let Some(name) = Self::zone_thread_name(&self.logical_threads, id, "logQ") {
            return name;
        }
        if let Some(name) = Self::zone_thread_name(&self.physical_threads, id, "physQ") {
            return name;
        }
        if let Some(name) = Self::zone_thread_name(&self.hash_zone_threads, id, "hashQ") {
            return name;
        }
        if let Some(name) = Self::zone_thread_name(&self.bio_threads, id, "bioQ") {
            return name;
        }
        format!("reqQ{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(logical: u8, physical: u8, hash: u8) -> ThreadCountConfig {
        ThreadCountConfig {
            logical_zones: logical,
            physical_zones: physical,
            hash_zones: hash,
            ..ThreadCountConfig::default()
        }
    }

    #[test]
    fn test_degenerate_config_shares_one_thread() {
        let config = ThreadConfig::new(&counts(0, 0, 0));
        assert_eq!(config.base_thread_count(), 1);
        assert_eq!(config.logical_thread(0), 0);
        assert_eq!(config.physical_thread(0), 0);
        assert_eq!(config.hash_zone_thread(0), 0);
        assert_eq!(config.journal_thread(), 0);
        assert_eq!(config.packer_thread(), 0);
        assert_eq!(config.admin_thread(), 0);
        assert_eq!(config.thread_name(0), "reqQ");
    }

    #[test]
    fn test_sequential_assignment() {
        let config = ThreadConfig::new(&counts(2, 1, 1));
        // admin == journal, then packer, then zones.
        assert_eq!(config.admin_thread(), 0);
        assert_eq!(config.journal_thread(), 0);
        assert_eq!(config.packer_thread(), 1);
        assert_eq!(config.logical_thread(0), 2);
        assert_eq!(config.logical_thread(1), 3);
        assert_eq!(config.physical_thread(0), 4);
        assert_eq!(config.hash_zone_thread(0), 5);
        assert_eq!(config.base_thread_count(), 6);
        assert_eq!(config.dedupe_thread(), 6);
        // Default counts have one bio-ack thread and four bio threads.
        assert_eq!(config.bio_ack_thread(), 7);
        assert_eq!(config.cpu_thread(), 8);
        assert_eq!(config.bio_thread(0), 9);
        assert_eq!(config.thread_count(), 13);
    }

    #[test]
    fn test_bio_ack_thread_optional() {
        let mut thread_counts = counts(1, 1, 1);
        thread_counts.bio_ack_threads = 0;
        let config = ThreadConfig::new(&thread_counts);
        assert_eq!(config.bio_ack_thread(), INVALID_THREAD_ID);
        assert_eq!(config.dedupe_thread(), 5);
        assert_eq!(config.cpu_thread(), 6);
    }

    #[test]
    fn test_thread_names() {
        let config = ThreadConfig::new(&counts(2, 1, 1));
        assert_eq!(config.thread_name(config.journal_thread()), "journalQ");
        assert_eq!(config.thread_name(config.packer_thread()), "packerQ");
        assert_eq!(config.thread_name(config.logical_thread(1)), "logQ1");
        assert_eq!(config.thread_name(config.physical_thread(0)), "physQ0");
        assert_eq!(config.thread_name(config.hash_zone_thread(0)), "hashQ0");
        assert_eq!(config.thread_name(config.dedupe_thread()), "dedupeQ");
        assert_eq!(config.thread_name(config.cpu_thread()), "cpuQ");
        assert_eq!(config.thread_name(config.bio_thread(2)), "bioQ2");
    }
}
