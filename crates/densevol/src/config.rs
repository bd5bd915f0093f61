// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device configuration consumed from the device layer, with validation.
//!
//! All limits are enforced here so the rest of the engine can assume a
//! well-formed configuration.

use crate::status::{Error, Result};
use crate::types::{BlockCount, ZoneCount};

/// At most this many logical zones may be configured.
pub const MAX_LOGICAL_ZONES: ZoneCount = 60;

/// At most this many physical zones may be configured.
pub const MAX_PHYSICAL_ZONES: ZoneCount = 16;

/// At most this many hash zones may be configured.
pub const MAX_HASH_ZONES: ZoneCount = 100;

/// Generic per-kind thread count limit (cpu, bio, bio-ack).
pub const MAX_THREADS_PER_KIND: u8 = 100;

/// Upper bound on the bio work rotation interval.
pub const MAX_BIO_ROTATION_INTERVAL: u16 = 1024;

/// Largest permitted discard, in 4 KiB blocks.
pub const MAX_DISCARD_BLOCKS_LIMIT: BlockCount = (u32::MAX / 4096) as BlockCount;

/// Counts of each kind of worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadCountConfig {
    pub bio_ack_threads: u8,
    pub bio_threads: u8,
    pub bio_rotation_interval: u16,
    pub cpu_threads: u8,
    pub logical_zones: ZoneCount,
    pub physical_zones: ZoneCount,
    pub hash_zones: ZoneCount,
}

impl Default for ThreadCountConfig {
    fn default() -> Self {
        ThreadCountConfig {
            bio_ack_threads: 1,
            bio_threads: 4,
            bio_rotation_interval: 64,
            cpu_threads: 1,
            logical_zones: 0,
            physical_zones: 0,
            hash_zones: 0,
        }
    }
}

impl ThreadCountConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bio_threads == 0 {
            return fail("at least one 'bio' thread is required");
        }
        if self.bio_threads > MAX_THREADS_PER_KIND {
            return fail("too many 'bio' threads");
        }
        if self.bio_ack_threads > MAX_THREADS_PER_KIND {
            return fail("too many 'ack' threads");
        }
        if self.cpu_threads == 0 {
            return fail("at least one 'cpu' thread is required");
        }
        if self.cpu_threads > MAX_THREADS_PER_KIND {
            return fail("too many 'cpu' threads");
        }
        if self.bio_rotation_interval == 0 {
            return fail("'bioRotationInterval' of at least 1 is required");
        }
        if self.bio_rotation_interval > MAX_BIO_ROTATION_INTERVAL {
            return fail("'bioRotationInterval' too large");
        }
        if self.logical_zones > MAX_LOGICAL_ZONES {
            return fail("too many 'logical' threads");
        }
        if self.physical_zones > MAX_PHYSICAL_ZONES {
            return fail("too many 'physical' threads");
        }
        if self.hash_zones > MAX_HASH_ZONES {
            return fail("too many 'hash' threads");
        }

        // Either every zone kind has threads or none do.
        let zoned = [
            self.logical_zones > 0,
            self.physical_zones > 0,
            self.hash_zones > 0,
        ];
        if zoned.iter().any(|&z| z) && !zoned.iter().all(|&z| z) {
            return fail("logical, physical, and hash zones must be all zero or all non-zero");
        }

        Ok(())
    }
}

/// The full device configuration handed down by the device layer.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub physical_blocks: BlockCount,
    pub logical_blocks: BlockCount,
    /// Host-visible logical block size in bytes; 512 or 4096.
    pub logical_block_size: u32,
    /// Block-map page cache size, in blocks.
    pub cache_size: BlockCount,
    /// Maximum number of journal blocks a dirty block-map page may age.
    pub block_map_maximum_age: u32,
    pub deduplication: bool,
    pub max_discard_blocks: BlockCount,
    pub thread_counts: ThreadCountConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            physical_blocks: 0,
            logical_blocks: 0,
            logical_block_size: 4096,
            cache_size: 128,
            block_map_maximum_age: 187,
            deduplication: true,
            max_discard_blocks: 1,
            thread_counts: ThreadCountConfig::default(),
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.physical_blocks == 0 {
            return fail("physical size must be non-zero");
        }
        if self.logical_blocks == 0 {
            return fail("logical size must be non-zero");
        }
        if self.logical_block_size != 512 && self.logical_block_size != 4096 {
            return fail("logical block size must be 512 or 4096 bytes");
        }
        if self.max_discard_blocks == 0 || self.max_discard_blocks > MAX_DISCARD_BLOCKS_LIMIT {
            return fail("maximum discard size out of range");
        }
        self.thread_counts.validate()
    }
}

fn fail(reason: &str) -> Result<()> {
    log::error!("[DeviceConfig::validate] {reason}");
    Err(Error::BadConfiguration(reason.to_string()))
}
