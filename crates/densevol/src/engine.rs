// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-level composition: zones, notifier, recovery journal, and depot,
//! plus the load and suspend pipelines.
//!
//! The physical layout is: super block at block 0, the recovery journal
//! partition, the slab-journal partition, then the slab data blocks.

use std::sync::Arc;

use crossbeam::channel;
use parking_lot::Mutex;

use crate::admin::state::{AdminState, AdminStateCode};
use crate::admin::suspend::{DrainTarget, NoopDrainTarget, SuspendPhase};
use crate::config::DeviceConfig;
use crate::depot::{SlabDepot, SlabDepotConfig};
use crate::journal::recovery::{JournalDiscovery, RecoveryJournal};
use crate::journal::super_block::{PartitionId, PartitionRecord, SuperBlock};
use crate::layer::MetadataLayer;
use crate::notifier::ReadOnlyNotifier;
use crate::rt::ZoneSet;
use crate::status::{Error, Result};
use crate::thread_config::ThreadConfig;
use crate::types::SlabCount;

/// Sizes of the metadata structures, fixed at format time.
#[derive(Debug, Clone, Copy)]
pub struct EngineGeometry {
    /// Recovery journal blocks; a power of two.
    pub journal_size: u64,
    pub slab_count: SlabCount,
    /// Data blocks per slab; a power of two.
    pub slab_size: u64,
    /// Journal blocks per slab; a power of two.
    pub slab_journal_size: u64,
    pub lock_pool_capacity: usize,
}

impl EngineGeometry {
    fn journal_origin(&self) -> u64 {
        1
    }

    fn slab_journal_origin(&self) -> u64 {
        self.journal_origin() + self.journal_size
    }

    fn data_origin(&self) -> u64 {
        self.slab_journal_origin() + u64::from(self.slab_count) * self.slab_journal_size
    }

    fn total_blocks(&self) -> u64 {
        self.data_origin() + u64::from(self.slab_count) * self.slab_size
    }

    fn partitions(&self) -> Vec<PartitionRecord> {
        vec![
            PartitionRecord {
                id: PartitionId::RecoveryJournal,
                offset: self.journal_origin(),
                count: self.journal_size,
            },
            PartitionRecord {
                id: PartitionId::SlabJournals,
                offset: self.slab_journal_origin(),
                count: u64::from(self.slab_count) * self.slab_journal_size,
            },
            PartitionRecord {
                id: PartitionId::SlabData,
                offset: self.data_origin(),
                count: u64::from(self.slab_count) * self.slab_size,
            },
        ]
    }
}

/// External subsystems drained by the suspend pipeline.
pub struct ExternalTargets {
    pub packer: Arc<Mutex<dyn DrainTarget>>,
    pub data_vios: Arc<Mutex<dyn DrainTarget>>,
    pub flusher: Arc<Mutex<dyn DrainTarget>>,
    pub logical_zones: Arc<Mutex<dyn DrainTarget>>,
    pub block_map: Arc<Mutex<dyn DrainTarget>>,
}

fn noop_target() -> Arc<Mutex<dyn DrainTarget>> {
    Arc::new(Mutex::new(NoopDrainTarget))
}

impl Default for ExternalTargets {
    fn default() -> Self {
        ExternalTargets {
            packer: noop_target(),
            data_vios: noop_target(),
            flusher: noop_target(),
            logical_zones: noop_target(),
            block_map: noop_target(),
        }
    }
}

pub struct Engine {
    config: DeviceConfig,
    geometry: EngineGeometry,
    thread_config: ThreadConfig,
    zones: Arc<ZoneSet>,
    notifier: Arc<ReadOnlyNotifier>,
    layer: Arc<dyn MetadataLayer>,
    journal: Arc<Mutex<RecoveryJournal>>,
    depot: Arc<Mutex<SlabDepot>>,
    super_block: Mutex<SuperBlock>,
    admin_state: Mutex<AdminState>,
    targets: Mutex<ExternalTargets>,
    discovery: JournalDiscovery,
}

impl Engine {
    /// Write a fresh super block for an empty device, then load it.
    pub fn format(
        config: DeviceConfig,
        geometry: EngineGeometry,
        layer: Arc<dyn MetadataLayer>,
        nonce: u64,
    ) -> Result<Engine> {
        config.validate()?;
        if geometry.total_blocks() > layer.block_count() {
            return Err(Error::VolumeOverflow {
                pbn: geometry.total_blocks() - 1,
                limit: layer.block_count(),
            });
        }

        let super_block = SuperBlock::new(nonce, geometry.partitions());
        layer.write_block(0, &super_block.encode())?;
        layer.flush()?;
        Self::load(config, geometry, layer)
    }

    /// Load a formatted device: decode the super block, discover the live
    /// recovery journal, and scrub every slab before the depot is usable.
    pub fn load(
        config: DeviceConfig,
        geometry: EngineGeometry,
        layer: Arc<dyn MetadataLayer>,
    ) -> Result<Engine> {
        config.validate()?;

        let mut block = vec![0u8; crate::types::BLOCK_SIZE];
        layer.read_block(0, &mut block)?;
        let super_block = SuperBlock::decode(&block)?;

        let journal_partition = super_block
            .partition(PartitionId::RecoveryJournal)
            .copied()
            .ok_or_else(|| {
                Error::CorruptJournal("super block has no recovery journal partition".to_string())
            })?;
        if journal_partition.count != geometry.journal_size {
            return Err(Error::BadConfiguration(format!(
                "journal partition holds {} blocks, configuration expects {}",
                journal_partition.count, geometry.journal_size
            )));
        }

        let thread_config = ThreadConfig::new(&config.thread_counts);
        let zones = Arc::new(ZoneSet::new(&thread_config));
        let notifier = ReadOnlyNotifier::new(
            false,
            thread_config.base_thread_count(),
            thread_config.admin_thread(),
            zones.clone(),
        );

        let mut journal = RecoveryJournal::new(
            layer.clone(),
            journal_partition.offset,
            journal_partition.count,
            super_block.nonce,
            super_block.recovery_count,
            super_block.journal_state,
            notifier.clone(),
            thread_config.journal_thread(),
        )?;
        let discovery = journal.find_head_and_tail()?;
        if discovery.found_entries {
            log::info!(
                "[Engine::load] recovery journal tail {} (block map head {}, \
                 slab journal head {})",
                discovery.tail,
                discovery.block_map_head,
                discovery.slab_journal_head
            );
            journal.resume_from_discovery(&discovery);
        }

        let mut depot = SlabDepot::new(
            layer.clone(),
            SlabDepotConfig {
                first_block: geometry.data_origin(),
                slab_count: geometry.slab_count,
                slab_size: geometry.slab_size,
                journal_origin: geometry.slab_journal_origin(),
                slab_journal_size: geometry.slab_journal_size,
                lock_pool_capacity: geometry.lock_pool_capacity,
            },
            super_block.nonce,
            notifier.clone(),
            thread_config.physical_thread(0),
        )?;
        depot.scrub_all_slabs()?;

        Ok(Engine {
            config,
            geometry,
            thread_config,
            zones,
            notifier,
            layer,
            journal: Arc::new(Mutex::new(journal)),
            depot: Arc::new(Mutex::new(depot)),
            super_block: Mutex::new(super_block),
            admin_state: Mutex::new(AdminState::default()),
            targets: Mutex::new(ExternalTargets::default()),
            discovery,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn geometry(&self) -> EngineGeometry {
        self.geometry
    }

    pub fn thread_config(&self) -> &ThreadConfig {
        &self.thread_config
    }

    pub fn journal(&self) -> &Arc<Mutex<RecoveryJournal>> {
        &self.journal
    }

    pub fn depot(&self) -> &Arc<Mutex<SlabDepot>> {
        &self.depot
    }

    pub fn notifier(&self) -> &Arc<ReadOnlyNotifier> {
        &self.notifier
    }

    /// What the journal scan found at load time.
    pub fn discovery(&self) -> JournalDiscovery {
        self.discovery
    }

    pub fn set_external_targets(&self, targets: ExternalTargets) {
        *self.targets.lock() = targets;
    }

    pub fn is_read_only(&self) -> bool {
        self.notifier
            .is_read_only(self.thread_config.admin_thread())
    }

    pub fn enter_read_only(&self, error_code: u32) {
        self.notifier
            .enter_read_only(self.thread_config.admin_thread(), error_code);
    }

    fn drain_external(
        &self,
        target: Arc<Mutex<dyn DrainTarget>>,
        thread: crate::types::ThreadId,
        operation: AdminStateCode,
    ) -> Result<()> {
        self.zones
            .run_blocking(thread, move || target.lock().drain(operation))
    }

    /// Run the suspend pipeline. With `save`, the super block is rewritten
    /// with the journal state so the next load resumes cleanly. A device
    /// that went read-only still suspends; only a suspend from an invalid
    /// state fails.
    pub fn suspend(&self, save: bool) -> Result<()> {
        let operation = if save {
            AdminStateCode::Saving
        } else {
            AdminStateCode::Suspending
        };
        {
            let mut admin = self.admin_state.lock();
            if admin.is_quiescent() {
                log::error!("[Engine::suspend] suspend invoked while already suspended");
                return Err(Error::InvalidAdminState(
                    "suspend invoked while suspended".to_string(),
                ));
            }
            admin.start_draining(operation);
        }

        let mut first_error: Option<Error> = None;
        let record = |result: Result<()>, first_error: &mut Option<Error>| {
            if let Err(e) = result {
                log::debug!("[Engine::suspend] phase error: {e}");
                first_error.get_or_insert(e);
            }
        };

        let mut phase = SuspendPhase::first();
        loop {
            let thread = phase.thread(&self.thread_config);
            match phase {
                SuspendPhase::Start => {}
                SuspendPhase::Packer => {
                    // A device that was resumed read-only may have skipped
                    // resuming some components; surfacing the read-only
                    // error here guarantees the suspend result is ReadOnly
                    // rather than a spurious admin-state failure.
                    if self.is_read_only() {
                        first_error.get_or_insert(Error::ReadOnly);
                    }
                    let target = self.targets.lock().packer.clone();
                    record(
                        self.drain_external(target, thread, operation),
                        &mut first_error,
                    );
                }
                SuspendPhase::DataVios => {
                    let target = self.targets.lock().data_vios.clone();
                    record(
                        self.drain_external(target, thread, operation),
                        &mut first_error,
                    );
                }
                SuspendPhase::Flushes => {
                    let target = self.targets.lock().flusher.clone();
                    record(
                        self.drain_external(target, thread, operation),
                        &mut first_error,
                    );
                }
                SuspendPhase::LogicalZones => {
                    // A suspended device is expected to have persisted all
                    // data written before the suspend.
                    if let Err(e) = self.layer.flush() {
                        self.enter_read_only(e.code());
                        record(Err(e), &mut first_error);
                    }
                    let target = self.targets.lock().logical_zones.clone();
                    record(
                        self.drain_external(target, thread, operation),
                        &mut first_error,
                    );
                }
                SuspendPhase::BlockMap => {
                    let target = self.targets.lock().block_map.clone();
                    record(
                        self.drain_external(target, thread, operation),
                        &mut first_error,
                    );
                }
                SuspendPhase::Journal => {
                    let journal = self.journal.clone();
                    record(
                        self.zones.run_blocking(thread, move || journal.lock().drain()),
                        &mut first_error,
                    );
                }
                SuspendPhase::Depot => {
                    let depot = self.depot.clone();
                    record(
                        self.zones.run_blocking(thread, move || depot.lock().drain()),
                        &mut first_error,
                    );
                }
                SuspendPhase::ReadOnlyWait => {
                    let notifier = self.notifier.clone();
                    let (tx, rx) = channel::bounded(1);
                    self.zones.submit(thread, move || {
                        notifier.wait_until_not_entering_read_only_mode(Box::new(
                            move |result| {
                                let _ = tx.send(result);
                            },
                        ));
                    });
                    match rx.recv() {
                        Ok(result) => record(result, &mut first_error),
                        Err(_) => record(Err(Error::ComponentBusy), &mut first_error),
                    }
                }
                SuspendPhase::WriteSuperBlock => {
                    if save && first_error.is_none() {
                        record(self.write_super_block(), &mut first_error);
                    }
                }
                SuspendPhase::End => break,
            }
            phase = phase.next();
        }

        self.admin_state.lock().finish_draining();
        match first_error {
            None => {
                log::info!("[Engine::suspend] device suspended");
                Ok(())
            }
            Some(Error::ReadOnly) => {
                // A read-only suspension still leaves the device suspended.
                log::info!("[Engine::suspend] device suspended (read-only)");
                Ok(())
            }
            Some(e) => {
                log::error!("[Engine::suspend] suspend failed: {e}");
                Err(e)
            }
        }
    }

    fn write_super_block(&self) -> Result<()> {
        let state = self.journal.lock().state();
        let mut super_block = self.super_block.lock();
        super_block.journal_state = state;
        self.layer.write_block(0, &super_block.encode())?;
        self.layer.flush()
    }

    /// Resume a suspended device. Notifications disabled by the suspend are
    /// re-allowed first; an error recorded while they were disabled
    /// notifies now. A read-only device stays suspended and refuses new
    /// I/O.
    pub fn resume(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }

        let notifier = self.notifier.clone();
        let (tx, rx) = channel::bounded(1);
        self.zones
            .submit(self.thread_config.admin_thread(), move || {
                notifier.allow_read_only_mode_entry(Box::new(move |result| {
                    let _ = tx.send(result);
                }));
            });
        match rx.recv() {
            Ok(result) => result?,
            Err(_) => return Err(Error::ComponentBusy),
        }

        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        self.admin_state.lock().resume_if_quiescent()
    }
}
