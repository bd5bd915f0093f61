// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The suspend pipeline's phase machine.
//!
//! Suspend is a linear walk over phases, each draining one subsystem on the
//! thread that owns it. The transition function is pure; the driver that
//! executes each phase lives with the engine. A read-only transition during
//! suspend leaves the device suspended with a `ReadOnly` result, which the
//! device layer treats as success.

use crate::admin::state::AdminStateCode;
use crate::status::Result;
use crate::thread_config::ThreadConfig;
use crate::types::ThreadId;

/// The phases of a suspend, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPhase {
    Start,
    Packer,
    DataVios,
    Flushes,
    LogicalZones,
    BlockMap,
    Journal,
    Depot,
    ReadOnlyWait,
    WriteSuperBlock,
    End,
}

impl SuspendPhase {
    pub fn first() -> Self {
        SuspendPhase::Start
    }

    /// The phase following this one. `End` is terminal.
    pub fn next(self) -> Self {
        match self {
            SuspendPhase::Start => SuspendPhase::Packer,
            SuspendPhase::Packer => SuspendPhase::DataVios,
            SuspendPhase::DataVios => SuspendPhase::Flushes,
            SuspendPhase::Flushes => SuspendPhase::LogicalZones,
            SuspendPhase::LogicalZones => SuspendPhase::BlockMap,
            SuspendPhase::BlockMap => SuspendPhase::Journal,
            SuspendPhase::Journal => SuspendPhase::Depot,
            SuspendPhase::Depot => SuspendPhase::ReadOnlyWait,
            SuspendPhase::ReadOnlyWait => SuspendPhase::WriteSuperBlock,
            SuspendPhase::WriteSuperBlock => SuspendPhase::End,
            SuspendPhase::End => SuspendPhase::End,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SuspendPhase::Start => "SUSPEND_PHASE_START",
            SuspendPhase::Packer => "SUSPEND_PHASE_PACKER",
            SuspendPhase::DataVios => "SUSPEND_PHASE_DATA_VIOS",
            SuspendPhase::Flushes => "SUSPEND_PHASE_FLUSHES",
            SuspendPhase::LogicalZones => "SUSPEND_PHASE_LOGICAL_ZONES",
            SuspendPhase::BlockMap => "SUSPEND_PHASE_BLOCK_MAP",
            SuspendPhase::Journal => "SUSPEND_PHASE_JOURNAL",
            SuspendPhase::Depot => "SUSPEND_PHASE_DEPOT",
            SuspendPhase::ReadOnlyWait => "SUSPEND_PHASE_READ_ONLY_WAIT",
            SuspendPhase::WriteSuperBlock => "SUSPEND_PHASE_WRITE_SUPER_BLOCK",
            SuspendPhase::End => "SUSPEND_PHASE_END",
        }
    }

    /// The thread a phase runs on: the packer thread for packer and flush
    /// draining, the journal thread for the journal, the admin thread for
    /// everything else.
    pub fn thread(self, config: &ThreadConfig) -> ThreadId {
        match self {
            SuspendPhase::Packer | SuspendPhase::Flushes => config.packer_thread(),
            SuspendPhase::Journal => config.journal_thread(),
            _ => config.admin_thread(),
        }
    }
}

/// An external subsystem the suspend pipeline drains (the packer, the
/// data-vio limiter, the flusher, the logical zones, the block map).
pub trait DrainTarget: Send {
    fn drain(&mut self, operation: AdminStateCode) -> Result<()>;
}

/// Drain target for subsystems absent in a given deployment.
pub struct NoopDrainTarget;

impl DrainTarget for NoopDrainTarget {
    fn drain(&mut self, _operation: AdminStateCode) -> Result<()> {
        Ok(())
    }
}
