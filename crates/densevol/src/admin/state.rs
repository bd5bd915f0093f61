// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-component admin state.
//!
//! Components drain into a quiescent state before suspend and resume out of
//! it afterwards. Operations that require a particular state fail with
//! `InvalidAdminState` rather than blocking.

use crate::status::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStateCode {
    Normal,
    Loading,
    Rebuilt,
    Scrubbing,
    SaveForScrubbing,
    Suspended,
    Resuming,
    Draining,
    Suspending,
    Saving,
}

impl AdminStateCode {
    pub fn name(self) -> &'static str {
        match self {
            AdminStateCode::Normal => "normal",
            AdminStateCode::Loading => "loading",
            AdminStateCode::Rebuilt => "rebuilt",
            AdminStateCode::Scrubbing => "scrubbing",
            AdminStateCode::SaveForScrubbing => "save for scrubbing",
            AdminStateCode::Suspended => "suspended",
            AdminStateCode::Resuming => "resuming",
            AdminStateCode::Draining => "draining",
            AdminStateCode::Suspending => "suspending",
            AdminStateCode::Saving => "saving",
        }
    }

    /// States that quiesce a component.
    pub fn is_quiescent(self) -> bool {
        matches!(self, AdminStateCode::Suspended)
    }

    /// States on the way to quiescence.
    pub fn is_draining(self) -> bool {
        matches!(
            self,
            AdminStateCode::Draining
                | AdminStateCode::Suspending
                | AdminStateCode::Saving
                | AdminStateCode::SaveForScrubbing
        )
    }
}

#[derive(Debug)]
pub struct AdminState {
    code: AdminStateCode,
}

impl AdminState {
    pub fn new(code: AdminStateCode) -> Self {
        AdminState { code }
    }

    pub fn code(&self) -> AdminStateCode {
        self.code
    }

    pub fn is_normal(&self) -> bool {
        self.code == AdminStateCode::Normal
    }

    pub fn is_quiescent(&self) -> bool {
        self.code.is_quiescent()
    }

    pub fn is_draining(&self) -> bool {
        self.code.is_draining()
    }

    /// Begin draining with `operation`. Returns false (without changing
    /// state) if the component is already quiescent.
    pub fn start_draining(&mut self, operation: AdminStateCode) -> bool {
        debug_assert!(operation.is_draining());
        if self.is_quiescent() {
            return false;
        }
        self.code = operation;
        true
    }

    /// Complete a drain. Returns true if a drain was in progress.
    pub fn finish_draining(&mut self) -> bool {
        if self.is_draining() {
            self.code = AdminStateCode::Suspended;
            true
        } else {
            false
        }
    }

    /// Leave quiescence, failing if the component is busy in another state.
    pub fn resume_if_quiescent(&mut self) -> Result<()> {
        if !self.is_quiescent() {
            return Err(Error::InvalidAdminState(format!(
                "cannot resume from {}",
                self.code.name()
            )));
        }
        self.code = AdminStateCode::Normal;
        Ok(())
    }

    /// Enter a transient operation state such as scrubbing.
    pub fn start_operation(&mut self, operation: AdminStateCode) -> Result<()> {
        if self.is_draining() {
            return Err(Error::InvalidAdminState(format!(
                "cannot start {} while {}",
                operation.name(),
                self.code.name()
            )));
        }
        self.code = operation;
        Ok(())
    }
}

impl Default for AdminState {
    fn default() -> Self {
        AdminState::new(AdminStateCode::Normal)
    }
}
