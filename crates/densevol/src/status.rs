// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status codes surfaced to the device layer.
//!
//! Success is `Ok(())`; every failure is a variant of [`Error`]. Each variant
//! maps to a stable numeric code so the read-only notifier can record the
//! first fatal error in an atomic word and surface it later.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Numeric code recorded for "no error".
pub const SUCCESS_CODE: u32 = 0;

/// Errors returned by engine operations.
#[derive(Debug)]
pub enum Error {
    /// The device is in read-only mode; no further mutation is permitted.
    ReadOnly,
    /// An admin operation is already outstanding on the component.
    ComponentBusy,
    /// The component is not in a state that permits the requested operation.
    InvalidAdminState(String),
    /// Device or thread configuration failed validation.
    BadConfiguration(String),
    /// A journal block or entry failed validation during recovery.
    CorruptJournal(String),
    /// A reference count change would leave the count unrepresentable.
    RefCountOverflow { sbn: u32 },
    /// The PBN lock pool could not satisfy a borrow.
    LockError(String),
    /// No free physical blocks are available.
    NoSpace,
    /// A block address fell outside the configured physical volume.
    VolumeOverflow { pbn: u64, limit: u64 },
    /// A metadata read or write failed.
    Io(std::io::Error),
}

impl Error {
    /// The stable numeric code for this error, as stored in atomics and in
    /// admin completions.
    pub fn code(&self) -> u32 {
        match self {
            Error::ReadOnly => 1,
            Error::ComponentBusy => 2,
            Error::InvalidAdminState(_) => 3,
            Error::BadConfiguration(_) => 4,
            Error::CorruptJournal(_) => 5,
            Error::RefCountOverflow { .. } => 6,
            Error::LockError(_) => 7,
            Error::NoSpace => 8,
            Error::VolumeOverflow { .. } => 9,
            Error::Io(_) => 10,
        }
    }
}

/// Human-readable name for a stored status code.
pub fn name_for_code(code: u32) -> &'static str {
    match code {
        SUCCESS_CODE => "success",
        1 => "read-only",
        2 => "component busy",
        3 => "invalid admin state",
        4 => "bad configuration",
        5 => "corrupt journal",
        6 => "reference count overflow",
        7 => "lock error",
        8 => "no space",
        9 => "volume overflow",
        10 => "I/O error",
        _ => "unknown error",
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReadOnly => write!(f, "device is in read-only mode"),
            Error::ComponentBusy => write!(f, "an admin operation is already in progress"),
            Error::InvalidAdminState(detail) => {
                write!(f, "operation not permitted in current state: {detail}")
            }
            Error::BadConfiguration(detail) => write!(f, "invalid configuration: {detail}"),
            Error::CorruptJournal(detail) => write!(f, "corrupt journal: {detail}"),
            Error::RefCountOverflow { sbn } => {
                write!(f, "reference count overflow at slab block {sbn}")
            }
            Error::LockError(detail) => write!(f, "PBN lock error: {detail}"),
            Error::NoSpace => write!(f, "no free physical blocks available"),
            Error::VolumeOverflow { pbn, limit } => {
                write!(f, "block {pbn} is outside the physical volume of {limit} blocks")
            }
            Error::Io(err) => write!(f, "metadata I/O failed: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
