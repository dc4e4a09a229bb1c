// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runmeter-workers.

use thiserror::Error;

/// Loop-level errors.
///
/// Per-run failures never surface here; they are logged where they happen.
/// These are the errors that abort a whole scan or receive.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Store, ledger, queue or result store operation failed.
    #[error(transparent)]
    Core(#[from] runmeter_core::Error),

    /// A configured interval could not be converted.
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
}

/// Result type using the workers [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Convert a std duration into a chrono one.
pub(crate) fn chrono_duration(duration: std::time::Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).map_err(|e| Error::InvalidDuration(e.to_string()))
}
