// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the sentinel core.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// Baseline content is missing or corrupt. Fatal before anything is watched.
    #[error("baseline unavailable: {0}")]
    ResourceUnavailable(String),

    /// No usable folders configured. Startup degrades to zero protection.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A canary already differs from the baseline at startup.
    #[error(
        "canary {} doesn't match baseline (expected {expected}, found {actual}), \
         delete it and allow it to be replaced",
        path.display()
    )]
    DriftDetected {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to stop service '{service}': {reason}")]
    StopFailed { service: String, reason: String },

    #[error("unable to send alert: {0}")]
    SendFailed(String),
}

impl SentinelError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
