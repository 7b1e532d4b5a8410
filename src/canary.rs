// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Canary provisioning.
//!
//! Every monitored folder gets a decoy at a fixed file name. Missing decoys are
//! created from the baseline; existing ones must already match it, otherwise
//! the folder is reported as drifted and must never be watched.

use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use tempfile::NamedTempFile;

use crate::baseline::{fingerprint_file, Baseline};
use crate::error::SentinelError;

/// File name of the decoy planted in each monitored folder.
pub const CANARY_FILE_NAME: &str = "DO NOT EDIT THIS DOCUMENT.doc";

/// A configured folder and the path of its canary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitoredFolder {
    path: PathBuf,
    canary_path: PathBuf,
}

impl MonitoredFolder {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let canary_path = path.join(CANARY_FILE_NAME);
        Self { path, canary_path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn canary_path(&self) -> &Path {
        &self.canary_path
    }
}

impl fmt::Display for MonitoredFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Successful provisioning outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanaryReady {
    /// Canary was absent and has been written from the baseline.
    Created,
    /// Canary already existed and matches the baseline. Not rewritten.
    Verified,
}

/// Ensures canaries exist and match the baseline before watching starts.
pub struct CanaryProvisioner<'a> {
    baseline: &'a Baseline,
}

impl<'a> CanaryProvisioner<'a> {
    #[must_use]
    pub const fn new(baseline: &'a Baseline) -> Self {
        Self { baseline }
    }

    /// Create the canary if absent, then verify it against the baseline.
    pub fn ensure_canary(&self, folder: &MonitoredFolder) -> Result<CanaryReady, SentinelError> {
        let canary = folder.canary_path();
        let created = match canary.symlink_metadata() {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::NotFound => self.write_canary(folder)?,
            Err(e) => return Err(SentinelError::io(canary, e)),
        };

        let actual = fingerprint_file(canary).map_err(|e| SentinelError::io(canary, e))?;
        if !self.baseline.matches(&actual) {
            warn!(
                "Canary {} doesn't match baseline, delete it and allow it to be replaced",
                canary.display()
            );
            return Err(SentinelError::DriftDetected {
                path: canary.to_path_buf(),
                expected: self.baseline.fingerprint().to_string(),
                actual,
            });
        }

        if created {
            info!("Baseline copied to {}", canary.display());
            Ok(CanaryReady::Created)
        } else {
            info!("Canary verified: {}", canary.display());
            Ok(CanaryReady::Verified)
        }
    }

    /// Atomically place baseline content at the canary path.
    ///
    /// Returns `false` if another writer created the file first; that file is
    /// left untouched and verified like any pre-existing canary.
    fn write_canary(&self, folder: &MonitoredFolder) -> Result<bool, SentinelError> {
        let mut tmp =
            NamedTempFile::new_in(folder.path()).map_err(|e| SentinelError::io(folder.path(), e))?;
        tmp.write_all(self.baseline.content())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| SentinelError::io(tmp.path(), e))?;

        match tmp.persist_noclobber(folder.canary_path()) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(SentinelError::io(folder.canary_path(), e.error)),
        }
    }
}
