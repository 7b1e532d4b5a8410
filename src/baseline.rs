// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Trusted canary content and its fingerprint.
//!
//! The baseline is loaded once at startup, either from the decoy compiled into
//! the binary or from an operator-supplied file. Its fingerprint is computed
//! exactly once and never derived from files in monitored folders.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use rustix::fs::{Mode, OFlags};
use sha2::{Digest, Sha256};

use crate::error::SentinelError;

/// Decoy document compiled into the binary.
const EMBEDDED_BASELINE: &[u8] = include_bytes!("../resources/canary.doc");

/// Read buffer for streaming hashes.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Where the baseline content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaselineSource {
    /// Decoy shipped inside the binary.
    Embedded,
    /// Operator-provided decoy file.
    File(PathBuf),
}

/// Canonical canary bytes plus their SHA-256 fingerprint.
#[derive(Debug, Clone)]
pub struct Baseline {
    content: Arc<[u8]>,
    fingerprint: String,
}

impl Baseline {
    /// Load baseline content and compute its fingerprint.
    pub fn load(source: &BaselineSource) -> Result<Self, SentinelError> {
        let content: Arc<[u8]> = match source {
            BaselineSource::Embedded => Arc::from(EMBEDDED_BASELINE),
            BaselineSource::File(path) => fs::read(path)
                .map_err(|e| {
                    SentinelError::ResourceUnavailable(format!(
                        "failed to read {}: {e}",
                        path.display()
                    ))
                })?
                .into(),
        };

        if content.is_empty() {
            return Err(SentinelError::ResourceUnavailable(format!(
                "{source:?} baseline is empty"
            )));
        }

        let fingerprint = fingerprint_bytes(&content);
        info!(
            "Baseline loaded ({} bytes, sha256 {fingerprint})",
            content.len()
        );
        Ok(Self {
            content,
            fingerprint,
        })
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Check a fingerprint against the baseline.
    #[must_use]
    pub fn matches(&self, fingerprint: &str) -> bool {
        self.fingerprint == fingerprint
    }
}

/// Lowercase hex SHA-256 of a byte slice.
#[must_use]
pub fn fingerprint_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase hex SHA-256 of a file's current content.
///
/// The file is opened read-only without locking, so concurrent writers are
/// tolerated. Symlinks and non-regular files are rejected.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = safe_open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = hex::encode(hasher.finalize());
    debug!("sha256 {}: {digest}", path.display());
    Ok(digest)
}

/// Open with `O_RDONLY | O_NOFOLLOW | O_CLOEXEC` and require a regular file.
///
/// The open itself is non-blocking so a FIFO planted at the path fails the
/// type check instead of waiting for a writer. Blocking mode is restored
/// before the file is returned.
fn safe_open(path: &Path) -> io::Result<File> {
    let fd = rustix::fs::open(
        path,
        OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC | OFlags::NONBLOCK,
        Mode::empty(),
    )?;
    let file = File::from(fd);

    if !file.metadata()?.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }

    let flags = rustix::fs::fcntl_getfl(&file)?;
    rustix::fs::fcntl_setfl(&file, flags.difference(OFlags::NONBLOCK))?;

    Ok(file)
}
