// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! File-sharing service control.

use std::process::{Command, Output};

use log::{debug, info};

use crate::error::SentinelError;

const SYSTEMCTL: &str = "systemctl";

/// Result of a successful stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Service control interface used for containment.
pub trait ServiceController: Send + Sync {
    /// Stop the named service.
    fn stop(&self, name: &str) -> Result<StopOutcome, SentinelError>;
}

/// Controls systemd units through `systemctl`.
pub struct SystemctlController;

impl SystemctlController {
    fn systemctl(args: &[&str], service: &str) -> Result<Output, SentinelError> {
        Command::new(SYSTEMCTL)
            .args(args)
            .arg(service)
            .output()
            .map_err(|e| SentinelError::StopFailed {
                service: service.to_string(),
                reason: format!("failed to run {SYSTEMCTL}: {e}"),
            })
    }
}

impl ServiceController for SystemctlController {
    fn stop(&self, name: &str) -> Result<StopOutcome, SentinelError> {
        let active = Self::systemctl(&["is-active", "--quiet"], name)?;
        if !active.status.success() {
            info!("Service '{name}' is not active");
            return Ok(StopOutcome::AlreadyStopped);
        }

        debug!("Stopping service '{name}'");
        let output = Self::systemctl(&["stop"], name)?;
        if output.status.success() {
            Ok(StopOutcome::Stopped)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SentinelError::StopFailed {
                service: name.to_string(),
                reason: format!("{} ({})", stderr.trim(), output.status),
            })
        }
    }
}
