// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Incident response: containment, then notification.
//!
//! Both steps always run for every incident, in that order, and neither is
//! retried. A failed stop is reported in the alert; a failed alert is logged.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{error, info, warn};

use crate::config::{EmailConfig, OperatingMode, SentinelConfig};
use crate::error::SentinelError;
use crate::mailer::{AlertMessage, Mailer};
use crate::owner::UNKNOWN_OWNER;
use crate::service::{ServiceController, StopOutcome};

const SUBJECT_PREFIX: &str = "[canary-sentinel]";

/// Why a canary is considered compromised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TamperEvidence {
    /// Content hashes differently from the baseline.
    Mismatch { actual: String },
    /// Canary is gone after all read attempts.
    Missing,
    /// Canary exists but could not be read after all attempts.
    Unreadable { error: String },
}

impl fmt::Display for TamperEvidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { actual } => write!(f, "content changed (sha256 {actual})"),
            Self::Missing => write!(f, "canary removed"),
            Self::Unreadable { error } => write!(f, "canary unreadable ({error})"),
        }
    }
}

/// Successful containment outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Stopped,
    AlreadyStopped,
    /// Observe-only mode; service left running.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainmentStatus {
    NotAttempted,
    Done(Containment),
    Failed(String),
}

impl ContainmentStatus {
    #[must_use]
    pub const fn failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for ContainmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAttempted => write!(f, "not attempted"),
            Self::Done(Containment::Stopped) => write!(f, "file sharing service stopped"),
            Self::Done(Containment::AlreadyStopped) => {
                write!(f, "file sharing service was already stopped")
            }
            Self::Done(Containment::Skipped) => {
                write!(f, "skipped, test mode enabled (service left running)")
            }
            Self::Failed(reason) => write!(f, "FAILED, {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationStatus {
    NotAttempted,
    Sent,
    Failed(String),
}

/// One containment cycle for a compromised canary.
#[derive(Debug, Clone)]
pub struct Incident {
    pub id: u64,
    pub folder: PathBuf,
    pub canary: PathBuf,
    pub detected_at: DateTime<Local>,
    pub owner: Option<String>,
    pub evidence: TamperEvidence,
    pub containment: ContainmentStatus,
    pub notification: NotificationStatus,
}

impl Incident {
    #[must_use]
    pub fn owner_or_unknown(&self) -> &str {
        self.owner.as_deref().unwrap_or(UNKNOWN_OWNER)
    }
}

/// Executes containment and notification for incidents.
pub struct ResponseCoordinator {
    mode: OperatingMode,
    service: String,
    host: String,
    email: EmailConfig,
    controller: Arc<dyn ServiceController>,
    mailer: Arc<dyn Mailer>,
}

impl ResponseCoordinator {
    #[must_use]
    pub fn new(
        config: &SentinelConfig,
        host: impl Into<String>,
        controller: Arc<dyn ServiceController>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            mode: config.mode(),
            service: config.service.clone(),
            host: host.into(),
            email: config.email.clone(),
            controller,
            mailer,
        }
    }

    /// Stop the sharing service unless running observe-only.
    pub fn contain(&self) -> Result<Containment, SentinelError> {
        if self.mode == OperatingMode::ObserveOnly {
            warn!("TEST MODE ENABLED, NOT SHUTTING DOWN FILE SERVICES");
            return Ok(Containment::Skipped);
        }

        match self.controller.stop(&self.service)? {
            StopOutcome::Stopped => {
                warn!("File sharing service '{}' stopped", self.service);
                Ok(Containment::Stopped)
            }
            StopOutcome::AlreadyStopped => {
                warn!("File sharing service '{}' was already stopped", self.service);
                Ok(Containment::AlreadyStopped)
            }
        }
    }

    /// Send the alert for an incident.
    pub fn notify(&self, incident: &Incident) -> Result<(), SentinelError> {
        let message = self.alert_for(incident);
        self.mailer.send(&message, &self.email.server)?;
        info!(
            "Incident #{}: alert sent to {}",
            incident.id, self.email.to
        );
        Ok(())
    }

    /// Run containment then notification, recording both outcomes.
    #[must_use]
    pub fn respond(&self, mut incident: Incident) -> Incident {
        incident.containment = match self.contain() {
            Ok(containment) => ContainmentStatus::Done(containment),
            Err(e) => {
                error!("Incident #{}: UNABLE TO STOP SERVICE: {e}", incident.id);
                ContainmentStatus::Failed(e.to_string())
            }
        };

        incident.notification = match self.notify(&incident) {
            Ok(()) => NotificationStatus::Sent,
            Err(e) => {
                error!(
                    "Incident #{}: ALERT NOT DELIVERED to {}: {e}",
                    incident.id, self.email.to
                );
                NotificationStatus::Failed(e.to_string())
            }
        };

        incident
    }

    fn alert_for(&self, incident: &Incident) -> AlertMessage {
        let headline = match incident.containment {
            ContainmentStatus::Failed(_) => "UNABLE TO STOP SERVICE",
            ContainmentStatus::Done(Containment::Skipped) => "CANARY TAMPERED (test mode)",
            _ => "FILE SERVICES SHUTDOWN",
        };

        let body = format!(
            "Potential ransomware infection\n\
             Computer: {}\n\
             Folder: {}\n\
             Canary: {}\n\
             Owner: {}\n\
             Evidence: {}\n\
             Detected: {}\n\
             Containment ({}): {}\n\
             \n\
             The canary has been left in place for investigation.\n\
             Protection for this folder stays disabled until the sentinel is restarted.\n",
            self.host,
            incident.folder.display(),
            incident.canary.display(),
            incident.owner_or_unknown(),
            incident.evidence,
            incident.detected_at.to_rfc3339(),
            self.service,
            incident.containment,
        );

        AlertMessage {
            to: self.email.to.clone(),
            from: self.email.from.clone(),
            subject: format!("{SUBJECT_PREFIX} {} {headline}", self.host),
            body,
        }
    }
}
