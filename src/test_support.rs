// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Recording fakes for the external collaborators.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::SentinelError;
use crate::mailer::{AlertMessage, Mailer};
use crate::owner::OwnerLookup;
use crate::response::{ContainmentStatus, Incident, NotificationStatus, TamperEvidence};
use crate::service::{ServiceController, StopOutcome};

pub struct RecordingController {
    outcome: Result<StopOutcome, &'static str>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
    panics: bool,
}

impl RecordingController {
    pub fn new(outcome: Result<StopOutcome, &'static str>) -> Self {
        Self {
            outcome,
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            panics: false,
        }
    }

    /// Block for `delay` inside every stop call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Panic inside every stop call, after recording it.
    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::new(Ok(StopOutcome::Stopped))
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ServiceController for RecordingController {
    fn stop(&self, name: &str) -> Result<StopOutcome, SentinelError> {
        self.calls.lock().unwrap().push(name.to_string());
        std::thread::sleep(self.delay);
        assert!(!self.panics, "service manager crashed");
        self.outcome.map_err(|reason| SentinelError::StopFailed {
            service: name.to_string(),
            reason: reason.to_string(),
        })
    }
}

pub struct RecordingMailer {
    succeed: bool,
    attempts: Mutex<usize>,
    sent: Mutex<Vec<AlertMessage>>,
}

impl RecordingMailer {
    pub fn new(succeed: bool) -> Self {
        Self {
            succeed,
            attempts: Mutex::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<AlertMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, message: &AlertMessage, _relay: &str) -> Result<(), SentinelError> {
        *self.attempts.lock().unwrap() += 1;
        if self.succeed {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        } else {
            Err(SentinelError::SendFailed("relay refused".to_string()))
        }
    }
}

pub struct FixedOwner(pub Option<&'static str>);

impl OwnerLookup for FixedOwner {
    fn owner(&self, _path: &Path) -> Option<String> {
        self.0.map(str::to_string)
    }
}

pub fn sample_incident() -> Incident {
    Incident {
        id: 1,
        folder: PathBuf::from("/srv/share"),
        canary: PathBuf::from("/srv/share/DO NOT EDIT THIS DOCUMENT.doc"),
        detected_at: chrono::Local::now(),
        owner: Some("mallory (uid 1001)".to_string()),
        evidence: TamperEvidence::Mismatch {
            actual: "00".repeat(32),
        },
        containment: ContainmentStatus::NotAttempted,
        notification: NotificationStatus::NotAttempted,
    }
}
