// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Canary-file sentinel for ransomware early warning.
//!
//! Decoy documents are planted in monitored folders and verified against a
//! trusted baseline. Any modification stops the file-sharing service and
//! alerts an administrator.
//!
//! # Modules
//!
//! - [`baseline`] - Trusted decoy content and SHA-256 fingerprinting
//! - [`canary`] - Per-folder canary provisioning and startup verification
//! - [`watcher`] - Inotify subscription scoped to one canary file
//! - [`engine`] - Debounced verification and the per-folder incident state machine
//! - [`response`] - Containment and notification, once per incident
//! - [`sentinel`] - Startup orchestration and graceful shutdown

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_errors_doc)]

pub mod baseline;
pub mod canary;
pub mod config;
pub mod engine;
pub mod error;
pub mod mailer;
pub mod owner;
pub mod response;
pub mod sentinel;
pub mod service;
pub mod util;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_support;
