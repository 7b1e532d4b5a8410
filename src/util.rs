// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use log::{info, warn};

// =============================================================================
// Logger
// =============================================================================

/// Initialize the systemd journal logger.
///
/// # Errors
/// Returns an error if the journal logger fails to initialize.
pub fn init_logger(debug: bool) -> Result<()> {
    let log_level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    systemd_journal_logger::JournalLog::new()?.install()?;
    log::set_max_level(log_level);
    Ok(())
}

// =============================================================================
// Signal Handling
// =============================================================================

/// Shutdown signal received.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Sigint,
    Sigterm,
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
///
/// # Errors
/// Returns an error if signal handlers fail to initialize.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received");
            Ok(ShutdownSignal::Sigint)
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received");
            Ok(ShutdownSignal::Sigterm)
        }
    }
}

// =============================================================================
// Host Identity
// =============================================================================

/// Host name used in alert subjects. Falls back to `localhost`.
#[must_use]
pub fn host_name() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Failed to read host name: {e}");
            "localhost".to_string()
        }
    }
}
