// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Startup orchestration and graceful shutdown.
//!
//! Every canary is provisioned and verified before any watch is armed, so a
//! folder is never watched while its canary is missing or already drifted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::baseline::Baseline;
use crate::canary::{CanaryProvisioner, CanaryReady, MonitoredFolder};
use crate::config::SentinelConfig;
use crate::engine::{EngineSummary, IntegrityEngine, VerifyPolicy};
use crate::error::SentinelError;
use crate::mailer::{Mailer, SmtpMailer};
use crate::owner::{OwnerLookup, SystemOwnerLookup};
use crate::response::{Incident, ResponseCoordinator};
use crate::service::{ServiceController, SystemctlController};
use crate::util::host_name;
use crate::watcher::{merge_receivers, FolderId, FolderWatch};

// =============================================================================
// Constants
// =============================================================================

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound for draining in-flight verifications and responses.
const ENGINE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Collaborators
// =============================================================================

/// External systems the sentinel acts on.
pub struct Collaborators {
    pub controller: Arc<dyn ServiceController>,
    pub mailer: Arc<dyn Mailer>,
    pub owners: Arc<dyn OwnerLookup>,
    /// Host name reported in alerts.
    pub host: String,
}

impl Collaborators {
    /// systemd, SMTP and the local account database.
    #[must_use]
    pub fn system(config: &SentinelConfig) -> Self {
        let host = host_name();
        Self {
            controller: Arc::new(SystemctlController),
            mailer: Arc::new(SmtpMailer::new(config.email.port, host.clone())),
            owners: Arc::new(SystemOwnerLookup),
            host,
        }
    }
}

// =============================================================================
// Sentinel
// =============================================================================

pub struct Sentinel {
    config: SentinelConfig,
    collaborators: Collaborators,
    incident_sink: Option<mpsc::UnboundedSender<Incident>>,
    engine_timeout: Duration,
}

impl Sentinel {
    #[must_use]
    pub const fn new(config: SentinelConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            incident_sink: None,
            engine_timeout: ENGINE_SHUTDOWN_TIMEOUT,
        }
    }

    /// Deliver each finished incident to `sink`.
    #[must_use]
    pub fn with_incident_sink(mut self, sink: mpsc::UnboundedSender<Incident>) -> Self {
        self.incident_sink = Some(sink);
        self
    }

    /// How long shutdown waits for in-flight work before giving up on it.
    #[must_use]
    pub const fn with_engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout = timeout;
        self
    }

    /// Provision canaries, arm watches and start the integrity engine.
    ///
    /// A configuration with nothing to protect is logged and yields a running
    /// sentinel without protection. A missing baseline, a drifted canary or an
    /// unusable folder aborts startup before anything is watched.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<RunningSentinel, SentinelError> {
        info!(
            "canary-sentinel: starting ({} folders)",
            self.config.folders.len()
        );

        let baseline = Arc::new(Baseline::load(&self.config.baseline_source())?);
        debug!("Baseline sha256 {}", baseline.fingerprint());

        if let Err(e) = self.config.validate() {
            error!("{e}; running with NO PROTECTION");
            return Ok(RunningSentinel::unprotected(self.engine_timeout));
        }

        let folders: Vec<Arc<MonitoredFolder>> = self
            .config
            .folders
            .iter()
            .map(|folder| Arc::new(MonitoredFolder::new(folder.path.clone())))
            .collect();

        let provisioner = CanaryProvisioner::new(&baseline);
        let mut created = 0;
        for folder in &folders {
            if provisioner.ensure_canary(folder)? == CanaryReady::Created {
                created += 1;
            }
        }
        debug!(
            "Canaries ready: {created} created, {} verified",
            folders.len() - created
        );

        let mut watches = Vec::with_capacity(folders.len());
        for (index, folder) in folders.iter().enumerate() {
            watches.push(FolderWatch::arm(FolderId(index), Arc::clone(folder))?);
        }

        let Collaborators {
            controller,
            mailer,
            owners,
            host,
        } = self.collaborators;
        let coordinator = Arc::new(ResponseCoordinator::new(
            &self.config,
            host,
            controller,
            mailer,
        ));
        let policy = VerifyPolicy {
            debounce: self.config.debounce(),
            read_attempts: self.config.read_attempts,
            retry_backoff: self.config.retry_backoff(),
        };

        let mut engine = IntegrityEngine::new(baseline, policy, coordinator, owners);
        for (index, folder) in folders.iter().enumerate() {
            engine.add_folder(FolderId(index), Arc::clone(folder));
        }
        if let Some(sink) = self.incident_sink {
            engine = engine.with_incident_sink(sink);
        }

        let status = engine.status();
        let watch_cancel = CancellationToken::new();
        let engine_cancel = CancellationToken::new();
        let mut receivers = Vec::with_capacity(watches.len());
        let mut watch_handles = Vec::with_capacity(watches.len());

        for watch in watches {
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            receivers.push(rx);
            watch_handles.push(tokio::spawn(watch.run(tx, watch_cancel.clone())));
        }
        let engine_handle =
            tokio::spawn(engine.run(merge_receivers(receivers), engine_cancel.clone()));

        let protected: Vec<PathBuf> = folders
            .iter()
            .map(|folder| folder.path().to_path_buf())
            .collect();
        info!("canary-sentinel: ready ({} folders protected)", protected.len());

        Ok(RunningSentinel {
            protected,
            engine: Some(engine_handle),
            status,
            engine_timeout: self.engine_timeout,
            watches: watch_handles,
            engine_cancel,
            watch_cancel,
        })
    }
}

// =============================================================================
// RunningSentinel
// =============================================================================

/// Handle to a started sentinel.
#[derive(Debug)]
pub struct RunningSentinel {
    protected: Vec<PathBuf>,
    engine: Option<JoinHandle<EngineSummary>>,
    /// Last state the engine published.
    status: watch::Receiver<EngineSummary>,
    engine_timeout: Duration,
    watches: Vec<JoinHandle<()>>,
    engine_cancel: CancellationToken,
    watch_cancel: CancellationToken,
}

impl RunningSentinel {
    fn unprotected(engine_timeout: Duration) -> Self {
        let (_, status) = watch::channel(EngineSummary::default());
        Self {
            protected: Vec::new(),
            engine: None,
            status,
            engine_timeout,
            watches: Vec::new(),
            engine_cancel: CancellationToken::new(),
            watch_cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn protected_folders(&self) -> &[PathBuf] {
        &self.protected
    }

    /// Stop the engine, letting in-flight verifications and responses finish,
    /// then release the watches.
    ///
    /// Work still running after the engine timeout is abandoned and the last
    /// published state is returned.
    pub async fn shutdown(self) -> EngineSummary {
        info!("canary-sentinel: stopping");
        self.engine_cancel.cancel();

        let summary = match self.engine {
            Some(mut handle) => match tokio::time::timeout(self.engine_timeout, &mut handle).await {
                Ok(Ok(summary)) => summary,
                Ok(Err(e)) => {
                    error!("Integrity engine failed: {e}");
                    self.status.borrow().clone()
                }
                Err(_) => {
                    error!(
                        "Integrity engine still busy after {}s, abandoning in-flight work",
                        self.engine_timeout.as_secs_f32()
                    );
                    handle.abort();
                    self.status.borrow().clone()
                }
            },
            None => EngineSummary::default(),
        };

        self.watch_cancel.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(self.watches)).await
        {
            Ok(_) => debug!("All watches released"),
            Err(_) => warn!("Shutdown timeout exceeded"),
        }

        for (path, state) in &summary.states {
            info!("Folder {}: {state}", path.display());
        }
        info!(
            "canary-sentinel: stopped ({} incidents)",
            summary.incidents.len()
        );
        summary
    }
}
