// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Integrity engine.
//!
//! A single dispatch loop owns all per-folder state. Change events are
//! coalesced per folder, verification passes run on the blocking pool (at most
//! one per folder at a time), and a confirmed mismatch moves the folder from
//! `Watching` to `Responding` exactly once. A folder that left `Watching`
//! ignores all further events until the process restarts.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::baseline::{fingerprint_file, Baseline};
use crate::canary::MonitoredFolder;
use crate::owner::OwnerLookup;
use crate::response::{
    ContainmentStatus, Incident, NotificationStatus, ResponseCoordinator, TamperEvidence,
};
use crate::watcher::{ChangeEvent, FolderId};

// =============================================================================
// Constants
// =============================================================================

/// A burst of events delays verification by at most this many debounce windows.
const MAX_COALESCE_FACTOR: u32 = 4;

/// Upper bound for a single retry backoff step.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2);

// =============================================================================
// Types
// =============================================================================

/// Per-folder protection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    Watching,
    Responding,
    Contained,
    ContainmentFailed,
}

impl fmt::Display for FolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Watching => write!(f, "WATCHING"),
            Self::Responding => write!(f, "RESPONDING"),
            Self::Contained => write!(f, "CONTAINED"),
            Self::ContainmentFailed => write!(f, "CONTAINMENT_FAILED"),
        }
    }
}

/// Timing for debounce and read retries.
#[derive(Debug, Clone, Copy)]
pub struct VerifyPolicy {
    /// Quiet period after the last event before verifying.
    pub debounce: Duration,
    /// Read attempts before an unreadable canary counts as tampered.
    pub read_attempts: u32,
    /// Initial retry backoff, doubled per attempt.
    pub retry_backoff: Duration,
}

impl VerifyPolicy {
    const fn max_coalesce(&self) -> Duration {
        self.debounce.saturating_mul(MAX_COALESCE_FACTOR)
    }
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            read_attempts: 5,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Outcome of one verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Intact,
    Tampered {
        evidence: TamperEvidence,
        owner: Option<String>,
    },
}

/// Per-folder states and incidents, published on every transition and
/// returned after shutdown.
#[derive(Debug, Clone, Default)]
pub struct EngineSummary {
    pub states: Vec<(PathBuf, FolderState)>,
    pub incidents: Vec<Incident>,
    /// Verification passes started.
    pub verifications: u64,
}

/// Burst currently being coalesced.
struct PendingBurst {
    first_seen: Instant,
    deadline: Instant,
}

struct FolderSlot {
    folder: Arc<MonitoredFolder>,
    state: FolderState,
    pending: Option<PendingBurst>,
    in_flight: bool,
    /// Events were coalesced while a pass was running; verify once more.
    recheck: bool,
}

enum TaskOutcome {
    Verified { id: FolderId, verdict: Verdict },
    Responded { id: FolderId, incident: Incident },
}

/// What a blocking task was doing, kept so a panicked task can be resolved.
enum TaskKind {
    Verify(FolderId),
    /// Incident as handed to the coordinator.
    Respond(FolderId, Incident),
}

// =============================================================================
// Verification
// =============================================================================

/// Hash the canary and compare against the baseline.
///
/// Read failures are retried with doubling backoff. When every attempt fails
/// the canary is reported as tampered, since an attacker replacing the file
/// may keep it locked or remove it.
pub fn verify_canary(
    folder: &MonitoredFolder,
    baseline: &Baseline,
    policy: &VerifyPolicy,
    owners: &dyn OwnerLookup,
) -> Verdict {
    let path = folder.canary_path();
    let attempts = policy.read_attempts.max(1);
    let mut backoff = policy.retry_backoff;
    let mut last_err: Option<io::Error> = None;

    for attempt in 1..=attempts {
        match fingerprint_file(path) {
            Ok(actual) if baseline.matches(&actual) => return Verdict::Intact,
            Ok(actual) => {
                return Verdict::Tampered {
                    evidence: TamperEvidence::Mismatch { actual },
                    owner: owners.owner(path),
                };
            }
            Err(e) => {
                debug!(
                    "Read attempt {attempt}/{attempts} failed for {}: {e}",
                    path.display()
                );
                last_err = Some(e);
                if attempt < attempts {
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2).min(MAX_RETRY_BACKOFF);
                }
            }
        }
    }

    warn!(
        "Canary {} unreadable after {attempts} attempts",
        path.display()
    );
    let evidence = match last_err {
        Some(e) if e.kind() == io::ErrorKind::NotFound => TamperEvidence::Missing,
        Some(e) => TamperEvidence::Unreadable {
            error: e.to_string(),
        },
        None => TamperEvidence::Missing,
    };
    Verdict::Tampered {
        evidence,
        owner: owners.owner(path),
    }
}

// =============================================================================
// IntegrityEngine
// =============================================================================

/// Central dispatcher for change events from all folders.
pub struct IntegrityEngine {
    baseline: Arc<Baseline>,
    policy: VerifyPolicy,
    coordinator: Arc<ResponseCoordinator>,
    owners: Arc<dyn OwnerLookup>,
    folders: BTreeMap<FolderId, FolderSlot>,
    tasks: HashMap<Id, TaskKind>,
    incident_sink: Option<mpsc::UnboundedSender<Incident>>,
    status: watch::Sender<EngineSummary>,
    incidents: Vec<Incident>,
    next_incident: u64,
    verifications: u64,
}

impl IntegrityEngine {
    #[must_use]
    pub fn new(
        baseline: Arc<Baseline>,
        policy: VerifyPolicy,
        coordinator: Arc<ResponseCoordinator>,
        owners: Arc<dyn OwnerLookup>,
    ) -> Self {
        let (status, _) = watch::channel(EngineSummary::default());
        Self {
            baseline,
            policy,
            coordinator,
            owners,
            folders: BTreeMap::new(),
            tasks: HashMap::new(),
            incident_sink: None,
            status,
            incidents: Vec::new(),
            next_incident: 1,
            verifications: 0,
        }
    }

    /// Deliver each finished incident to `sink` as well as the log.
    #[must_use]
    pub fn with_incident_sink(mut self, sink: mpsc::UnboundedSender<Incident>) -> Self {
        self.incident_sink = Some(sink);
        self
    }

    /// Register a folder in the `Watching` state.
    pub fn add_folder(&mut self, id: FolderId, folder: Arc<MonitoredFolder>) {
        self.folders.insert(
            id,
            FolderSlot {
                folder,
                state: FolderState::Watching,
                pending: None,
                in_flight: false,
                recheck: false,
            },
        );
        self.publish();
    }

    #[must_use]
    pub fn state(&self, id: FolderId) -> Option<FolderState> {
        self.folders.get(&id).map(|slot| slot.state)
    }

    /// Live view of folder states and incidents.
    ///
    /// Stays readable after the engine is gone, holding the last state it
    /// published.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<EngineSummary> {
        self.status.subscribe()
    }

    /// Dispatch events until cancelled or the event stream ends.
    ///
    /// On exit, pending bursts are verified and every in-flight verification
    /// and response runs to completion before the summary is returned.
    pub async fn run<S>(mut self, events: S, cancel: CancellationToken) -> EngineSummary
    where
        S: Stream<Item = ChangeEvent> + Unpin,
    {
        let mut events = events.fuse();
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut events_open = true;

        info!("Integrity engine: running ({} folders)", self.folders.len());

        loop {
            let next_deadline = self.next_deadline();
            // Only polled when a deadline exists
            let sleep_until = next_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Integrity engine: shutdown requested");
                    break;
                }
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    self.on_task_joined(joined, &mut tasks);
                }
                () = tokio::time::sleep_until(sleep_until), if next_deadline.is_some() => {
                    self.flush_expired(&mut tasks);
                }
                event = events.next(), if events_open => {
                    match event {
                        Some(event) => self.on_event(&event),
                        None => {
                            debug!("Integrity engine: event stream closed");
                            events_open = false;
                        }
                    }
                }
            }

            if !events_open && tasks.is_empty() && self.next_deadline().is_none() {
                break;
            }
        }

        self.drain(&mut tasks).await;
        self.summary()
    }

    fn on_event(&mut self, event: &ChangeEvent) {
        let debounce = self.policy.debounce;
        let max_coalesce = self.policy.max_coalesce();

        let Some(slot) = self.folders.get_mut(&event.folder) else {
            warn!("Change event for unknown folder {}", event.folder);
            return;
        };

        if slot.state != FolderState::Watching {
            debug!(
                "Folder {}: ignoring {:?} ({})",
                event.folder, event.kind, slot.state
            );
            return;
        }

        info!(
            "Change detected in {} ({:?})",
            slot.folder.canary_path().display(),
            event.kind
        );

        let now = event.detected_at.max(Instant::now());
        match slot.pending {
            Some(ref mut burst) => {
                burst.deadline = (now + debounce).min(burst.first_seen + max_coalesce);
            }
            None => {
                slot.pending = Some(PendingBurst {
                    first_seen: now,
                    deadline: now + debounce,
                });
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.folders
            .values()
            .filter_map(|slot| slot.pending.as_ref().map(|p| p.deadline))
            .min()
    }

    fn flush_expired(&mut self, tasks: &mut JoinSet<TaskOutcome>) {
        let now = Instant::now();
        let expired: Vec<FolderId> = self
            .folders
            .iter()
            .filter(|(_, slot)| slot.pending.as_ref().is_some_and(|p| p.deadline <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.schedule_verify(id, tasks);
        }
    }

    /// Start a verification pass for a folder with a pending burst, or mark it
    /// for re-verification if one is already running.
    fn schedule_verify(&mut self, id: FolderId, tasks: &mut JoinSet<TaskOutcome>) {
        let Some(slot) = self.folders.get_mut(&id) else {
            return;
        };
        slot.pending = None;

        if slot.state != FolderState::Watching {
            return;
        }
        if slot.in_flight {
            slot.recheck = true;
            return;
        }

        slot.in_flight = true;
        let folder = Arc::clone(&slot.folder);
        let baseline = Arc::clone(&self.baseline);
        let owners = Arc::clone(&self.owners);
        let policy = self.policy;
        self.verifications += 1;

        debug!("Folder {id}: verifying {}", folder.canary_path().display());
        let task = tasks.spawn_blocking(move || TaskOutcome::Verified {
            id,
            verdict: verify_canary(&folder, &baseline, &policy, owners.as_ref()),
        });
        self.tasks.insert(task.id(), TaskKind::Verify(id));
    }

    fn on_task_joined(
        &mut self,
        joined: Result<(Id, TaskOutcome), JoinError>,
        tasks: &mut JoinSet<TaskOutcome>,
    ) {
        let (task, outcome) = match joined {
            Ok((task, outcome)) => (task, Ok(outcome)),
            Err(e) => (e.id(), Err(e)),
        };
        let Some(kind) = self.tasks.remove(&task) else {
            error!("Integrity engine: untracked task {task} finished");
            return;
        };

        match (kind, outcome) {
            (_, Ok(TaskOutcome::Verified { id, verdict })) => self.on_verified(id, verdict, tasks),
            (_, Ok(TaskOutcome::Responded { id, incident })) => self.on_responded(id, incident),
            // A pass that cannot finish is as suspicious as a canary that cannot be read
            (TaskKind::Verify(id), Err(e)) => {
                error!("Folder {id}: verification aborted: {e}");
                let verdict = Verdict::Tampered {
                    evidence: TamperEvidence::Unreadable {
                        error: format!("verification aborted: {e}"),
                    },
                    owner: None,
                };
                self.on_verified(id, verdict, tasks);
            }
            (TaskKind::Respond(id, mut incident), Err(e)) => {
                error!("Incident #{}: response aborted: {e}", incident.id);
                // Outcome of either step is unknown; report both as failed
                let reason = format!("response aborted: {e}");
                incident.containment = ContainmentStatus::Failed(reason.clone());
                incident.notification = NotificationStatus::Failed(reason);
                self.on_responded(id, incident);
            }
        }
    }

    fn on_verified(&mut self, id: FolderId, verdict: Verdict, tasks: &mut JoinSet<TaskOutcome>) {
        let Some(slot) = self.folders.get_mut(&id) else {
            return;
        };
        slot.in_flight = false;

        let (evidence, owner) = match verdict {
            Verdict::Intact => {
                debug!(
                    "Folder {id}: canary intact {}",
                    slot.folder.canary_path().display()
                );
                if std::mem::take(&mut slot.recheck) {
                    slot.pending = Some(PendingBurst {
                        first_seen: Instant::now(),
                        deadline: Instant::now(),
                    });
                    self.schedule_verify(id, tasks);
                }
                return;
            }
            Verdict::Tampered { evidence, owner } => (evidence, owner),
        };

        if slot.state != FolderState::Watching {
            return;
        }
        slot.state = FolderState::Responding;
        slot.recheck = false;
        slot.pending = None;

        let incident = Incident {
            id: self.next_incident,
            folder: slot.folder.path().to_path_buf(),
            canary: slot.folder.canary_path().to_path_buf(),
            detected_at: chrono::Local::now(),
            owner,
            evidence,
            containment: ContainmentStatus::NotAttempted,
            notification: NotificationStatus::NotAttempted,
        };
        self.next_incident += 1;

        error!(
            "WARNING: FILE CHANGE DETECTED in {}, USING PROTECTION (incident #{}: {})",
            incident.canary.display(),
            incident.id,
            incident.evidence
        );
        warn!("Incident #{}: owner {}", incident.id, incident.owner_or_unknown());

        let coordinator = Arc::clone(&self.coordinator);
        let handed_off = incident.clone();
        let task = tasks.spawn_blocking(move || TaskOutcome::Responded {
            id,
            incident: coordinator.respond(incident),
        });
        self.tasks.insert(task.id(), TaskKind::Respond(id, handed_off));
        self.publish();
    }

    fn on_responded(&mut self, id: FolderId, incident: Incident) {
        if let Some(slot) = self.folders.get_mut(&id) {
            slot.state = if incident.containment.failed() {
                FolderState::ContainmentFailed
            } else {
                FolderState::Contained
            };
            warn!(
                "Folder {id}: {} (containment: {}, notification: {:?}); \
                 protection disabled until restart",
                slot.state, incident.containment, incident.notification
            );
        }

        self.incidents.push(incident.clone());
        self.publish();

        if let Some(ref sink) = self.incident_sink {
            if sink.send(incident).is_err() {
                debug!("Incident sink closed");
            }
        }
    }

    /// Verify pending bursts and run all outstanding work to completion.
    async fn drain(&mut self, tasks: &mut JoinSet<TaskOutcome>) {
        let pending: Vec<FolderId> = self
            .folders
            .iter()
            .filter(|(_, slot)| slot.pending.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.schedule_verify(id, tasks);
        }

        if !tasks.is_empty() {
            info!(
                "Integrity engine: waiting for {} in-flight tasks",
                tasks.len()
            );
        }
        while let Some(joined) = tasks.join_next_with_id().await {
            self.on_task_joined(joined, tasks);
        }
        info!(
            "Integrity engine: stopped after {} verification passes",
            self.verifications
        );
    }

    fn snapshot(&self) -> EngineSummary {
        EngineSummary {
            states: self
                .folders
                .values()
                .map(|slot| (slot.folder.path().to_path_buf(), slot.state))
                .collect(),
            incidents: self.incidents.clone(),
            verifications: self.verifications,
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.snapshot());
    }

    fn summary(self) -> EngineSummary {
        let summary = self.snapshot();
        self.status.send_replace(summary.clone());
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineSource;
    use crate::config::SentinelConfig;
    use crate::mailer::Mailer;
    use crate::service::{ServiceController, StopOutcome};
    use crate::test_support::{FixedOwner, RecordingController, RecordingMailer};
    use crate::watcher::{merge_receivers, ChangeKind};
    use assert_matches::assert_matches;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct PanickingOwner;

    impl OwnerLookup for PanickingOwner {
        fn owner(&self, _path: &Path) -> Option<String> {
            panic!("account database unavailable");
        }
    }

    /// Owner lookup that keeps a verification pass busy.
    struct SlowOwner {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl OwnerLookup for SlowOwner {
        fn owner(&self, _path: &Path) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Some("mallory (uid 1001)".to_string())
        }
    }

    struct Harness {
        _dir: TempDir,
        folder: Arc<MonitoredFolder>,
        baseline: Arc<Baseline>,
        controller: Arc<RecordingController>,
        mailer: Arc<RecordingMailer>,
        engine: IntegrityEngine,
    }

    fn policy(debounce_ms: u64) -> VerifyPolicy {
        VerifyPolicy {
            debounce: Duration::from_millis(debounce_ms),
            read_attempts: 3,
            retry_backoff: Duration::from_millis(5),
        }
    }

    fn harness(stop: Result<StopOutcome, &'static str>, policy: VerifyPolicy) -> Harness {
        harness_with(
            RecordingController::new(stop),
            policy,
            Arc::new(FixedOwner(Some("mallory (uid 1001)"))),
        )
    }

    fn harness_with(
        controller: RecordingController,
        policy: VerifyPolicy,
        owners: Arc<dyn OwnerLookup>,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let folder = Arc::new(MonitoredFolder::new(dir.path()));
        let baseline = Arc::new(Baseline::load(&BaselineSource::Embedded).unwrap());
        fs::write(folder.canary_path(), baseline.content()).unwrap();

        let controller = Arc::new(controller);
        let mailer = Arc::new(RecordingMailer::new(true));
        let config = SentinelConfig {
            test_mode: false,
            ..SentinelConfig::default()
        };
        let coordinator = Arc::new(ResponseCoordinator::new(
            &config,
            "fileserver01",
            Arc::clone(&controller) as Arc<dyn ServiceController>,
            Arc::clone(&mailer) as Arc<dyn Mailer>,
        ));

        let mut engine = IntegrityEngine::new(Arc::clone(&baseline), policy, coordinator, owners);
        engine.add_folder(FolderId(0), Arc::clone(&folder));

        Harness {
            _dir: dir,
            folder,
            baseline,
            controller,
            mailer,
            engine,
        }
    }

    fn change(kind: ChangeKind) -> ChangeEvent {
        ChangeEvent {
            folder: FolderId(0),
            detected_at: Instant::now(),
            kind,
        }
    }

    struct Running {
        tx: mpsc::Sender<ChangeEvent>,
        incidents: mpsc::UnboundedReceiver<Incident>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<EngineSummary>,
    }

    fn spawn_engine(engine: IntegrityEngine) -> Running {
        let (tx, rx) = mpsc::channel(64);
        let (sink_tx, incidents) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            engine
                .with_incident_sink(sink_tx)
                .run(merge_receivers(vec![rx]), cancel.clone()),
        );
        Running {
            tx,
            incidents,
            cancel,
            handle,
        }
    }

    async fn next_incident(rx: &mut mpsc::UnboundedReceiver<Incident>) -> Incident {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("incident within timeout")
            .expect("incident sink open")
    }

    fn flip_bit(folder: &MonitoredFolder, baseline: &Baseline, index: usize) {
        let mut bytes = baseline.content().to_vec();
        bytes[index] ^= 0x01;
        fs::write(folder.canary_path(), bytes).unwrap();
    }

    #[test]
    fn test_verify_intact_canary() {
        let h = harness(Ok(StopOutcome::Stopped), policy(50));
        let verdict = verify_canary(&h.folder, &h.baseline, &policy(50), &FixedOwner(None));
        assert_eq!(verdict, Verdict::Intact);
    }

    #[test]
    fn test_verify_mismatch_captures_owner() {
        let h = harness(Ok(StopOutcome::Stopped), policy(50));
        flip_bit(&h.folder, &h.baseline, 0);

        let verdict = verify_canary(&h.folder, &h.baseline, &policy(50), &FixedOwner(Some("eve")));

        assert_matches!(verdict, Verdict::Tampered {
            evidence: TamperEvidence::Mismatch { .. },
            owner: Some(ref owner),
        } if owner == "eve");
    }

    #[test]
    fn test_verify_missing_after_retries() {
        let h = harness(Ok(StopOutcome::Stopped), policy(50));
        fs::remove_file(h.folder.canary_path()).unwrap();

        let started = std::time::Instant::now();
        let verdict = verify_canary(&h.folder, &h.baseline, &policy(50), &FixedOwner(None));

        assert_eq!(
            verdict,
            Verdict::Tampered {
                evidence: TamperEvidence::Missing,
                owner: None,
            }
        );
        // Two backoff sleeps: 5ms + 10ms
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_verify_unreadable_is_tamper() {
        let h = harness(Ok(StopOutcome::Stopped), policy(50));
        fs::remove_file(h.folder.canary_path()).unwrap();
        fs::create_dir(h.folder.canary_path()).unwrap();

        let verdict = verify_canary(&h.folder, &h.baseline, &policy(50), &FixedOwner(None));

        assert_matches!(
            verdict,
            Verdict::Tampered {
                evidence: TamperEvidence::Unreadable { .. },
                ..
            }
        );
    }

    #[test]
    fn test_verify_fifo_canary_is_tamper() {
        let h = harness(Ok(StopOutcome::Stopped), policy(50));
        fs::remove_file(h.folder.canary_path()).unwrap();
        nix::unistd::mkfifo(h.folder.canary_path(), nix::sys::stat::Mode::S_IRWXU).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let folder = Arc::clone(&h.folder);
        let baseline = Arc::clone(&h.baseline);
        std::thread::spawn(move || {
            let _ = tx.send(verify_canary(&folder, &baseline, &policy(50), &FixedOwner(None)));
        });
        let verdict = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("verification finishes without a writer on the pipe");

        assert_matches!(
            verdict,
            Verdict::Tampered {
                evidence: TamperEvidence::Unreadable { .. },
                ..
            }
        );
    }

    #[tokio::test]
    async fn test_burst_creates_single_incident() {
        let h = harness(Ok(StopOutcome::Stopped), policy(50));
        let mut running = spawn_engine(h.engine);

        flip_bit(&h.folder, &h.baseline, h.baseline.content().len() / 2);
        for kind in [ChangeKind::Write, ChangeKind::Write, ChangeKind::Attribute, ChangeKind::Write] {
            running.tx.send(change(kind)).await.unwrap();
        }

        let incident = next_incident(&mut running.incidents).await;
        assert_eq!(incident.id, 1);
        assert_eq!(incident.owner.as_deref(), Some("mallory (uid 1001)"));
        assert_matches!(incident.evidence, TamperEvidence::Mismatch { .. });

        // Folder is compromised; later events must not open new incidents
        for _ in 0..5 {
            running.tx.send(change(ChangeKind::Write)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        running.cancel.cancel();
        let summary = running.handle.await.unwrap();

        assert_eq!(summary.incidents.len(), 1);
        assert_eq!(summary.states[0].1, FolderState::Contained);
        assert_eq!(h.controller.calls().len(), 1);
        assert_eq!(h.mailer.sent().len(), 1);
        assert!(running.incidents.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_benign_touch_is_false_alarm() {
        let h = harness(Ok(StopOutcome::Stopped), policy(30));
        let running = spawn_engine(h.engine);

        running.tx.send(change(ChangeKind::Attribute)).await.unwrap();
        running.tx.send(change(ChangeKind::Write)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        running.cancel.cancel();
        let summary = running.handle.await.unwrap();

        assert!(summary.incidents.is_empty());
        assert_eq!(summary.states[0].1, FolderState::Watching);
        assert!(h.controller.calls().is_empty());
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_marks_containment_failed() {
        let h = harness(Err("access denied"), policy(30));
        let mut running = spawn_engine(h.engine);

        fs::write(h.folder.canary_path(), b"encrypted by ransomware").unwrap();
        running.tx.send(change(ChangeKind::Write)).await.unwrap();

        let incident = next_incident(&mut running.incidents).await;
        assert!(incident.containment.failed());
        assert_eq!(incident.notification, NotificationStatus::Sent);
        assert!(h.mailer.sent()[0].body.contains("access denied"));

        running.cancel.cancel();
        let summary = running.handle.await.unwrap();
        assert_eq!(summary.states[0].1, FolderState::ContainmentFailed);
    }

    #[tokio::test]
    async fn test_shutdown_verifies_pending_burst() {
        let h = harness(Ok(StopOutcome::Stopped), policy(1_000));
        let running = spawn_engine(h.engine);

        fs::write(h.folder.canary_path(), b"encrypted by ransomware").unwrap();
        running.tx.send(change(ChangeKind::Write)).await.unwrap();
        // Let the engine take the event, well inside the debounce window
        tokio::time::sleep(Duration::from_millis(50)).await;
        running.cancel.cancel();
        let summary = running.handle.await.unwrap();

        assert_eq!(summary.incidents.len(), 1);
        assert_eq!(summary.incidents[0].notification, NotificationStatus::Sent);
        assert_eq!(summary.states[0].1, FolderState::Contained);
    }

    #[tokio::test]
    async fn test_unknown_folder_ignored() {
        let h = harness(Ok(StopOutcome::Stopped), policy(30));
        let running = spawn_engine(h.engine);

        running
            .tx
            .send(ChangeEvent {
                folder: FolderId(42),
                detected_at: Instant::now(),
                kind: ChangeKind::Write,
            })
            .await
            .unwrap();
        drop(running.tx);

        // Stream closed and nothing pending: engine exits on its own
        let summary = tokio::time::timeout(Duration::from_secs(5), running.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(summary.incidents.is_empty());
    }

    #[tokio::test]
    async fn test_events_during_pass_cause_one_recheck() {
        let policy = VerifyPolicy {
            debounce: Duration::from_millis(20),
            read_attempts: 2,
            retry_backoff: Duration::from_millis(400),
        };
        let h = harness(Ok(StopOutcome::Stopped), policy);
        let running = spawn_engine(h.engine);

        fs::remove_file(h.folder.canary_path()).unwrap();
        running.tx.send(change(ChangeKind::Removed)).await.unwrap();

        // First pass is now sleeping between its two read attempts
        tokio::time::sleep(Duration::from_millis(150)).await;
        fs::write(h.folder.canary_path(), h.baseline.content()).unwrap();
        for kind in [ChangeKind::Write, ChangeKind::Write, ChangeKind::Attribute] {
            running.tx.send(change(kind)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(650)).await;
        running.cancel.cancel();
        let summary = running.handle.await.unwrap();

        assert_eq!(summary.verifications, 2);
        assert!(summary.incidents.is_empty());
        assert_eq!(summary.states[0].1, FolderState::Watching);
        assert!(h.controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_events_during_tampered_pass_yield_one_incident() {
        let owners = Arc::new(SlowOwner {
            delay: Duration::from_millis(200),
            calls: AtomicUsize::new(0),
        });
        let h = harness_with(
            RecordingController::new(Ok(StopOutcome::Stopped)),
            policy(20),
            Arc::clone(&owners) as Arc<dyn OwnerLookup>,
        );
        let mut running = spawn_engine(h.engine);

        fs::write(h.folder.canary_path(), b"encrypted by ransomware").unwrap();
        running.tx.send(change(ChangeKind::Write)).await.unwrap();
        // Pass is inside the owner lookup
        tokio::time::sleep(Duration::from_millis(100)).await;
        for _ in 0..3 {
            running.tx.send(change(ChangeKind::Write)).await.unwrap();
        }

        let incident = next_incident(&mut running.incidents).await;
        assert_eq!(incident.id, 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        running.cancel.cancel();
        let summary = running.handle.await.unwrap();

        assert_eq!(summary.verifications, 1);
        assert_eq!(summary.incidents.len(), 1);
        assert_eq!(owners.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.calls().len(), 1);
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_panicked_verification_treated_as_tamper() {
        let h = harness_with(
            RecordingController::new(Ok(StopOutcome::Stopped)),
            policy(30),
            Arc::new(PanickingOwner),
        );
        let mut running = spawn_engine(h.engine);

        fs::write(h.folder.canary_path(), b"encrypted by ransomware").unwrap();
        running.tx.send(change(ChangeKind::Write)).await.unwrap();

        let incident = next_incident(&mut running.incidents).await;
        assert_matches!(
            incident.evidence,
            TamperEvidence::Unreadable { ref error } if error.starts_with("verification aborted")
        );
        assert_eq!(incident.owner, None);
        assert_eq!(h.controller.calls().len(), 1);

        running.cancel.cancel();
        let summary = running.handle.await.unwrap();
        assert_eq!(summary.states[0].1, FolderState::Contained);
    }

    #[tokio::test]
    async fn test_panicked_response_marks_containment_failed() {
        let h = harness_with(
            RecordingController::panicking(),
            policy(30),
            Arc::new(FixedOwner(None)),
        );
        let mut running = spawn_engine(h.engine);

        fs::write(h.folder.canary_path(), b"encrypted by ransomware").unwrap();
        running.tx.send(change(ChangeKind::Write)).await.unwrap();

        let incident = next_incident(&mut running.incidents).await;
        assert_matches!(
            incident.containment,
            ContainmentStatus::Failed(ref reason) if reason.starts_with("response aborted")
        );
        assert_matches!(incident.notification, NotificationStatus::Failed(_));

        running.cancel.cancel();
        let summary = running.handle.await.unwrap();
        assert_eq!(summary.states[0].1, FolderState::ContainmentFailed);
        assert_eq!(summary.incidents.len(), 1);
    }

    #[tokio::test]
    async fn test_status_tracks_transitions() {
        let h = harness(Ok(StopOutcome::Stopped), policy(30));
        let mut status = h.engine.status();
        assert_eq!(status.borrow().states[0].1, FolderState::Watching);
        let mut running = spawn_engine(h.engine);

        fs::write(h.folder.canary_path(), b"encrypted by ransomware").unwrap();
        running.tx.send(change(ChangeKind::Write)).await.unwrap();
        let _ = next_incident(&mut running.incidents).await;

        status.changed().await.unwrap();
        let latest = status.borrow_and_update().clone();
        assert_eq!(latest.states[0].1, FolderState::Contained);
        assert_eq!(latest.incidents.len(), 1);

        running.cancel.cancel();
        running.handle.await.unwrap();
    }
}

