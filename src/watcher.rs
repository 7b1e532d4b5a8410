// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use inotify::{EventMask, EventStream, Inotify, WatchMask};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::canary::{MonitoredFolder, CANARY_FILE_NAME};
use crate::error::SentinelError;

// =============================================================================
// Constants
// =============================================================================

/// Inotify read buffer size.
const INOTIFY_BUFFER_SIZE: usize = 4096;

/// Events on the folder that can affect the canary.
///
/// `ACCESS` is left out on purpose: verification reads would trigger it.
const CANARY_WATCH_MASK: WatchMask = WatchMask::MODIFY
    .union(WatchMask::CLOSE_WRITE)
    .union(WatchMask::ATTRIB)
    .union(WatchMask::CREATE)
    .union(WatchMask::DELETE)
    .union(WatchMask::MOVED_FROM)
    .union(WatchMask::MOVED_TO)
    .union(WatchMask::DELETE_SELF)
    .union(WatchMask::MOVE_SELF);

/// Consecutive inotify read errors after which a watch gives up.
const MAX_READ_ERRORS: u32 = 8;

/// Pause after the first read error; doubles per consecutive error.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);

const READ_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(2);

// =============================================================================
// Types
// =============================================================================

/// Index of a monitored folder, in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FolderId(pub usize);

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw change notification for a canary.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub folder: FolderId,
    pub detected_at: Instant,
    pub kind: ChangeKind,
}

/// Type of change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Content or size changed, or the file was (re)created.
    Write,
    /// Ownership, permissions, ACL/xattr or timestamps changed.
    Attribute,
    /// Canary or its folder moved.
    Rename,
    /// Canary or its folder deleted.
    Removed,
    /// Kernel queue overflowed; state unknown.
    Rescan,
}

/// Map an inotify event to a canary change, ignoring unrelated entries.
fn classify(mask: EventMask, name: Option<&OsStr>, canary_name: &OsStr) -> Option<ChangeKind> {
    if mask.contains(EventMask::Q_OVERFLOW) {
        return Some(ChangeKind::Rescan);
    }

    let Some(name) = name else {
        // Events on the watched folder itself
        if mask.contains(EventMask::DELETE_SELF) {
            return Some(ChangeKind::Removed);
        }
        if mask.contains(EventMask::MOVE_SELF) {
            return Some(ChangeKind::Rename);
        }
        return None;
    };

    if name != canary_name || mask.contains(EventMask::ISDIR) {
        return None;
    }

    if mask.contains(EventMask::DELETE) {
        Some(ChangeKind::Removed)
    } else if mask.intersects(EventMask::MOVED_FROM | EventMask::MOVED_TO) {
        Some(ChangeKind::Rename)
    } else if mask.contains(EventMask::ATTRIB) {
        Some(ChangeKind::Attribute)
    } else if mask.intersects(EventMask::MODIFY | EventMask::CLOSE_WRITE | EventMask::CREATE) {
        Some(ChangeKind::Write)
    } else {
        None
    }
}

// =============================================================================
// FolderWatch
// =============================================================================

/// Inotify subscription for a single canary file.
///
/// Forwards every matching notification without filtering or deduplication;
/// coalescing is the engine's job.
pub struct FolderWatch {
    id: FolderId,
    folder: Arc<MonitoredFolder>,
    canary_name: OsString,
    /// Async inotify event stream. Dropping it removes the watch.
    stream: EventStream<Vec<u8>>,
}

impl FolderWatch {
    /// Subscribe to change notifications for the folder's canary.
    ///
    /// # Errors
    /// Returns an error if inotify initialization or the watch fails.
    pub fn arm(id: FolderId, folder: Arc<MonitoredFolder>) -> Result<Self, SentinelError> {
        let stream = Inotify::init()
            .and_then(|inotify| inotify.into_event_stream(vec![0u8; INOTIFY_BUFFER_SIZE]))
            .map_err(|e| SentinelError::io(folder.path(), e))?;

        stream
            .watches()
            .add(folder.path(), CANARY_WATCH_MASK)
            .map_err(|e| SentinelError::io(folder.path(), e))?;

        let canary_name = folder
            .canary_path()
            .file_name()
            .map_or_else(|| OsString::from(CANARY_FILE_NAME), OsStr::to_os_string);

        info!("Folder {id}: watching {}", folder.canary_path().display());
        Ok(Self {
            id,
            folder,
            canary_name,
            stream,
        })
    }

    #[must_use]
    pub const fn id(&self) -> FolderId {
        self.id
    }

    /// Forward change events until cancelled, or until the engine goes away.
    pub async fn run(mut self, tx: mpsc::Sender<ChangeEvent>, cancel: CancellationToken) {
        let mut errors = ReadErrorBudget::default();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = self.stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => {
                    errors.reset();
                    event
                }
                Some(Err(e)) => {
                    let Some(pause) = errors.failed() else {
                        error!(
                            "Folder {}: giving up after {MAX_READ_ERRORS} consecutive inotify read errors, last: {e}",
                            self.id
                        );
                        break;
                    };
                    warn!(
                        "Folder {}: inotify read error: {e}, retrying in {}ms",
                        self.id,
                        pause.as_millis()
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(pause) => continue,
                    }
                }
                None => {
                    warn!("Folder {}: inotify stream ended", self.id);
                    break;
                }
            };

            let Some(kind) = classify(event.mask, event.name.as_deref(), &self.canary_name) else {
                continue;
            };
            if kind == ChangeKind::Rescan {
                warn!("Folder {}: inotify queue overflow", self.id);
            }
            debug!(
                "Folder {}: {kind:?} on {}",
                self.id,
                self.folder.canary_path().display()
            );

            let change = ChangeEvent {
                folder: self.id,
                detected_at: Instant::now(),
                kind,
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                sent = tx.send(change) => {
                    if sent.is_err() {
                        debug!("Folder {}: engine gone, stopping watch", self.id);
                        break;
                    }
                }
            }
        }
        debug!("Folder {}: watch disarmed", self.id);
    }
}

/// Backoff bookkeeping for failing inotify reads.
#[derive(Debug, Default)]
struct ReadErrorBudget {
    consecutive: u32,
}

impl ReadErrorBudget {
    /// Record a failed read. Returns the pause before retrying, or `None`
    /// once the budget is spent.
    fn failed(&mut self) -> Option<Duration> {
        self.consecutive += 1;
        if self.consecutive >= MAX_READ_ERRORS {
            return None;
        }
        let pause = READ_ERROR_BACKOFF.saturating_mul(1 << (self.consecutive - 1));
        Some(pause.min(READ_ERROR_BACKOFF_MAX))
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Merge per-folder event channels into one stream for the engine.
///
/// The stream ends once every sender is dropped.
pub fn merge_receivers(
    receivers: Vec<mpsc::Receiver<ChangeEvent>>,
) -> impl Stream<Item = ChangeEvent> + Unpin + Send {
    futures::stream::select_all(receivers.into_iter().map(|rx| {
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }))
}
