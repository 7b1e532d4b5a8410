// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::debug;
use nix::unistd::{Uid, User};

/// Placeholder reported when the owner cannot be determined.
pub const UNKNOWN_OWNER: &str = "unknown owner";

/// Best-effort identity of whoever owns a file.
pub trait OwnerLookup: Send + Sync {
    /// Returns `None` when the owner cannot be determined.
    fn owner(&self, path: &Path) -> Option<String>;
}

/// Resolves the file's uid through the system account database.
pub struct SystemOwnerLookup;

impl OwnerLookup for SystemOwnerLookup {
    fn owner(&self, path: &Path) -> Option<String> {
        let uid = match fs::symlink_metadata(path) {
            Ok(meta) => meta.uid(),
            Err(e) => {
                debug!("Owner lookup failed for {}: {e}", path.display());
                return None;
            }
        };

        match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => Some(format!("{} (uid {uid})", user.name)),
            Ok(None) => Some(format!("uid {uid}")),
            Err(e) => {
                debug!("Account lookup failed for uid {uid}: {e}");
                Some(format!("uid {uid}"))
            }
        }
    }
}
