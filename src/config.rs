// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::baseline::BaselineSource;
use crate::error::SentinelError;
use crate::mailer::check_address;

/// Default debounce duration in milliseconds
const fn default_debounce_ms() -> u64 {
    300
}

const fn default_read_attempts() -> u32 {
    5
}

const fn default_retry_backoff_ms() -> u64 {
    50
}

const fn default_test_mode() -> bool {
    true
}

const fn default_smtp_port() -> u16 {
    25
}

fn default_service() -> String {
    "smbd".to_string()
}

/// Whether tamper detection stops the sharing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Log and alert only; the service is never touched.
    ObserveOnly,
    /// Stop the sharing service on tamper.
    Enforcing,
}

/// Alert addressing.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    pub to: String,
    pub from: String,
    /// SMTP relay host, optionally `host:port`.
    pub server: String,
    /// Relay port used when `server` carries none (default 25).
    #[serde(default = "default_smtp_port")]
    pub port: u16,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            to: "admin@example.com".to_string(),
            from: "canary-sentinel@example.com".to_string(),
            server: "localhost".to_string(),
            port: default_smtp_port(),
        }
    }
}

/// A folder to plant and watch a canary in.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FolderConfig {
    /// Absolute directory path.
    pub path: PathBuf,
}

/// Sentinel configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SentinelConfig {
    /// Observe-only mode: detect and alert, never stop the service (default: true).
    #[serde(default = "default_test_mode")]
    pub test_mode: bool,

    /// Systemd unit providing file sharing (default: smbd).
    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default)]
    pub email: EmailConfig,

    /// Folders in configuration order.
    #[serde(default)]
    pub folders: Vec<FolderConfig>,

    /// Coalescing window for bursts of change notifications (default: 300ms).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Read attempts before an unreadable canary counts as tampered (default: 5).
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,

    /// Initial backoff between read attempts, doubled each retry (default: 50ms).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Operator-supplied decoy. Uses the embedded one when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_path: Option<PathBuf>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            test_mode: default_test_mode(),
            service: default_service(),
            email: EmailConfig::default(),
            folders: vec![FolderConfig {
                path: PathBuf::from("/srv/share"),
            }],
            debounce_ms: default_debounce_ms(),
            read_attempts: default_read_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            baseline_path: None,
        }
    }
}

/// Check if a path is an accessible directory.
fn check_dir(dir: &Path) -> Result<(), &'static str> {
    match dir.metadata() {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err("is not a directory"),
        Err(e) if e.kind() == ErrorKind::NotFound => Err("does not exist"),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Err("permission denied"),
        Err(_) => Err("is not accessible"),
    }
}

impl FolderConfig {
    /// Validate a folder entry.
    pub fn validate(&self) -> Result<(), String> {
        if !self.path.is_absolute() {
            return Err("path must be absolute".to_string());
        }
        check_dir(&self.path).map_err(|e| format!("path {e}"))
    }
}

impl SentinelConfig {
    #[must_use]
    pub const fn mode(&self) -> OperatingMode {
        if self.test_mode {
            OperatingMode::ObserveOnly
        } else {
            OperatingMode::Enforcing
        }
    }

    #[must_use]
    pub fn baseline_source(&self) -> BaselineSource {
        self.baseline_path
            .clone()
            .map_or(BaselineSource::Embedded, BaselineSource::File)
    }

    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Check whether the configuration can protect anything.
    pub fn validate(&self) -> Result<(), SentinelError> {
        if self.folders.is_empty() {
            return Err(SentinelError::ConfigInvalid(
                "no folders configured".to_string(),
            ));
        }
        if self.service.trim().is_empty() {
            return Err(SentinelError::ConfigInvalid(
                "service name is empty".to_string(),
            ));
        }
        for address in [&self.email.from, &self.email.to] {
            check_address(address).map_err(SentinelError::ConfigInvalid)?;
        }
        Ok(())
    }

    /// Log configuration info.
    pub fn log_config_info(&self) {
        match self.mode() {
            OperatingMode::ObserveOnly => {
                warn!("Test mode enabled: service '{}' will not be stopped", self.service);
            }
            OperatingMode::Enforcing => {
                info!("Enforcing: service '{}' will be stopped on tamper", self.service);
            }
        }
        info!(
            "Alerts: {} -> {} via {}",
            self.email.from, self.email.to, self.email.server
        );
        if let Some(ref path) = self.baseline_path {
            info!("Baseline override: {}", path.display());
        }
        debug!(
            "Debounce {}ms, {} read attempts, backoff {}ms",
            self.debounce_ms, self.read_attempts, self.retry_backoff_ms
        );
    }

    /// Load configuration from file, dropping folders that fail validation.
    pub fn load_config(config_path: &Path) -> Result<Self> {
        let config_data = fs::read(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Self =
            serde_json::from_slice(&config_data).context("Failed to parse config JSON")?;

        info!("Loaded configuration for {} folders", config.folders.len());

        let original_count = config.folders.len();
        config.folders.retain(|folder| match folder.validate() {
            Ok(()) => {
                debug!("Folder '{}': ready for operation", folder.path.display());
                true
            }
            Err(e) => {
                error!("Folder '{}': {e}", folder.path.display());
                warn!(
                    "Folder '{}': removed due to configuration errors",
                    folder.path.display()
                );
                false
            }
        });

        validate_unique_folders(&config.folders)?;

        let final_count = config.folders.len();
        if final_count < original_count {
            warn!(
                "Removed {} folders due to configuration issues",
                original_count - final_count
            );
        }

        config.log_config_info();
        Ok(config)
    }

    /// Write a template configuration for the operator to edit.
    pub fn write_template(config_path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(&Self::default())
            .context("Failed to serialize template config")?;
        fs::write(config_path, data).with_context(|| {
            format!("Failed to write template config: {}", config_path.display())
        })
    }
}

/// Validate that no two folders resolve to the same directory.
fn validate_unique_folders(folders: &[FolderConfig]) -> Result<()> {
    let mut seen = HashMap::new();

    for folder in folders {
        let canonical = folder
            .path
            .canonicalize()
            .unwrap_or_else(|_| folder.path.clone());
        if let Some(existing) = seen.insert(canonical, &folder.path) {
            anyhow::bail!(
                "Folders '{}' and '{}' refer to the same directory",
                existing.display(),
                folder.path.display()
            );
        }
    }

    Ok(())
}

/// Verify configuration file without starting the sentinel.
pub fn verify_config(config_path: &Path) -> Result<()> {
    let config_data = fs::read(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

    let config: SentinelConfig =
        serde_json::from_slice(&config_data).context("Failed to parse config JSON")?;

    let (total_valid, total_invalid) =
        config
            .folders
            .iter()
            .fold((0, 0), |(valid, invalid), folder| match folder.validate() {
                Ok(()) => {
                    eprintln!("Folder '{}': valid", folder.path.display());
                    (valid + 1, invalid)
                }
                Err(e) => {
                    eprintln!("Folder '{}': {e}", folder.path.display());
                    (valid, invalid + 1)
                }
            });

    validate_unique_folders(&config.folders)?;
    config.validate()?;

    eprintln!("{total_valid} valid, {total_invalid} invalid");

    if total_invalid > 0 {
        anyhow::bail!("Configuration has {total_invalid} invalid folders");
    }

    Ok(())
}
