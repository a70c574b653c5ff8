use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use crate::audit::verify_audit_log;
use crate::config::{DoctorReport, Settings};
use crate::error::UpdateError;
use crate::lock::lock_status;
use crate::updater::ReleaseManager;

/// JSON-report facade over [`ReleaseManager`] used by the command line.
pub struct ReleaseApp {
    settings: Settings,
    manager: ReleaseManager,
}

impl ReleaseApp {
    pub fn new(settings: Settings) -> Result<Self> {
        let manager = ReleaseManager::from_settings(&settings);
        Ok(Self {
            settings,
            manager,
        })
    }

    /// Ctrl-C sets `cancel`; an update observing it before the swap aborts as interrupted.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.manager = ReleaseManager::from_settings(&self.settings).with_cancel_flag(cancel);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn doctor(&self) -> DoctorReport {
        self.settings.doctor_report()
    }

    pub fn doctor_json(&self) -> Result<String> {
        let report = self.doctor();
        let status = if report.warnings.is_empty() {
            "ok"
        } else {
            "warning"
        };
        serde_json::to_string_pretty(&json!({
            "status": status,
            "report": report
        }))
        .context("failed to encode doctor report")
    }

    /// Runs one update and returns the process exit code with its JSON report.
    pub fn update_json(
        &self,
        manifest: &Path,
        signature: &Path,
        public_key: &Path,
        source_dir: Option<&Path>,
    ) -> Result<(i32, String)> {
        match self.manager.update(manifest, signature, public_key, source_dir) {
            Ok(report) => {
                let exit_code = report.exit_code();
                let encoded = serde_json::to_string_pretty(&json!({
                    "status": report.status,
                    "exit_code": exit_code,
                    "report": report
                }))
                .context("failed to encode update report")?;
                Ok((exit_code, encoded))
            }
            Err(failure) => {
                let exit_code = failure.exit_code();
                let holder = match &failure.error {
                    UpdateError::UpdateInProgress { holder, .. } => Some(holder),
                    _ => None,
                };
                let encoded = serde_json::to_string_pretty(&json!({
                    "status": "failed",
                    "exit_code": exit_code,
                    "phase": failure.phase,
                    "code": failure.error.code(),
                    "class": failure.error.class(),
                    "current_unchanged": failure.current_unchanged(),
                    "error": failure.error.to_string(),
                    "lock_holder": holder,
                }))
                .context("failed to encode update failure")?;
                Ok((exit_code, encoded))
            }
        }
    }

    pub fn status_json(&self) -> Result<String> {
        let report = self.manager.status()?;
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "report": report
        }))
        .context("failed to encode release status")
    }

    pub fn lock_status_json(&self) -> Result<String> {
        let report = lock_status(self.manager.layout())?;
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "report": report
        }))
        .context("failed to encode lock status")
    }

    /// Exit code `1` when the chain is broken; the report names the first bad line.
    pub fn audit_verify_json(&self) -> Result<(i32, String)> {
        let report = verify_audit_log(&self.manager.layout().audit_log_path())?;
        let exit_code = if report.valid { 0 } else { 1 };
        let encoded = serde_json::to_string_pretty(&json!({
            "status": if report.valid { "ok" } else { "failed" },
            "exit_code": exit_code,
            "report": report
        }))
        .context("failed to encode audit verify result")?;
        Ok((exit_code, encoded))
    }

    /// Applies retention on demand; `keep` overrides the configured window.
    pub fn prune_json(&self, keep: Option<usize>) -> Result<(i32, String)> {
        let manager = match keep {
            Some(keep) => ReleaseManager::from_settings(&self.settings).with_retention(keep),
            None => ReleaseManager::from_settings(&self.settings),
        };
        match manager.prune() {
            Ok(report) => {
                let exit_code = if report.failures.is_empty() { 0 } else { 2 };
                let encoded = serde_json::to_string_pretty(&json!({
                    "status": if exit_code == 0 { "ok" } else { "warning" },
                    "exit_code": exit_code,
                    "report": report
                }))
                .context("failed to encode prune report")?;
                Ok((exit_code, encoded))
            }
            Err(err) => {
                let exit_code = match err {
                    UpdateError::UpdateInProgress { .. } => 3,
                    _ => 1,
                };
                let encoded = serde_json::to_string_pretty(&json!({
                    "status": "failed",
                    "exit_code": exit_code,
                    "code": err.code(),
                    "error": err.to_string(),
                }))
                .context("failed to encode prune failure")?;
                Ok((exit_code, encoded))
            }
        }
    }
}
