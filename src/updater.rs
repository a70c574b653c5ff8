//! Update orchestration: one linear run per invocation, gated phase by phase.
//!
//! `Validating` and `Staging` never touch the live pointers. `Swapping` ends with the single
//! rename of `current`. Anything that goes wrong in `Finalizing` is reported as a soft failure
//! and never undone.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn, Span};

use crate::audit::{AuditEvent, AuditJournal};
use crate::config::Settings;
use crate::error::{Phase, SoftFailure, UpdateError, UpdateFailure};
use crate::integrity::{stage_files, IntegrityCounters};
use crate::layout::{ReleaseEntry, ReleaseLayout};
use crate::lock::{lock_status, LockStatusReport, ReleaseLock};
use crate::manifest::load_manifest;
use crate::metadata::{read_metadata, write_metadata, VersionMetadata};
use crate::observability::record_update;
use crate::retention::{compare_versions, prune_releases, RetentionReport};
use crate::signature::verify_manifest_signature;
use crate::smoke::SmokeCheck;
use crate::stager::{remove_orphaned_staging, sync_dir, StagedRelease};
use crate::swap::{promote, verify_promotion};

/// State threaded through every phase of one update run.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateContext {
    pub base_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub source_dir: PathBuf,
    pub phase: Phase,
    pub version: Option<String>,
    pub previous_version: Option<String>,
    pub update_type: Option<String>,
    pub manifest_sha256: Option<String>,
    pub counters: IntegrityCounters,
    pub release_dir: Option<PathBuf>,
    pub rollback_version: Option<String>,
    pub swapped: bool,
}

impl UpdateContext {
    fn new(base_dir: &Path, manifest_path: &Path, source_dir: Option<&Path>) -> Self {
        let source_dir = source_dir.map(Path::to_path_buf).unwrap_or_else(|| {
            manifest_path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        Self {
            base_dir: base_dir.to_path_buf(),
            manifest_path: manifest_path.to_path_buf(),
            source_dir,
            phase: Phase::Validating,
            version: None,
            previous_version: None,
            update_type: None,
            manifest_sha256: None,
            counters: IntegrityCounters::default(),
            release_dir: None,
            rollback_version: None,
            swapped: false,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug!(from = %self.phase, to = %next, "update phase transition");
        self.phase = next;
    }

    fn fail(&self, error: UpdateError) -> UpdateFailure {
        UpdateFailure::new(self.phase, error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Succeeded,
    /// The swap committed but at least one post-swap step failed.
    SucceededWithWarnings,
}

impl UpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::SucceededWithWarnings => "succeeded_with_warnings",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub status: UpdateStatus,
    pub version: String,
    pub previous_version: Option<String>,
    pub rollback_version: Option<String>,
    pub update_type: String,
    pub manifest_sha256: String,
    pub release_dir: String,
    pub files_count: usize,
    pub total_bytes: u64,
    pub smoke_check: String,
    pub post_swap_verified: bool,
    pub metadata_written: bool,
    pub recovered_orphans: Vec<String>,
    pub retention: Option<RetentionReport>,
    pub soft_failures: Vec<SoftFailure>,
    pub duration_ms: u64,
}

impl UpdateReport {
    /// `0` on a clean run, `2` when the swap committed with soft failures.
    pub fn exit_code(&self) -> i32 {
        if self.soft_failures.is_empty() {
            0
        } else {
            2
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseStatus {
    pub base_dir: String,
    pub current: Option<String>,
    pub rollback: Option<String>,
    pub releases: Vec<ReleaseEntry>,
    pub metadata: Option<VersionMetadata>,
    pub lock: LockStatusReport,
}

pub struct ReleaseManager {
    layout: ReleaseLayout,
    retention_keep: usize,
    required_artifacts: Vec<String>,
    smoke_check: SmokeCheck,
    hash_workers: usize,
    audit: Option<AuditJournal>,
    cancel: Option<Arc<AtomicBool>>,
}

impl ReleaseManager {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let layout = ReleaseLayout::new(base_dir);
        let audit = AuditJournal::new(layout.audit_log_path());
        Self {
            layout,
            retention_keep: 3,
            required_artifacts: vec!["index.db".to_string()],
            smoke_check: SmokeCheck::Builtin,
            hash_workers: 1,
            audit: Some(audit),
            cancel: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.base_dir)
            .with_retention(settings.retention_keep)
            .with_required_artifacts(settings.required_artifacts.clone())
            .with_smoke_check(settings.smoke_check())
            .with_hash_workers(settings.hash_workers)
            .with_audit(settings.audit_enabled)
    }

    pub fn with_retention(mut self, keep: usize) -> Self {
        self.retention_keep = keep.max(1);
        self
    }

    pub fn with_required_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.required_artifacts = artifacts;
        self
    }

    pub fn with_smoke_check(mut self, check: SmokeCheck) -> Self {
        self.smoke_check = check;
        self
    }

    pub fn with_hash_workers(mut self, workers: usize) -> Self {
        self.hash_workers = workers.max(1);
        self
    }

    pub fn with_audit(mut self, enabled: bool) -> Self {
        self.audit = enabled.then(|| AuditJournal::new(self.layout.audit_log_path()));
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn layout(&self) -> &ReleaseLayout {
        &self.layout
    }

    /// Verifies, stages and promotes the release described by `manifest_path`.
    ///
    /// Any `Err` means `current` was not touched. `Ok` means `current` targets the new
    /// release; post-swap problems are listed in `soft_failures`.
    #[instrument(
        name = "release_update",
        skip_all,
        fields(manifest = %manifest_path.display(), version = tracing::field::Empty)
    )]
    pub fn update(
        &self,
        manifest_path: &Path,
        signature_path: &Path,
        public_key_path: &Path,
        source_dir: Option<&Path>,
    ) -> Result<UpdateReport, UpdateFailure> {
        let started = Instant::now();
        let mut ctx = UpdateContext::new(self.layout.base(), manifest_path, source_dir);

        // A contended run never owned the base directory; the holder journals its own run.
        let result = match ReleaseLock::acquire(&self.layout, "update") {
            Ok(lock) => {
                let result = self.run_update(&mut ctx, signature_path, public_key_path, started);
                self.audit_update(&lock, &ctx, &result);
                drop(lock);
                result
            }
            Err(err) => Err(ctx.fail(err)),
        };

        match &result {
            Ok(report) => {
                info!(
                    version = %report.version,
                    rollback = report.rollback_version.as_deref().unwrap_or("-"),
                    files = report.files_count,
                    bytes = report.total_bytes,
                    soft_failures = report.soft_failures.len(),
                    "release promoted"
                );
                record_update(
                    report.status.as_str(),
                    report.soft_failures.first().map(|failure| failure.code.as_str()),
                    started.elapsed(),
                    report.total_bytes,
                );
            }
            Err(failure) => {
                warn!(
                    phase = %failure.phase,
                    code = failure.error.code(),
                    error = %failure.error,
                    current_unchanged = failure.current_unchanged(),
                    "update aborted"
                );
                record_update("failed", Some(failure.error.code()), started.elapsed(), 0);
            }
        }
        result
    }

    fn run_update(
        &self,
        ctx: &mut UpdateContext,
        signature_path: &Path,
        public_key_path: &Path,
        started: Instant,
    ) -> Result<UpdateReport, UpdateFailure> {
        self.layout.ensure_dirs().map_err(|err| ctx.fail(err))?;
        self.layout.current_version().map_err(|err| ctx.fail(err))?;
        self.layout.rollback_version().map_err(|err| ctx.fail(err))?;
        let recovered_orphans =
            remove_orphaned_staging(&self.layout).map_err(|err| ctx.fail(err))?;

        let loaded = load_manifest(&ctx.manifest_path).map_err(|err| ctx.fail(err))?;
        let version = loaded.manifest.version.clone();
        Span::current().record("version", version.as_str());
        ctx.version = Some(version.clone());
        ctx.previous_version = loaded.manifest.previous_version.clone();
        ctx.update_type = Some(loaded.manifest.update_type.as_str().to_string());
        ctx.manifest_sha256 = Some(loaded.sha256.clone());
        info!(
            version = %version,
            manifest_sha256 = %loaded.sha256,
            files = loaded.manifest.files.len(),
            "manifest loaded"
        );

        verify_manifest_signature(&loaded.raw, signature_path, public_key_path)
            .map_err(|err| ctx.fail(err))?;
        info!(version = %version, "manifest signature verified");
        self.check_cancelled(ctx)?;

        ctx.advance(Phase::Staging);
        let mut staged = StagedRelease::create(&self.layout, &version).map_err(|err| ctx.fail(err))?;
        ctx.release_dir = Some(staged.path().to_path_buf());
        stage_files(
            &loaded.manifest.files,
            &ctx.source_dir,
            staged.path(),
            self.hash_workers,
            self.cancel.as_deref(),
            &mut ctx.counters,
        )
        .map_err(|err| ctx.fail(err))?;
        staged
            .check_required_artifacts(&self.required_artifacts)
            .map_err(|err| ctx.fail(err))?;
        staged
            .smoke_check(&self.smoke_check, &self.required_artifacts)
            .map_err(|err| ctx.fail(err))?;
        self.check_cancelled(ctx)?;
        staged.seal().map_err(|err| ctx.fail(err))?;
        info!(
            version = %version,
            files = ctx.counters.processed_files,
            bytes = ctx.counters.total_bytes,
            "release staged"
        );

        ctx.advance(Phase::Swapping);
        let outcome = promote(&self.layout, &version).map_err(|err| ctx.fail(err))?;
        let release_dir = staged.commit();
        ctx.swapped = true;
        ctx.rollback_version = outcome.previous.clone();

        ctx.advance(Phase::Finalizing);
        let mut soft_failures = Vec::new();

        if let Err(err) = sync_dir(self.layout.base()) {
            record_soft(
                &mut soft_failures,
                UpdateError::PostSwapVerificationFailed {
                    version: version.clone(),
                    reason: format!("durability flush failed: {}", err),
                },
            );
        }

        let post_swap_verified =
            match verify_promotion(&self.layout, &version, &self.smoke_check, &self.required_artifacts) {
                Ok(_) => true,
                Err(err) => {
                    record_soft(&mut soft_failures, err);
                    false
                }
            };

        let retention = match prune_releases(&self.layout, self.retention_keep) {
            Ok(report) => Some(report),
            Err(err) => {
                record_soft(
                    &mut soft_failures,
                    UpdateError::RetentionPruneFailed {
                        path: self.layout.releases_dir(),
                        reason: err.to_string(),
                    },
                );
                None
            }
        };
        if let Some(report) = retention.as_ref() {
            soft_failures.extend(report.failures.iter().cloned());
        }

        let metadata = VersionMetadata {
            current_version: version.clone(),
            previous_version: ctx.previous_version.clone(),
            update_type: loaded.manifest.update_type.as_str().to_string(),
            updated_at: Utc::now().to_rfc3339(),
            files_count: ctx.counters.processed_files,
            total_bytes: ctx.counters.total_bytes,
            manifest_sha256: Some(loaded.sha256.clone()),
            rollback_version: outcome.previous.clone(),
            retained_releases: retained_releases(retention.as_ref()),
        };
        let metadata_written = match write_metadata(&self.layout.metadata_path(), &metadata) {
            Ok(()) => true,
            Err(err) => {
                record_soft(&mut soft_failures, err);
                false
            }
        };

        let status = if soft_failures.is_empty() {
            UpdateStatus::Succeeded
        } else {
            UpdateStatus::SucceededWithWarnings
        };
        Ok(UpdateReport {
            status,
            version,
            previous_version: ctx.previous_version.clone(),
            rollback_version: outcome.previous,
            update_type: metadata.update_type,
            manifest_sha256: loaded.sha256,
            release_dir: release_dir.display().to_string(),
            files_count: ctx.counters.processed_files,
            total_bytes: ctx.counters.total_bytes,
            smoke_check: self.smoke_check.kind().to_string(),
            post_swap_verified,
            metadata_written,
            recovered_orphans,
            retention,
            soft_failures,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Applies the retention window outside of an update run.
    pub fn prune(&self) -> Result<RetentionReport, UpdateError> {
        let _lock = ReleaseLock::acquire(&self.layout, "prune")?;
        let report = prune_releases(&self.layout, self.retention_keep)?;
        if let Some(audit) = self.audit.as_ref() {
            audit.append_safe(AuditEvent {
                event: "prune".to_string(),
                status: if report.failures.is_empty() {
                    "succeeded".to_string()
                } else {
                    "succeeded_with_warnings".to_string()
                },
                version: self.layout.current_version().ok().flatten(),
                rollback_version: self.layout.rollback_version().ok().flatten(),
                error_code: report.failures.first().map(|failure| failure.code.clone()),
                error: report.failures.first().map(|failure| failure.message.clone()),
                ..AuditEvent::default()
            });
        }
        Ok(report)
    }

    pub fn status(&self) -> Result<ReleaseStatus> {
        Ok(ReleaseStatus {
            base_dir: self.layout.base().display().to_string(),
            current: self.layout.current_version()?,
            rollback: self.layout.rollback_version()?,
            releases: self.layout.list_releases()?,
            metadata: read_metadata(&self.layout.metadata_path())?,
            lock: lock_status(&self.layout)?,
        })
    }

    fn check_cancelled(&self, ctx: &UpdateContext) -> Result<(), UpdateFailure> {
        let cancelled = self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst));
        if cancelled {
            return Err(ctx.fail(UpdateError::Interrupted { phase: ctx.phase }));
        }
        Ok(())
    }

    /// Appends the run's record; `_lock` proves the chain is extended under the update lock.
    fn audit_update(
        &self,
        _lock: &ReleaseLock,
        ctx: &UpdateContext,
        result: &Result<UpdateReport, UpdateFailure>,
    ) {
        let Some(audit) = self.audit.as_ref() else {
            return;
        };
        let (status, failure) = match result {
            Ok(report) => (report.status.as_str(), report.soft_failures.first().cloned()),
            Err(failure) => ("failed", Some(SoftFailure::from(&failure.error))),
        };
        audit.append_safe(AuditEvent {
            event: "update".to_string(),
            status: status.to_string(),
            manifest_path: Some(ctx.manifest_path.display().to_string()),
            manifest_sha256: ctx.manifest_sha256.clone(),
            version: ctx.version.clone(),
            previous_version: ctx.previous_version.clone(),
            rollback_version: ctx.rollback_version.clone(),
            phase: Some(ctx.phase.as_str().to_string()),
            files_count: Some(ctx.counters.processed_files as u64),
            total_bytes: Some(ctx.counters.total_bytes),
            error_code: failure.as_ref().map(|failure| failure.code.clone()),
            error: failure.map(|failure| failure.message),
        });
    }
}

fn record_soft(soft_failures: &mut Vec<SoftFailure>, err: UpdateError) {
    warn!(code = err.code(), error = %err, "post-swap step failed");
    soft_failures.push(SoftFailure::from(&err));
}

/// Retained release names in ascending order, for `version.json`.
fn retained_releases(retention: Option<&RetentionReport>) -> Vec<String> {
    let mut kept = retention
        .map(|report| report.kept.clone())
        .unwrap_or_default();
    kept.sort_by(|a, b| compare_versions(a, b).then_with(|| a.cmp(b)));
    kept
}
