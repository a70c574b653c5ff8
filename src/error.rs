use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Point in the update run where a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validating,
    Staging,
    Swapping,
    Finalizing,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Staging => "staging",
            Self::Swapping => "swapping",
            Self::Finalizing => "finalizing",
        }
    }

    /// Phases before the `current` pointer has been replaced.
    pub fn is_pre_swap(self) -> bool {
        matches!(self, Self::Validating | Self::Staging | Self::Swapping)
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Detected before the swap; nothing live was mutated.
    Hard,
    /// Detected after the swap committed; reported but never compensated.
    Soft,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("manifest {path} is malformed: {reason}")]
    ManifestMalformed { path: PathBuf, reason: String },

    #[error("manifest signature verification failed: {reason}")]
    SignatureInvalid { reason: String },

    #[error("source file for '{entry}' is missing: {path}")]
    SourceFileMissing { entry: String, path: PathBuf },

    #[error("source file '{entry}' hash mismatch (expected {expected}, got {actual})")]
    HashMismatch {
        entry: String,
        expected: String,
        actual: String,
    },

    #[error("source file '{entry}' size mismatch (declared {declared} bytes, got {actual})")]
    SizeMismatch {
        entry: String,
        declared: u64,
        actual: u64,
    },

    #[error("staged copy of '{entry}' failed verification (expected {expected}, got {actual})")]
    CopyVerificationFailed {
        entry: String,
        expected: String,
        actual: String,
    },

    #[error("release '{version}' already exists at {path}")]
    ReleaseAlreadyExists { version: String, path: PathBuf },

    #[error("release '{version}' is missing required artifact '{artifact}'")]
    RequiredArtifactMissing { version: String, artifact: String },

    #[error("staged release '{version}' failed smoke check: {reason}")]
    StagedArtifactInvalid { version: String, reason: String },

    #[error("another update is already in progress{holder} (lock: {lock})")]
    UpdateInProgress { lock: PathBuf, holder: LockHolder },

    #[error("pointer {path} is corrupt: {reason}")]
    PointerCorrupt { path: PathBuf, reason: String },

    #[error("update interrupted during {phase}")]
    Interrupted { phase: Phase },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("post-swap verification of release '{version}' failed: {reason}")]
    PostSwapVerificationFailed { version: String, reason: String },

    #[error("failed writing version metadata {path}: {reason}")]
    MetadataWriteFailed { path: PathBuf, reason: String },

    #[error("failed pruning release {path}: {reason}")]
    RetentionPruneFailed { path: PathBuf, reason: String },
}

impl UpdateError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::PostSwapVerificationFailed { .. }
            | Self::MetadataWriteFailed { .. }
            | Self::RetentionPruneFailed { .. } => FailureClass::Soft,
            _ => FailureClass::Hard,
        }
    }

    /// Stable identifier used in reports, audit records and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ManifestMalformed { .. } => "manifest_malformed",
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::SourceFileMissing { .. } => "source_file_missing",
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::CopyVerificationFailed { .. } => "copy_verification_failed",
            Self::ReleaseAlreadyExists { .. } => "release_already_exists",
            Self::RequiredArtifactMissing { .. } => "required_artifact_missing",
            Self::StagedArtifactInvalid { .. } => "staged_artifact_invalid",
            Self::UpdateInProgress { .. } => "update_in_progress",
            Self::PointerCorrupt { .. } => "pointer_corrupt",
            Self::Interrupted { .. } => "interrupted",
            Self::Io { .. } => "io",
            Self::PostSwapVerificationFailed { .. } => "post_swap_verification_failed",
            Self::MetadataWriteFailed { .. } => "metadata_write_failed",
            Self::RetentionPruneFailed { .. } => "retention_prune_failed",
        }
    }

    pub(crate) fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        Self::ManifestMalformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn signature(reason: impl Into<String>) -> Self {
        Self::SignatureInvalid {
            reason: reason.into(),
        }
    }
}

/// Description of the process holding the update lock, parsed from the lock file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub operation: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
}

impl LockHolder {
    pub fn is_empty(&self) -> bool {
        self.operation.is_none() && self.pid.is_none() && self.started_at.is_none()
    }
}

impl Display for LockHolder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return Ok(());
        }

        let mut parts = Vec::new();
        if let Some(operation) = self.operation.as_deref() {
            parts.push(format!("operation={}", operation));
        }
        if let Some(pid) = self.pid {
            parts.push(format!("pid={}", pid));
        }
        if let Some(started_at) = self.started_at.as_deref() {
            parts.push(format!("started_at={}", started_at));
        }
        write!(f, ": {}", parts.join(" "))
    }
}

/// A terminal failure of an update run, tagged with the phase it happened in.
#[derive(Debug, Error)]
#[error("update failed while {phase}: {error}")]
pub struct UpdateFailure {
    pub phase: Phase,
    #[source]
    pub error: UpdateError,
}

impl UpdateFailure {
    pub fn new(phase: Phase, error: UpdateError) -> Self {
        Self { phase, error }
    }

    /// `current` still targets the release it targeted before the run.
    pub fn current_unchanged(&self) -> bool {
        self.phase.is_pre_swap()
    }

    pub fn exit_code(&self) -> i32 {
        match self.error {
            UpdateError::UpdateInProgress { .. } => 3,
            _ => 1,
        }
    }
}

/// Soft failure as surfaced in reports and audit records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftFailure {
    pub code: String,
    pub message: String,
}

impl From<&UpdateError> for SoftFailure {
    fn from(error: &UpdateError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}
