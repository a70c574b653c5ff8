//! Append-only, hash-chained JSONL journal of update and prune runs.
//!
//! Each record stores the SHA-256 of its own canonical payload plus the hash of the record
//! before it, so truncation in the middle or in-place edits are detected by
//! [`verify_audit_log`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::manifest::normalize_sha256_hex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub event: String,
    pub status: String,
    pub manifest_path: Option<String>,
    pub manifest_sha256: Option<String>,
    pub version: Option<String>,
    pub previous_version: Option<String>,
    pub rollback_version: Option<String>,
    pub phase: Option<String>,
    pub files_count: Option<u64>,
    pub total_bytes: Option<u64>,
    pub error_code: Option<String>,
    pub error: Option<String>,
    pub prev_hash: Option<String>,
    pub hash: String,
}

/// Fields supplied by the caller; timestamp and chain hashes are filled in on append.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub event: String,
    pub status: String,
    pub manifest_path: Option<String>,
    pub manifest_sha256: Option<String>,
    pub version: Option<String>,
    pub previous_version: Option<String>,
    pub rollback_version: Option<String>,
    pub phase: Option<String>,
    pub files_count: Option<u64>,
    pub total_bytes: Option<u64>,
    pub error_code: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditVerifyReport {
    pub audit_log_path: String,
    pub entries: usize,
    pub last_hash: Option<String>,
    pub valid: bool,
    pub failed_line: Option<usize>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditJournal {
    path: PathBuf,
}

impl AuditJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends and logs on failure; the journal never decides the outcome of a run.
    pub fn append_safe(&self, event: AuditEvent) {
        if let Err(err) = self.append(event) {
            warn!(audit_log = %self.path.display(), error = %err, "failed appending audit record");
        }
    }

    pub fn append(&self, event: AuditEvent) -> Result<AuditRecord> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating audit dir {}", parent.display()))?;
        }

        let prev_hash = read_last_audit_hash(&self.path)?;
        let mut record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            event: event.event,
            status: event.status,
            manifest_path: event.manifest_path,
            manifest_sha256: event.manifest_sha256,
            version: event.version,
            previous_version: event.previous_version,
            rollback_version: event.rollback_version,
            phase: event.phase,
            files_count: event.files_count,
            total_bytes: event.total_bytes,
            error_code: event.error_code,
            error: event.error,
            prev_hash,
            hash: String::new(),
        };
        record.hash = compute_audit_record_hash(&record);

        let mut line = serde_json::to_string(&record).context("failed encoding audit record")?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed writing audit log {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed flushing audit log {}", self.path.display()))?;
        Ok(record)
    }
}

/// Walks the whole journal, recomputing each hash and checking the `prev_hash` links.
///
/// A broken chain is reported with `valid: false` and the first offending line; only an
/// unreadable journal is an error.
pub fn verify_audit_log(path: &Path) -> Result<AuditVerifyReport> {
    let mut report = AuditVerifyReport {
        audit_log_path: path.display().to_string(),
        entries: 0,
        last_hash: None,
        valid: true,
        failed_line: None,
        failure: None,
    };
    if !path.exists() {
        return Ok(report);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading audit log {}", path.display()))?;
    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        match verify_record(line, report.last_hash.as_deref()) {
            Ok(hash) => {
                report.last_hash = Some(hash);
                report.entries += 1;
            }
            Err(reason) => {
                warn!(audit_log = %path.display(), line = line_no, %reason, "audit chain broken");
                report.valid = false;
                report.failed_line = Some(line_no);
                report.failure = Some(reason);
                return Ok(report);
            }
        }
    }
    Ok(report)
}

fn verify_record(
    line: &str,
    expected_prev_hash: Option<&str>,
) -> std::result::Result<String, String> {
    let record: AuditRecord =
        serde_json::from_str(line).map_err(|err| format!("undecodable record: {}", err))?;
    let record_hash =
        normalize_sha256_hex(&record.hash).map_err(|err| format!("invalid hash: {}", err))?;
    if compute_audit_record_hash(&record) != record_hash {
        return Err("hash mismatch".to_string());
    }

    let prev_hash = normalize_optional_hash(record.prev_hash.as_deref())
        .map_err(|err| format!("invalid prev_hash: {}", err))?;
    if prev_hash.as_deref() != expected_prev_hash {
        return Err("prev_hash mismatch".to_string());
    }
    Ok(record_hash)
}

fn read_last_audit_hash(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading audit log {}", path.display()))?;
    let Some(last_line) = raw.lines().rev().find(|line| !line.trim().is_empty()) else {
        return Ok(None);
    };
    let parsed: AuditRecord =
        serde_json::from_str(last_line).context("failed decoding last audit record")?;
    normalize_optional_hash(Some(parsed.hash.as_str())).map_err(|err| anyhow!(err))
}

fn normalize_optional_hash(raw: Option<&str>) -> std::result::Result<Option<String>, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => normalize_sha256_hex(value).map(Some),
    }
}

fn compute_audit_record_hash(record: &AuditRecord) -> String {
    fn opt<T: ToString>(value: &Option<T>) -> String {
        value.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    let payload = format!(
        "timestamp={}\nevent={}\nstatus={}\nmanifest_path={}\nmanifest_sha256={}\nversion={}\nprevious_version={}\nrollback_version={}\nphase={}\nfiles_count={}\ntotal_bytes={}\nerror_code={}\nerror={}\nprev_hash={}\n",
        record.timestamp,
        record.event,
        record.status,
        opt(&record.manifest_path),
        opt(&record.manifest_sha256),
        opt(&record.version),
        opt(&record.previous_version),
        opt(&record.rollback_version),
        opt(&record.phase),
        opt(&record.files_count),
        opt(&record.total_bytes),
        opt(&record.error_code),
        opt(&record.error),
        opt(&record.prev_hash),
    );
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}
