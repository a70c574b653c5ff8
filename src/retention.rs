use std::cmp::Ordering;
use std::fs;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{SoftFailure, UpdateError};
use crate::layout::{ReleaseEntry, ReleaseLayout};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub keep: usize,
    pub kept: Vec<String>,
    pub pruned: Vec<String>,
    pub failures: Vec<SoftFailure>,
}

/// Deletes releases outside the newest `keep`, never touching `current` or `rollback`.
///
/// Deletion failures are collected as soft failures; only an unreadable layout is an error.
pub fn prune_releases(layout: &ReleaseLayout, keep: usize) -> Result<RetentionReport, UpdateError> {
    let keep = keep.max(1);
    let current = layout.current_version()?;
    let rollback = layout.rollback_version()?;

    let mut releases = layout.list_releases()?;
    releases.sort_by(newest_first);

    let mut report = RetentionReport {
        keep,
        ..RetentionReport::default()
    };
    for (rank, entry) in releases.into_iter().enumerate() {
        let protected = current.as_deref() == Some(entry.version.as_str())
            || rollback.as_deref() == Some(entry.version.as_str());
        if rank < keep || protected {
            report.kept.push(entry.version);
            continue;
        }

        match remove_release(&entry) {
            Ok(()) => {
                info!(version = %entry.version, "pruned release");
                report.pruned.push(entry.version);
            }
            Err(err) => {
                warn!(version = %entry.version, error = %err, "failed pruning release");
                report.failures.push(SoftFailure::from(&err));
                report.kept.push(entry.version);
            }
        }
    }

    Ok(report)
}

fn remove_release(entry: &ReleaseEntry) -> Result<(), UpdateError> {
    let failed = |reason: String| UpdateError::RetentionPruneFailed {
        path: entry.path.clone(),
        reason,
    };

    // Staged files are sealed read-only; directories keep their write bit.
    fs::remove_dir_all(&entry.path).map_err(|err| failed(err.to_string()))
}

fn newest_first(a: &ReleaseEntry, b: &ReleaseEntry) -> Ordering {
    let a_time = a.modified.unwrap_or(SystemTime::UNIX_EPOCH);
    let b_time = b.modified.unwrap_or(SystemTime::UNIX_EPOCH);
    b_time
        .cmp(&a_time)
        .then_with(|| compare_versions(&b.version, &a.version))
        .then_with(|| b.version.cmp(&a.version))
}

/// Orders dotted numeric versions (`v1.10` after `v1.9`); non-numeric versions compare equal.
pub fn compare_versions(lhs: &str, rhs: &str) -> Ordering {
    match (parse_version_components(lhs), parse_version_components(rhs)) {
        (Some(lhs), Some(rhs)) => compare_version_components(&lhs, &rhs),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn parse_version_components(raw: &str) -> Option<Vec<u64>> {
    let trimmed = raw.trim();
    let normalized = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if normalized.is_empty() {
        return None;
    }
    normalized
        .split('.')
        .map(|segment| {
            if segment.is_empty() || !segment.chars().all(|ch| ch.is_ascii_digit()) {
                return None;
            }
            segment.parse::<u64>().ok()
        })
        .collect()
}

fn compare_version_components(lhs: &[u64], rhs: &[u64]) -> Ordering {
    let max_len = lhs.len().max(rhs.len());
    for idx in 0..max_len {
        let left = lhs.get(idx).copied().unwrap_or(0);
        let right = rhs.get(idx).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    Ordering::Equal
}
