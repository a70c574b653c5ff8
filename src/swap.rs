use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::UpdateError;
use crate::layout::ReleaseLayout;
use crate::smoke::{SmokeCheck, SmokeOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapOutcome {
    /// Release `current` targeted before the swap; now the rollback target.
    pub previous: Option<String>,
    pub current: String,
}

/// Points `rollback` at the live release, then atomically re-points `current`.
///
/// `current` is replaced by a single `rename(2)` of a freshly created symlink in the
/// same directory, so readers only ever observe the old or the new target. The caller
/// is responsible for flushing the base directory afterwards.
pub fn promote(layout: &ReleaseLayout, version: &str) -> Result<SwapOutcome, UpdateError> {
    let previous = layout.current_version()?;
    if let Some(previous) = previous.as_deref() {
        replace_pointer(
            &layout.rollback_pointer(),
            &ReleaseLayout::pointer_target(previous),
        )?;
        crate::stager::sync_dir(layout.base())?;
    }

    replace_pointer(
        &layout.current_pointer(),
        &ReleaseLayout::pointer_target(version),
    )?;

    Ok(SwapOutcome {
        previous,
        current: version.to_string(),
    })
}

/// Atomically replaces (or creates) the symlink at `pointer` with one targeting `target`.
pub fn replace_pointer(pointer: &Path, target: &Path) -> Result<(), UpdateError> {
    let tmp = tmp_pointer_path(pointer);
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(UpdateError::io(
                format!("failed removing stale pointer {}", tmp.display()),
                err,
            ))
        }
    }

    std::os::unix::fs::symlink(target, &tmp).map_err(|err| {
        UpdateError::io(
            format!("failed creating pointer {} -> {}", tmp.display(), target.display()),
            err,
        )
    })?;
    if let Err(err) = fs::rename(&tmp, pointer) {
        let _ = fs::remove_file(&tmp);
        return Err(UpdateError::io(
            format!(
                "failed replacing pointer {} -> {}",
                tmp.display(),
                pointer.display()
            ),
            err,
        ));
    }
    Ok(())
}

/// Re-resolves `current` after the swap and checks the release through it.
///
/// Failures here are soft: the swap has already committed.
pub fn verify_promotion(
    layout: &ReleaseLayout,
    version: &str,
    check: &SmokeCheck,
    required_artifacts: &[String],
) -> Result<SmokeOutcome, UpdateError> {
    let failed = |reason: String| UpdateError::PostSwapVerificationFailed {
        version: version.to_string(),
        reason,
    };

    let resolved = layout
        .current_version()
        .map_err(|err| failed(err.to_string()))?;
    if resolved.as_deref() != Some(version) {
        return Err(failed(format!(
            "current resolves to {:?} instead of '{}'",
            resolved, version
        )));
    }

    let through_pointer = fs::canonicalize(layout.current_pointer())
        .map_err(|err| failed(format!("failed resolving current: {}", err)))?;
    let expected = fs::canonicalize(layout.release_dir(version))
        .map_err(|err| failed(format!("failed resolving release dir: {}", err)))?;
    if through_pointer != expected {
        return Err(failed(format!(
            "current resolves to {} instead of {}",
            through_pointer.display(),
            expected.display()
        )));
    }

    let outcome = check.run(&layout.current_pointer(), required_artifacts);
    if !outcome.success {
        return Err(failed(outcome.detail));
    }
    Ok(outcome)
}

fn tmp_pointer_path(pointer: &Path) -> PathBuf {
    let file_name = pointer
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("pointer");
    pointer.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()))
}
