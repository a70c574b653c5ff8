use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::UpdateError;
use crate::layout::{ReleaseLayout, ReleaseState, STAGING_MARKER};
use crate::smoke::{SmokeCheck, SmokeOutcome};

/// A release directory under construction.
///
/// Dropping it before [`StagedRelease::commit`] removes the directory, so every failed
/// attempt cleans up after itself.
#[derive(Debug)]
pub struct StagedRelease {
    version: String,
    path: PathBuf,
    sealed: bool,
    committed: bool,
}

impl StagedRelease {
    /// Reserves `releases/<version>`; an existing directory is never reused or touched.
    pub fn create(layout: &ReleaseLayout, version: &str) -> Result<Self, UpdateError> {
        let path = layout.release_dir(version);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(UpdateError::ReleaseAlreadyExists {
                    version: version.to_string(),
                    path,
                });
            }
            Err(err) => {
                return Err(UpdateError::io(
                    format!("failed creating release dir {}", path.display()),
                    err,
                ));
            }
        }

        let staged = Self {
            version: version.to_string(),
            path,
            sealed: false,
            committed: false,
        };
        let marker = staged.path.join(STAGING_MARKER);
        fs::write(&marker, format!("pid={}\n", std::process::id())).map_err(|err| {
            UpdateError::io(format!("failed writing staging marker {}", marker.display()), err)
        })?;
        Ok(staged)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn check_required_artifacts(&self, required: &[String]) -> Result<(), UpdateError> {
        for artifact in required {
            let path = self.path.join(artifact);
            let present = fs::metadata(&path)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false);
            if !present {
                return Err(UpdateError::RequiredArtifactMissing {
                    version: self.version.clone(),
                    artifact: artifact.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn smoke_check(
        &self,
        check: &SmokeCheck,
        required: &[String],
    ) -> Result<SmokeOutcome, UpdateError> {
        let outcome = check.run(&self.path, required);
        if !outcome.success {
            return Err(UpdateError::StagedArtifactInvalid {
                version: self.version.clone(),
                reason: outcome.detail,
            });
        }
        Ok(outcome)
    }

    /// Marks staging complete and makes the directory durable. The release stays
    /// removable on drop until [`StagedRelease::commit`].
    pub fn seal(&mut self) -> Result<(), UpdateError> {
        let marker = self.path.join(STAGING_MARKER);
        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(UpdateError::io(
                    format!("failed removing staging marker {}", marker.display()),
                    err,
                ))
            }
        }
        sync_dir(&self.path)?;
        if let Some(parent) = self.path.parent() {
            sync_dir(parent)?;
        }
        self.sealed = true;
        Ok(())
    }

    /// Called once `current` targets the release; it is no longer removed on drop.
    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.path.clone()
    }
}

impl Drop for StagedRelease {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    release = %self.path.display(),
                    error = %err,
                    "failed removing abandoned staging directory"
                );
            }
        }
    }
}

/// Removes release directories left in the staging state by an interrupted run.
///
/// Must only be called while holding the update lock.
pub fn remove_orphaned_staging(layout: &ReleaseLayout) -> Result<Vec<String>, UpdateError> {
    let mut removed = Vec::new();
    for entry in layout.list_releases()? {
        if entry.state != ReleaseState::Staging {
            continue;
        }
        match fs::remove_dir_all(&entry.path) {
            Ok(()) => {
                warn!(version = %entry.version, "removed orphaned staging directory");
                removed.push(entry.version);
            }
            Err(err) => {
                warn!(
                    version = %entry.version,
                    error = %err,
                    "failed removing orphaned staging directory"
                );
            }
        }
    }
    Ok(removed)
}

pub(crate) fn sync_dir(path: &Path) -> Result<(), UpdateError> {
    fs::File::open(path)
        .and_then(|dir| dir.sync_all())
        .map_err(|err| UpdateError::io(format!("failed syncing {}", path.display()), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> (tempfile::TempDir, ReleaseLayout) {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ReleaseLayout::new(dir.path());
        layout.ensure_dirs().expect("dirs");
        (dir, layout)
    }

    #[test]
    fn existing_release_is_rejected_and_left_alone() {
        let (_dir, layout) = layout();
        fs::create_dir(layout.release_dir("v1")).expect("v1");
        fs::write(layout.release_dir("v1").join("index.db"), "live").expect("index");

        let err = StagedRelease::create(&layout, "v1").expect_err("exists");
        assert_eq!(err.code(), "release_already_exists");
        assert_eq!(
            fs::read_to_string(layout.release_dir("v1").join("index.db")).expect("index"),
            "live"
        );
    }

    #[test]
    fn dropped_release_is_removed() {
        let (_dir, layout) = layout();
        {
            let staged = StagedRelease::create(&layout, "v2").expect("create");
            fs::write(staged.path().join("index.db"), "x").expect("write");
        }
        assert!(!layout.release_dir("v2").exists());
    }

    #[test]
    fn committed_release_survives_and_loses_marker() {
        let (_dir, layout) = layout();
        let mut staged = StagedRelease::create(&layout, "v3").expect("create");
        fs::write(staged.path().join("index.db"), "x").expect("write");
        staged.check_required_artifacts(&["index.db".to_string()]).expect("required");
        staged
            .smoke_check(&SmokeCheck::Builtin, &["index.db".to_string()])
            .expect("smoke");

        staged.seal().expect("seal");
        assert!(staged.is_sealed());
        let path = staged.commit();
        assert!(path.join("index.db").exists());
        assert!(!path.join(STAGING_MARKER).exists());
    }

    #[test]
    fn sealed_but_uncommitted_release_is_removed() {
        let (_dir, layout) = layout();
        {
            let mut staged = StagedRelease::create(&layout, "v5").expect("create");
            fs::write(staged.path().join("index.db"), "x").expect("write");
            staged.seal().expect("seal");
        }
        assert!(!layout.release_dir("v5").exists());
    }

    #[test]
    fn missing_required_artifact_is_reported() {
        let (_dir, layout) = layout();
        let staged = StagedRelease::create(&layout, "v4").expect("create");
        let err = staged
            .check_required_artifacts(&["index.db".to_string()])
            .expect_err("missing");
        match err {
            UpdateError::RequiredArtifactMissing { version, artifact } => {
                assert_eq!(version, "v4");
                assert_eq!(artifact, "index.db");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn orphaned_staging_directories_are_removed() {
        let (_dir, layout) = layout();
        fs::create_dir(layout.release_dir("v1")).expect("v1");
        fs::create_dir(layout.release_dir("v2")).expect("v2");
        fs::write(layout.release_dir("v2").join(STAGING_MARKER), "pid=1\n").expect("marker");

        let removed = remove_orphaned_staging(&layout).expect("recover");
        assert_eq!(removed, vec!["v2".to_string()]);
        assert!(layout.release_dir("v1").exists());
        assert!(!layout.release_dir("v2").exists());
    }
}
