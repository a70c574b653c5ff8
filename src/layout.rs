use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::error::UpdateError;

pub const RELEASES_DIR: &str = "releases";
pub const CURRENT_POINTER: &str = "current";
pub const ROLLBACK_POINTER: &str = "rollback";
pub const METADATA_FILE: &str = "version.json";
pub const LOCK_FILE: &str = ".update.lock";
pub const AUDIT_LOG_FILE: &str = "update-audit.jsonl";

/// Marker present inside a release directory until staging completes.
pub const STAGING_MARKER: &str = ".release-staging";

/// Paths of the on-disk contract rooted at one base directory.
#[derive(Debug, Clone)]
pub struct ReleaseLayout {
    base: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    Staging,
    Staged,
    Active,
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseEntry {
    pub version: String,
    pub state: ReleaseState,
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub modified: Option<SystemTime>,
}

impl ReleaseLayout {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.base.join(RELEASES_DIR)
    }

    pub fn release_dir(&self, version: &str) -> PathBuf {
        self.releases_dir().join(version)
    }

    pub fn current_pointer(&self) -> PathBuf {
        self.base.join(CURRENT_POINTER)
    }

    pub fn rollback_pointer(&self) -> PathBuf {
        self.base.join(ROLLBACK_POINTER)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.base.join(METADATA_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base.join(LOCK_FILE)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.base.join(AUDIT_LOG_FILE)
    }

    /// Relative symlink target for a release, as stored in `current`/`rollback`.
    pub fn pointer_target(version: &str) -> PathBuf {
        Path::new(RELEASES_DIR).join(version)
    }

    pub fn ensure_dirs(&self) -> Result<(), UpdateError> {
        let releases = self.releases_dir();
        fs::create_dir_all(&releases)
            .map_err(|err| UpdateError::io(format!("failed creating {}", releases.display()), err))
    }

    /// Version targeted by `current`, or `None` before the first install.
    pub fn current_version(&self) -> Result<Option<String>, UpdateError> {
        read_pointer_version(&self.current_pointer())
    }

    pub fn rollback_version(&self) -> Result<Option<String>, UpdateError> {
        read_pointer_version(&self.rollback_pointer())
    }

    /// All release directories with their derived lifecycle state.
    pub fn list_releases(&self) -> Result<Vec<ReleaseEntry>, UpdateError> {
        let releases_dir = self.releases_dir();
        let current = self.current_version()?;
        let rollback = self.rollback_version()?;

        let entries = match fs::read_dir(&releases_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(UpdateError::io(
                    format!("failed listing {}", releases_dir.display()),
                    err,
                ))
            }
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                UpdateError::io(format!("failed listing {}", releases_dir.display()), err)
            })?;
            let Some(version) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            if version.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(UpdateError::io(
                        format!("failed reading metadata {}", path.display()),
                        err,
                    ))
                }
            };
            if !metadata.is_dir() {
                continue;
            }

            let state = if current.as_deref() == Some(version.as_str()) {
                ReleaseState::Active
            } else if rollback.as_deref() == Some(version.as_str()) {
                ReleaseState::Superseded
            } else if path.join(STAGING_MARKER).exists() {
                ReleaseState::Staging
            } else {
                ReleaseState::Staged
            };

            out.push(ReleaseEntry {
                version,
                state,
                path,
                modified: metadata.modified().ok(),
            });
        }

        out.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(out)
    }
}

/// Resolves a pointer symlink to the release version it targets.
///
/// A missing pointer is `None`. Anything that is not a symlink into `releases/` is
/// reported as corrupt rather than silently followed.
pub fn read_pointer_version(pointer: &Path) -> Result<Option<String>, UpdateError> {
    let metadata = match fs::symlink_metadata(pointer) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(UpdateError::io(
                format!("failed inspecting pointer {}", pointer.display()),
                err,
            ))
        }
    };
    if !metadata.file_type().is_symlink() {
        return Err(UpdateError::PointerCorrupt {
            path: pointer.to_path_buf(),
            reason: "expected a symbolic link".to_string(),
        });
    }

    let target = fs::read_link(pointer).map_err(|err| {
        UpdateError::io(format!("failed reading pointer {}", pointer.display()), err)
    })?;
    version_from_target(&target)
        .map(Some)
        .ok_or_else(|| UpdateError::PointerCorrupt {
            path: pointer.to_path_buf(),
            reason: format!("target {} is not a release directory", target.display()),
        })
}

fn version_from_target(target: &Path) -> Option<String> {
    let components = target
        .components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect::<Vec<_>>();
    let [.., Component::Normal(parent), Component::Normal(version)] = components.as_slice() else {
        return None;
    };
    if parent.to_str() != Some(RELEASES_DIR) {
        return None;
    }
    version.to_str().map(ToString::to_string)
}
