use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Observational record of the live release, rewritten after each successful swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub current_version: String,
    pub previous_version: Option<String>,
    pub update_type: String,
    pub updated_at: String,
    pub files_count: usize,
    pub total_bytes: u64,
    #[serde(default)]
    pub manifest_sha256: Option<String>,
    #[serde(default)]
    pub rollback_version: Option<String>,
    /// Release directories left after retention ran for this swap.
    #[serde(default)]
    pub retained_releases: Vec<String>,
}

pub fn write_metadata(path: &Path, metadata: &VersionMetadata) -> Result<(), UpdateError> {
    let failed = |reason: String| UpdateError::MetadataWriteFailed {
        path: path.to_path_buf(),
        reason,
    };

    let payload = serde_json::to_vec_pretty(metadata)
        .map_err(|err| failed(format!("failed encoding metadata: {}", err)))?;
    let tmp = atomic_tmp_path(path);
    let mut file = fs::File::create(&tmp)
        .map_err(|err| failed(format!("failed creating {}: {}", tmp.display(), err)))?;
    let written = file
        .write_all(&payload)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all());
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(failed(format!("failed writing {}: {}", tmp.display(), err)));
    }
    drop(file);

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(failed(format!(
            "failed moving {} -> {}: {}",
            tmp.display(),
            path.display(),
            err
        )));
    }
    Ok(())
}

/// Reads `version.json`; `None` before the first successful update.
pub fn read_metadata(path: &Path) -> anyhow::Result<Option<VersionMetadata>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading version metadata {}", path.display()))
        }
    };
    let metadata = serde_json::from_str(&raw)
        .with_context(|| format!("failed decoding version metadata {}", path.display()))?;
    Ok(Some(metadata))
}

fn atomic_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("metadata");
    path.with_file_name(format!("{file_name}.tmp"))
}
