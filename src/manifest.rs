use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::UpdateError;
use crate::layout::STAGING_MARKER;

const MAX_VERSION_CHARS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    #[default]
    Full,
}

impl UpdateType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    #[default]
    Add,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Normalised relative path inside the release root.
    pub path: String,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
    pub size_bytes: u64,
    pub action: FileAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub version: String,
    pub previous_version: Option<String>,
    pub update_type: UpdateType,
    pub files: Vec<FileEntry>,
}

/// A validated manifest together with the exact bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub path: PathBuf,
    pub manifest: Manifest,
    pub raw: Vec<u8>,
    pub sha256: String,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    version: String,
    #[serde(default)]
    previous_version: Option<String>,
    #[serde(default)]
    update_type: Option<String>,
    files: Vec<RawFileEntry>,
}

#[derive(Debug, Deserialize)]
struct RawFileEntry {
    path: String,
    sha256: String,
    #[serde(alias = "size_bytes", alias = "sizeBytes")]
    bytes: u64,
    #[serde(default)]
    action: Option<String>,
}

/// Reads and validates a manifest file. Nothing is written.
pub fn load_manifest(path: &Path) -> Result<LoadedManifest, UpdateError> {
    let raw = fs::read(path).map_err(|err| {
        UpdateError::malformed(path, format!("failed reading manifest: {}", err))
    })?;
    let manifest = parse_manifest(path, &raw)?;
    let sha256 = format!("{:x}", Sha256::digest(&raw));
    Ok(LoadedManifest {
        path: path.to_path_buf(),
        manifest,
        raw,
        sha256,
    })
}

pub fn parse_manifest(path: &Path, raw: &[u8]) -> Result<Manifest, UpdateError> {
    let parsed: RawManifest = serde_json::from_slice(raw)
        .map_err(|err| UpdateError::malformed(path, err.to_string()))?;

    let version = normalize_version(parsed.version.trim())
        .map_err(|reason| UpdateError::malformed(path, reason))?;
    let previous_version = parsed
        .previous_version
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let update_type = match parsed.update_type.as_deref().map(str::trim) {
        None | Some("") | Some("full") => UpdateType::Full,
        Some(other) => {
            return Err(UpdateError::malformed(
                path,
                format!("unsupported update_type '{}' (only 'full' is supported)", other),
            ))
        }
    };

    if parsed.files.is_empty() {
        return Err(UpdateError::malformed(path, "manifest declares no files"));
    }

    let mut seen = HashSet::new();
    let mut files = Vec::with_capacity(parsed.files.len());
    for (idx, entry) in parsed.files.into_iter().enumerate() {
        let entry_path = normalize_entry_path(&entry.path)
            .map_err(|reason| UpdateError::malformed(path, format!("files[{}]: {}", idx, reason)))?;
        if !seen.insert(entry_path.clone()) {
            return Err(UpdateError::malformed(
                path,
                format!("files[{}]: duplicate path '{}'", idx, entry_path),
            ));
        }
        let sha256 = normalize_sha256_hex(&entry.sha256)
            .map_err(|reason| UpdateError::malformed(path, format!("files[{}]: {}", idx, reason)))?;
        let action = match entry.action.as_deref().map(str::trim) {
            None | Some("") | Some("add") => FileAction::Add,
            Some("update") => FileAction::Update,
            Some(other) => {
                return Err(UpdateError::malformed(
                    path,
                    format!("files[{}]: unsupported action '{}'", idx, other),
                ))
            }
        };
        files.push(FileEntry {
            path: entry_path,
            sha256,
            size_bytes: entry.bytes,
            action,
        });
    }

    Ok(Manifest {
        version,
        previous_version,
        update_type,
        files,
    })
}

fn normalize_version(raw: &str) -> Result<String, String> {
    if raw.is_empty() {
        return Err("version is empty".to_string());
    }
    if raw.chars().count() > MAX_VERSION_CHARS {
        return Err(format!("version exceeds {} characters", MAX_VERSION_CHARS));
    }
    if raw.starts_with('.') {
        return Err(format!("version '{}' must not start with '.'", raw));
    }
    if !raw
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | '+'))
    {
        return Err(format!(
            "invalid version '{}'. allowed chars: A-Z, a-z, 0-9, '.', '_', '-', '+'",
            raw
        ));
    }
    Ok(raw.to_string())
}

/// Validates a manifest path and returns it in `a/b/c` form.
pub fn normalize_entry_path(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("path is empty".to_string());
    }
    if trimmed.contains('\\') {
        return Err(format!("path '{}' must use '/' separators", trimmed));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| format!("path '{}' is not valid UTF-8", trimmed))?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(format!("path '{}' escapes the release root", trimmed));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("path '{}' must be relative", trimmed));
            }
        }
    }
    if parts.is_empty() {
        return Err(format!("path '{}' does not name a file", trimmed));
    }
    if parts[0] == STAGING_MARKER {
        return Err(format!("path '{}' uses a reserved name", trimmed));
    }
    Ok(parts.join("/"))
}

pub fn normalize_sha256_hex(raw: &str) -> Result<String, String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.len() != 64 {
        return Err("sha256 must be a 64-character hex string".to_string());
    }
    if !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err("sha256 must contain only hex characters".to_string());
    }
    Ok(normalized)
}
