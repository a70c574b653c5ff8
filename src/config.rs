use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::manifest::normalize_entry_path;
use crate::smoke::SmokeCheck;

const ENV_FILE_ENV: &str = "INDEX_RELEASE_ENV_FILE";
const DEFAULT_REQUIRED_ARTIFACT: &str = "index.db";
const DEFAULT_SMOKE_ARG: &str = "{release}";

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_dir: PathBuf,
    pub retention_keep: usize,
    pub required_artifacts: Vec<String>,
    pub smoke: SmokeSettings,
    pub hash_workers: usize,
    pub audit_enabled: bool,
    pub otel_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SmokeSettings {
    /// Program to run as the smoke check; `None` selects the builtin check.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub base_dir: String,
    pub base_dir_exists: bool,
    pub retention_keep: usize,
    pub required_artifacts: Vec<String>,
    pub smoke_check: String,
    pub smoke_check_command: Option<String>,
    pub smoke_check_args: Vec<String>,
    pub smoke_check_timeout_secs: u64,
    pub hash_workers: usize,
    pub audit_enabled: bool,
    pub otel_enabled: bool,
    pub warnings: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let base_dir = read_non_empty_env("INDEX_RELEASE_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let required_artifacts = match env::var("INDEX_RELEASE_REQUIRED_ARTIFACTS") {
            Ok(_) => read_csv_env("INDEX_RELEASE_REQUIRED_ARTIFACTS"),
            Err(_) => vec![DEFAULT_REQUIRED_ARTIFACT.to_string()],
        };

        let smoke_args = match env::var("INDEX_RELEASE_SMOKE_CHECK_ARGS") {
            Ok(_) => read_args_env("INDEX_RELEASE_SMOKE_CHECK_ARGS"),
            Err(_) => vec![DEFAULT_SMOKE_ARG.to_string()],
        };

        Ok(Self {
            base_dir,
            retention_keep: read_usize_env("INDEX_RELEASE_RETENTION_KEEP", 3),
            required_artifacts,
            smoke: SmokeSettings {
                command: read_non_empty_env("INDEX_RELEASE_SMOKE_CHECK_CMD"),
                args: smoke_args,
                timeout_secs: read_u64_env("INDEX_RELEASE_SMOKE_CHECK_TIMEOUT_SECS", 30),
            },
            hash_workers: read_usize_env("INDEX_RELEASE_HASH_WORKERS", 1),
            audit_enabled: read_bool_env("INDEX_RELEASE_AUDIT_ENABLED", true),
            otel_enabled: read_bool_env("INDEX_RELEASE_OTEL_ENABLED", false),
        })
    }

    pub fn smoke_check(&self) -> SmokeCheck {
        match self.smoke.command.as_deref() {
            Some(program) => SmokeCheck::Command {
                program: program.to_string(),
                args: self.smoke.args.clone(),
                timeout_secs: self.smoke.timeout_secs,
            },
            None => SmokeCheck::Builtin,
        }
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();

        if self.retention_keep == 0 {
            warnings.push(
                "INDEX_RELEASE_RETENTION_KEEP=0 is treated as 1; the active release is always kept"
                    .to_string(),
            );
        }
        if self.required_artifacts.is_empty() {
            warnings.push(
                "INDEX_RELEASE_REQUIRED_ARTIFACTS is empty; releases without an index artifact will be promoted"
                    .to_string(),
            );
        }
        for artifact in &self.required_artifacts {
            if let Err(reason) = normalize_entry_path(artifact) {
                warnings.push(format!(
                    "required artifact '{}' is not a valid release path: {}",
                    artifact, reason
                ));
            }
        }
        if let Some(program) = self.smoke.command.as_deref() {
            if !program_is_resolvable(program) {
                warnings.push(format!(
                    "INDEX_RELEASE_SMOKE_CHECK_CMD '{}' was not found; every update will fail its smoke check",
                    program
                ));
            }
            if self.smoke.timeout_secs == 0 {
                warnings.push(
                    "INDEX_RELEASE_SMOKE_CHECK_TIMEOUT_SECS should be > 0 (1 second is used)"
                        .to_string(),
                );
            }
        } else if self.smoke.args != [DEFAULT_SMOKE_ARG] {
            warnings.push(
                "INDEX_RELEASE_SMOKE_CHECK_ARGS is set without INDEX_RELEASE_SMOKE_CHECK_CMD and is ignored"
                    .to_string(),
            );
        }
        if self.hash_workers == 0 {
            warnings.push("INDEX_RELEASE_HASH_WORKERS should be >= 1 (1 is used)".to_string());
        }
        if !self.audit_enabled {
            warnings.push("INDEX_RELEASE_AUDIT_ENABLED=false; update runs are not journaled".to_string());
        }

        DoctorReport {
            base_dir: self.base_dir.display().to_string(),
            base_dir_exists: self.base_dir.is_dir(),
            retention_keep: self.retention_keep,
            required_artifacts: self.required_artifacts.clone(),
            smoke_check: self.smoke_check().kind().to_string(),
            smoke_check_command: self.smoke.command.clone(),
            smoke_check_args: self.smoke.args.clone(),
            smoke_check_timeout_secs: self.smoke.timeout_secs,
            hash_workers: self.hash_workers,
            audit_enabled: self.audit_enabled,
            otel_enabled: self.otel_enabled,
            warnings,
        }
    }
}

fn program_is_resolvable(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_usize_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn read_csv_env(key: &str) -> Vec<String> {
    let Some(value) = env::var(key).ok() else {
        return Vec::new();
    };

    value
        .split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

fn read_args_env(key: &str) -> Vec<String> {
    let Some(value) = env::var(key).ok() else {
        return Vec::new();
    };

    value
        .split_whitespace()
        .map(ToString::to_string)
        .collect()
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
