use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

/// How a release is judged operational before and after promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeCheck {
    /// Required artifacts must be non-empty readable files; `.json` artifacts must parse.
    Builtin,
    /// Runs an external checker; `{release}` in `args` is replaced by the release directory.
    Command {
        program: String,
        args: Vec<String>,
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SmokeOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub detail: String,
}

impl SmokeOutcome {
    fn passed(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            timed_out: false,
            exit_code: None,
            detail: detail.into(),
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            timed_out: false,
            exit_code: None,
            detail: detail.into(),
        }
    }
}

impl SmokeCheck {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Command { .. } => "command",
        }
    }

    /// Read-only check of `release_dir`. Never writes into the release.
    pub fn run(&self, release_dir: &Path, required_artifacts: &[String]) -> SmokeOutcome {
        match self {
            Self::Builtin => builtin_check(release_dir, required_artifacts),
            Self::Command {
                program,
                args,
                timeout_secs,
            } => run_smoke_command(program, args, release_dir, *timeout_secs),
        }
    }
}

fn builtin_check(release_dir: &Path, required_artifacts: &[String]) -> SmokeOutcome {
    if required_artifacts.is_empty() {
        return SmokeOutcome::passed("no required artifacts configured");
    }

    for artifact in required_artifacts {
        let path = release_dir.join(artifact);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) => {
                return SmokeOutcome::failed(format!("failed reading {}: {}", artifact, err));
            }
        };
        if contents.is_empty() {
            return SmokeOutcome::failed(format!("artifact {} is empty", artifact));
        }
        if artifact.ends_with(".json") {
            if let Err(err) = serde_json::from_slice::<serde_json::Value>(&contents) {
                return SmokeOutcome::failed(format!("artifact {} is not valid JSON: {}", artifact, err));
            }
        }
    }

    SmokeOutcome::passed(format!(
        "{} required artifact(s) readable",
        required_artifacts.len()
    ))
}

fn run_smoke_command(
    program: &str,
    args: &[String],
    release_dir: &Path,
    timeout_secs: u64,
) -> SmokeOutcome {
    let release = release_dir.display().to_string();
    let args = args
        .iter()
        .map(|arg| arg.replace("{release}", &release))
        .collect::<Vec<_>>();

    let timeout = Duration::from_secs(timeout_secs.max(1));
    let mut child = match Command::new(program)
        .args(&args)
        .env("INDEX_RELEASE_DIR", &release)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return SmokeOutcome::failed(format!(
                "failed running smoke check '{}' with args {:?}: {}",
                program, args, err
            ));
        }
    };

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                return match child.wait_with_output() {
                    Ok(output) => {
                        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                        let detail = if stderr.trim().is_empty() {
                            summarize_log(&stdout)
                        } else {
                            summarize_log(&stderr)
                        };
                        SmokeOutcome {
                            success: output.status.success(),
                            timed_out: false,
                            exit_code: output.status.code(),
                            detail,
                        }
                    }
                    Err(err) => SmokeOutcome::failed(format!(
                        "failed collecting smoke check output '{}': {}",
                        program, err
                    )),
                };
            }
            Ok(None) => {}
            Err(err) => {
                return SmokeOutcome::failed(format!(
                    "failed checking smoke check '{}': {}",
                    program, err
                ));
            }
        }

        if started.elapsed() >= timeout {
            let _ = child.kill();
            let output = child.wait_with_output().ok();
            return SmokeOutcome {
                success: false,
                timed_out: true,
                exit_code: output.and_then(|out| out.status.code()),
                detail: format!(
                    "smoke check timed out after {} seconds and process was killed",
                    timeout.as_secs()
                ),
            };
        }

        thread::sleep(Duration::from_millis(50));
    }
}

fn summarize_log(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= 500 {
        return trimmed.to_string();
    }
    let prefix = trimmed.chars().take(500).collect::<String>();
    format!("{}...", prefix)
}
