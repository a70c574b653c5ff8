//! Exclusive advisory lock over one base directory.
//!
//! The lock is a `flock(2)` on `<base>/.update.lock`. The kernel drops it when the holding
//! process exits, so a crashed run never leaves the base directory locked. The file body
//! names the holder (`operation= pid= started_at=`) for diagnostics only.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{LockHolder, UpdateError};
use crate::layout::ReleaseLayout;

/// Held for the whole update run; released on drop on every exit path.
#[derive(Debug)]
pub struct ReleaseLock {
    file: File,
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatusReport {
    pub lock_path: String,
    pub lock_exists: bool,
    pub held: bool,
    pub operation: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub age_secs: Option<u64>,
}

impl ReleaseLock {
    pub fn acquire(layout: &ReleaseLayout, operation: &str) -> Result<Self, UpdateError> {
        let path = layout.lock_path();
        let mut file = open_lock_file(&path)?;

        if let Err(err) = try_flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            if err.kind() == ErrorKind::WouldBlock {
                let holder = read_holder(&mut file).unwrap_or_default();
                return Err(UpdateError::UpdateInProgress { lock: path, holder });
            }
            return Err(UpdateError::io(
                format!("failed locking {}", path.display()),
                err,
            ));
        }

        let details = format!(
            "operation={} pid={} started_at={}\n",
            operation.trim(),
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(details.as_bytes()))
            .and_then(|_| file.sync_all())
            .map_err(|err| UpdateError::io(format!("failed writing lock {}", path.display()), err))?;

        debug!(lock = %path.display(), operation, "acquired update lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ReleaseLock {
    fn drop(&mut self) {
        // The file stays in place; removing it would let a waiter lock an unlinked inode.
        if let Err(err) = self.file.set_len(0) {
            warn!(lock = %self.path.display(), error = %err, "failed clearing update lock");
        }
        if let Err(err) = try_flock(&self.file, libc::LOCK_UN) {
            warn!(lock = %self.path.display(), error = %err, "failed releasing update lock");
        }
    }
}

/// Probes the lock without waiting and reports who holds it, if anyone.
pub fn lock_status(layout: &ReleaseLayout) -> Result<LockStatusReport, UpdateError> {
    let path = layout.lock_path();
    let mut report = LockStatusReport {
        lock_path: path.display().to_string(),
        lock_exists: path.exists(),
        held: false,
        operation: None,
        pid: None,
        started_at: None,
        age_secs: None,
    };
    if !report.lock_exists {
        return Ok(report);
    }

    let mut file = match OpenOptions::new().read(true).open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            report.lock_exists = false;
            return Ok(report);
        }
        Err(err) => {
            return Err(UpdateError::io(
                format!("failed opening lock {}", path.display()),
                err,
            ))
        }
    };

    match try_flock(&file, libc::LOCK_SH | libc::LOCK_NB) {
        Ok(()) => {
            let _ = try_flock(&file, libc::LOCK_UN);
            return Ok(report);
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => {}
        Err(err) => {
            return Err(UpdateError::io(
                format!("failed probing lock {}", path.display()),
                err,
            ))
        }
    }

    report.held = true;
    let holder = read_holder(&mut file).unwrap_or_default();
    report.age_secs = holder.started_at.as_deref().and_then(age_secs);
    report.operation = holder.operation;
    report.pid = holder.pid;
    report.started_at = holder.started_at;
    Ok(report)
}

pub fn parse_lock_holder(raw: &str) -> LockHolder {
    let mut holder = LockHolder::default();
    for token in raw.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key {
            "operation" => holder.operation = Some(value.to_string()),
            "pid" => holder.pid = value.parse::<u32>().ok(),
            "started_at" => holder.started_at = Some(value.to_string()),
            _ => {}
        }
    }
    holder
}

fn open_lock_file(path: &Path) -> Result<File, UpdateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| UpdateError::io(format!("failed creating {}", parent.display()), err))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| UpdateError::io(format!("failed opening lock {}", path.display()), err))
}

fn read_holder(file: &mut File) -> io::Result<LockHolder> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut raw)?;
    Ok(parse_lock_holder(&raw))
}

fn try_flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn age_secs(started_at: &str) -> Option<u64> {
    let started = chrono::DateTime::parse_from_rfc3339(started_at)
        .ok()?
        .with_timezone(&Utc);
    let secs = (Utc::now() - started).num_seconds();
    Some(secs.max(0) as u64)
}
