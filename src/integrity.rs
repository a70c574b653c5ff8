use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Phase, UpdateError};
use crate::manifest::FileEntry;

/// Running totals of the verification loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityCounters {
    pub processed_files: usize,
    pub total_bytes: u64,
}

/// Streams a file through SHA-256, returning the hex digest and the byte count.
pub fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Checks presence, content hash and declared size of one source file.
pub fn verify_source(entry: &FileEntry, source_dir: &Path) -> Result<PathBuf, UpdateError> {
    let source = source_dir.join(&entry.path);
    let is_file = fs::metadata(&source)
        .map(|metadata| metadata.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(UpdateError::SourceFileMissing {
            entry: entry.path.clone(),
            path: source,
        });
    }

    let (actual, size) = sha256_file(&source)
        .map_err(|err| UpdateError::io(format!("failed hashing {}", source.display()), err))?;
    if actual != entry.sha256 {
        return Err(UpdateError::HashMismatch {
            entry: entry.path.clone(),
            expected: entry.sha256.clone(),
            actual,
        });
    }
    if size != entry.size_bytes {
        return Err(UpdateError::SizeMismatch {
            entry: entry.path.clone(),
            declared: entry.size_bytes,
            actual: size,
        });
    }
    Ok(source)
}

/// Copies a verified source into the release root and re-hashes the copy on disk.
pub fn copy_verified(
    entry: &FileEntry,
    source: &Path,
    release_root: &Path,
) -> Result<u64, UpdateError> {
    let dest = release_root.join(&entry.path);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| UpdateError::io(format!("failed creating {}", parent.display()), err))?;
    }

    fs::copy(source, &dest).map_err(|err| {
        UpdateError::io(
            format!("failed copying {} -> {}", source.display(), dest.display()),
            err,
        )
    })?;
    fs::File::open(&dest)
        .and_then(|file| file.sync_all())
        .map_err(|err| UpdateError::io(format!("failed flushing {}", dest.display()), err))?;

    let (actual, size) = sha256_file(&dest)
        .map_err(|err| UpdateError::io(format!("failed hashing {}", dest.display()), err))?;
    if actual != entry.sha256 {
        return Err(UpdateError::CopyVerificationFailed {
            entry: entry.path.clone(),
            expected: entry.sha256.clone(),
            actual,
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o444)).map_err(|err| {
            UpdateError::io(format!("failed sealing {}", dest.display()), err)
        })?;
    }

    Ok(size)
}

/// Verifies every entry in manifest order, copying each into `release_root`.
///
/// Counters are only advanced for entries whose copy verified.
pub fn stage_files(
    entries: &[FileEntry],
    source_dir: &Path,
    release_root: &Path,
    hash_workers: usize,
    cancel: Option<&AtomicBool>,
    counters: &mut IntegrityCounters,
) -> Result<(), UpdateError> {
    let pre_verified = hash_workers > 1 && entries.len() > 1;
    if pre_verified {
        verify_sources_parallel(entries, source_dir, hash_workers, cancel)?;
    }

    for entry in entries {
        if is_cancelled(cancel) {
            return Err(UpdateError::Interrupted {
                phase: Phase::Staging,
            });
        }

        let source = if pre_verified {
            source_dir.join(&entry.path)
        } else {
            verify_source(entry, source_dir)?
        };
        stage_entry(entry, &source, release_root, counters)?;
    }

    Ok(())
}

/// Counters advance only once the copy on disk has re-verified.
fn stage_entry(
    entry: &FileEntry,
    source: &Path,
    release_root: &Path,
    counters: &mut IntegrityCounters,
) -> Result<(), UpdateError> {
    let size = copy_verified(entry, source, release_root)?;
    counters.processed_files += 1;
    counters.total_bytes += size;
    debug!(path = %entry.path, bytes = size, "staged file verified");
    Ok(())
}

/// Hashes sources on up to `workers` scoped threads.
///
/// The first failing entry (lowest manifest index among observed failures) is reported;
/// remaining work is abandoned once any worker fails.
pub fn verify_sources_parallel(
    entries: &[FileEntry],
    source_dir: &Path,
    workers: usize,
    cancel: Option<&AtomicBool>,
) -> Result<(), UpdateError> {
    let workers = workers.clamp(1, entries.len().max(1));
    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let failures: Mutex<Vec<(usize, UpdateError)>> = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if failed.load(Ordering::SeqCst) || is_cancelled(cancel) {
                    break;
                }
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(entry) = entries.get(idx) else {
                    break;
                };
                if let Err(err) = verify_source(entry, source_dir) {
                    failed.store(true, Ordering::SeqCst);
                    failures
                        .lock()
                        .unwrap_or_else(|poison| poison.into_inner())
                        .push((idx, err));
                    break;
                }
            });
        }
    });

    let mut failures = failures
        .into_inner()
        .unwrap_or_else(|poison| poison.into_inner());
    failures.sort_by_key(|(idx, _)| *idx);
    if let Some((_, err)) = failures.into_iter().next() {
        return Err(err);
    }
    if is_cancelled(cancel) {
        return Err(UpdateError::Interrupted {
            phase: Phase::Staging,
        });
    }
    Ok(())
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileAction;

    fn entry_for(path: &str, contents: &[u8]) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            sha256: format!("{:x}", Sha256::digest(contents)),
            size_bytes: contents.len() as u64,
            action: FileAction::Add,
        }
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.txt");
        fs::write(&path, "test").expect("write");
        let (hash, size) = sha256_file(&path).expect("hash");
        assert_eq!(
            hash,
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
        assert_eq!(size, 4);
    }

    #[test]
    fn stage_files_copies_nested_paths_and_counts_every_entry() {
        let source = tempfile::tempdir().expect("source");
        let release = tempfile::tempdir().expect("release");
        fs::create_dir_all(source.path().join("shards")).expect("shards");
        fs::write(source.path().join("index.db"), b"index-bytes").expect("index");
        fs::write(source.path().join("shards/0.bin"), b"shard").expect("shard");

        let entries = vec![
            entry_for("index.db", b"index-bytes"),
            entry_for("shards/0.bin", b"shard"),
        ];
        let mut counters = IntegrityCounters::default();
        stage_files(&entries, source.path(), release.path(), 1, None, &mut counters)
            .expect("stage");

        assert_eq!(counters.processed_files, 2);
        assert_eq!(counters.total_bytes, 16);
        assert_eq!(
            fs::read(release.path().join("shards/0.bin")).expect("copy"),
            b"shard"
        );
    }

    #[test]
    fn missing_source_is_reported_before_hashing() {
        let source = tempfile::tempdir().expect("source");
        let release = tempfile::tempdir().expect("release");
        let entries = vec![entry_for("index.db", b"x")];
        let mut counters = IntegrityCounters::default();

        let err = stage_files(&entries, source.path(), release.path(), 1, None, &mut counters)
            .expect_err("missing");
        assert_eq!(err.code(), "source_file_missing");
        assert_eq!(counters.processed_files, 0);
    }

    #[test]
    fn hash_mismatch_stops_at_offending_entry() {
        let source = tempfile::tempdir().expect("source");
        let release = tempfile::tempdir().expect("release");
        fs::write(source.path().join("a"), b"good").expect("a");
        fs::write(source.path().join("b"), b"tampered").expect("b");
        fs::write(source.path().join("c"), b"never").expect("c");

        let entries = vec![
            entry_for("a", b"good"),
            entry_for("b", b"original"),
            entry_for("c", b"never"),
        ];
        let mut counters = IntegrityCounters::default();
        let err = stage_files(&entries, source.path(), release.path(), 1, None, &mut counters)
            .expect_err("mismatch");

        match err {
            UpdateError::HashMismatch {
                entry,
                expected,
                actual,
            } => {
                assert_eq!(entry, "b");
                assert_eq!(expected, entries[1].sha256);
                assert_eq!(actual, format!("{:x}", Sha256::digest(b"tampered")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(counters.processed_files, 1);
        assert!(!release.path().join("c").exists());
    }

    #[test]
    fn copy_differing_from_manifest_is_rejected() {
        let source = tempfile::tempdir().expect("source");
        let release = tempfile::tempdir().expect("release");
        let swapped = source.path().join("swapped.db");
        fs::write(&swapped, b"bytes changed after verification").expect("swapped");
        let entry = entry_for("index.db", b"verified bytes");

        let mut counters = IntegrityCounters::default();
        let err = stage_entry(&entry, &swapped, release.path(), &mut counters)
            .expect_err("copy mismatch");
        assert_eq!(err.code(), "copy_verification_failed");
        match err {
            UpdateError::CopyVerificationFailed {
                entry: path,
                expected,
                actual,
            } => {
                assert_eq!(path, "index.db");
                assert_eq!(expected, entry.sha256);
                assert_eq!(
                    actual,
                    format!("{:x}", Sha256::digest(b"bytes changed after verification"))
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(counters, IntegrityCounters::default());

        let source_ok = source.path().join("index.db");
        fs::write(&source_ok, b"verified bytes").expect("source");
        let other = tempfile::tempdir().expect("other release");
        stage_entry(&entry, &source_ok, other.path(), &mut counters).expect("copy ok");
        assert_eq!(counters.processed_files, 1);
        assert_eq!(counters.total_bytes, 14);
    }

    #[test]
    fn declared_size_must_match() {
        let source = tempfile::tempdir().expect("source");
        fs::write(source.path().join("a"), b"four").expect("a");
        let mut entry = entry_for("a", b"four");
        entry.size_bytes = 5;

        let err = verify_source(&entry, source.path()).expect_err("size");
        assert_eq!(err.code(), "size_mismatch");
    }

    #[test]
    fn parallel_verification_reports_lowest_failing_entry() {
        let source = tempfile::tempdir().expect("source");
        let mut entries = Vec::new();
        for idx in 0..8 {
            let name = format!("f{idx}");
            fs::write(source.path().join(&name), name.as_bytes()).expect("write");
            entries.push(entry_for(&name, name.as_bytes()));
        }
        entries[5].sha256 = "0".repeat(64);

        let err = verify_sources_parallel(&entries, source.path(), 4, None).expect_err("fail");
        match err {
            UpdateError::HashMismatch { entry, .. } => assert_eq!(entry, "f5"),
            other => panic!("unexpected error: {other}"),
        }

        entries[5] = entry_for("f5", b"f5");
        verify_sources_parallel(&entries, source.path(), 4, None).expect("all valid");
    }

    #[test]
    fn cancellation_interrupts_staging() {
        let source = tempfile::tempdir().expect("source");
        let release = tempfile::tempdir().expect("release");
        fs::write(source.path().join("a"), b"a").expect("a");
        let cancel = AtomicBool::new(true);
        let mut counters = IntegrityCounters::default();

        let err = stage_files(
            &[entry_for("a", b"a")],
            source.path(),
            release.path(),
            1,
            Some(&cancel),
            &mut counters,
        )
        .expect_err("cancelled");
        assert_eq!(err.code(), "interrupted");
    }
}
