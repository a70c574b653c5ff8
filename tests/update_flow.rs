mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use common::{snapshot, Fixture};
use ed25519_dalek::SigningKey;
use index_release::audit::verify_audit_log;
use index_release::error::Phase;
use index_release::metadata::read_metadata;
use index_release::smoke::SmokeCheck;
use index_release::updater::UpdateStatus;

fn pause_for_mtime() {
    std::thread::sleep(Duration::from_millis(20));
}

#[test]
fn first_install_promotes_without_rollback() {
    let fixture = Fixture::new();
    let manager = fixture.manager();

    let report = fixture.index_bundle("v1").apply(&manager).expect("v1");
    assert_eq!(report.status, UpdateStatus::Succeeded);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.files_count, 2);
    assert_eq!(report.total_bytes, ("index-v1".len() + "shard-v1".len()) as u64);
    assert!(report.post_swap_verified);
    assert_eq!(report.rollback_version, None);

    assert_eq!(fixture.current_target(), Some(PathBuf::from("releases/v1")));
    assert_eq!(fixture.rollback_target(), None);
    assert_eq!(
        fs::read_to_string(fixture.base.join("current/shards/0.bin")).expect("shard"),
        "shard-v1"
    );

    let mode = fs::metadata(fixture.base.join("releases/v1/index.db"))
        .expect("metadata")
        .permissions()
        .mode();
    assert_eq!(mode & 0o222, 0, "staged files are read-only");
    assert!(!fixture.base.join("releases/v1/.release-staging").exists());
}

#[test]
fn v2_swap_records_rollback_and_metadata() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    fixture.index_bundle("v1").apply(&manager).expect("v1");

    let v2 = fixture.index_bundle("v2");
    let report = v2.apply(&manager).expect("v2");
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.rollback_version.as_deref(), Some("v1"));

    assert_eq!(fixture.current_target(), Some(PathBuf::from("releases/v2")));
    assert_eq!(fixture.rollback_target(), Some(PathBuf::from("releases/v1")));

    let metadata = read_metadata(&fixture.base.join("version.json"))
        .expect("read")
        .expect("metadata");
    assert_eq!(metadata.current_version, "v2");
    assert_eq!(metadata.rollback_version.as_deref(), Some("v1"));
    assert_eq!(metadata.update_type, "full");
    assert_eq!(metadata.files_count, 2);
    assert_eq!(metadata.manifest_sha256.as_deref(), Some(report.manifest_sha256.as_str()));
}

#[test]
fn invalid_signature_leaves_tree_untouched() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    fixture.index_bundle("v1").apply(&manager).expect("v1");
    let before = snapshot(&fixture.base);

    let v2 = fixture.index_bundle("v2");
    let mut manifest = fs::read(&v2.manifest).expect("manifest");
    manifest.push(b'\n');
    fs::write(&v2.manifest, manifest).expect("tamper");

    let failure = v2.apply(&manager).expect_err("bad signature");
    assert_eq!(failure.error.code(), "signature_invalid");
    assert_eq!(failure.phase, Phase::Validating);
    assert_eq!(failure.exit_code(), 1);
    assert_eq!(snapshot(&fixture.base), before);
}

#[test]
fn signature_from_untrusted_key_is_rejected() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let v1 = fixture.index_bundle("v1");

    let other_key = fixture.temp.path().join("other.pub");
    let other = SigningKey::from_bytes(&[7u8; 32]);
    let hex = other
        .verifying_key()
        .as_bytes()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    fs::write(&other_key, hex).expect("other key");
    let failure = manager
        .update(&v1.manifest, &v1.signature, &other_key, None)
        .expect_err("untrusted");
    assert_eq!(failure.error.code(), "signature_invalid");
    assert_eq!(fixture.current_target(), None);
    assert!(fixture.release_dirs().is_empty());
}

#[test]
fn v2_hash_mismatch_keeps_current_and_removes_staging() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    fixture.index_bundle("v1").apply(&manager).expect("v1");
    let before = snapshot(&fixture.base);

    let v2 = fixture.index_bundle("v2");
    fs::write(v2.dir.join("shards/0.bin"), "corrupted in transit").expect("tamper");

    let failure = v2.apply(&manager).expect_err("hash mismatch");
    assert_eq!(failure.exit_code(), 1);
    assert_eq!(failure.phase, Phase::Staging);
    match &failure.error {
        index_release::error::UpdateError::HashMismatch { entry, .. } => {
            assert_eq!(entry, "shards/0.bin")
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(!fixture.base.join("releases/v2").exists());
    assert_eq!(fixture.current_target(), Some(PathBuf::from("releases/v1")));
    assert_eq!(snapshot(&fixture.base), before);
}

#[test]
fn missing_source_file_fails_before_swap() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let v1 = fixture.index_bundle("v1");
    fs::remove_file(v1.dir.join("index.db")).expect("remove");

    let failure = v1.apply(&manager).expect_err("missing");
    assert_eq!(failure.error.code(), "source_file_missing");
    assert_eq!(fixture.current_target(), None);
    assert!(fixture.release_dirs().is_empty());
}

#[test]
fn existing_version_is_never_reapplied() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let v1 = fixture.index_bundle("v1");
    v1.apply(&manager).expect("v1");
    let before = snapshot(&fixture.base);

    let failure = v1.apply(&manager).expect_err("already exists");
    assert_eq!(failure.error.code(), "release_already_exists");
    assert_eq!(failure.phase, Phase::Staging);
    assert_eq!(snapshot(&fixture.base), before);
}

#[test]
fn missing_required_artifact_aborts_staging() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let bundle = fixture.bundle("v1", &[("docs/readme.txt", b"no index here")]);

    let failure = bundle.apply(&manager).expect_err("no index");
    assert_eq!(failure.error.code(), "required_artifact_missing");
    assert!(fixture.release_dirs().is_empty());
    assert_eq!(fixture.current_target(), None);
}

#[test]
fn failing_smoke_check_blocks_promotion() {
    let fixture = Fixture::new();
    let manager = fixture.manager().with_smoke_check(SmokeCheck::Command {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), "exit 7".to_string()],
        timeout_secs: 5,
    });

    let failure = fixture.index_bundle("v1").apply(&manager).expect_err("smoke");
    assert_eq!(failure.error.code(), "staged_artifact_invalid");
    assert_eq!(failure.phase, Phase::Staging);
    assert!(fixture.release_dirs().is_empty());
}

#[test]
fn post_swap_verification_failure_is_soft() {
    let fixture = Fixture::new();
    // Passes against releases/<v>, fails when checked through the `current` pointer.
    let manager = fixture.manager().with_smoke_check(SmokeCheck::Command {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "case \"$1\" in */current) exit 1 ;; *) exit 0 ;; esac".to_string(),
            "smoke".to_string(),
            "{release}".to_string(),
        ],
        timeout_secs: 5,
    });

    let report = fixture.index_bundle("v1").apply(&manager).expect("swap committed");
    assert_eq!(report.status, UpdateStatus::SucceededWithWarnings);
    assert_eq!(report.exit_code(), 2);
    assert!(!report.post_swap_verified);
    assert_eq!(report.soft_failures[0].code, "post_swap_verification_failed");
    assert_eq!(fixture.current_target(), Some(PathBuf::from("releases/v1")));
    assert!(report.metadata_written);
}

#[test]
fn retention_keeps_window_of_three() {
    let fixture = Fixture::new();
    let manager = fixture.manager().with_retention(3);

    for version in ["v1", "v2", "v3", "v4", "v5", "v6"] {
        fixture.index_bundle(version).apply(&manager).expect(version);
        pause_for_mtime();

        let releases = fixture.release_dirs();
        assert!(releases.len() <= 3, "{releases:?}");
        let current = fixture.current_target().expect("current");
        assert!(fixture.base.join(current).exists());
        if let Some(rollback) = fixture.rollback_target() {
            assert!(fixture.base.join(rollback).exists());
        }
    }

    assert_eq!(fixture.release_dirs(), vec!["v4", "v5", "v6"]);
    assert_eq!(fixture.current_target(), Some(PathBuf::from("releases/v6")));
    assert_eq!(fixture.rollback_target(), Some(PathBuf::from("releases/v5")));

    let metadata = read_metadata(&fixture.base.join("version.json"))
        .expect("read metadata")
        .expect("metadata present");
    assert_eq!(metadata.current_version, "v6");
    assert_eq!(metadata.retained_releases, vec!["v4", "v5", "v6"]);
}

#[test]
fn retention_never_prunes_rollback_target() {
    let fixture = Fixture::new();
    let manager = fixture.manager().with_retention(1);

    fixture.index_bundle("v1").apply(&manager).expect("v1");
    pause_for_mtime();
    let report = fixture.index_bundle("v2").apply(&manager).expect("v2");
    assert_eq!(fixture.release_dirs(), vec!["v1", "v2"]);
    assert!(report.retention.expect("retention").pruned.is_empty());

    pause_for_mtime();
    let report = fixture.index_bundle("v3").apply(&manager).expect("v3");
    assert_eq!(fixture.release_dirs(), vec!["v2", "v3"]);
    assert_eq!(report.retention.expect("retention").pruned, vec!["v1".to_string()]);
}

#[test]
fn orphaned_staging_directory_is_recovered_on_next_run() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    fixture.index_bundle("v1").apply(&manager).expect("v1");

    let orphan = fixture.base.join("releases/v9");
    fs::create_dir_all(&orphan).expect("orphan");
    fs::write(orphan.join(".release-staging"), "pid=1\n").expect("marker");
    fs::write(orphan.join("index.db"), "partial").expect("partial");

    let report = fixture.index_bundle("v2").apply(&manager).expect("v2");
    assert_eq!(report.recovered_orphans, vec!["v9".to_string()]);
    assert!(!orphan.exists());
}

#[test]
fn source_dir_override_is_used_for_files() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let v1 = fixture.index_bundle("v1");

    let payload = fixture.temp.path().join("payload");
    fs::create_dir_all(payload.join("shards")).expect("payload");
    fs::rename(v1.dir.join("index.db"), payload.join("index.db")).expect("move index");
    fs::rename(v1.dir.join("shards/0.bin"), payload.join("shards/0.bin")).expect("move shard");

    manager
        .update(&v1.manifest, &v1.signature, &v1.public_key, Some(&payload))
        .expect("update from payload dir");
    assert_eq!(fixture.current_target(), Some(PathBuf::from("releases/v1")));
}

#[test]
fn cancellation_before_swap_is_interrupted() {
    let fixture = Fixture::new();
    let cancel = Arc::new(AtomicBool::new(true));
    let manager = fixture.manager().with_cancel_flag(cancel);

    let failure = fixture.index_bundle("v1").apply(&manager).expect_err("cancelled");
    assert_eq!(failure.error.code(), "interrupted");
    assert!(fixture.release_dirs().is_empty());
    assert_eq!(fixture.current_target(), None);
}

#[test]
fn hash_workers_verify_in_parallel() {
    let fixture = Fixture::new();
    let manager = fixture.manager().with_hash_workers(4);
    let files = (0..12)
        .map(|idx| (format!("shards/{idx}.bin"), format!("shard-{idx}")))
        .collect::<Vec<_>>();
    let mut entries = files
        .iter()
        .map(|(path, contents)| (path.as_str(), contents.as_bytes()))
        .collect::<Vec<_>>();
    entries.push(("index.db", "index".as_bytes()));

    let report = fixture.bundle("v1", &entries).apply(&manager).expect("v1");
    assert_eq!(report.files_count, 13);
}

#[test]
fn audit_journal_chains_successful_and_failed_runs() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    fixture.index_bundle("v1").apply(&manager).expect("v1");

    let v2 = fixture.index_bundle("v2");
    fs::write(v2.dir.join("index.db"), "tampered").expect("tamper");
    v2.apply(&manager).expect_err("hash mismatch");

    let journal = fixture.base.join("update-audit.jsonl");
    let report = verify_audit_log(&journal).expect("verify");
    assert!(report.valid);
    assert_eq!(report.entries, 2);

    let raw = fs::read_to_string(&journal).expect("journal");
    let records = raw
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("record"))
        .collect::<Vec<_>>();
    assert_eq!(records[0]["status"], "succeeded");
    assert_eq!(records[0]["version"], "v1");
    assert_eq!(records[1]["status"], "failed");
    assert_eq!(records[1]["error_code"], "hash_mismatch");
    assert_eq!(records[1]["phase"], "staging");
    assert_eq!(records[1]["prev_hash"], records[0]["hash"]);
}

#[test]
fn corrupt_current_pointer_is_detected_before_mutation() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    fs::create_dir_all(fixture.base.join("current")).expect("bogus current");

    let failure = fixture.index_bundle("v1").apply(&manager).expect_err("corrupt");
    assert_eq!(failure.error.code(), "pointer_corrupt");
    assert!(fixture.release_dirs().is_empty());
}
