#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use serde_json::json;
use sha2::{Digest, Sha256};

use index_release::error::UpdateFailure;
use index_release::updater::{ReleaseManager, UpdateReport};

const SIGNING_KEY_BYTES: [u8; 32] = [
    0x4c, 0xcd, 0x08, 0x9b, 0x28, 0xff, 0x96, 0xda, 0x9d, 0xb6, 0xc3, 0x46, 0xec, 0x11, 0x4e,
    0x0f, 0x5b, 0x8a, 0x31, 0x9f, 0x35, 0xab, 0xa6, 0x24, 0xda, 0x8c, 0xf6, 0xed, 0x4f, 0xb8,
    0xa6, 0xfb,
];

// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410).
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// Temporary base directory plus a signing authority producing release bundles.
pub struct Fixture {
    pub temp: tempfile::TempDir,
    pub base: PathBuf,
    pub key_path: PathBuf,
    signing: SigningKey,
}

/// A signed manifest with its companion files, as delivered to the machine.
pub struct ReleaseBundle {
    pub version: String,
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub signature: PathBuf,
    pub public_key: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path().join("base");
        let signing = SigningKey::from_bytes(&SIGNING_KEY_BYTES);

        let mut der = ED25519_SPKI_PREFIX.to_vec();
        der.extend_from_slice(signing.verifying_key().as_bytes());
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            general_purpose::STANDARD.encode(der)
        );
        let key_path = temp.path().join("release-key.pem");
        fs::write(&key_path, pem).expect("public key");

        Self {
            temp,
            base,
            key_path,
            signing,
        }
    }

    pub fn manager(&self) -> ReleaseManager {
        ReleaseManager::new(&self.base)
    }

    /// Writes `files` plus a signed manifest under `incoming/<version>/`.
    pub fn bundle(&self, version: &str, files: &[(&str, &[u8])]) -> ReleaseBundle {
        let dir = self.temp.path().join("incoming").join(version);
        fs::create_dir_all(&dir).expect("bundle dir");

        let mut entries = Vec::new();
        for (path, contents) in files {
            let dest = dir.join(path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).expect("bundle parent");
            }
            fs::write(&dest, contents).expect("bundle file");
            entries.push(json!({
                "path": path,
                "sha256": format!("{:x}", Sha256::digest(contents)),
                "bytes": contents.len(),
                "action": "add",
            }));
        }

        let manifest = serde_json::to_vec_pretty(&json!({
            "version": version,
            "previous_version": null,
            "update_type": "full",
            "files": entries,
        }))
        .expect("manifest json");
        let manifest_path = dir.join("manifest.json");
        fs::write(&manifest_path, &manifest).expect("manifest");

        let signature_path = dir.join("manifest.sig");
        fs::write(&signature_path, self.signing.sign(&manifest).to_bytes()).expect("signature");

        ReleaseBundle {
            version: version.to_string(),
            dir,
            manifest: manifest_path,
            signature: signature_path,
            public_key: self.key_path.clone(),
        }
    }

    /// Standard bundle: an index artifact plus one nested shard.
    pub fn index_bundle(&self, version: &str) -> ReleaseBundle {
        let index = format!("index-{version}");
        let shard = format!("shard-{version}");
        self.bundle(
            version,
            &[
                ("index.db", index.as_bytes()),
                ("shards/0.bin", shard.as_bytes()),
            ],
        )
    }

    pub fn current_target(&self) -> Option<PathBuf> {
        fs::read_link(self.base.join("current")).ok()
    }

    pub fn rollback_target(&self) -> Option<PathBuf> {
        fs::read_link(self.base.join("rollback")).ok()
    }

    pub fn release_dirs(&self) -> Vec<String> {
        let mut names = fs::read_dir(self.base.join("releases"))
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.file_name().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl ReleaseBundle {
    pub fn apply(&self, manager: &ReleaseManager) -> Result<UpdateReport, UpdateFailure> {
        manager.update(&self.manifest, &self.signature, &self.public_key, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File(Vec<u8>),
    Link(PathBuf),
}

/// Byte-for-byte view of the live tree, excluding the lock file and audit journal.
pub fn snapshot(base: &Path) -> BTreeMap<PathBuf, Node> {
    let mut out = BTreeMap::new();
    walk(base, base, &mut out);
    out
}

fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Node>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let name = entry.file_name();
        if dir == root && (name == ".update.lock" || name == "update-audit.jsonl") {
            continue;
        }
        let relative = path.strip_prefix(root).expect("relative").to_path_buf();
        let metadata = fs::symlink_metadata(&path).expect("metadata");
        if metadata.file_type().is_symlink() {
            out.insert(relative, Node::Link(fs::read_link(&path).expect("link")));
        } else if metadata.is_dir() {
            out.insert(relative, Node::Dir);
            walk(root, &path, out);
        } else {
            out.insert(relative, Node::File(fs::read(&path).expect("file")));
        }
    }
}
