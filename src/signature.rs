//! Detached Ed25519 signatures over the exact manifest bytes.
//!
//! Public keys are accepted as PEM SubjectPublicKeyInfo or as a raw 32-byte key in
//! hex/base64; signatures as 64 raw bytes or their hex/base64 text form.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::UpdateError;

const PEM_BEGIN: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_END: &str = "-----END PUBLIC KEY-----";

pub fn load_public_key(path: &Path) -> Result<VerifyingKey, UpdateError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        UpdateError::signature(format!(
            "failed reading public key {}: {}",
            path.display(),
            err
        ))
    })?;
    parse_public_key(&raw)
}

pub fn parse_public_key(raw: &str) -> Result<VerifyingKey, UpdateError> {
    let trimmed = raw.trim();
    if trimmed.contains(PEM_BEGIN) {
        let der = decode_pem_body(trimmed)?;
        return VerifyingKey::from_public_key_der(&der)
            .map_err(|err| UpdateError::signature(format!("invalid PEM public key: {}", err)));
    }

    let bytes = decode_hex_or_base64(trimmed)?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| UpdateError::signature("Ed25519 public key must decode to 32 bytes"))?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| UpdateError::signature("invalid Ed25519 public key bytes"))
}

pub fn load_signature(path: &Path) -> Result<Signature, UpdateError> {
    let raw = fs::read(path).map_err(|err| {
        UpdateError::signature(format!(
            "failed reading signature {}: {}",
            path.display(),
            err
        ))
    })?;
    parse_signature(&raw)
}

pub fn parse_signature(raw: &[u8]) -> Result<Signature, UpdateError> {
    if raw.len() == 64 {
        let signature_bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| UpdateError::signature("invalid Ed25519 signature bytes"))?;
        return Ok(Signature::from_bytes(&signature_bytes));
    }

    let text = std::str::from_utf8(raw)
        .map_err(|_| {
            UpdateError::signature("signature must be UTF-8 text or a 64-byte raw signature")
        })?
        .trim();
    if text.is_empty() {
        return Err(UpdateError::signature("signature file is empty"));
    }

    let decoded = decode_hex_or_base64(text)?;
    let signature_bytes: [u8; 64] = decoded
        .try_into()
        .map_err(|_| UpdateError::signature("Ed25519 signature must decode to 64 bytes"))?;
    Ok(Signature::from_bytes(&signature_bytes))
}

/// Verifies `signature` over `message` exactly as read from disk.
pub fn verify_detached(
    key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), UpdateError> {
    key.verify_strict(message, signature)
        .map_err(|_| UpdateError::signature("signature does not match manifest bytes"))
}

/// Loads key and signature from disk and verifies the manifest bytes against them.
pub fn verify_manifest_signature(
    manifest_bytes: &[u8],
    signature_path: &Path,
    public_key_path: &Path,
) -> Result<(), UpdateError> {
    let key = load_public_key(public_key_path)?;
    let signature = load_signature(signature_path)?;
    verify_detached(&key, manifest_bytes, &signature)
}

fn decode_pem_body(input: &str) -> Result<Vec<u8>, UpdateError> {
    let start = input
        .find(PEM_BEGIN)
        .ok_or_else(|| UpdateError::signature("missing PEM header"))?
        + PEM_BEGIN.len();
    let stop = input
        .find(PEM_END)
        .ok_or_else(|| UpdateError::signature("missing PEM footer"))?;
    if stop <= start {
        return Err(UpdateError::signature("invalid PEM framing"));
    }
    let cleaned: String = input[start..stop]
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect();
    general_purpose::STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|err| UpdateError::signature(format!("invalid PEM base64: {}", err)))
}

fn decode_hex_or_base64(raw: &str) -> Result<Vec<u8>, UpdateError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UpdateError::signature("key material is empty"));
    }
    if trimmed.len() % 2 == 0 && trimmed.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return decode_hex_string(trimmed);
    }

    general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|_| UpdateError::signature("value must be base64 or hex encoded"))
}

fn decode_hex_string(hex: &str) -> Result<Vec<u8>, UpdateError> {
    let mut out = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| UpdateError::signature("value must contain valid hexadecimal characters"))?;
        out.push(byte);
    }
    Ok(out)
}
