//! Signed-tarball verification: SHA-256 checksum plus Ed25519 signature
//! against the embedded first-party release key.
//!
//! A signed artefact is a triple: `<name>.tar.gz`, `<name>.tar.gz.sig`
//! (raw 64-byte Ed25519 signature over the tarball bytes) and
//! `<name>.tar.gz.sha256` (hex digest, two spaces, file name).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// The first-party release public key, hex-encoded.
pub const SIGNING_KEY_HEX: &str =
    "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";

/// The three files making up a signed artefact.
#[derive(Debug, Clone)]
pub struct TarballSet {
    pub tarball: PathBuf,
    pub signature: PathBuf,
    pub checksum: PathBuf,
}

/// Outcome of a verification. A `Failed` outcome is a verification
/// mismatch; I/O problems surface as errors instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified { fingerprint: String },
    Failed { reason: String },
}

impl VerifyOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyOutcome::Verified { .. })
    }
}

/// The embedded release key, decoded.
pub fn embedded_key() -> Result<VerifyingKey> {
    let bytes = hex::decode(SIGNING_KEY_HEX).context("embedded key is not valid hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .ok()
        .context("embedded key must be 32 bytes")?;
    VerifyingKey::from_bytes(&bytes).context("embedded key is not a valid Ed25519 point")
}

/// SHA-256 fingerprint of a verifying key, hex-encoded.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Locate the most-recently-modified `*.tar.gz` in `dir` that has both
/// `.sig` and `.sha256` siblings.
pub fn find_signed_tarball(dir: &Path) -> Result<Option<TarballSet>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let entries = fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;

    let mut candidates: Vec<(SystemTime, TarballSet)> = Vec::new();
    for entry in entries {
        let entry = entry.context("failed to read dir entry")?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".tar.gz") {
            continue;
        }
        let signature = dir.join(format!("{name}.sig"));
        let checksum = dir.join(format!("{name}.sha256"));
        if !signature.is_file() || !checksum.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push((
            modified,
            TarballSet {
                tarball: path,
                signature,
                checksum,
            },
        ));
    }

    candidates.sort_by_key(|(t, _)| *t);
    Ok(candidates.pop().map(|(_, set)| set))
}

/// Verify `set` against `key`. Both the checksum and the signature must
/// pass.
pub fn verify_tarball_with_key(set: &TarballSet, key: &VerifyingKey) -> Result<VerifyOutcome> {
    let bytes = fs::read(&set.tarball)
        .with_context(|| format!("failed to read tarball {}", set.tarball.display()))?;

    // Checksum gate, then signature.
    let checksum_line = fs::read_to_string(&set.checksum)
        .with_context(|| format!("failed to read checksum {}", set.checksum.display()))?;
    let expected = checksum_line
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if expected.len() != 64 || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(VerifyOutcome::Failed {
            reason: "checksum file is not a SHA-256 hex digest".to_string(),
        });
    }

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let actual = hex::encode(hasher.finalize());
    if actual != expected {
        return Ok(VerifyOutcome::Failed {
            reason: "sha256 checksum mismatch".to_string(),
        });
    }

    let sig_bytes = fs::read(&set.signature)
        .with_context(|| format!("failed to read signature {}", set.signature.display()))?;
    let sig_bytes: [u8; 64] = match sig_bytes.try_into() {
        Ok(b) => b,
        Err(_) => {
            return Ok(VerifyOutcome::Failed {
                reason: "signature is not raw 64-byte Ed25519".to_string(),
            });
        }
    };
    let signature = Signature::from_bytes(&sig_bytes);

    match key.verify(&bytes, &signature) {
        Ok(()) => Ok(VerifyOutcome::Verified {
            fingerprint: key_fingerprint(key),
        }),
        Err(_) => Ok(VerifyOutcome::Failed {
            reason: "ed25519 signature mismatch".to_string(),
        }),
    }
}

/// Verify the newest signed tarball in `dir` against the embedded key.
pub fn verify_directory(dir: &Path) -> Result<(TarballSet, VerifyOutcome)> {
    let Some(set) = find_signed_tarball(dir)? else {
        bail!("no signed tarball found in {}", dir.display());
    };
    let key = embedded_key()?;
    let outcome = verify_tarball_with_key(&set, &key)?;
    Ok((set, outcome))
}
