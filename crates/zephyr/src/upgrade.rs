//! Self-upgrade from the published release manifest.
//!
//! Fetch the release manifest, compare versions, then download the
//! platform artifact, verify its SHA-256, and atomically replace the
//! running executable (write a sibling, rename over).

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::audit;
use crate::install::Reporter;
use crate::types::OperationResult;

/// Where releases are announced.
pub const RELEASE_MANIFEST_URL: &str = "https://get.zephyr-modules.dev/releases/latest.json";

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseManifest {
    pub version: String,
    /// Keyed by `<os>-<arch>` (e.g. `linux-x86_64`).
    pub artifacts: BTreeMap<String, ReleaseArtifact>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseArtifact {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    pub check_only: bool,
    pub force: bool,
    /// Override for tests and mirrors.
    pub manifest_url: Option<String>,
    pub timeout: Duration,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            check_only: false,
            force: false,
            manifest_url: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    UpToDate { version: String },
    /// `--check` found a newer release but did not apply it.
    Available { version: String },
    Upgraded { version: String },
}

/// Compare dotted version strings component-wise; numeric components
/// compare numerically, anything else lexically.
pub fn version_is_newer(candidate: &str, current: &str) -> bool {
    let split = |v: &str| -> Vec<String> {
        v.trim_start_matches('v')
            .split('.')
            .map(str::to_string)
            .collect()
    };
    let a = split(candidate);
    let b = split(current);
    for i in 0..a.len().max(b.len()) {
        let left = a.get(i).map(String::as_str).unwrap_or("0");
        let right = b.get(i).map(String::as_str).unwrap_or("0");
        let ordering = match (left.parse::<u64>(), right.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => left.cmp(right),
        };
        match ordering {
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Equal => {}
        }
    }
    false
}

/// Check for (and unless `check_only`, apply) a newer release.
pub fn upgrade(
    current_version: &str,
    options: &UpgradeOptions,
    reporter: &mut dyn Reporter,
) -> Result<UpgradeOutcome> {
    let url = options
        .manifest_url
        .as_deref()
        .unwrap_or(RELEASE_MANIFEST_URL);
    reporter.info(&format!("checking {url}"));
    let manifest = fetch_manifest(url, options.timeout)?;

    if !options.force && !version_is_newer(&manifest.version, current_version) {
        reporter.info(&format!("already at {current_version}"));
        return Ok(UpgradeOutcome::UpToDate {
            version: current_version.to_string(),
        });
    }
    if options.check_only {
        reporter.info(&format!("version {} is available", manifest.version));
        return Ok(UpgradeOutcome::Available {
            version: manifest.version,
        });
    }

    let platform = format!("{}-{}", env::consts::OS, env::consts::ARCH);
    let Some(artifact) = manifest.artifacts.get(&platform) else {
        bail!("release {} has no artifact for {platform}", manifest.version);
    };

    reporter.info(&format!("downloading {}", artifact.url));
    let client = reqwest::blocking::Client::builder()
        .user_agent(format!("zephyr/{}", env!("CARGO_PKG_VERSION")))
        .timeout(options.timeout)
        .build()
        .context("failed to build HTTP client")?;
    let bytes = client
        .get(&artifact.url)
        .send()
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("failed to download {}", artifact.url))?
        .bytes()
        .context("failed to read artifact body")?;

    let exe = env::current_exe().context("failed to locate current executable")?;
    let result = apply_artifact(&bytes, &artifact.sha256, &exe);

    let (op_result, reason) = match &result {
        Ok(()) => (OperationResult::Success, None),
        Err(e) => (OperationResult::Blocked, Some(format!("{e:#}"))),
    };
    if let Err(err) = audit::log_operation(
        "upgrade",
        "zephyr",
        &artifact.url,
        op_result,
        reason.as_deref(),
        false,
    ) {
        reporter.warn(&format!("failed to write audit event: {err:#}"));
    }
    result?;

    reporter.info(&format!("upgraded to {}", manifest.version));
    Ok(UpgradeOutcome::Upgraded {
        version: manifest.version,
    })
}

fn fetch_manifest(url: &str, timeout: Duration) -> Result<ReleaseManifest> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(format!("zephyr/{}", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")?;
    client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("failed to fetch release manifest {url}"))?
        .json()
        .context("failed to parse release manifest")
}

/// Verify the artifact digest and rename it over `exe`. The new binary
/// lands as a sibling first so the swap is a single rename.
pub(crate) fn apply_artifact(bytes: &[u8], expected_sha256: &str, exe: &Path) -> Result<()> {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected_sha256) {
        bail!("artifact sha256 mismatch (expected {expected_sha256}, got {actual})");
    }

    let staging = exe.with_extension("upgrade-staging");
    fs::write(&staging, bytes)
        .with_context(|| format!("failed to stage new binary {}", staging.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&staging)
            .with_context(|| format!("failed to stat {}", staging.display()))?
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&staging, perms)
            .with_context(|| format!("failed to mark {} executable", staging.display()))?;
    }

    fs::rename(&staging, exe)
        .with_context(|| format!("failed to replace {}", exe.display()))
}
