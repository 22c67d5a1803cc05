//! Two-phase install pipeline.
//!
//! Acquire into a `zephyr-install-*` temp workspace, verify signatures
//! for signed tarballs, run the security scanner, validate the
//! manifest, then atomically publish into the modules directory. Every
//! failure path tears the workspace down and leaves the modules
//! directory untouched; every outcome is recorded in the operations
//! audit stream.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;

use crate::audit;
use crate::config;
use crate::manifest;
use crate::process;
use crate::roles;
use crate::scanner;
use crate::session;
use crate::signature;
use crate::types::{
    Capability, InstallOptions, OperationResult, Role, ScanOptions, ScanResult, SourceKind,
};

/// Prefix of every pipeline workspace under `$TMPDIR`.
pub const TEMP_PREFIX: &str = "zephyr-install-";

/// Progress sink threaded through the long-running operations.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
    /// Ask the caller to approve proceeding. Non-interactive sinks
    /// decline.
    fn confirm(&mut self, _prompt: &str) -> bool {
        false
    }
}

/// A reporter that drops everything. Useful for embedders and tests.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// A classified install source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Git { url: String },
    RemoteTarball { url: String },
    /// Local directory holding a signed tarball triple.
    LocalTarball { dir: PathBuf },
    LocalDir { dir: PathBuf },
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Git { .. } => SourceKind::GitRepo,
            Source::RemoteTarball { .. } | Source::LocalTarball { .. } => SourceKind::SignedTarball,
            Source::LocalDir { .. } => SourceKind::LocalPath,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Source::LocalTarball { .. } | Source::LocalDir { .. })
    }
}

static GITHUB_SHORTHAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*/[A-Za-z0-9][A-Za-z0-9_.-]*$")
        .expect("valid shorthand regex")
});

/// Classify an install source string.
///
/// URLs are classified by scheme and suffix; existing local paths by
/// their contents; `owner/repo` shorthands are probed for a latest
/// GitHub release carrying a `.tar.gz` asset, falling back to a git
/// clone URL.
pub fn detect_source(input: &str, timeout: Duration) -> Result<Source> {
    let is_url = ["http://", "https://", "git://", "file://"]
        .iter()
        .any(|s| input.starts_with(s))
        || input.starts_with("git@");
    if is_url {
        if input.ends_with(".tar.gz") {
            return Ok(Source::RemoteTarball {
                url: input.to_string(),
            });
        }
        return Ok(Source::Git {
            url: input.to_string(),
        });
    }

    let path = Path::new(input);
    if path.exists() {
        if path.is_dir() {
            if signature::find_signed_tarball(path)?.is_some() {
                return Ok(Source::LocalTarball {
                    dir: path.to_path_buf(),
                });
            }
            return Ok(Source::LocalDir {
                dir: path.to_path_buf(),
            });
        }
        if input.ends_with(".tar.gz") {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            return Ok(Source::LocalTarball {
                dir: dir.to_path_buf(),
            });
        }
        bail!("local source {} is neither a directory nor a tarball", input);
    }

    if GITHUB_SHORTHAND_RE.is_match(input) {
        if let Some(url) = github_latest_tarball(input, timeout) {
            return Ok(Source::RemoteTarball { url });
        }
        return Ok(Source::Git {
            url: format!("https://github.com/{input}.git"),
        });
    }

    bail!("invalid install source `{input}`");
}

fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(format!("zephyr/{}", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

/// Probe the latest GitHub release of `owner/repo` for a `.tar.gz`
/// asset. Any failure falls back to `None` (clone instead).
fn github_latest_tarball(slug: &str, timeout: Duration) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct Release {
        assets: Vec<Asset>,
    }
    #[derive(serde::Deserialize)]
    struct Asset {
        browser_download_url: String,
    }

    let client = http_client(timeout).ok()?;
    let url = format!("https://api.github.com/repos/{slug}/releases/latest");
    let release: Release = client.get(url).send().ok()?.error_for_status().ok()?.json().ok()?;
    release
        .assets
        .into_iter()
        .map(|a| a.browser_download_url)
        .find(|u| u.ends_with(".tar.gz"))
}

/// A `$TMPDIR/zephyr-install-*` staging directory, removed on drop.
pub(crate) struct TempWorkspace {
    path: PathBuf,
}

impl TempWorkspace {
    pub(crate) fn create() -> Result<Self> {
        let base = {
            let _guard = session::lock_home_env();
            env::temp_dir()
        };
        let name = format!(
            "{TEMP_PREFIX}{}-{:06x}",
            std::process::id(),
            rand::random::<u32>() & 0xff_ffff
        );
        let path = base.join(name);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create temp workspace {}", path.display()))?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        // Gone already when publish renamed the workspace root away.
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Outcome of a completed (or no-op) install/update.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub module: String,
    pub version: String,
    pub path: PathBuf,
    pub source: SourceKind,
    pub signature_verified: bool,
    pub scan: ScanResult,
    /// Set when an update found the installed version already current.
    pub no_op: bool,
}

/// Install a module from `source_str`.
pub fn install(
    source_str: &str,
    options: &InstallOptions,
    reporter: &mut dyn Reporter,
) -> Result<InstallReport> {
    run_pipeline("install", source_str, options, None, reporter)
}

/// Update an installed module from its recorded source.
///
/// A failure at any stage leaves the installed version untouched; an
/// unchanged version is a no-op.
pub fn update(
    name: &str,
    options: &InstallOptions,
    reporter: &mut dyn Reporter,
) -> Result<InstallReport> {
    let modules_dir = config::modules_dir()?;
    let dir = modules_dir.join(name);
    if !dir.is_dir() {
        bail!("module `{name}` is not installed");
    }
    let installed = manifest::parse_module(&dir)
        .with_context(|| format!("installed module `{name}` has an unreadable manifest"))?;
    let source_str = manifest::read_source(&dir)
        .with_context(|| format!("module `{name}` has no recorded install source"))?;
    run_pipeline("update", &source_str, options, Some(installed), reporter)
}

/// Audit bookkeeping for one pipeline run.
struct Operation<'a> {
    action: &'a str,
    source: &'a str,
    module: String,
    signature_verified: bool,
}

impl Operation<'_> {
    fn record(&self, result: OperationResult, reason: Option<&str>, reporter: &mut dyn Reporter) {
        if let Err(err) = audit::log_operation(
            self.action,
            &self.module,
            self.source,
            result,
            reason,
            self.signature_verified,
        ) {
            reporter.warn(&format!("failed to write audit event: {err:#}"));
        }
    }

    fn blocked(
        &self,
        reason: String,
        reporter: &mut dyn Reporter,
    ) -> anyhow::Error {
        self.record(OperationResult::Blocked, Some(&reason), reporter);
        anyhow!("{} blocked: {reason}", self.action)
    }

    fn failed(&self, reason: String, reporter: &mut dyn Reporter) -> anyhow::Error {
        self.record(OperationResult::Failed, Some(&reason), reporter);
        anyhow!("{} failed: {reason}", self.action)
    }
}

fn name_hint(source_str: &str) -> String {
    let tail = source_str
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(source_str);
    tail.trim_end_matches(".git")
        .trim_end_matches(".tar.gz")
        .to_string()
}

fn run_pipeline(
    action: &str,
    source_str: &str,
    options: &InstallOptions,
    updating: Option<crate::types::Module>,
    reporter: &mut dyn Reporter,
) -> Result<InstallReport> {
    let mut op = Operation {
        action,
        source: source_str,
        module: name_hint(source_str),
        signature_verified: false,
    };

    // Policy gate before anything touches the network or disk.
    if !roles::check_permission(Capability::Install)? {
        return Err(op.blocked("role does not permit install".to_string(), reporter));
    }

    reporter.info(&format!("classifying source {source_str}"));
    let source = detect_source(source_str, options.acquire_timeout)
        .map_err(|e| op.failed(format!("{e:#}"), reporter))?;

    if source.is_local() && !options.allow_local {
        return Err(op.failed(
            "local sources require --allow-local".to_string(),
            reporter,
        ));
    }

    let workspace = TempWorkspace::create()?;

    // Acquire. The staged directory keeps the module's natural basename
    // so the trusted-module rule sees the same name a user would.
    let staged_root = match &source {
        Source::Git { url } => {
            reporter.info(&format!("cloning {url}"));
            clone_with_retry(url, &op.module, &workspace, options.acquire_timeout)
                .map_err(|e| op.failed(format!("{e:#}"), reporter))?
        }
        Source::RemoteTarball { url } => {
            reporter.info(&format!("downloading {url}"));
            let staging = download_tarball_set(url, &workspace, options.acquire_timeout)
                .map_err(|e| op.failed(format!("{e:#}"), reporter))?;
            verify_and_extract(&staging, &workspace, &mut op, reporter)?
        }
        Source::LocalTarball { dir } => {
            reporter.info(&format!("verifying signed tarball in {}", dir.display()));
            verify_and_extract(dir, &workspace, &mut op, reporter)?
        }
        Source::LocalDir { dir } => {
            let basename = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| op.module.clone());
            let dest = workspace.path().join(basename);
            copy_dir_recursive(dir, &dest)
                .map_err(|e| op.failed(format!("{e:#}"), reporter))?;
            dest
        }
    };

    let module_root = find_module_root(&staged_root)
        .map_err(|e| op.failed(format!("{e:#}"), reporter))?;

    // Scan.
    reporter.info("scanning for dangerous patterns");
    let scan_options = ScanOptions {
        trusted_modules: config::trusted_modules()?,
        ..ScanOptions::default()
    };
    let scan = scanner::scan_module(&module_root, &scan_options);
    if !scan.success {
        let reason = scan
            .error
            .clone()
            .unwrap_or_else(|| "scan did not complete".to_string());
        return Err(op.failed(format!("security scan error: {reason}"), reporter));
    }

    if scan.critical_count > 0 {
        let authorised = options.unsafe_override && roles::check_permission(Capability::UseUnsafe)?;
        if !authorised {
            return Err(op.blocked(
                format!(
                    "security scan found {} critical finding(s)",
                    scan.critical_count
                ),
                reporter,
            ));
        }
        reporter.warn(&format!(
            "proceeding past {} critical finding(s): unsafe mode enabled",
            scan.critical_count
        ));
    } else if scan.warning_count > 0 {
        let grant = roles::check_permission_detailed(Capability::Install)?;
        if grant.requires_confirmation && !options.confirm {
            // Agents never get prompted; interactive users do.
            let approved = roles::current_role() == Role::User
                && options.interactive
                && reporter.confirm(&format!(
                    "{} warning(s) found; continue anyway?",
                    scan.warning_count
                ));
            if !approved {
                return Err(op.blocked(
                    format!(
                        "{} warning(s) require confirmation",
                        scan.warning_count
                    ),
                    reporter,
                ));
            }
        }
    }

    // Validate the manifest.
    let module = manifest::parse_module(&module_root)
        .map_err(|e| op.failed(format!("{e:#}"), reporter))?;
    op.module = module.name.clone();

    if let Some(installed) = &updating {
        if module.name != installed.name {
            return Err(op.failed(
                format!(
                    "manifest name changed from `{}` to `{}`",
                    installed.name, module.name
                ),
                reporter,
            ));
        }
        if module.version == installed.version {
            reporter.info(&format!(
                "{} is already at version {}",
                module.name, module.version
            ));
            op.record(OperationResult::Success, Some("unchanged"), reporter);
            return Ok(InstallReport {
                module: module.name,
                version: module.version,
                path: installed.path.clone(),
                source: source.kind(),
                signature_verified: op.signature_verified,
                scan,
                no_op: true,
            });
        }
    }

    // Publish.
    let modules_dir = config::modules_dir()?;
    fs::create_dir_all(&modules_dir)
        .with_context(|| format!("failed to create modules dir {}", modules_dir.display()))?;
    let target = modules_dir.join(&module.name);
    let replacing = updating.is_some() || options.force;
    if target.exists() {
        if !replacing {
            return Err(op.failed(
                format!("module `{}` is already installed (use --force)", module.name),
                reporter,
            ));
        }
        fs::remove_dir_all(&target)
            .with_context(|| format!("failed to remove {}", target.display()))?;
    }
    publish(&module_root, &target).map_err(|e| op.failed(format!("{e:#}"), reporter))?;
    manifest::write_source(&target, source_str)
        .map_err(|e| op.failed(format!("{e:#}"), reporter))?;

    op.record(OperationResult::Success, None, reporter);
    reporter.info(&format!(
        "installed {} {} to {}",
        module.name,
        module.version,
        target.display()
    ));

    Ok(InstallReport {
        module: module.name,
        version: module.version,
        path: target,
        source: source.kind(),
        signature_verified: op.signature_verified,
        scan,
        no_op: false,
    })
}

fn clone_with_retry(
    url: &str,
    dest_name: &str,
    workspace: &TempWorkspace,
    timeout: Duration,
) -> Result<PathBuf> {
    let dest = workspace.path().join(dest_name);
    let mut last_error = String::new();
    for _attempt in 0..2 {
        let _ = fs::remove_dir_all(&dest);
        let output = process::run_with_deadline(
            "git",
            &["clone", "--depth", "1", url, dest_name],
            workspace.path(),
            timeout,
        )?;
        if output.ok() {
            // Drop VCS metadata before scanning and publishing.
            let _ = fs::remove_dir_all(dest.join(".git"));
            return Ok(dest);
        }
        last_error = output.failure_reason();
    }
    bail!("git clone of {url} failed: {last_error}");
}

fn download_tarball_set(url: &str, workspace: &TempWorkspace, timeout: Duration) -> Result<PathBuf> {
    let staging = workspace.path().join("download");
    fs::create_dir_all(&staging)
        .with_context(|| format!("failed to create {}", staging.display()))?;
    let client = http_client(timeout)?;

    let file_name = url.rsplit('/').next().unwrap_or("module.tar.gz");
    let bytes = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("failed to download {url}"))?
        .bytes()
        .context("failed to read download body")?;
    fs::write(staging.join(file_name), &bytes)
        .with_context(|| format!("failed to stage {file_name}"))?;

    // Best-effort siblings; verification reports what is missing.
    for ext in ["sig", "sha256"] {
        let sibling_url = format!("{url}.{ext}");
        if let Ok(resp) = client.get(&sibling_url).send().and_then(|r| r.error_for_status()) {
            if let Ok(body) = resp.bytes() {
                let _ = fs::write(staging.join(format!("{file_name}.{ext}")), &body);
            }
        }
    }
    Ok(staging)
}

fn verify_and_extract(
    triple_dir: &Path,
    workspace: &TempWorkspace,
    op: &mut Operation<'_>,
    reporter: &mut dyn Reporter,
) -> Result<PathBuf> {
    let (set, outcome) = signature::verify_directory(triple_dir)
        .map_err(|e| op.blocked(format!("signature verification: {e:#}"), reporter))?;
    match outcome {
        signature::VerifyOutcome::Verified { fingerprint } => {
            op.signature_verified = true;
            reporter.info(&format!("signature verified (key {fingerprint})"));
        }
        signature::VerifyOutcome::Failed { reason } => {
            return Err(op.blocked(format!("signature verification: {reason}"), reporter));
        }
    }

    let extract_dir = workspace.path().join("extract");
    fs::create_dir_all(&extract_dir)
        .with_context(|| format!("failed to create {}", extract_dir.display()))?;
    let file = fs::File::open(&set.tarball)
        .with_context(|| format!("failed to open {}", set.tarball.display()))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(&extract_dir)
        .with_context(|| format!("failed to extract {}", set.tarball.display()))?;
    Ok(extract_dir)
}

/// The directory holding `module.toml`: the staged root itself, or its
/// single top-level subdirectory.
fn find_module_root(staged: &Path) -> Result<PathBuf> {
    if staged.join(manifest::MANIFEST_FILE).is_file() {
        return Ok(staged.to_path_buf());
    }
    let entries: Vec<PathBuf> = fs::read_dir(staged)
        .with_context(|| format!("failed to read {}", staged.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    if let [single] = entries.as_slice() {
        if single.join(manifest::MANIFEST_FILE).is_file() {
            return Ok(single.clone());
        }
    }
    bail!("no {} found in acquired source", manifest::MANIFEST_FILE);
}

/// Atomic move with a copy-then-remove fallback for cross-device
/// renames. The source is retained until the copy has completed.
fn publish(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_recursive(from, to)?;
            fs::remove_dir_all(from)
                .with_context(|| format!("failed to remove staged tree {}", from.display()))
        }
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("failed to create {}", to.display()))?;
    let entries =
        fs::read_dir(from).with_context(|| format!("failed to read {}", from.display()))?;
    for entry in entries {
        let entry = entry.context("failed to read dir entry")?;
        let src = entry.path();
        let dest = to.join(entry.file_name());
        if src.is_dir() {
            copy_dir_recursive(&src, &dest)?;
        } else {
            fs::copy(&src, &dest)
                .with_context(|| format!("failed to copy {}", src.display()))?;
        }
    }
    Ok(())
}
