//! Module-tree security scanner.
//!
//! Walks a module directory, classifies files as scannable, applies the
//! compiled pattern catalog line by line, and aggregates findings into a
//! [`ScanResult`]. The walk rejects oversized and binary files, and
//! records any path that escapes the module root through a symlink.

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::patterns::{self, CompiledCatalog};
use crate::types::{
    CredentialFinding, Finding, ReverseShellFinding, ScanOptions, ScanResult, Severity,
    SymlinkFinding,
};

/// Extensions eligible for scanning; extensionless files qualify when
/// they carry a shebang, plus `Makefile` by name.
const SCANNABLE_EXTENSIONS: &[&str] = &["sh", "zsh", "bash", "py", "toml", "json"];

/// How much of a file the binary heuristic sniffs.
const BINARY_SNIFF_LEN: usize = 4096;

/// Longest line text carried in a finding.
const SNIPPET_LEN: usize = 200;

/// Scan `root` with `options`. Never panics; failures that abort the
/// scan are reported through `ScanResult::error`.
pub fn scan_module(root: &Path, options: &ScanOptions) -> ScanResult {
    match scan_module_inner(root, options) {
        Ok(result) => result,
        Err(err) => ScanResult {
            success: false,
            error: Some(format!("{err:#}")),
            ..ScanResult::default()
        },
    }
}

fn scan_module_inner(root: &Path, options: &ScanOptions) -> Result<ScanResult> {
    let catalog = CompiledCatalog::compile()?;
    let canonical_root = fs::canonicalize(root)
        .with_context(|| format!("failed to resolve module root {}", root.display()))?;

    let mut state = WalkState {
        catalog,
        options,
        root: root.to_path_buf(),
        canonical_root,
        visited_dirs: BTreeSet::new(),
        result: ScanResult::default(),
    };
    state.walk_dir(&root.to_path_buf())?;

    let mut result = state.result;
    aggregate(&mut result);
    apply_trust(&mut result, root, options);
    result.success = true;
    Ok(result)
}

struct WalkState<'a> {
    catalog: CompiledCatalog,
    options: &'a ScanOptions,
    root: PathBuf,
    canonical_root: PathBuf,
    visited_dirs: BTreeSet<PathBuf>,
    result: ScanResult,
}

impl WalkState<'_> {
    fn walk_dir(&mut self, dir: &Path) -> Result<()> {
        let canonical = fs::canonicalize(dir)
            .with_context(|| format!("failed to resolve {}", dir.display()))?;
        if !self.visited_dirs.insert(canonical) {
            self.record_symlink(dir, None, "directory symlink cycle");
            return Ok(());
        }

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for path in entries {
            let Ok(resolved) = fs::canonicalize(&path) else {
                // Dangling symlink or unreadable entry; nothing to scan.
                continue;
            };
            if !resolved.starts_with(&self.canonical_root) {
                self.record_symlink(&path, Some(resolved), "path escapes the module root");
                continue;
            }
            if resolved.is_dir() {
                self.walk_dir(&path)?;
            } else if resolved.is_file() {
                self.scan_file(&path)?;
            }
        }
        Ok(())
    }

    fn record_symlink(&mut self, path: &Path, target: Option<PathBuf>, description: &str) {
        self.result.symlink_findings.push(SymlinkFinding {
            file: self.relative(path),
            target,
            description: description.to_string(),
        });
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_path_buf()
    }

    fn scan_file(&mut self, path: &Path) -> Result<()> {
        let meta = fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if meta.len() > self.options.max_file_size {
            return Ok(());
        }

        let mut head = vec![0u8; BINARY_SNIFF_LEN.min(meta.len() as usize)];
        {
            let mut file = fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            file.read_exact(&mut head)
                .with_context(|| format!("failed to read {}", path.display()))?;
        }
        if head.contains(&0) {
            return Ok(());
        }
        if !self.is_scannable(path, &head) {
            return Ok(());
        }

        let content = match fs::read_to_string(path) {
            Ok(s) => s,
            // Not valid UTF-8 but not binary either; scan lossily.
            Err(_) => String::from_utf8_lossy(&fs::read(path).unwrap_or_default()).into_owned(),
        };

        let rel = self.relative(path);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let build_context = patterns::is_build_file(&file_name);

        for (idx, line) in content.lines().enumerate() {
            self.scan_line(&rel, build_context, idx + 1, line);
        }
        Ok(())
    }

    fn is_scannable(&self, path: &Path, head: &[u8]) -> bool {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        if name.as_deref() == Some("Makefile") {
            return true;
        }
        match path.extension() {
            Some(ext) => SCANNABLE_EXTENSIONS
                .iter()
                .any(|s| ext.eq_ignore_ascii_case(s)),
            None => head.starts_with(b"#!"),
        }
    }

    fn scan_line(&mut self, rel: &Path, build_context: bool, line_no: usize, line: &str) {
        if patterns::is_comment_only(line) || patterns::is_wholly_string_literal(line) {
            return;
        }
        let spans = patterns::string_spans(line);

        // Reverse shells first: they ignore string containment and every
        // downgrade.
        for (re, pattern) in &self.catalog.reverse_shells {
            if re.is_match(line) {
                self.result.reverse_shell_findings.push(ReverseShellFinding {
                    finding: base_finding(
                        Severity::Critical,
                        pattern.pattern,
                        pattern.description,
                        rel,
                        line_no,
                        line,
                    ),
                    shell: pattern.kind,
                });
            }
        }

        for (re, pattern) in &self.catalog.shell {
            let Some(m) = re.find(line) else { continue };
            if patterns::contained_in_string(&spans, m.start(), m.end()) {
                continue;
            }
            let mut severity = pattern.severity;
            if build_context && severity == Severity::Critical && pattern.downgrade_in_build {
                severity = Severity::Warning;
            }
            self.result.findings.push(base_finding(
                severity,
                pattern.pattern,
                pattern.description,
                rel,
                line_no,
                line,
            ));
        }

        for (re, pattern) in &self.catalog.credentials {
            let Some(m) = re.find(line) else { continue };
            if patterns::contained_in_string(&spans, m.start(), m.end()) {
                continue;
            }
            let has_exfiltration = self.catalog.is_exfiltration_line(line);
            let severity = if pattern.always_critical {
                Severity::Critical
            } else if has_exfiltration {
                // Downgrade applies before trust, like the generic table.
                if build_context {
                    Severity::Warning
                } else {
                    Severity::Critical
                }
            } else {
                Severity::Warning
            };
            self.result.credential_findings.push(CredentialFinding {
                finding: base_finding(
                    severity,
                    pattern.pattern,
                    pattern.description,
                    rel,
                    line_no,
                    line,
                ),
                credential: pattern.kind,
                has_exfiltration,
            });
        }
    }
}

fn base_finding(
    severity: Severity,
    pattern: &str,
    description: &str,
    rel: &Path,
    line_no: usize,
    line: &str,
) -> Finding {
    Finding {
        severity,
        pattern: pattern.to_string(),
        description: description.to_string(),
        file: rel.to_path_buf(),
        line: line_no,
        text: snippet(line),
    }
}

fn snippet(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.len() <= SNIPPET_LEN {
        return trimmed.to_string();
    }
    // Cut at a char boundary; a raw byte index can fall mid-codepoint.
    let cut = trimmed
        .char_indices()
        .take_while(|(i, _)| *i <= SNIPPET_LEN - 3)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("{}...", &trimmed[..cut])
}

fn aggregate(result: &mut ScanResult) {
    let mut critical = 0;
    let mut warning = 0;
    let mut info = 0;

    for f in &result.findings {
        match f.severity {
            Severity::Critical => critical += 1,
            Severity::Warning => warning += 1,
            Severity::Info => info += 1,
        }
    }
    for f in &result.credential_findings {
        match f.finding.severity {
            Severity::Critical => critical += 1,
            Severity::Warning => warning += 1,
            Severity::Info => info += 1,
        }
    }
    critical += result.reverse_shell_findings.len();
    critical += result.symlink_findings.len();

    result.critical_count = critical;
    result.warning_count = warning;
    result.info_count = info;
}

/// Trusted-module downgrade, applied last: credential warnings become
/// info. Criticals are never touched by trust.
fn apply_trust(result: &mut ScanResult, root: &Path, options: &ScanOptions) {
    let Some(basename) = root.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return;
    };
    if !options.trusted_modules.contains(&basename) {
        return;
    }
    result.trusted_module_applied = true;
    for f in &mut result.credential_findings {
        if f.finding.severity == Severity::Warning {
            f.finding.severity = Severity::Info;
            result.warning_count -= 1;
            result.info_count += 1;
        }
    }
}
