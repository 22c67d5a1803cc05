use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Config durations land either as humantime strings (`"45s"`, `"2m"`)
/// or as bare millisecond integers.
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a humantime string or a millisecond count")
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Duration, E> {
            humantime::parse_duration(v)
                .map_err(|e| E::custom(format_args!("unparseable duration {v:?}: {e}")))
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_millis)
                .map_err(|_| E::custom("duration must not be negative"))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

/// Optional-field variant of [`deserialize_duration`].
pub(crate) fn deserialize_opt_duration<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "deserialize_duration")] Duration);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

/// Finding severity. Ordering matters: `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Caller identity derived from environment evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    Human,
    ClaudeCode,
    Cursor,
    GithubCopilot,
    Vscode,
    Windsurf,
    Aider,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Human => "human",
            AgentType::ClaudeCode => "claude-code",
            AgentType::Cursor => "cursor",
            AgentType::GithubCopilot => "github-copilot",
            AgentType::Vscode => "vscode",
            AgentType::Windsurf => "windsurf",
            AgentType::Aider => "aider",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(AgentType::Human),
            "claude-code" => Some(AgentType::ClaudeCode),
            "cursor" => Some(AgentType::Cursor),
            "github-copilot" => Some(AgentType::GithubCopilot),
            "vscode" => Some(AgentType::Vscode),
            "windsurf" => Some(AgentType::Windsurf),
            "aider" => Some(AgentType::Aider),
            _ => None,
        }
    }

    /// Every non-human agent type maps to the restricted `agent` role.
    pub fn role(&self) -> Role {
        match self {
            AgentType::Human => Role::User,
            _ => Role::Agent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
        }
    }
}

/// The six capability booleans a role carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Install,
    InstallUnsigned,
    UseUnsafe,
    Uninstall,
    ModifyConfig,
    RequireConfirmation,
}

/// A registered caller session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub parent_process: String,
    pub started_at: DateTime<Utc>,
    pub role: Role,
}

/// A discovered shell module and its parsed manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    /// Absolute path of the module directory.
    pub path: PathBuf,
    /// Required dependencies, in manifest order.
    pub required: Vec<String>,
    pub optional: Vec<String>,
    /// Files to source, in manifest order.
    pub files: Vec<String>,
    pub settings: BTreeMap<String, String>,
    pub platforms: PlatformFilter,
    pub hooks: Hooks,
    /// Load priority; lower loads first among independent modules.
    pub priority: i64,
    pub loaded: bool,
}

pub const DEFAULT_PRIORITY: i64 = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformFilter {
    #[serde(default)]
    pub os: Vec<String>,
    #[serde(default)]
    pub arch: Vec<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub min_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub pre_load: Option<String>,
    #[serde(default)]
    pub post_load: Option<String>,
}

/// Why a resolution failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid module: duplicate name `{name}` (modules {first} and {second})")]
    InvalidModule {
        name: String,
        first: usize,
        second: usize,
    },
    #[error("missing dependency: `{module}` requires `{missing}`, which is not installed")]
    MissingDependency { module: String, missing: String },
    #[error("circular dependency among: {}", .members.join(", "))]
    CircularDependency { members: Vec<String> },
}

/// A generic pattern match inside a scanned file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    /// The pattern source that matched.
    pub pattern: String,
    pub description: String,
    /// File path relative to the module root.
    pub file: PathBuf,
    /// 1-based line number.
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Aws,
    Ssh,
    AnthropicApi,
    OpenaiApi,
    ShellHistory,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Aws => "AWS credentials",
            CredentialKind::Ssh => "SSH private key",
            CredentialKind::AnthropicApi => "Anthropic API key",
            CredentialKind::OpenaiApi => "OpenAI API key",
            CredentialKind::ShellHistory => "shell history",
        }
    }
}

/// A credential-access match; critical when the same line exfiltrates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialFinding {
    #[serde(flatten)]
    pub finding: Finding,
    pub credential: CredentialKind,
    pub has_exfiltration: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReverseShellKind {
    BashTcp,
    BashUdp,
    Netcat,
    Socat,
    Python,
    Perl,
}

impl ReverseShellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReverseShellKind::BashTcp => "bash /dev/tcp",
            ReverseShellKind::BashUdp => "bash /dev/udp",
            ReverseShellKind::Netcat => "netcat -e",
            ReverseShellKind::Socat => "socat",
            ReverseShellKind::Python => "python socket",
            ReverseShellKind::Perl => "perl socket",
        }
    }
}

/// A reverse-shell match. Always critical, never downgraded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseShellFinding {
    #[serde(flatten)]
    pub finding: Finding,
    pub shell: ReverseShellKind,
}

/// A path that resolves outside the module root after symlink expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymlinkFinding {
    /// The offending path, relative to the module root.
    pub file: PathBuf,
    /// Where it resolves to (absolute), when resolution succeeded.
    pub target: Option<PathBuf>,
    pub description: String,
}

/// Aggregated output of one scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    pub findings: Vec<Finding>,
    pub credential_findings: Vec<CredentialFinding>,
    pub reverse_shell_findings: Vec<ReverseShellFinding>,
    pub symlink_findings: Vec<SymlinkFinding>,
    pub critical_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub trusted_module_applied: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanResult {
    pub fn total_findings(&self) -> usize {
        self.critical_count + self.warning_count + self.info_count
    }
}

/// Per-scan knobs. Defaults mirror the walker's gates.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Files larger than this are skipped.
    pub max_file_size: u64,
    /// Module names whose credential warnings downgrade to info.
    pub trusted_modules: std::collections::BTreeSet<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024,
            trusted_modules: std::collections::BTreeSet::new(),
        }
    }
}

/// How an audited operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Success,
    Blocked,
    Failed,
}

/// Where an install source was classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    GitRepo,
    SignedTarball,
    LocalPath,
}

/// Runtime knobs for the install pipeline.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub force: bool,
    /// Proceed despite critical findings (requires the `use_unsafe` capability).
    pub unsafe_override: bool,
    pub allow_local: bool,
    /// Explicit confirmation supplied up front (stands in for a prompt).
    pub confirm: bool,
    /// Whether the caller can prompt interactively.
    pub interactive: bool,
    /// Timeout for git/HTTP acquisition.
    pub acquire_timeout: Duration,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            force: false,
            unsafe_override: false,
            allow_local: false,
            confirm: false,
            interactive: false,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}
