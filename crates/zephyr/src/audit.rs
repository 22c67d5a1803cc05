//! Append-only JSONL audit streams.
//!
//! Three streams under `~/.zephyr/audit/`:
//!
//! - `sessions/<sid>-<timestamp>.log` — one line per session registration
//! - `commands/<YYYY-MM-DD>/<command-id>.log` — per-command scan events
//! - `operations/<YYYY-MM-DD>/operations.log` — install/update/uninstall/upgrade
//!
//! Directory creation is lazy. Nothing in this module truncates or
//! rewrites; the only sanctioned deletion is [`cleanup_old_audit_logs`].

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config;
use crate::session;
use crate::types::{AgentType, OperationResult, Role, Session};

pub const AUDIT_DIR: &str = "audit";
pub const SESSIONS_STREAM: &str = "sessions";
pub const COMMANDS_STREAM: &str = "commands";
pub const OPERATIONS_STREAM: &str = "operations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Sessions,
    Commands,
    Operations,
}

impl Stream {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Stream::Sessions => SESSIONS_STREAM,
            Stream::Commands => COMMANDS_STREAM,
            Stream::Operations => OPERATIONS_STREAM,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            SESSIONS_STREAM => Some(Stream::Sessions),
            COMMANDS_STREAM => Some(Stream::Commands),
            OPERATIONS_STREAM => Some(Stream::Operations),
            _ => None,
        }
    }
}

/// Common actor fields carried by every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub session_id: String,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub role: Role,
}

impl Actor {
    /// The current session's identity, or an anonymous `user` actor.
    pub fn from_current() -> Self {
        match session::current() {
            Some(s) => Self {
                session_id: s.session_id,
                agent_id: s.agent_id,
                agent_type: s.agent_type,
                role: s.role,
            },
            None => Self {
                session_id: "-".to_string(),
                agent_id: "-".to_string(),
                agent_type: AgentType::Human,
                role: Role::User,
            },
        }
    }

    fn from_session(s: &Session) -> Self {
        Self {
            session_id: s.session_id.clone(),
            agent_id: s.agent_id.clone(),
            agent_type: s.agent_type,
            role: s.role,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub actor: Actor,
    pub action: String,
    pub parent_process: String,
}

/// Severity counts summarising a scan inside a command event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub actor: Actor,
    pub action: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanSummary>,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub actor: Actor,
    pub action: String,
    pub module: String,
    pub source: String,
    pub result: OperationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub signature_verified: bool,
}

/// `~/.zephyr/audit`.
pub fn audit_dir() -> Result<PathBuf> {
    Ok(config::zephyr_home()?.join(AUDIT_DIR))
}

fn append_line<T: Serialize>(path: &Path, event: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create audit dir {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open audit file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(event).context("failed to serialize audit event")?;
    writeln!(writer, "{}", line).context("failed to write audit event")?;
    writer.flush().context("failed to flush audit file")?;
    Ok(())
}

/// Record a session registration. Returns the file written.
pub fn log_session_registered(s: &Session) -> Result<PathBuf> {
    let event = SessionEvent {
        timestamp: s.started_at,
        actor: Actor::from_session(s),
        action: "register".to_string(),
        parent_process: s.parent_process.clone(),
    };
    let stamp = s.started_at.format("%Y%m%dT%H%M%SZ");
    let path = audit_dir()?
        .join(SESSIONS_STREAM)
        .join(format!("{}-{}.log", s.session_id, stamp));
    append_line(&path, &event)?;
    Ok(path)
}

/// Record a command with its scan outcome. Returns the file written.
pub fn log_command(command: &str, scan: Option<ScanSummary>, exit_code: i32) -> Result<PathBuf> {
    let now = Utc::now();
    let event = CommandEvent {
        timestamp: now,
        actor: Actor::from_current(),
        action: "command".to_string(),
        command: command.to_string(),
        scan,
        exit_code,
    };
    let command_id = format!(
        "{}-{:04x}",
        now.format("%Y%m%dT%H%M%S"),
        rand::random::<u16>()
    );
    let path = audit_dir()?
        .join(COMMANDS_STREAM)
        .join(now.format("%Y-%m-%d").to_string())
        .join(format!("{command_id}.log"));
    append_line(&path, &event)?;
    Ok(path)
}

/// Record an install/update/uninstall/upgrade outcome.
pub fn log_operation(
    action: &str,
    module: &str,
    source: &str,
    result: OperationResult,
    reason: Option<&str>,
    signature_verified: bool,
) -> Result<()> {
    let now = Utc::now();
    let event = OperationEvent {
        timestamp: now,
        actor: Actor::from_current(),
        action: action.to_string(),
        module: module.to_string(),
        source: source.to_string(),
        result,
        reason: reason.map(str::to_string),
        signature_verified,
    };
    let path = audit_dir()?
        .join(OPERATIONS_STREAM)
        .join(now.format("%Y-%m-%d").to_string())
        .join("operations.log");
    append_line(&path, &event)
}

/// Remove date-named stream subdirectories strictly older than
/// `now - max_age_days`. `0` deletes everything before today; today and
/// future-dated directories are always preserved. Returns the number of
/// directories removed.
pub fn cleanup_old_audit_logs(max_age_days: u32) -> Result<usize> {
    let cutoff = Utc::now().date_naive() - chrono::Days::new(u64::from(max_age_days));
    let base = audit_dir()?;
    let mut removed = 0;

    for stream in [COMMANDS_STREAM, OPERATIONS_STREAM] {
        let dir = base.join(stream);
        if !dir.is_dir() {
            continue;
        }
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to read audit stream {}", dir.display()))?;
        for entry in entries {
            let entry = entry.context("failed to read audit stream entry")?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(date) = NaiveDate::parse_from_str(name, "%Y-%m-%d") else {
                continue;
            };
            if date < cutoff {
                fs::remove_dir_all(entry.path()).with_context(|| {
                    format!("failed to remove old audit dir {}", entry.path().display())
                })?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Read back raw JSON lines from one stream, newest file first, with an
/// optional substring filter.
pub fn read_stream(stream: Stream, filter: Option<&str>) -> Result<Vec<String>> {
    let dir = audit_dir()?.join(stream.dir_name());
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    collect_log_files(&dir, &mut files)?;
    files.sort();
    files.reverse();

    let mut lines = Vec::new();
    for file in files {
        let content = fs::read_to_string(&file)
            .with_context(|| format!("failed to read audit file {}", file.display()))?;
        for line in content.lines() {
            if filter.is_none_or(|f| line.contains(f)) {
                lines.push(line.to_string());
            }
        }
    }
    Ok(lines)
}

fn collect_log_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.context("failed to read dir entry")?;
        let path = entry.path();
        if path.is_dir() {
            collect_log_files(&path, out)?;
        } else if path.extension().is_some_and(|e| e == "log") {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::session::SESSION_ID_ENV;

    #[test]
    #[serial]
    fn session_registration_writes_exactly_one_file() {
        let home = tempdir().expect("tempdir");
        temp_env::with_var("HOME", Some(home.path()), || {
            session::teardown();
            session::register("agent-1", AgentType::ClaudeCode, "sess-1", "zsh")
                .expect("register");

            let sessions_dir = home.path().join(".zephyr/audit/sessions");
            let files: Vec<_> = fs::read_dir(&sessions_dir)
                .expect("sessions dir")
                .map(|e| e.expect("entry").path())
                .collect();
            assert_eq!(files.len(), 1);
            let name = files[0].file_name().expect("name").to_string_lossy();
            assert!(name.starts_with("sess-1-"), "file name was {name}");
            assert!(name.ends_with(".log"));

            let content = fs::read_to_string(&files[0]).expect("read");
            assert!(content.contains("\"session_id\":\"sess-1\""));
            assert!(content.contains("\"agent_type\":\"claude-code\""));
            assert!(content.trim_end().lines().count() == 1);
            session::teardown();
        });
    }

    #[test]
    #[serial]
    fn operations_append_to_one_file_per_day() {
        let home = tempdir().expect("tempdir");
        temp_env::with_vars(
            [
                ("HOME", Some(home.path().to_str().expect("utf8"))),
                (SESSION_ID_ENV, None),
            ],
            || {
                session::teardown();
                log_operation(
                    "install",
                    "demo",
                    "https://github.com/acme/demo",
                    OperationResult::Success,
                    None,
                    true,
                )
                .expect("first");
                log_operation(
                    "uninstall",
                    "demo",
                    "local",
                    OperationResult::Failed,
                    Some("dependents exist"),
                    false,
                )
                .expect("second");

                let lines = read_stream(Stream::Operations, None).expect("read");
                assert_eq!(lines.len(), 2);
                for line in &lines {
                    let v: serde_json::Value = serde_json::from_str(line).expect("json");
                    assert!(v.get("timestamp").is_some());
                    assert_eq!(v["role"], "user");
                }
                let filtered =
                    read_stream(Stream::Operations, Some("dependents")).expect("filter");
                assert_eq!(filtered.len(), 1);
                assert!(filtered[0].contains("\"result\":\"failed\""));
            },
        );
    }

    #[test]
    #[serial]
    fn timestamps_use_utc_z_suffix() {
        let home = tempdir().expect("tempdir");
        temp_env::with_var("HOME", Some(home.path()), || {
            session::teardown();
            log_operation("install", "m", "src", OperationResult::Blocked, None, false)
                .expect("log");
            let lines = read_stream(Stream::Operations, None).expect("read");
            let v: serde_json::Value = serde_json::from_str(&lines[0]).expect("json");
            let ts = v["timestamp"].as_str().expect("timestamp");
            assert!(ts.ends_with('Z'), "timestamp was {ts}");
        });
    }

    #[test]
    #[serial]
    fn cleanup_preserves_today_and_future() {
        let home = tempdir().expect("tempdir");
        temp_env::with_var("HOME", Some(home.path()), || {
            let ops = home.path().join(".zephyr/audit/operations");
            let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
            for name in ["2000-01-01", &today, "2999-12-31", "not-a-date"] {
                fs::create_dir_all(ops.join(name)).expect("mkdir");
            }

            let removed = cleanup_old_audit_logs(0).expect("cleanup");
            assert_eq!(removed, 1);
            assert!(!ops.join("2000-01-01").exists());
            assert!(ops.join(&today).exists());
            assert!(ops.join("2999-12-31").exists());
            assert!(ops.join("not-a-date").exists());

            // Idempotent: nothing left to remove.
            assert_eq!(cleanup_old_audit_logs(0).expect("cleanup again"), 0);
        });
    }

    #[test]
    #[serial]
    fn cleanup_honours_max_age_window() {
        let home = tempdir().expect("tempdir");
        temp_env::with_var("HOME", Some(home.path()), || {
            let cmds = home.path().join(".zephyr/audit/commands");
            let yesterday = (Utc::now().date_naive() - chrono::Days::new(1))
                .format("%Y-%m-%d")
                .to_string();
            fs::create_dir_all(cmds.join(&yesterday)).expect("mkdir");
            fs::create_dir_all(cmds.join("2000-01-01")).expect("mkdir");

            let removed = cleanup_old_audit_logs(7).expect("cleanup");
            assert_eq!(removed, 1);
            assert!(cmds.join(&yesterday).exists());
            assert!(!cmds.join("2000-01-01").exists());
        });
    }

    #[test]
    #[serial]
    fn command_events_carry_scan_summary() {
        let home = tempdir().expect("tempdir");
        temp_env::with_var("HOME", Some(home.path()), || {
            session::teardown();
            let path = log_command(
                "install acme/demo",
                Some(ScanSummary {
                    critical: 1,
                    warning: 2,
                    info: 0,
                }),
                1,
            )
            .expect("log");
            let content = fs::read_to_string(&path).expect("read");
            let v: serde_json::Value =
                serde_json::from_str(content.trim_end()).expect("json");
            assert_eq!(v["scan"]["critical"], 1);
            assert_eq!(v["exit_code"], 1);
        });
    }
}
