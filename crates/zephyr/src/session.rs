//! Caller session registry and agent-type detection.
//!
//! The registry is a process-wide map from session id to [`Session`]. A
//! session is created explicitly via [`register`] (the `register-session`
//! entry point) or derived lazily from environment evidence. Once
//! registered, the entry for a session id never changes until [`teardown`].

use std::collections::BTreeMap;
use std::env;
use std::sync::{Mutex, MutexGuard, OnceLock};

use anyhow::Result;
use chrono::Utc;

use crate::audit;
use crate::types::{AgentType, Session};

/// Environment variable naming the current session.
pub const SESSION_ID_ENV: &str = "ZEPHYR_SESSION_ID";

/// Process-wide lock serialising every code path that reads or writes
/// `HOME`, `TMPDIR`, `ZEPHYR_SESSION_ID`, or the agent-detection
/// variables. Tests mutate these, so production uses of the same paths
/// take the same lock.
pub fn home_env_mutex() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Acquire [`home_env_mutex`], recovering from poisoning.
pub fn lock_home_env() -> MutexGuard<'static, ()> {
    home_env_mutex().lock().unwrap_or_else(|e| e.into_inner())
}

fn registry() -> &'static Mutex<BTreeMap<String, Session>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, Session>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Classify the caller from environment evidence.
///
/// The precedence is fixed and observable: `ANTHROPIC_API_KEY`, then
/// `TERM_PROGRAM=cursor`, then the Copilot variables, then
/// `TERM_PROGRAM=vscode`, then `WINDSURF_SESSION`, then `AIDER_SESSION`,
/// else human.
pub fn detect_agent_type() -> AgentType {
    let _guard = lock_home_env();
    detect_agent_type_unlocked()
}

pub(crate) fn detect_agent_type_unlocked() -> AgentType {
    if env::var_os("ANTHROPIC_API_KEY").is_some() {
        return AgentType::ClaudeCode;
    }
    let term_program = env::var("TERM_PROGRAM").unwrap_or_default();
    if term_program == "cursor" {
        return AgentType::Cursor;
    }
    if env::var_os("GITHUB_COPILOT_TOKEN").is_some()
        || env::var_os("GITHUB_COPILOT_SESSION").is_some()
    {
        return AgentType::GithubCopilot;
    }
    if term_program == "vscode" {
        return AgentType::Vscode;
    }
    if env::var_os("WINDSURF_SESSION").is_some() {
        return AgentType::Windsurf;
    }
    if env::var_os("AIDER_SESSION").is_some() {
        return AgentType::Aider;
    }
    AgentType::Human
}

/// Register a session and append a session audit event.
///
/// Registering an id that already exists is a no-op returning the
/// existing session unchanged.
pub fn register(
    agent_id: &str,
    agent_type: AgentType,
    session_id: &str,
    parent_process: &str,
) -> Result<Session> {
    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = reg.get(session_id) {
        return Ok(existing.clone());
    }

    let session = Session {
        session_id: session_id.to_string(),
        agent_id: agent_id.to_string(),
        agent_type,
        parent_process: parent_process.to_string(),
        started_at: Utc::now(),
        role: agent_type.role(),
    };
    reg.insert(session_id.to_string(), session.clone());
    drop(reg);

    audit::log_session_registered(&session)?;
    Ok(session)
}

/// Lazily adopt a session from environment evidence.
///
/// When `ZEPHYR_SESSION_ID` names a session this process has not seen,
/// register it with the detected agent type. Unlike [`register`], no
/// session audit event is written; the registration already happened in
/// the process that issued the id.
pub fn ensure_current_from_env() -> Option<Session> {
    let (sid, agent_type) = {
        let _guard = lock_home_env();
        (
            env::var(SESSION_ID_ENV).ok()?,
            detect_agent_type_unlocked(),
        )
    };
    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = reg.get(&sid) {
        return Some(existing.clone());
    }
    let session = Session {
        session_id: sid.clone(),
        agent_id: agent_type.as_str().to_string(),
        agent_type,
        parent_process: "unknown".to_string(),
        started_at: Utc::now(),
        role: agent_type.role(),
    };
    reg.insert(sid, session.clone());
    Some(session)
}

/// The session named by `ZEPHYR_SESSION_ID`, if registered.
pub fn current() -> Option<Session> {
    let sid = {
        let _guard = lock_home_env();
        env::var(SESSION_ID_ENV).ok()?
    };
    let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    reg.get(&sid).cloned()
}

/// Look up a session by id.
pub fn get(session_id: &str) -> Option<Session> {
    let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    reg.get(session_id).cloned()
}

/// All registered sessions, ordered by session id.
pub fn all() -> Vec<Session> {
    let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    reg.values().cloned().collect()
}

/// Delete every registered session. Idempotent.
pub fn teardown() {
    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    reg.clear();
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::types::Role;

    const AGENT_VARS: [&str; 6] = [
        "ANTHROPIC_API_KEY",
        "TERM_PROGRAM",
        "GITHUB_COPILOT_TOKEN",
        "GITHUB_COPILOT_SESSION",
        "WINDSURF_SESSION",
        "AIDER_SESSION",
    ];

    fn with_clean_agent_env<R>(extra: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let mut vars: Vec<(&str, Option<&str>)> =
            AGENT_VARS.iter().map(|v| (*v, None)).collect();
        for (k, v) in extra {
            if let Some(slot) = vars.iter_mut().find(|(name, _)| name == k) {
                slot.1 = Some(v);
            } else {
                vars.push((k, Some(v)));
            }
        }
        temp_env::with_vars(vars, f)
    }

    #[test]
    #[serial]
    fn detection_defaults_to_human() {
        with_clean_agent_env(&[], || {
            assert_eq!(detect_agent_type(), AgentType::Human);
        });
    }

    #[test]
    #[serial]
    fn detection_precedence_is_fixed() {
        // Everything set at once: ANTHROPIC_API_KEY wins.
        with_clean_agent_env(
            &[
                ("ANTHROPIC_API_KEY", "sk-ant-xxx"),
                ("TERM_PROGRAM", "cursor"),
                ("GITHUB_COPILOT_TOKEN", "tok"),
                ("WINDSURF_SESSION", "1"),
                ("AIDER_SESSION", "1"),
            ],
            || assert_eq!(detect_agent_type(), AgentType::ClaudeCode),
        );

        // Cursor beats Copilot and vscode.
        with_clean_agent_env(
            &[("TERM_PROGRAM", "cursor"), ("GITHUB_COPILOT_TOKEN", "tok")],
            || assert_eq!(detect_agent_type(), AgentType::Cursor),
        );

        // Copilot beats a vscode TERM_PROGRAM.
        with_clean_agent_env(
            &[("TERM_PROGRAM", "vscode"), ("GITHUB_COPILOT_SESSION", "s")],
            || assert_eq!(detect_agent_type(), AgentType::GithubCopilot),
        );

        with_clean_agent_env(&[("TERM_PROGRAM", "vscode")], || {
            assert_eq!(detect_agent_type(), AgentType::Vscode)
        });
        with_clean_agent_env(&[("WINDSURF_SESSION", "w")], || {
            assert_eq!(detect_agent_type(), AgentType::Windsurf)
        });
        with_clean_agent_env(&[("AIDER_SESSION", "a")], || {
            assert_eq!(detect_agent_type(), AgentType::Aider)
        });
    }

    #[test]
    #[serial]
    fn register_is_idempotent_per_session_id() {
        let home = tempdir().expect("tempdir");
        temp_env::with_var("HOME", Some(home.path()), || {
            teardown();
            let first =
                register("agent-1", AgentType::ClaudeCode, "sess-dup", "zsh").expect("register");
            let second =
                register("agent-2", AgentType::Cursor, "sess-dup", "bash").expect("re-register");
            assert_eq!(second.agent_id, first.agent_id);
            assert_eq!(second.agent_type, AgentType::ClaudeCode);
            assert_eq!(all().len(), 1);
            teardown();
        });
    }

    #[test]
    #[serial]
    fn current_follows_session_id_env() {
        let home = tempdir().expect("tempdir");
        temp_env::with_vars(
            [
                ("HOME", Some(home.path().to_str().expect("utf8"))),
                (SESSION_ID_ENV, Some("sess-env")),
            ],
            || {
                teardown();
                assert!(current().is_none());
                register("agent-1", AgentType::Human, "sess-env", "zsh").expect("register");
                let cur = current().expect("current");
                assert_eq!(cur.session_id, "sess-env");
                assert_eq!(cur.role, Role::User);
                teardown();
            },
        );
    }

    #[test]
    #[serial]
    fn teardown_twice_leaves_empty_registry() {
        let home = tempdir().expect("tempdir");
        temp_env::with_var("HOME", Some(home.path()), || {
            register("agent-1", AgentType::Aider, "sess-gone", "sh").expect("register");
            teardown();
            assert!(all().is_empty());
            teardown();
            assert!(all().is_empty());
        });
    }
}
