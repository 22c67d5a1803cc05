//! Uninstall gate: role policy, reverse-dependency blocking, audit.

use std::fs;

use anyhow::{Context, Result, bail};

use crate::audit;
use crate::config;
use crate::discover;
use crate::install::Reporter;
use crate::resolver::ReverseDependencyIndex;
use crate::roles;
use crate::types::{Capability, OperationResult, Role};

#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    pub force: bool,
    /// Skip the interactive confirmation.
    pub yes: bool,
    pub skip_permission: bool,
    pub interactive: bool,
}

/// How the gate resolved. `AgentBlocked` is an advisory denial: the
/// caller reports the message and exits 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallOutcome {
    Removed,
    AgentBlocked { message: String },
}

/// Remove `name` from the modules directory, subject to role policy and
/// the reverse-dependency index.
pub fn uninstall(
    name: &str,
    options: &UninstallOptions,
    reporter: &mut dyn Reporter,
) -> Result<UninstallOutcome> {
    let modules_dir = config::modules_dir()?;
    let target = modules_dir.join(name);
    let role = roles::current_role();

    // Agent arbitration comes first and is advisory: denials log an
    // agent_blocked event and exit clean.
    if role == Role::Agent && !options.skip_permission {
        if options.force {
            let message =
                format!("agents may not force-uninstall `{name}`; ask a human operator");
            record_agent_blocked(name, &message, reporter);
            return Ok(UninstallOutcome::AgentBlocked { message });
        }
        let critical = config::critical_modules()?;
        if critical.contains(name) {
            let message = format!("`{name}` is a critical module and cannot be removed by an agent");
            record_agent_blocked(name, &message, reporter);
            return Ok(UninstallOutcome::AgentBlocked { message });
        }
    } else if !options.skip_permission && !roles::check_permission(Capability::Uninstall)? {
        record(name, OperationResult::Blocked, Some("role does not permit uninstall"), reporter);
        bail!("role does not permit uninstall");
    }

    if !target.is_dir() {
        record(name, OperationResult::Failed, Some("not installed"), reporter);
        bail!("module `{name}` is not installed");
    }

    // Reverse-dependency check over one discovery pass.
    let modules = discover::discover_modules()?;
    let index = ReverseDependencyIndex::build(&modules);
    let dependents = index.dependents(name);
    if !dependents.is_empty() && !options.force {
        let reason = format!("dependents: {}", dependents.join(", "));
        record(name, OperationResult::Failed, Some(&reason), reporter);
        bail!("cannot uninstall `{name}`; {reason}");
    }

    if role == Role::User && !options.yes && options.interactive {
        let approved = reporter.confirm(&format!("remove module `{name}`?"));
        if !approved {
            record(name, OperationResult::Failed, Some("declined"), reporter);
            bail!("uninstall of `{name}` declined");
        }
    }

    fs::remove_dir_all(&target)
        .with_context(|| format!("failed to remove {}", target.display()))
        .inspect_err(|e| {
            record(name, OperationResult::Failed, Some(&format!("{e:#}")), reporter);
        })?;

    record(name, OperationResult::Success, None, reporter);
    reporter.info(&format!("removed module `{name}`"));
    Ok(UninstallOutcome::Removed)
}

fn record(
    name: &str,
    result: OperationResult,
    reason: Option<&str>,
    reporter: &mut dyn Reporter,
) {
    if let Err(err) = audit::log_operation("uninstall", name, "local", result, reason, false) {
        reporter.warn(&format!("failed to write audit event: {err:#}"));
    }
}

fn record_agent_blocked(name: &str, message: &str, reporter: &mut dyn Reporter) {
    reporter.warn(message);
    if let Err(err) = audit::log_operation(
        "agent_blocked",
        name,
        "local",
        OperationResult::Blocked,
        Some(message),
        false,
    ) {
        reporter.warn(&format!("failed to write audit event: {err:#}"));
    }
}
