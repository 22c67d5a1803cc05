//! User-level configuration under `~/.zephyr`.
//!
//! Two optional files: `security.toml` (role capability overrides and
//! extra critical modules) and `trusted_modules.toml` (allowlist whose
//! credential warnings downgrade to info). Missing files mean defaults.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::roles::{RoleCaps, RoleTable};
use crate::session;

pub const SECURITY_FILE: &str = "security.toml";
pub const TRUSTED_FILE: &str = "trusted_modules.toml";

/// Overrides the default `~/.zephyr/modules` location.
pub const MODULES_DIR_ENV: &str = "ZSH_MODULES_DIR";

/// Modules that may never be uninstalled by an agent, regardless of config.
pub const BUILTIN_CRITICAL_MODULES: [&str; 2] = ["stdlib", "tooling"];

/// Module names trusted out of the box.
pub const BUILTIN_TRUSTED_MODULES: [&str; 1] = ["oh-my-zsh"];

/// Default timeout for git/HTTP acquisition.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// `$HOME/.zephyr`. Reads `HOME` under the process-wide env lock.
pub fn zephyr_home() -> Result<PathBuf> {
    let home = {
        let _guard = session::lock_home_env();
        env::var("HOME").context("HOME env var not set")?
    };
    Ok(PathBuf::from(home).join(".zephyr"))
}

/// The modules directory: `ZSH_MODULES_DIR` when set, else
/// `~/.zephyr/modules`.
pub fn modules_dir() -> Result<PathBuf> {
    let from_env = {
        let _guard = session::lock_home_env();
        env::var(MODULES_DIR_ENV).ok()
    };
    match from_env {
        Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
        _ => Ok(zephyr_home()?.join("modules")),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SecurityConfigFile {
    #[serde(default)]
    critical_modules: Vec<String>,
    #[serde(default)]
    roles: RolesSection,
    #[serde(default)]
    install: InstallSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InstallSection {
    /// Accepts humantime strings ("45s") or integer milliseconds.
    #[serde(default, deserialize_with = "crate::types::deserialize_opt_duration")]
    acquire_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RolesSection {
    #[serde(default)]
    user: Option<RoleCapsFile>,
    #[serde(default)]
    agent: Option<RoleCapsFile>,
}

/// On-disk capability flags. Every field optional so a partial table
/// overrides only what it names.
#[derive(Debug, Clone, Default, Deserialize)]
struct RoleCapsFile {
    can_install: Option<bool>,
    can_install_unsigned: Option<bool>,
    can_use_unsafe: Option<bool>,
    can_uninstall: Option<bool>,
    can_modify_config: Option<bool>,
    require_confirmation: Option<bool>,
}

impl RoleCapsFile {
    fn apply(&self, caps: &mut RoleCaps) {
        if let Some(v) = self.can_install {
            caps.install = v;
        }
        if let Some(v) = self.can_install_unsigned {
            caps.install_unsigned = v;
        }
        if let Some(v) = self.can_use_unsafe {
            caps.use_unsafe = v;
        }
        if let Some(v) = self.can_uninstall {
            caps.uninstall = v;
        }
        if let Some(v) = self.can_modify_config {
            caps.modify_config = v;
        }
        if let Some(v) = self.require_confirmation {
            caps.require_confirmation = v;
        }
    }
}

fn load_security_file() -> Result<Option<SecurityConfigFile>> {
    let path = zephyr_home()?.join(SECURITY_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read security config {}", path.display()))?;
    let parsed: SecurityConfigFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse security config {}", path.display()))?;
    Ok(Some(parsed))
}

/// The role table: defaults, overridden by `security.toml` where present.
pub fn load_role_table() -> Result<RoleTable> {
    let mut table = RoleTable::default();
    if let Some(file) = load_security_file()? {
        if let Some(user) = &file.roles.user {
            user.apply(&mut table.user);
        }
        if let Some(agent) = &file.roles.agent {
            agent.apply(&mut table.agent);
        }
    }
    Ok(table)
}

/// Timeout for git/HTTP acquisition, overridable via `security.toml`.
pub fn acquire_timeout() -> Result<Duration> {
    Ok(load_security_file()?
        .and_then(|f| f.install.acquire_timeout)
        .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT))
}

/// Modules an agent may never uninstall: builtins plus any declared in
/// `security.toml`.
pub fn critical_modules() -> Result<BTreeSet<String>> {
    let mut set: BTreeSet<String> = BUILTIN_CRITICAL_MODULES
        .iter()
        .map(|s| s.to_string())
        .collect();
    if let Some(file) = load_security_file()? {
        set.extend(file.critical_modules);
    }
    Ok(set)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TrustedModulesFile {
    #[serde(default)]
    modules: Vec<String>,
}

/// The trusted-module allowlist: builtins plus `trusted_modules.toml`.
pub fn trusted_modules() -> Result<BTreeSet<String>> {
    let mut set: BTreeSet<String> = BUILTIN_TRUSTED_MODULES
        .iter()
        .map(|s| s.to_string())
        .collect();

    let path = zephyr_home()?.join(TRUSTED_FILE);
    if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read trusted modules {}", path.display()))?;
        let parsed: TrustedModulesFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse trusted modules {}", path.display()))?;
        set.extend(parsed.modules);
    }
    Ok(set)
}
