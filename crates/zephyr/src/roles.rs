//! Role capability table and permission arbitration.

use anyhow::Result;

use crate::config;
use crate::session;
use crate::types::{Capability, Role};

/// The six capability booleans a role carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCaps {
    pub install: bool,
    pub install_unsigned: bool,
    pub use_unsafe: bool,
    pub uninstall: bool,
    pub modify_config: bool,
    pub require_confirmation: bool,
}

impl RoleCaps {
    /// Full powers, no confirmation gate.
    pub fn user_defaults() -> Self {
        Self {
            install: true,
            install_unsigned: true,
            use_unsafe: true,
            uninstall: true,
            modify_config: true,
            require_confirmation: false,
        }
    }

    /// Install only, everything else denied, confirmation required.
    pub fn agent_defaults() -> Self {
        Self {
            install: true,
            install_unsigned: false,
            use_unsafe: false,
            uninstall: false,
            modify_config: false,
            require_confirmation: true,
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Install => self.install,
            Capability::InstallUnsigned => self.install_unsigned,
            Capability::UseUnsafe => self.use_unsafe,
            Capability::Uninstall => self.uninstall,
            Capability::ModifyConfig => self.modify_config,
            Capability::RequireConfirmation => self.require_confirmation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTable {
    pub user: RoleCaps,
    pub agent: RoleCaps,
}

impl Default for RoleTable {
    fn default() -> Self {
        Self {
            user: RoleCaps::user_defaults(),
            agent: RoleCaps::agent_defaults(),
        }
    }
}

impl RoleTable {
    pub fn caps(&self, role: Role) -> &RoleCaps {
        match role {
            Role::User => &self.user,
            Role::Agent => &self.agent,
        }
    }
}

/// The current session's role; callers without a session are `user`.
pub fn current_role() -> Role {
    session::current().map(|s| s.role).unwrap_or(Role::User)
}

/// Static table lookup of `capability` for the current session's role.
pub fn check_permission(capability: Capability) -> Result<bool> {
    let table = config::load_role_table()?;
    Ok(table.caps(current_role()).allows(capability))
}

/// A permission plus its confirmation condition.
///
/// When `requires_confirmation` is set the grant is conditional: callers
/// that can prompt must do so; callers that cannot (agents,
/// non-interactive runs) must treat it as denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionGrant {
    pub allowed: bool,
    pub requires_confirmation: bool,
}

pub fn check_permission_detailed(capability: Capability) -> Result<PermissionGrant> {
    let table = config::load_role_table()?;
    let caps = table.caps(current_role());
    Ok(PermissionGrant {
        allowed: caps.allows(capability),
        requires_confirmation: caps.require_confirmation,
    })
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::session::SESSION_ID_ENV;
    use crate::types::AgentType;

    #[test]
    fn defaults_match_role_contract() {
        let table = RoleTable::default();
        for cap in [
            Capability::Install,
            Capability::InstallUnsigned,
            Capability::UseUnsafe,
            Capability::Uninstall,
            Capability::ModifyConfig,
        ] {
            assert!(table.user.allows(cap), "user default for {cap:?}");
        }
        assert!(!table.user.allows(Capability::RequireConfirmation));

        assert!(table.agent.allows(Capability::Install));
        for cap in [
            Capability::InstallUnsigned,
            Capability::UseUnsafe,
            Capability::Uninstall,
            Capability::ModifyConfig,
        ] {
            assert!(!table.agent.allows(cap), "agent default for {cap:?}");
        }
        assert!(table.agent.allows(Capability::RequireConfirmation));
    }

    #[test]
    #[serial]
    fn no_session_means_user_role() {
        let home = tempdir().expect("tempdir");
        temp_env::with_vars(
            [
                ("HOME", Some(home.path().to_str().expect("utf8"))),
                (SESSION_ID_ENV, None),
            ],
            || {
                session::teardown();
                assert_eq!(current_role(), Role::User);
                assert!(check_permission(Capability::Uninstall).expect("check"));
            },
        );
    }

    #[test]
    #[serial]
    fn agent_session_blocks_unsigned_but_allows_install() {
        let home = tempdir().expect("tempdir");
        temp_env::with_vars(
            [
                ("HOME", Some(home.path().to_str().expect("utf8"))),
                (SESSION_ID_ENV, Some("sess-perm")),
            ],
            || {
                session::teardown();
                session::register("agent-1", AgentType::ClaudeCode, "sess-perm", "zsh")
                    .expect("register");

                assert!(!check_permission(Capability::InstallUnsigned).expect("check"));
                let grant =
                    check_permission_detailed(Capability::Install).expect("check");
                assert!(grant.allowed);
                assert!(grant.requires_confirmation);

                session::teardown();
            },
        );
    }
}
