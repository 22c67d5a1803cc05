//! Shell initialization emission.
//!
//! A small backend seam with the four operations the emitted code
//! needs, concrete zsh and bash variants, and the `load` entry point
//! that walks a resolved module order.

use std::env;
use std::path::Path;

use crate::session;
use crate::types::Module;

pub trait ShellBackend {
    /// Guard expression that is true when `function` is defined.
    fn function_exists_check(&self, function: &str) -> String;
    fn source_command(&self, path: &Path) -> String;
    fn export_variable(&self, name: &str, value: &str) -> String;
    /// Guard expression that is true when `path` is a regular file.
    fn file_exists_check(&self, path: &Path) -> String;
}

#[derive(Debug, Default)]
pub struct Zsh;

impl ShellBackend for Zsh {
    fn function_exists_check(&self, function: &str) -> String {
        format!("(( $+functions[{function}] ))")
    }

    fn source_command(&self, path: &Path) -> String {
        format!("source \"{}\"", path.display())
    }

    fn export_variable(&self, name: &str, value: &str) -> String {
        format!("export {name}=\"{value}\"")
    }

    fn file_exists_check(&self, path: &Path) -> String {
        format!("[[ -f \"{}\" ]]", path.display())
    }
}

#[derive(Debug, Default)]
pub struct Bash;

impl ShellBackend for Bash {
    fn function_exists_check(&self, function: &str) -> String {
        format!("declare -F {function} > /dev/null 2>&1")
    }

    fn source_command(&self, path: &Path) -> String {
        format!("source \"{}\"", path.display())
    }

    fn export_variable(&self, name: &str, value: &str) -> String {
        format!("export {name}=\"{value}\"")
    }

    fn file_exists_check(&self, path: &Path) -> String {
        format!("[[ -f \"{}\" ]]", path.display())
    }
}

/// The backend for a shell name. Unknown shells get zsh, the native
/// target.
pub fn backend_for(shell: &str) -> Box<dyn ShellBackend> {
    match shell {
        "bash" => Box::new(Bash),
        _ => Box::new(Zsh),
    }
}

/// Basename of `$SHELL`, defaulting to zsh.
pub fn shell_from_env() -> String {
    let raw = {
        let _guard = session::lock_home_env();
        env::var("SHELL").unwrap_or_default()
    };
    let base = raw.rsplit('/').next().unwrap_or("");
    if base.is_empty() {
        "zsh".to_string()
    } else {
        base.to_string()
    }
}

/// True when the module's platform filter admits this host.
pub fn platform_matches(module: &Module) -> bool {
    let os_ok = module.platforms.os.is_empty()
        || module.platforms.os.iter().any(|o| o == env::consts::OS);
    let arch_ok = module.platforms.arch.is_empty()
        || module.platforms.arch.iter().any(|a| a == env::consts::ARCH);
    os_ok && arch_ok
}

/// Render initialization code for `modules` (already resolved and
/// platform-filtered), hooks guarded, files sourced in manifest order,
/// settings exported as `ZEPHYR_<MODULE>_<KEY>`.
pub fn emit_init(modules: &[Module], backend: &dyn ShellBackend) -> String {
    let mut out = String::new();
    out.push_str("# Generated by zephyr; do not edit.\n");

    for module in modules {
        out.push_str(&format!("\n# module {} {}\n", module.name, module.version));

        if let Some(hook) = &module.hooks.pre_load {
            out.push_str(&format!(
                "if {}; then {hook}; fi\n",
                backend.function_exists_check(hook)
            ));
        }

        for file in &module.files {
            let path = module.path.join(file);
            out.push_str(&format!(
                "if {}; then {}; fi\n",
                backend.file_exists_check(&path),
                backend.source_command(&path)
            ));
        }

        for (key, value) in &module.settings {
            out.push_str(&format!(
                "{}\n",
                backend.export_variable(&setting_var(&module.name, key), value)
            ));
        }

        if let Some(hook) = &module.hooks.post_load {
            out.push_str(&format!(
                "if {}; then {hook}; fi\n",
                backend.function_exists_check(hook)
            ));
        }
    }
    out
}

fn setting_var(module: &str, key: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("ZEPHYR_{}_{}", clean(module), clean(key))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::*;
    use crate::types::{DEFAULT_PRIORITY, Hooks, PlatformFilter};

    fn module() -> Module {
        Module {
            name: "git-extras".to_string(),
            version: "1.4.0".to_string(),
            description: None,
            author: None,
            license: None,
            path: PathBuf::from("/modules/git-extras"),
            required: Vec::new(),
            optional: Vec::new(),
            files: vec!["init.zsh".to_string(), "aliases.zsh".to_string()],
            settings: BTreeMap::from([("editor".to_string(), "vim".to_string())]),
            platforms: PlatformFilter::default(),
            hooks: Hooks {
                pre_load: Some("git_extras_pre".to_string()),
                post_load: Some("git_extras_post".to_string()),
            },
            priority: DEFAULT_PRIORITY,
            loaded: false,
        }
    }

    #[test]
    fn zsh_emission_guards_hooks_files_and_settings() {
        let out = emit_init(&[module()], &Zsh);
        assert!(out.contains("# module git-extras 1.4.0"));
        assert!(out.contains("if (( $+functions[git_extras_pre] )); then git_extras_pre; fi"));
        assert!(out.contains(
            "if [[ -f \"/modules/git-extras/init.zsh\" ]]; then source \"/modules/git-extras/init.zsh\"; fi"
        ));
        assert!(out.contains("export ZEPHYR_GIT_EXTRAS_EDITOR=\"vim\""));
        let pre = out.find("git_extras_pre").expect("pre hook");
        let post = out.find("git_extras_post").expect("post hook");
        assert!(pre < post);
    }

    #[test]
    fn bash_backend_uses_declare_for_function_checks() {
        let out = emit_init(&[module()], &Bash);
        assert!(out.contains("declare -F git_extras_pre > /dev/null 2>&1"));
        assert!(!out.contains("$+functions"));
    }

    #[test]
    fn files_are_sourced_in_manifest_order() {
        let out = emit_init(&[module()], &Zsh);
        let init = out.find("init.zsh").expect("init");
        let aliases = out.find("aliases.zsh").expect("aliases");
        assert!(init < aliases);
    }

    #[test]
    fn platform_filter_admits_current_host_and_rejects_others() {
        let mut m = module();
        assert!(platform_matches(&m));

        m.platforms.os = vec![env::consts::OS.to_string()];
        m.platforms.arch = vec![env::consts::ARCH.to_string()];
        assert!(platform_matches(&m));

        m.platforms.os = vec!["plan9".to_string()];
        assert!(!platform_matches(&m));
    }

    #[test]
    fn backend_selection_defaults_to_zsh() {
        let bash = backend_for("bash");
        assert!(bash.function_exists_check("f").starts_with("declare"));
        let other = backend_for("fish");
        assert!(other.function_exists_check("f").contains("$+functions"));
    }
}
