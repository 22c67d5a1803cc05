//! Module manifest (`module.toml`) parsing and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{DEFAULT_PRIORITY, Hooks, Module, PlatformFilter};

pub const MANIFEST_FILE: &str = "module.toml";

/// Sidecar recording where an installed module came from, so `update`
/// can re-run the pipeline against the same source.
pub const SOURCE_FILE: &str = ".zephyr-source";

static MODULE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,49}$").expect("valid name regex"));

/// True when `name` is a legal module name.
pub fn valid_module_name(name: &str) -> bool {
    MODULE_NAME_RE.is_match(name)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct ManifestFile {
    module: ModuleSection,
    #[serde(default)]
    dependencies: DependenciesSection,
    #[serde(default)]
    load: LoadSection,
    #[serde(default)]
    hooks: Hooks,
    #[serde(default)]
    platforms: PlatformFilter,
    #[serde(default)]
    settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct ModuleSection {
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    license: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct DependenciesSection {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    optional: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct LoadSection {
    #[serde(default = "default_priority")]
    priority: i64,
    #[serde(default)]
    files: Vec<String>,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

impl Default for LoadSection {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            files: Vec::new(),
        }
    }
}

/// Parse and validate the manifest inside `module_dir`.
pub fn parse_module(module_dir: &Path) -> Result<Module> {
    let path = module_dir.join(MANIFEST_FILE);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;

    let raw: ManifestFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;

    if raw.module.name.is_empty() {
        bail!("manifest {} has an empty module name", path.display());
    }
    if !valid_module_name(&raw.module.name) {
        bail!(
            "manifest {} has an invalid module name `{}`",
            path.display(),
            raw.module.name
        );
    }
    if raw.module.version.is_empty() {
        bail!("manifest {} has an empty version", path.display());
    }

    Ok(Module {
        name: raw.module.name,
        version: raw.module.version,
        description: raw.module.description,
        author: raw.module.author,
        license: raw.module.license,
        path: module_dir.to_path_buf(),
        required: raw.dependencies.required,
        optional: raw.dependencies.optional,
        files: raw.load.files,
        settings: raw.settings,
        platforms: raw.platforms,
        hooks: raw.hooks,
        priority: raw.load.priority,
        loaded: false,
    })
}

/// Record the install source next to the manifest.
pub fn write_source(module_dir: &Path, source: &str) -> Result<()> {
    let path = module_dir.join(SOURCE_FILE);
    fs::write(&path, source)
        .with_context(|| format!("failed to record install source {}", path.display()))
}

/// Read back the recorded install source, if any.
pub fn read_source(module_dir: &Path) -> Option<String> {
    let content = fs::read_to_string(module_dir.join(SOURCE_FILE)).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Scaffold a new module directory with a starter manifest and init file.
pub fn scaffold_module(modules_dir: &Path, name: &str) -> Result<()> {
    if !valid_module_name(name) {
        bail!("invalid module name `{name}`");
    }
    let dir = modules_dir.join(name);
    if dir.exists() {
        bail!("module directory {} already exists", dir.display());
    }
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create module dir {}", dir.display()))?;

    let manifest = format!(
        "[module]\nname = \"{name}\"\nversion = \"0.1.0\"\ndescription = \"\"\n\n\
         [load]\npriority = {DEFAULT_PRIORITY}\nfiles = [\"init.zsh\"]\n"
    );
    fs::write(dir.join(MANIFEST_FILE), manifest).context("failed to write starter manifest")?;
    fs::write(dir.join("init.zsh"), format!("# {name} module\n"))
        .context("failed to write starter init file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::*;

    fn write_manifest(dir: &Path, content: &str) {
        fs::write(dir.join(MANIFEST_FILE), content).expect("write manifest");
    }

    #[test]
    fn parses_full_manifest() {
        let td = tempdir().expect("tempdir");
        write_manifest(
            td.path(),
            r#"
[module]
name = "git-extras"
version = "1.4.0"
description = "extra git helpers"
author = "someone"
license = "MIT"

[dependencies]
required = ["core"]
optional = ["fzf"]

[load]
priority = 40
files = ["init.zsh", "aliases.zsh"]

[hooks]
pre_load = "git_extras_pre"
post_load = "git_extras_post"

[platforms]
os = ["linux", "macos"]
arch = ["x86_64", "aarch64"]
shell = "zsh"
min_version = "5.8"

[settings]
editor = "vim"
"#,
        );

        let module = parse_module(td.path()).expect("parse");
        assert_eq!(module.name, "git-extras");
        assert_eq!(module.version, "1.4.0");
        assert_eq!(module.required, vec!["core".to_string()]);
        assert_eq!(module.files.len(), 2);
        assert_eq!(module.priority, 40);
        assert_eq!(module.hooks.pre_load.as_deref(), Some("git_extras_pre"));
        assert_eq!(module.platforms.shell.as_deref(), Some("zsh"));
        assert_eq!(module.settings.get("editor").map(String::as_str), Some("vim"));
        assert_eq!(module.path, td.path().to_path_buf());
        assert!(!module.loaded);
    }

    #[test]
    fn minimal_manifest_gets_defaults() {
        let td = tempdir().expect("tempdir");
        write_manifest(
            td.path(),
            "[module]\nname = \"tiny\"\nversion = \"0.1.0\"\n",
        );

        let module = parse_module(td.path()).expect("parse");
        assert_eq!(module.priority, DEFAULT_PRIORITY);
        assert!(module.required.is_empty());
        assert!(module.files.is_empty());
        assert!(module.settings.is_empty());
    }

    #[test]
    fn missing_name_or_version_is_rejected() {
        let td = tempdir().expect("tempdir");
        write_manifest(td.path(), "[module]\nversion = \"0.1.0\"\n");
        let err = parse_module(td.path()).expect_err("no name");
        assert!(format!("{err:#}").contains("failed to parse manifest"));

        write_manifest(td.path(), "[module]\nname = \"x\"\nversion = \"\"\n");
        let err = parse_module(td.path()).expect_err("empty version");
        assert!(format!("{err:#}").contains("empty version"));
    }

    #[test]
    fn module_name_rule_matches_spec() {
        assert!(valid_module_name("a"));
        assert!(valid_module_name("oh-my-zsh"));
        assert!(valid_module_name("Mod_2"));
        assert!(!valid_module_name(""));
        assert!(!valid_module_name("2fast"));
        assert!(!valid_module_name("-dash"));
        assert!(!valid_module_name(&"x".repeat(51)));
        assert!(valid_module_name(&"x".repeat(50)));
    }

    #[test]
    fn source_sidecar_round_trips() {
        let td = tempdir().expect("tempdir");
        assert_eq!(read_source(td.path()), None);
        write_source(td.path(), "https://github.com/acme/mod.git").expect("write");
        assert_eq!(
            read_source(td.path()),
            Some("https://github.com/acme/mod.git".to_string())
        );
    }

    #[test]
    fn scaffold_creates_parseable_module() {
        let td = tempdir().expect("tempdir");
        scaffold_module(td.path(), "fresh").expect("scaffold");

        let module = parse_module(&td.path().join("fresh")).expect("parse scaffolded");
        assert_eq!(module.name, "fresh");
        assert_eq!(module.version, "0.1.0");
        assert_eq!(module.files, vec!["init.zsh".to_string()]);
        assert_eq!(module.path, PathBuf::from(td.path().join("fresh")));

        let err = scaffold_module(td.path(), "fresh").expect_err("exists");
        assert!(format!("{err:#}").contains("already exists"));
        let err = scaffold_module(td.path(), "no/slash").expect_err("bad name");
        assert!(format!("{err:#}").contains("invalid module name"));
    }
}
