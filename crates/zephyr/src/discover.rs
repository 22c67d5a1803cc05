//! Modules-directory discovery.
//!
//! One discovery pass enumerates the modules directory in sorted order
//! (the discovery order the resolver's tie-break relies on), parses
//! each manifest through the cache, and rejects duplicate module names.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::cache;
use crate::config;
use crate::manifest;
use crate::types::Module;

/// Discover modules in the configured modules directory. A missing
/// directory is an empty result, not an error.
pub fn discover_modules() -> Result<Vec<Module>> {
    discover_in(&config::modules_dir()?)
}

/// Discover modules under `dir`.
pub fn discover_in(dir: &Path) -> Result<Vec<Module>> {
    let mut modules = Vec::new();
    for module_dir in module_dirs(dir)? {
        let module = cache::parse_module_cached(&module_dir)?;
        if let Some(existing) = modules.iter().find(|m: &&Module| m.name == module.name) {
            bail!(
                "duplicate module name `{}` in {} and {}",
                module.name,
                existing.path.display(),
                module.path.display()
            );
        }
        modules.push(module);
    }
    Ok(modules)
}

/// Per-module parse results, for `validate`: each candidate directory
/// with its outcome, in discovery order.
pub fn validate_all(dir: &Path) -> Result<Vec<(String, Result<Module>)>> {
    let mut results = Vec::new();
    for module_dir in module_dirs(dir)? {
        let label = module_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| module_dir.display().to_string());
        results.push((label, manifest::parse_module(&module_dir)));
    }
    Ok(results)
}

fn module_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read modules dir {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && p.join(manifest::MANIFEST_FILE).is_file())
        .collect();
    dirs.sort();
    Ok(dirs)
}
