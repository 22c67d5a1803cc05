//! Dependency resolution and the reverse-dependency index.
//!
//! Kahn's algorithm over the module registry, with a deterministic
//! ready-queue ordered by `(priority, discovery index)`: among modules
//! whose dependencies are satisfied, lower priority loads first and
//! ties fall back to discovery order.

use std::collections::{BTreeMap, BTreeSet};

use crate::cache;
use crate::types::{Module, ResolveError};

/// Resolve `modules` into load order.
pub fn resolve(modules: &[Module]) -> Result<Vec<Module>, ResolveError> {
    let order = resolve_order(modules)?;
    Ok(order.into_iter().map(|i| modules[i].clone()).collect())
}

/// Resolve, consulting the process-wide resolution cache.
///
/// The cache key covers every member's name, version, path, and
/// manifest mtime, so any on-disk change misses and recomputes. The
/// result is identical to the uncached [`resolve`].
pub fn resolve_cached(modules: &[Module]) -> Result<Vec<Module>, ResolveError> {
    let Some(key) = cache::resolution_key(modules) else {
        return resolve(modules);
    };
    if let Some(names) = cache::get_resolution(&key) {
        let by_name: BTreeMap<&str, &Module> =
            modules.iter().map(|m| (m.name.as_str(), m)).collect();
        let resolved: Option<Vec<Module>> = names
            .iter()
            .map(|n| by_name.get(n.as_str()).map(|m| (*m).clone()))
            .collect();
        if let Some(resolved) = resolved {
            return Ok(resolved);
        }
    }
    let resolved = resolve(modules)?;
    cache::put_resolution(key, resolved.iter().map(|m| m.name.clone()).collect());
    Ok(resolved)
}

fn resolve_order(modules: &[Module]) -> Result<Vec<usize>, ResolveError> {
    // Registry pass: name -> discovery index, duplicates rejected.
    let mut registry: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, module) in modules.iter().enumerate() {
        if let Some(&first) = registry.get(module.name.as_str()) {
            return Err(ResolveError::InvalidModule {
                name: module.name.clone(),
                first,
                second: idx,
            });
        }
        registry.insert(&module.name, idx);
    }

    // In-degree per module; missing required deps fail here.
    let mut required_of: Vec<BTreeSet<&str>> = Vec::with_capacity(modules.len());
    let mut dependents_of: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut indegree = vec![0usize; modules.len()];
    for (idx, module) in modules.iter().enumerate() {
        let unique: BTreeSet<&str> = module.required.iter().map(String::as_str).collect();
        for dep in &unique {
            let Some(&dep_idx) = registry.get(dep) else {
                return Err(ResolveError::MissingDependency {
                    module: module.name.clone(),
                    missing: (*dep).to_string(),
                });
            };
            indegree[idx] += 1;
            dependents_of.entry(dep_idx).or_default().push(idx);
        }
        required_of.push(unique);
    }

    // Ready queue: ascending (priority, discovery index).
    let mut ready: BTreeSet<(i64, usize)> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(idx, _)| (modules[idx].priority, idx))
        .collect();

    let mut out: Vec<usize> = Vec::with_capacity(modules.len());
    while let Some(&entry) = ready.iter().next() {
        ready.remove(&entry);
        let (_, idx) = entry;
        out.push(idx);

        if let Some(dependents) = dependents_of.get(&idx) {
            for &dep_idx in dependents {
                indegree[dep_idx] -= 1;
                if indegree[dep_idx] == 0 {
                    ready.insert((modules[dep_idx].priority, dep_idx));
                }
            }
        }
    }

    if out.len() != modules.len() {
        let emitted: BTreeSet<usize> = out.iter().copied().collect();
        let members = modules
            .iter()
            .enumerate()
            .filter(|(idx, _)| !emitted.contains(idx))
            .map(|(_, m)| m.name.clone())
            .collect();
        return Err(ResolveError::CircularDependency { members });
    }
    Ok(out)
}

/// Name -> set of modules that list it in their required deps.
#[derive(Debug, Clone, Default)]
pub struct ReverseDependencyIndex {
    map: BTreeMap<String, BTreeSet<String>>,
}

impl ReverseDependencyIndex {
    pub fn build(modules: &[Module]) -> Self {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for module in modules {
            for dep in &module.required {
                map.entry(dep.clone())
                    .or_default()
                    .insert(module.name.clone());
            }
        }
        Self { map }
    }

    /// Modules that require `name`, sorted.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.map
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use proptest::prelude::*;
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::manifest;
    use crate::types::DEFAULT_PRIORITY;

    fn module(name: &str, required: &[&str], priority: i64) -> Module {
        Module {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: None,
            author: None,
            license: None,
            path: PathBuf::from("/modules").join(name),
            required: required.iter().map(|s| s.to_string()).collect(),
            optional: Vec::new(),
            files: Vec::new(),
            settings: Default::default(),
            platforms: Default::default(),
            hooks: Default::default(),
            priority,
            loaded: false,
        }
    }

    fn names(modules: &[Module]) -> Vec<&str> {
        modules.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn dependencies_come_before_dependents() {
        let modules = vec![
            module("web", &["core"], DEFAULT_PRIORITY),
            module("core", &[], DEFAULT_PRIORITY),
            module("extras", &["web", "core"], DEFAULT_PRIORITY),
        ];
        let order = resolve(&modules).expect("resolve");
        assert_eq!(names(&order), vec!["core", "web", "extras"]);
    }

    #[test]
    fn lower_priority_loads_first_among_independents() {
        let modules = vec![
            module("late", &[], 200),
            module("early", &[], 10),
            module("mid", &[], DEFAULT_PRIORITY),
        ];
        let order = resolve(&modules).expect("resolve");
        assert_eq!(names(&order), vec!["early", "mid", "late"]);
    }

    #[test]
    fn priority_ties_break_by_discovery_order() {
        let modules = vec![
            module("zeta", &[], DEFAULT_PRIORITY),
            module("alpha", &[], DEFAULT_PRIORITY),
        ];
        let order = resolve(&modules).expect("resolve");
        assert_eq!(names(&order), vec!["zeta", "alpha"]);
    }

    #[test]
    fn duplicate_name_reports_both_indices() {
        let modules = vec![
            module("dup", &[], DEFAULT_PRIORITY),
            module("other", &[], DEFAULT_PRIORITY),
            module("dup", &[], DEFAULT_PRIORITY),
        ];
        let err = resolve(&modules).expect_err("duplicate");
        assert_eq!(
            err,
            ResolveError::InvalidModule {
                name: "dup".to_string(),
                first: 0,
                second: 2,
            }
        );
    }

    #[test]
    fn missing_dependency_names_module_and_dep() {
        let modules = vec![module("web", &["ghost"], DEFAULT_PRIORITY)];
        let err = resolve(&modules).expect_err("missing");
        assert_eq!(
            err,
            ResolveError::MissingDependency {
                module: "web".to_string(),
                missing: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn cycle_lists_unprocessed_members() {
        let modules = vec![
            module("a", &["b"], DEFAULT_PRIORITY),
            module("b", &["a"], DEFAULT_PRIORITY),
            module("free", &[], DEFAULT_PRIORITY),
        ];
        let err = resolve(&modules).expect_err("cycle");
        match err {
            ResolveError::CircularDependency { members } => {
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn duplicate_required_entries_count_once() {
        let modules = vec![
            module("base", &[], DEFAULT_PRIORITY),
            module("twice", &["base", "base"], DEFAULT_PRIORITY),
        ];
        let order = resolve(&modules).expect("resolve");
        assert_eq!(names(&order), vec!["base", "twice"]);
    }

    #[test]
    fn reverse_index_reports_dependents() {
        let modules = vec![
            module("module-b", &[], DEFAULT_PRIORITY),
            module("module-a", &["module-b"], DEFAULT_PRIORITY),
            module("module-c", &["module-b"], DEFAULT_PRIORITY),
        ];
        let index = ReverseDependencyIndex::build(&modules);
        assert_eq!(index.dependents("module-b"), vec!["module-a", "module-c"]);
        assert!(index.dependents("module-a").is_empty());
        assert!(index.dependents("unknown").is_empty());
    }

    #[test]
    #[serial]
    fn cached_resolution_matches_uncached() {
        cache::clear();
        let td = tempdir().expect("tempdir");
        for (name, deps) in [("base", ""), ("web", "\"base\"")] {
            let dir = td.path().join(name);
            fs::create_dir_all(&dir).expect("mkdir");
            fs::write(
                dir.join(manifest::MANIFEST_FILE),
                format!(
                    "[module]\nname = \"{name}\"\nversion = \"1.0.0\"\n\n\
                     [dependencies]\nrequired = [{deps}]\n"
                ),
            )
            .expect("write manifest");
        }
        let modules = vec![
            manifest::parse_module(&td.path().join("web")).expect("web"),
            manifest::parse_module(&td.path().join("base")).expect("base"),
        ];

        let direct = resolve(&modules).expect("direct");
        let first = resolve_cached(&modules).expect("cold");
        let second = resolve_cached(&modules).expect("warm");
        assert_eq!(names(&direct), names(&first));
        assert_eq!(names(&first), names(&second));
        assert_eq!(names(&direct), vec!["base", "web"]);
        cache::clear();
    }

    proptest! {
        // Every resolvable set keeps required deps strictly before
        // their dependents, and emits every module exactly once.
        #[test]
        fn resolution_respects_edges(chain_len in 1usize..8, extras in 0usize..5) {
            let mut modules = Vec::new();
            for i in 0..chain_len {
                let required: Vec<String> = if i == 0 {
                    Vec::new()
                } else {
                    vec![format!("chain-{}", i - 1)]
                };
                let required: Vec<&str> = required.iter().map(String::as_str).collect();
                modules.push(module(&format!("chain-{i}"), &required, (i % 3) as i64 * 50));
            }
            for i in 0..extras {
                modules.push(module(&format!("extra-{i}"), &[], 100 - i as i64));
            }

            let order = resolve(&modules).expect("resolvable");
            prop_assert_eq!(order.len(), modules.len());
            let position: BTreeMap<&str, usize> = order
                .iter()
                .enumerate()
                .map(|(pos, m)| (m.name.as_str(), pos))
                .collect();
            for m in &modules {
                for dep in &m.required {
                    prop_assert!(position[dep.as_str()] < position[m.name.as_str()]);
                }
            }
        }
    }
}
