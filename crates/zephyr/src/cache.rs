//! Process-wide bounded LRU caches.
//!
//! Two caches: parsed manifests keyed on `(module dir, manifest mtime)`
//! and resolution results keyed on the sorted member fingerprint. Both
//! sit behind a single mutex each; callers serialise. `clear` is the
//! explicit teardown and is idempotent.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use lru::LruCache;

use crate::manifest;
use crate::types::Module;

const MANIFEST_CACHE_CAPACITY: usize = 128;
const RESOLUTION_CACHE_CAPACITY: usize = 16;

type ManifestKey = (PathBuf, SystemTime);

fn manifest_cache() -> &'static Mutex<LruCache<ManifestKey, Module>> {
    static CACHE: OnceLock<Mutex<LruCache<ManifestKey, Module>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(
            NonZeroUsize::new(MANIFEST_CACHE_CAPACITY).expect("nonzero capacity"),
        ))
    })
}

fn resolution_cache() -> &'static Mutex<LruCache<String, Vec<String>>> {
    static CACHE: OnceLock<Mutex<LruCache<String, Vec<String>>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(
            NonZeroUsize::new(RESOLUTION_CACHE_CAPACITY).expect("nonzero capacity"),
        ))
    })
}

/// Parse a module manifest through the cache. The key carries the
/// manifest mtime, so an edited file misses and re-parses.
pub fn parse_module_cached(module_dir: &Path) -> Result<Module> {
    let manifest_path = module_dir.join(manifest::MANIFEST_FILE);
    let mtime = fs::metadata(&manifest_path)
        .and_then(|m| m.modified())
        .with_context(|| format!("failed to stat {}", manifest_path.display()))?;
    let key = (module_dir.to_path_buf(), mtime);

    {
        let mut cache = manifest_cache().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(module) = cache.get(&key) {
            return Ok(module.clone());
        }
    }

    let module = manifest::parse_module(module_dir)?;
    let mut cache = manifest_cache().lock().unwrap_or_else(|e| e.into_inner());
    cache.put(key, module.clone());
    Ok(module)
}

/// Fingerprint of a module set for the resolution cache: sorted
/// `(name, version, path, mtime)` tuples. `None` when any member's
/// manifest cannot be stated (callers then resolve uncached).
pub fn resolution_key(modules: &[Module]) -> Option<String> {
    let mut parts: Vec<String> = Vec::with_capacity(modules.len());
    for module in modules {
        let manifest_path = module.path.join(manifest::MANIFEST_FILE);
        let mtime = fs::metadata(&manifest_path).and_then(|m| m.modified()).ok()?;
        let nanos = mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        parts.push(format!(
            "{}@{}@{}@{}",
            module.name,
            module.version,
            module.path.display(),
            nanos
        ));
    }
    parts.sort();
    Some(parts.join("\n"))
}

pub fn get_resolution(key: &str) -> Option<Vec<String>> {
    let mut cache = resolution_cache().lock().unwrap_or_else(|e| e.into_inner());
    cache.get(key).cloned()
}

pub fn put_resolution(key: String, order: Vec<String>) {
    let mut cache = resolution_cache().lock().unwrap_or_else(|e| e.into_inner());
    cache.put(key, order);
}

/// Drop every cached entry. Idempotent.
pub fn clear() {
    manifest_cache()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
    resolution_cache()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}
