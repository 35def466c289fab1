//! Hash-keyed, reference-counted dependency environments shared across
//! sandboxes that declare the same (order-independent) dependency set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

const DEFAULT_MAX_ENTRIES: usize = 20;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// A prepared, shareable runtime environment keyed by the hash of its
/// sorted dependency list.
pub struct CachedEnv {
    pub hash: String,
    pub path: PathBuf,
    pub dep_list: Vec<String>,
    pub created_at: u64,
    ref_count: AtomicI64,
}

impl CachedEnv {
    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }
}

/// Disk-backed, in-memory-indexed cache of dependency environments.
pub struct DependencyCache {
    root: PathBuf,
    entries: DashMap<String, std::sync::Arc<CachedEnv>>,
    max_entries: usize,
    max_age: Duration,
}

impl DependencyCache {
    pub fn new(sandbox_root: impl AsRef<Path>) -> Self {
        Self {
            root: sandbox_root.as_ref().join(".cache").join("envs"),
            entries: DashMap::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    /// The SHA-256 hex digest of the sorted, newline-joined dep list.
    pub fn key(deps: &[String]) -> String {
        let mut sorted = deps.to_vec();
        sorted.sort();
        let joined = sorted.join("\n");
        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Return the existing entry for `deps`, bumping its ref count, or
    /// prepare and register a fresh one on disk.
    pub fn get_or_create(&self, deps: &[String]) -> Result<std::sync::Arc<CachedEnv>> {
        let hash = Self::key(deps);
        let short_hash = &hash[..16.min(hash.len())];

        if let Some(existing) = self.entries.get(&hash) {
            existing.ref_count.fetch_add(1, Ordering::SeqCst);
            debug!(hash = %short_hash, "dependency cache hit");
            return Ok(existing.clone());
        }

        std::fs::create_dir_all(&self.root).map_err(EngineError::Io)?;
        let env_path = self.root.join(short_hash);
        std::fs::create_dir_all(&env_path).map_err(EngineError::Io)?;

        let mut sorted = deps.to_vec();
        sorted.sort();
        let marker = env_path.join("deps.txt");
        std::fs::write(&marker, sorted.join("\n")).map_err(EngineError::Io)?;

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let entry = std::sync::Arc::new(CachedEnv {
            hash: hash.clone(),
            path: env_path,
            dep_list: sorted,
            created_at,
            ref_count: AtomicI64::new(1),
        });

        self.entries.insert(hash.clone(), entry.clone());
        info!(hash = %short_hash, "created dependency cache entry");
        self.evict_if_needed();
        Ok(entry)
    }

    /// Release a sandbox's link to a cached env, decrementing its ref
    /// count. Never goes negative.
    pub fn release(&self, hash: &str) {
        if let Some(entry) = self.entries.get(hash) {
            let prev = entry.ref_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some((v - 1).max(0))
            });
            debug!(hash = %hash, prev = ?prev, "released dependency cache reference");
        }
    }

    /// LRU-by-creation-time eviction of unreferenced entries once the
    /// cache exceeds `max_entries` or an entry exceeds `max_age`. Never
    /// removes an entry with a positive ref count.
    pub fn evict_if_needed(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut aged: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| {
                e.ref_count() == 0
                    && now.saturating_sub(e.created_at) > self.max_age.as_secs()
            })
            .map(|e| (e.key().clone(), e.created_at))
            .collect();
        aged.sort_by_key(|(_, created)| *created);
        for (hash, _) in aged {
            self.remove_entry(&hash);
        }

        while self.entries.len() > self.max_entries {
            let oldest_unused = self
                .entries
                .iter()
                .filter(|e| e.ref_count() == 0)
                .min_by_key(|e| e.created_at)
                .map(|e| e.key().clone());

            match oldest_unused {
                Some(hash) => self.remove_entry(&hash),
                None => {
                    warn!("dependency cache over capacity but every entry is in use");
                    break;
                }
            }
        }
    }

    fn remove_entry(&self, hash: &str) {
        if let Some((_, entry)) = self.entries.remove(hash) {
            let _ = std::fs::remove_dir_all(&entry.path);
            info!(hash = %hash, "evicted dependency cache entry");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Link a cached env into a sandbox directory at `link_path`, trying
    /// a symlink first and falling back to a recursive copy.
    pub fn link_into(&self, entry: &CachedEnv, link_path: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            if std::os::unix::fs::symlink(&entry.path, link_path).is_ok() {
                return Ok(());
            }
        }
        copy_dir_recursive(&entry.path, link_path).map_err(EngineError::Io)
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dst_path)?;
        } else {
            std::fs::copy(entry.path(), dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_order_independent() {
        let a = DependencyCache::key(&["x".to_string(), "y".to_string()]);
        let b = DependencyCache::key(&["y".to_string(), "x".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn get_or_create_shares_entry_for_equivalent_deps() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DependencyCache::new(dir.path());

        let a = cache.get_or_create(&["x".to_string(), "y".to_string()]).unwrap();
        let b = cache.get_or_create(&["y".to_string(), "x".to_string()]).unwrap();

        assert_eq!(a.hash, b.hash);
        assert_eq!(a.path, b.path);
        assert_eq!(a.ref_count(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn ref_count_never_goes_negative() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DependencyCache::new(dir.path());
        let entry = cache.get_or_create(&["x".to_string()]).unwrap();
        cache.release(&entry.hash);
        cache.release(&entry.hash);
        let reacquired = cache.get_or_create(&["x".to_string()]).unwrap();
        assert!(reacquired.ref_count() >= 0);
    }

    #[test]
    fn eviction_never_removes_in_use_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DependencyCache::new(dir.path());
        let kept = cache.get_or_create(&["a".to_string()]).unwrap();
        for i in 0..DEFAULT_MAX_ENTRIES + 5 {
            let e = cache.get_or_create(&[format!("z{i}")]).unwrap();
            cache.release(&e.hash);
        }
        assert!(cache.entries.contains_key(&kept.hash));
    }
}
