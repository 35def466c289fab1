//! Writes an artifact's declared files into a sandbox directory and links
//! in its cached dependency environment.

use std::path::Path;

use crate::artifact::Artifact;
use crate::cache::{CachedEnv, DependencyCache};
use crate::error::{EngineError, Result};
use crate::filesystem::SafePath;

/// The conventional relative path at which a sandbox's linked dependency
/// environment is mounted.
pub const CACHED_ENV_LINK: &str = ".env";

/// Write every file declared by `artifact` under `sandbox_path`, rejecting
/// any path that would escape the sandbox root, then link in a cached
/// environment for the artifact's declared deps.
pub fn materialize(
    sandbox_path: &Path,
    artifact: &Artifact,
    cache: &DependencyCache,
) -> Result<std::sync::Arc<CachedEnv>> {
    std::fs::create_dir_all(sandbox_path).map_err(EngineError::Io)?;

    for file in &artifact.files {
        if is_traversal_attempt(&file.path) {
            return Err(EngineError::Internal(format!(
                "artifact file path '{}' escapes the sandbox root",
                file.path
            )));
        }

        let safe = SafePath::new(sandbox_path, &file.path).map_err(|_| {
            EngineError::Internal(format!(
                "artifact file path '{}' escapes the sandbox root",
                file.path
            ))
        })?;

        if let Some(parent) = safe.resolved().parent() {
            std::fs::create_dir_all(parent).map_err(EngineError::Io)?;
        }
        std::fs::write(safe.resolved(), &file.bytes).map_err(EngineError::Io)?;
    }

    let env_entry = cache.get_or_create(&artifact.deps)?;
    let link_path = sandbox_path.join(CACHED_ENV_LINK);
    if !link_path.exists() {
        cache.link_into(&env_entry, &link_path)?;
    }

    Ok(env_entry)
}

/// Unlike [`SafePath`]'s clamping `clean_path`, declared artifact file
/// paths must be rejected outright on any `..` component or absolute
/// path — silently clamping here would let a malicious artifact overwrite
/// a file it did not intend to name.
fn is_traversal_attempt(path: &str) -> bool {
    let p = Path::new(path);
    p.is_absolute()
        || p.components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_declared_files_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox_root = dir.path().join("sandbox_root");
        let sandbox_path = sandbox_root.join("svc");
        let cache = DependencyCache::new(&sandbox_root);

        let artifact = Artifact::new("svc", "sh -c 'true'")
            .with_file("app/main.sh", "#!/bin/sh\necho hi\n")
            .with_deps(vec!["x".to_string()]);

        materialize(&sandbox_path, &artifact, &cache).unwrap();

        let content = std::fs::read(sandbox_path.join("app/main.sh")).unwrap();
        assert_eq!(content, b"#!/bin/sh\necho hi\n");
        assert!(sandbox_path.join(CACHED_ENV_LINK).exists());
    }

    #[test]
    fn rejects_path_traversal_in_declared_files() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox_root = dir.path().join("sandbox_root");
        let sandbox_path = sandbox_root.join("svc");
        let cache = DependencyCache::new(&sandbox_root);

        let artifact = Artifact::new("svc", "sh -c 'true'").with_file("../escape.txt", "evil");

        let result = materialize(&sandbox_path, &artifact, &cache);
        assert!(result.is_err());
    }

    #[test]
    fn two_sandboxes_with_equivalent_deps_share_env() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox_root = dir.path().join("sandbox_root");
        let cache = DependencyCache::new(&sandbox_root);

        let a = Artifact::new("a", "sh -c 'true'").with_deps(vec!["x".into(), "y".into()]);
        let b = Artifact::new("b", "sh -c 'true'").with_deps(vec!["y".into(), "x".into()]);

        let env_a = materialize(&sandbox_root.join("a"), &a, &cache).unwrap();
        let env_b = materialize(&sandbox_root.join("b"), &b, &cache).unwrap();

        assert_eq!(env_a.hash, env_b.hash);
    }
}
