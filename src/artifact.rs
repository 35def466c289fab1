//! The core's seam onto the Markdown world.
//!
//! The core never parses Markdown. It consumes artifacts through the
//! [`ArtifactSource`] trait, which a collaborator implements against
//! whatever front-matter/Markdown extractor it prefers. A minimal
//! reference implementation is provided for tests and local examples.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{EngineError, Result};

/// One file this service's sandbox must materialize.
#[derive(Debug, Clone)]
pub struct ArtifactFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// An HTTP smoke test declared by the artifact, run by external tooling
/// (the core itself does not execute these; see §6).
#[derive(Debug, Clone)]
pub struct ArtifactTest {
    pub method: String,
    pub path: String,
    pub body: Option<String>,
    pub expect_status: u16,
}

/// The parsed form of one service's Markdown document.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub title: String,
    pub files: Vec<ArtifactFile>,
    pub deps: Vec<String>,
    pub run: String,
    pub tests: Vec<ArtifactTest>,
}

/// Given a path to a Markdown artifact, produce its parsed form.
///
/// Implementations are free to parse prose Markdown, a front-matter
/// block, or any other representation; the core only depends on this
/// trait, never on a Markdown parsing crate.
pub trait ArtifactSource: Send + Sync {
    fn load(&self, readme: &Path) -> Result<Artifact>;
}

/// A reference [`ArtifactSource`] that accepts a small explicit
/// representation instead of parsing prose Markdown: a JSON document
/// with the same shape as [`Artifact`], suitable for tests and local
/// examples. Production deployments plug in a real Markdown extractor.
pub struct InMemoryArtifactSource;

#[derive(serde::Deserialize)]
struct RawArtifact {
    title: String,
    #[serde(default)]
    files: HashMap<String, String>,
    #[serde(default)]
    deps: Vec<String>,
    run: String,
    #[serde(default)]
    tests: Vec<RawTest>,
}

#[derive(serde::Deserialize)]
struct RawTest {
    method: String,
    path: String,
    #[serde(default)]
    body: Option<String>,
    expect_status: u16,
}

impl ArtifactSource for InMemoryArtifactSource {
    fn load(&self, readme: &Path) -> Result<Artifact> {
        let content = std::fs::read_to_string(readme).map_err(EngineError::Io)?;
        let raw: RawArtifact = serde_json::from_str(&content).map_err(|e| {
            EngineError::ConfigError(format!(
                "failed to parse artifact '{}': {}",
                readme.display(),
                e
            ))
        })?;

        Ok(Artifact {
            title: raw.title,
            files: raw
                .files
                .into_iter()
                .map(|(path, content)| ArtifactFile {
                    path,
                    bytes: content.into_bytes(),
                })
                .collect(),
            deps: raw.deps,
            run: raw.run,
            tests: raw
                .tests
                .into_iter()
                .map(|t| ArtifactTest {
                    method: t.method,
                    path: t.path,
                    body: t.body,
                    expect_status: t.expect_status,
                })
                .collect(),
        })
    }
}

/// Convenience constructor for tests that build an artifact in memory
/// without going through a file at all.
impl Artifact {
    pub fn new(title: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            files: Vec::new(),
            deps: Vec::new(),
            run: run.into(),
            tests: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.push(ArtifactFile {
            path: path.into(),
            bytes: bytes.into(),
        });
        self
    }

    pub fn with_deps(mut self, deps: Vec<String>) -> Self {
        self.deps = deps;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_reference_artifact_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let readme = dir.path().join("svc.md");
        std::fs::write(
            &readme,
            r#"{"title":"db","deps":["y","x"],"run":"sh -c 'echo hi'","files":{"a.txt":"hello"}}"#,
        )
        .unwrap();

        let artifact = InMemoryArtifactSource.load(&readme).unwrap();
        assert_eq!(artifact.title, "db");
        assert_eq!(artifact.deps, vec!["y".to_string(), "x".to_string()]);
        assert_eq!(artifact.files.len(), 1);
    }
}
