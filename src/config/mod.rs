//! Configuration structures and loading.
//!
//! Mirrors the shape of the YAML ecosystem file (§6): a top-level spec
//! with a `services` map, each entry pointing at a Markdown artifact on
//! disk plus its runtime knobs.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

fn default_base_port() -> u16 {
    8000
}

fn default_health_check() -> String {
    "/health".into()
}

fn default_timeout() -> u64 {
    60
}

/// The parsed and validated contents of an ecosystem YAML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EcosystemSpec {
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_base_port")]
    pub base_port: u16,

    pub sandbox_root: PathBuf,

    #[serde(default)]
    pub registry: Option<RegistryConfig>,

    pub services: HashMap<String, ServiceSpec>,
}

/// Optional override of the port allocator's scan range, settable from the
/// YAML document's `registry` block as well as the `PACTOWN_PORT_RANGE`
/// environment variable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default)]
    pub port_range: Option<(u16, u16)>,
}

/// One service entry as declared in the YAML document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Path to the Markdown artifact describing this service, resolved
    /// relative to the ecosystem file's directory.
    pub readme: PathBuf,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_health_check")]
    pub health_check: String,

    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
}

/// A single dependency edge declared by a service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyRef {
    pub name: String,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub env_var: Option<String>,
}

impl DependencyRef {
    /// The environment variable under which this dependency's endpoint
    /// must be exposed, defaulting to `{UPPER(name)}_URL`.
    pub fn env_var_name(&self) -> String {
        self.env_var
            .clone()
            .unwrap_or_else(|| format!("{}_URL", self.name.to_uppercase()))
    }

    /// Whether this reference points outside the ecosystem (no ordering
    /// constraint is placed on an external dependency).
    pub fn is_external(&self) -> bool {
        self.endpoint.is_some()
    }
}

impl EcosystemSpec {
    /// Load and validate an ecosystem YAML file from `path`.
    ///
    /// Applies `PACTOWN_SANDBOX_ROOT` and `PACTOWN_PORT_RANGE` overrides
    /// after parsing, then resolves `sandbox_root` against the config
    /// file's parent directory if it is relative.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigError(format!("failed to read '{}': {}", path.display(), e))
        })?;

        let mut spec: EcosystemSpec = serde_yaml::from_str(&content)
            .map_err(|e| EngineError::ConfigError(format!("invalid YAML: {}", e)))?;

        spec.validate_shape()?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        spec.resolve_paths(&base_dir);
        spec.apply_env_overrides();

        std::fs::create_dir_all(&spec.sandbox_root).map_err(EngineError::Io)?;

        Ok(spec)
    }

    fn validate_shape(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::ConfigError("'name' is required".into()));
        }
        if self.services.is_empty() {
            return Err(EngineError::ConfigError(
                "'services' must declare at least one service".into(),
            ));
        }
        for (svc_name, svc) in &self.services {
            for dep in &svc.depends_on {
                if dep.name == *svc_name {
                    return Err(EngineError::ConfigError(format!(
                        "service '{}' cannot depend on itself",
                        svc_name
                    )));
                }
                if !dep.is_external() && !self.services.contains_key(&dep.name) {
                    return Err(EngineError::ConfigError(format!(
                        "service '{}' depends on unknown service '{}'",
                        svc_name, dep.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        self.sandbox_root = resolve_path(&self.sandbox_root, base_dir);
        for svc in self.services.values_mut() {
            svc.readme = resolve_path(&svc.readme, base_dir);
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = env::var("PACTOWN_SANDBOX_ROOT") {
            self.sandbox_root = PathBuf::from(root);
        }
    }

    /// Port scan range after applying `registry.port_range` and the
    /// `PACTOWN_PORT_RANGE` environment override, in that precedence order.
    pub fn port_range(&self) -> (u16, u16) {
        let mut range = self
            .registry
            .as_ref()
            .and_then(|r| r.port_range)
            .unwrap_or((10000, 65000));

        if let Ok(raw) = env::var("PACTOWN_PORT_RANGE") {
            if let Some((low, high)) = raw.split_once('-') {
                if let (Ok(low), Ok(high)) = (low.trim().parse(), high.trim().parse()) {
                    range = (low, high);
                }
            }
        }

        range
    }
}

fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        normalize_path(&base_dir.join(path))
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}
