//! In-memory plus on-disk map from service name to its live endpoint.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::DependencyRef;
use crate::error::{EngineError, Result};

/// A live service's reachable address, as recorded in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub health_check: String,
}

impl ServiceEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    services: HashMap<String, ServiceEndpoint>,
}

/// Capability interface exposed to the sandbox manager: registration only,
/// never a callback into the manager itself.
pub trait RegistryHandle: Send + Sync {
    fn register(&self, endpoint: ServiceEndpoint) -> Result<()>;
    fn unregister(&self, name: &str) -> Result<()>;
    fn get(&self, name: &str) -> Option<ServiceEndpoint>;
}

/// The service registry: a concurrent map mirrored atomically to disk.
pub struct ServiceRegistry {
    path: PathBuf,
    services: DashMap<String, ServiceEndpoint>,
}

impl ServiceRegistry {
    pub fn new(sandbox_root: impl AsRef<Path>) -> Self {
        Self {
            path: sandbox_root.as_ref().join(".pactown-services.json"),
            services: DashMap::new(),
        }
    }

    /// Load a previously persisted registry, reconciling against the set
    /// of names reported alive by the caller; dead entries are dropped.
    pub fn load(sandbox_root: impl AsRef<Path>, alive: &[String]) -> Result<Self> {
        let registry = Self::new(sandbox_root);
        if !registry.path.exists() {
            return Ok(registry);
        }

        let content = std::fs::read_to_string(&registry.path)?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&content)?;

        for (name, endpoint) in snapshot.services {
            if alive.contains(&name) {
                registry.services.insert(name, endpoint);
            }
        }

        registry.persist()?;
        Ok(registry)
    }

    pub fn register(&self, name: &str, port: u16, health_check: &str) -> Result<ServiceEndpoint> {
        let endpoint = ServiceEndpoint {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            health_check: health_check.to_string(),
        };
        self.services.insert(name.to_string(), endpoint.clone());
        self.persist()?;
        Ok(endpoint)
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.services.remove(name);
        self.persist()
    }

    pub fn get(&self, name: &str) -> Option<ServiceEndpoint> {
        self.services.get(name).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<ServiceEndpoint> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    /// Compose the environment injected into a service's process: one
    /// `{NAME}_URL`/`{NAME}_HOST`/`{NAME}_PORT` triple per dependency, plus
    /// the caller's own identity variables.
    pub fn environment_for(
        &self,
        service_name: &str,
        own_port: u16,
        deps: &[DependencyRef],
    ) -> HashMap<String, String> {
        let mut env = HashMap::new();

        for dep in deps {
            let upper = dep.name.to_uppercase();
            if let Some(explicit) = &dep.endpoint {
                env.insert(dep.env_var_name(), explicit.clone());
                if let Ok(url) = url::Url::parse(explicit) {
                    if let Some(host) = url.host_str() {
                        env.insert(format!("{upper}_HOST"), host.to_string());
                    }
                    if let Some(port) = url.port() {
                        env.insert(format!("{upper}_PORT"), port.to_string());
                    }
                }
                continue;
            }

            if let Some(endpoint) = self.get(&dep.name) {
                env.insert(dep.env_var_name(), endpoint.url());
                env.insert(format!("{upper}_HOST"), endpoint.host.clone());
                env.insert(format!("{upper}_PORT"), endpoint.port.to_string());
            }
        }

        env.insert("MARKPACT_PORT".to_string(), own_port.to_string());
        env.insert("PORT".to_string(), own_port.to_string());
        env.insert("SERVICE_NAME".to_string(), service_name.to_string());
        env.insert(
            "SERVICE_URL".to_string(),
            format!("http://127.0.0.1:{own_port}"),
        );

        env
    }

    /// Atomically persist the registry to `<sandbox_root>/.pactown-services.json`.
    pub fn persist(&self) -> Result<()> {
        let snapshot = RegistrySnapshot {
            services: self
                .services
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp_path).map_err(EngineError::Io)?;
            file.write_all(json.as_bytes()).map_err(EngineError::Io)?;
            file.sync_all().ok();
        }
        std::fs::rename(&tmp_path, &self.path).map_err(EngineError::Io)?;
        Ok(())
    }
}

impl RegistryHandle for ServiceRegistry {
    fn register(&self, endpoint: ServiceEndpoint) -> Result<()> {
        self.services.insert(endpoint.name.clone(), endpoint);
        self.persist()
    }

    fn unregister(&self, name: &str) -> Result<()> {
        ServiceRegistry::unregister(self, name)
    }

    fn get(&self, name: &str) -> Option<ServiceEndpoint> {
        ServiceRegistry::get(self, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::new(dir.path());
        registry.register("db", 8003, "/health").unwrap();
        let endpoint = registry.get("db").unwrap();
        assert_eq!(endpoint.port, 8003);
        assert_eq!(endpoint.url(), "http://127.0.0.1:8003");
    }

    #[test]
    fn unregister_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::new(dir.path());
        registry.register("db", 8003, "/health").unwrap();
        registry.unregister("db").unwrap();
        assert!(registry.get("db").is_none());
    }

    #[test]
    fn persist_then_load_reconciles_dead_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = ServiceRegistry::new(dir.path());
            registry.register("db", 8003, "/health").unwrap();
            registry.register("api", 8004, "/health").unwrap();
        }

        let reloaded = ServiceRegistry::load(dir.path(), &["db".to_string()]).unwrap();
        assert!(reloaded.get("db").is_some());
        assert!(reloaded.get("api").is_none());
    }

    #[test]
    fn environment_for_composes_dependency_vars() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::new(dir.path());
        registry.register("db", 8003, "/health").unwrap();

        let deps = vec![DependencyRef {
            name: "db".into(),
            endpoint: None,
            env_var: Some("DATABASE_URL".into()),
        }];
        let env = registry.environment_for("api", 9000, &deps);
        assert_eq!(env.get("DATABASE_URL").unwrap(), "http://127.0.0.1:8003");
        assert_eq!(env.get("DB_HOST").unwrap(), "127.0.0.1");
        assert_eq!(env.get("DB_PORT").unwrap(), "8003");
        assert_eq!(env.get("MARKPACT_PORT").unwrap(), "9000");
        assert_eq!(env.get("SERVICE_NAME").unwrap(), "api");
    }

    #[test]
    fn explicit_endpoint_override_replaces_url_only() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::new(dir.path());
        let deps = vec![DependencyRef {
            name: "ext".into(),
            endpoint: Some("http://example.com:1234".into()),
            env_var: None,
        }];
        let env = registry.environment_for("api", 9000, &deps);
        assert_eq!(env.get("EXT_URL").unwrap(), "http://example.com:1234");
        assert_eq!(env.get("EXT_HOST").unwrap(), "example.com");
        assert_eq!(env.get("EXT_PORT").unwrap(), "1234");
    }
}
