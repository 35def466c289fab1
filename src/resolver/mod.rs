//! Topological ordering of services with deterministic tie-breaking.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::EcosystemSpec;
use crate::error::{EngineError, Result};

/// Produces a start order for an ecosystem's services, and the list of
/// external (out-of-ecosystem) dependency names a service declares.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Compute a deterministic, dependency-respecting start order.
    ///
    /// Internal `depends_on` entries (no explicit `endpoint`) impose an
    /// ordering edge; external references are validated but impose none.
    /// Ties among services with equal remaining in-degree are broken
    /// alphabetically by name so repeated runs trace identically.
    pub fn resolve(spec: &EcosystemSpec) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = spec
            .services
            .keys()
            .map(|name| (name.as_str(), 0usize))
            .collect();

        // edges[dep] = set of services that depend on dep
        let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (name, svc) in &spec.services {
            for dep in &svc.depends_on {
                if dep.is_external() {
                    continue;
                }
                if !spec.services.contains_key(&dep.name) {
                    return Err(EngineError::UnknownDependency(
                        name.clone(),
                        dep.name.clone(),
                    ));
                }
                edges.entry(dep.name.as_str()).or_default().insert(name.as_str());
                *in_degree.get_mut(name.as_str()).unwrap() += 1;
            }
        }

        let mut order = Vec::with_capacity(spec.services.len());
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();

        while let Some(&next) = ready.iter().next() {
            ready.remove(next);
            order.push(next.to_string());

            if let Some(dependents) = edges.get(next) {
                for &dependent in dependents {
                    let deg = in_degree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != spec.services.len() {
            let remaining: Vec<String> = in_degree
                .iter()
                .filter(|(name, &deg)| deg > 0 && !order.contains(&name.to_string()))
                .map(|(&name, _)| name.to_string())
                .collect();
            return Err(EngineError::CycleDetected { names: remaining });
        }

        Ok(order)
    }
}
