//! Top-level coordinator: wires the resolver, security policy, port
//! allocator, dependency cache, sandbox manager, and service registry
//! into the `Engine` value this whole crate is built around (§9: no
//! component reads a process-global, everything is threaded explicitly).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifact::ArtifactSource;
use crate::cache::DependencyCache;
use crate::config::EcosystemSpec;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, LifecycleState};
use crate::port::PortAllocator;
use crate::registry::ServiceRegistry;
use crate::resolver::DependencyResolver;
use crate::sandbox::manager::{SandboxManager, StartSpec};
use crate::security::{AnomalyLog, SecurityPolicy};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Every owned component, threaded explicitly instead of living behind a
/// process-global singleton.
pub struct Engine {
    pub spec: EcosystemSpec,
    pub port_allocator: Arc<PortAllocator>,
    pub cache: Arc<DependencyCache>,
    pub registry: Arc<ServiceRegistry>,
    pub anomaly_log: Arc<AnomalyLog>,
    pub policy: Arc<SecurityPolicy>,
    pub manager: Arc<SandboxManager>,
}

impl Engine {
    pub fn new(spec: EcosystemSpec, artifact_source: Arc<dyn ArtifactSource>) -> Result<Self> {
        let port_allocator = Arc::new(PortAllocator::new(spec.port_range()));
        let cache = Arc::new(DependencyCache::new(&spec.sandbox_root));
        // A fresh process has no way to know which, if any, previously
        // persisted endpoints still have a live process behind them,
        // so reconciliation on a cold start drops the prior snapshot
        // entirely rather than asserting liveness it cannot verify.
        let registry = Arc::new(ServiceRegistry::load(&spec.sandbox_root, &[])?);
        let anomaly_log = Arc::new(AnomalyLog::new(&spec.sandbox_root));
        let policy = Arc::new(SecurityPolicy::new(anomaly_log.clone()));
        let event_bus = EventBus::new();
        let manager = Arc::new(SandboxManager::new(
            spec.sandbox_root.clone(),
            port_allocator.clone(),
            cache.clone(),
            registry.clone(),
            anomaly_log.clone(),
            event_bus,
            artifact_source,
        ));

        Ok(Self {
            spec,
            port_allocator,
            cache,
            registry,
            anomaly_log,
            policy,
            manager,
        })
    }
}

/// A point-in-time view of one service, returned by [`Orchestrator::status`].
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    pub state: LifecycleState,
    pub port: Option<u16>,
    pub uptime: Option<Duration>,
}

/// Drives startup, steady-state supervision, and shutdown of one
/// ecosystem. See SPEC_FULL.md §4.6.
pub struct Orchestrator {
    engine: Engine,
}

impl Orchestrator {
    pub fn new(spec: EcosystemSpec, artifact_source: Arc<dyn ArtifactSource>) -> Result<Self> {
        Ok(Self {
            engine: Engine::new(spec, artifact_source)?,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Resolve the start order, then materialize and start every service
    /// in turn. `requesting_user`, when set, gates each start behind the
    /// security policy (§4.7); when `None`, admission is skipped
    /// entirely — the policy is optional ambient infrastructure, not a
    /// mandatory gate for single-tenant local use. On any failure the
    /// orchestrator tears down, in reverse order, everything it started
    /// during this call before returning the triggering error.
    pub async fn up(&self, requesting_user: Option<&str>) -> Result<Vec<String>> {
        let engine = &self.engine;
        let order = DependencyResolver::resolve(&engine.spec)?;
        let mut started: Vec<String> = Vec::new();

        for name in &order {
            let service = engine
                .spec
                .services
                .get(name)
                .expect("resolver only returns declared service names");

            if let Some(user) = requesting_user {
                let guess_port = service.port.unwrap_or(0);
                let decision = engine.policy.check_can_start(
                    user,
                    name,
                    guess_port,
                    engine.manager.running_count(),
                );
                if !decision.allowed {
                    let reason = decision.reason.unwrap_or_else(|| "denied".to_string());
                    warn!(service = %name, user, %reason, "policy denied service start");
                    self.teardown_started(&started).await;
                    return Err(EngineError::PolicyDenied {
                        user_id: user.to_string(),
                        service_id: name.clone(),
                        reason,
                    });
                }
                if decision.delay_seconds > 0.0 {
                    info!(service = %name, delay = decision.delay_seconds, "throttled by server load, delaying start");
                    tokio::time::sleep(Duration::from_secs_f64(decision.delay_seconds)).await;
                }
            }

            if let Err(e) = engine.manager.create(name, &service.readme) {
                error!(service = %name, error = %e, "failed to materialize sandbox");
                self.teardown_started(&started).await;
                return Err(e);
            }

            let start_spec = StartSpec {
                preferred_port: service.port,
                health_check: service.health_check.clone(),
                timeout: Duration::from_secs(service.timeout),
                extra_env: service.env.clone(),
                depends_on: service.depends_on.clone(),
            };

            match engine.manager.start(name, start_spec).await {
                Ok(()) => {
                    info!(service = %name, "service is healthy");
                    started.push(name.clone());
                }
                Err(e) => {
                    error!(service = %name, error = %e, "service failed to become healthy");
                    self.teardown_started(&started).await;
                    return Err(e);
                }
            }
        }

        Ok(started)
    }

    /// Stop services in reverse of the resolver's order, best-effort:
    /// every stop is attempted even if an earlier one failed.
    pub async fn down(&self) -> Result<()> {
        let order = DependencyResolver::resolve(&self.engine.spec)?;
        let reversed: Vec<String> = order.into_iter().rev().collect();
        let mut errors = Vec::new();

        for name in &reversed {
            if let Err(e) = self.engine.manager.stop(name).await {
                warn!(service = %name, error = %e, "error stopping service during teardown");
                errors.push(format!("{name}: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Internal(format!(
                "down completed with errors: {}",
                errors.join("; ")
            )))
        }
    }

    async fn teardown_started(&self, started: &[String]) {
        for name in started.iter().rev() {
            if let Err(e) = self.engine.manager.stop(name).await {
                warn!(service = %name, error = %e, "error during abort teardown");
            }
        }
    }

    /// A point-in-time snapshot of every service this orchestrator knows
    /// about, in the ecosystem's declared order.
    pub fn status(&self) -> Vec<ServiceStatus> {
        let mut names: Vec<&String> = self.engine.spec.services.keys().collect();
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let sandbox = self.engine.manager.sandbox(name);
                ServiceStatus {
                    name: name.clone(),
                    state: sandbox
                        .as_ref()
                        .map(|s| s.state())
                        .unwrap_or(LifecycleState::Dead),
                    port: sandbox.as_ref().and_then(|s| *s.port.read()),
                    uptime: sandbox.as_ref().and_then(|s| s.uptime()),
                }
            })
            .collect()
    }

    /// Spawn the background task that sweeps the dependency cache for
    /// unreferenced, aged-out entries on a fixed interval (§4.4),
    /// independent of the lazy eviction performed on every cache miss.
    pub fn spawn_cache_sweep(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.engine.cache.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        cache.evict_if_needed();
                    }
                }
            }
        })
    }

    /// Block until `cancel` fires, then run `down`. This is the
    /// "steady-state" half of §4.6: after `up` succeeds the orchestrator
    /// stays alive handling asynchronous supervisor events (handled by
    /// the manager's own background tasks) until a single shutdown
    /// signal arrives.
    pub async fn run_until_cancelled(&self, cancel: CancellationToken) -> Result<()> {
        cancel.cancelled().await;
        info!("shutdown signal received, tearing down ecosystem");
        self.down().await
    }
}
