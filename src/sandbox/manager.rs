//! Creates, starts, health-probes, stops, and tears down sandboxes; owns
//! their runtime lifetime end to end.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::artifact::ArtifactSource;
use crate::cache::DependencyCache;
use crate::config::DependencyRef;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, LifecycleState};
use crate::port::PortAllocator;
use crate::registry::ServiceRegistry;
use crate::sandbox::crash::RapidRestartTracker;
use crate::sandbox::health::{self, ProbeOutcome};
use crate::sandbox::process::{rewrite_port, ProcessHandle, ProcessSupervisor};
use crate::sandbox::sandbox::Sandbox;
use crate::security::{AnomalyEvent, AnomalyLog, AnomalyType, Severity};
use crate::system::SinkPool;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const MIN_UPTIME_FOR_CLEAN_EXIT: Duration = Duration::from_secs(10);

/// Per-service knobs needed to start a sandbox, independent of the YAML
/// config representation so tests can build these directly.
pub struct StartSpec {
    pub preferred_port: Option<u16>,
    pub health_check: String,
    pub timeout: Duration,
    pub extra_env: HashMap<String, String>,
    pub depends_on: Vec<DependencyRef>,
}

/// Owns every sandbox's lifetime: materialization, launch, health gating,
/// supervision, and teardown.
pub struct SandboxManager {
    sandbox_root: PathBuf,
    sandboxes: DashMap<String, Arc<Sandbox>>,
    sinks: DashMap<String, SinkPool>,
    crash_trackers: DashMap<String, Arc<RapidRestartTracker>>,
    port_allocator: Arc<PortAllocator>,
    cache: Arc<DependencyCache>,
    registry: Arc<ServiceRegistry>,
    anomaly_log: Arc<AnomalyLog>,
    event_bus: EventBus,
    artifact_source: Arc<dyn ArtifactSource>,
    http_client: reqwest::Client,
}

impl SandboxManager {
    pub fn new(
        sandbox_root: PathBuf,
        port_allocator: Arc<PortAllocator>,
        cache: Arc<DependencyCache>,
        registry: Arc<ServiceRegistry>,
        anomaly_log: Arc<AnomalyLog>,
        event_bus: EventBus,
        artifact_source: Arc<dyn ArtifactSource>,
    ) -> Self {
        Self {
            sandbox_root,
            sandboxes: DashMap::new(),
            sinks: DashMap::new(),
            crash_trackers: DashMap::new(),
            port_allocator,
            cache,
            registry,
            anomaly_log,
            event_bus,
            artifact_source,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Materialize a service's files and cached environment under its own
    /// sandbox directory. Does not start the process.
    pub fn create(&self, name: &str, readme: &std::path::Path) -> Result<Arc<Sandbox>> {
        let artifact = self.artifact_source.load(readme)?;
        let sandbox_path = self.sandbox_root.join("sandboxes").join(name);
        let sandbox = Arc::new(Sandbox::new(name, sandbox_path.clone(), artifact.run.clone()));

        let env_entry = crate::sandbox::materialize::materialize(&sandbox_path, &artifact, &self.cache)?;
        *sandbox.cached_env.write() = Some(env_entry);
        sandbox.set_state(LifecycleState::Materialized);

        self.sandboxes.insert(name.to_string(), sandbox.clone());
        self.sinks.insert(name.to_string(), SinkPool::new());
        self.crash_trackers
            .insert(name.to_string(), Arc::new(RapidRestartTracker::new()));
        self.event_bus.publish_state(name, LifecycleState::Materialized);

        Ok(sandbox)
    }

    /// Count of this manager's currently-running sandboxes.
    pub fn running_count(&self) -> u32 {
        self.sandboxes
            .iter()
            .filter(|s| s.is_running())
            .count() as u32
    }

    pub fn status(&self, name: &str) -> Option<LifecycleState> {
        self.sandboxes.get(name).map(|s| s.state())
    }

    pub fn sandbox(&self, name: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.get(name).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<String> {
        self.sandboxes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn logs(&self, name: &str, tail: usize) -> Option<Vec<u8>> {
        let sandbox = self.sandboxes.get(name)?;
        let process = sandbox.process.read();
        process.as_ref().map(|p| p.stdout.tail(tail))
    }

    /// Start a materialized sandbox: allocate a port, compose its
    /// environment, launch the process, and gate readiness on its health
    /// probe. On failure the sandbox is torn down before returning.
    pub async fn start(&self, name: &str, start_spec: StartSpec) -> Result<()> {
        let sandbox = self
            .sandboxes
            .get(name)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::Internal(format!("sandbox '{name}' was not created")))?;

        if sandbox.is_running() {
            return Err(EngineError::AlreadyRunning(name.to_string()));
        }

        let _guard = sandbox
            .power_lock
            .acquire()
            .await
            .map_err(|e| EngineError::Internal(format!("power lock: {e}")))?;

        let port = self.port_allocator.allocate(start_spec.preferred_port)?;
        let mut env = self
            .registry
            .environment_for(name, port, &start_spec.depends_on);
        env.extend(start_spec.extra_env.clone());

        let run = rewrite_port(&sandbox.run, port);
        let log_path = sandbox.path.join(format!("{name}.log"));
        let sink = self.sinks.get(name).map(|s| s.clone()).unwrap_or_default();

        sandbox.set_state(LifecycleState::Starting);
        self.event_bus.publish_state(name, LifecycleState::Starting);

        let launch_result =
            ProcessSupervisor::spawn(&run, &sandbox.path, &env, &log_path, sink.clone()).await;

        let handle = match launch_result {
            Ok(h) => Arc::new(h),
            Err(e) => {
                self.port_allocator.release(port);
                if let Some(entry) = sandbox.cached_env.read().clone() {
                    self.cache.release(&entry.hash);
                }
                sandbox.set_state(LifecycleState::Dead);
                return Err(e);
            }
        };
        *sandbox.process.write() = Some(handle.clone());
        *sandbox.port.write() = Some(port);
        *sandbox.env.write() = env;

        let (exit_tx, exit_rx) = tokio::sync::watch::channel(None::<i32>);
        let reap_handle = handle.clone();
        let reaper_name = name.to_string();
        tokio::spawn(async move {
            let status = ProcessSupervisor::wait(&reap_handle).await.unwrap_or(-1);
            info!(service = %reaper_name, status, "process exited");
            let _ = exit_tx.send(Some(status));
        });

        let mut probe_exit_rx = exit_rx.clone();
        let exit_signal = Box::pin(async move {
            loop {
                if let Some(status) = *probe_exit_rx.borrow() {
                    return status;
                }
                if probe_exit_rx.changed().await.is_err() {
                    return -1;
                }
            }
        });

        let outcome = health::probe_until_healthy(
            &self.http_client,
            "127.0.0.1",
            port,
            &start_spec.health_check,
            start_spec.timeout,
            exit_signal,
        )
        .await?;

        match outcome {
            ProbeOutcome::Healthy => {
                sandbox.set_state(LifecycleState::Running);
                *sandbox.running_since.write() = Some(Instant::now());
                self.registry
                    .register(name, port, &start_spec.health_check)?;
                self.event_bus.publish_state(name, LifecycleState::Running);
                self.spawn_supervision(name.to_string(), sandbox.clone(), exit_rx);
                Ok(())
            }
            ProbeOutcome::Timeout => {
                self.teardown_after_failed_start(name, &sandbox, &handle, port)
                    .await;
                Err(health::timeout_error(name, start_spec.timeout.as_secs()))
            }
            ProbeOutcome::ProcessExited(status) => {
                self.port_allocator.release(port);
                if let Some(entry) = sandbox.cached_env.read().clone() {
                    self.cache.release(&entry.hash);
                }
                sandbox.set_state(LifecycleState::Dead);
                self.event_bus.publish(Event::ProcessExited {
                    service: name.to_string(),
                    status,
                });
                Err(health::process_exited_error(name, status))
            }
        }
    }

    async fn teardown_after_failed_start(
        &self,
        name: &str,
        sandbox: &Arc<Sandbox>,
        handle: &Arc<ProcessHandle>,
        port: u16,
    ) {
        let _ = ProcessSupervisor::stop(handle, Some(DEFAULT_STOP_GRACE)).await;
        self.port_allocator.release(port);
        if let Some(entry) = sandbox.cached_env.read().clone() {
            self.cache.release(&entry.hash);
        }
        sandbox.set_state(LifecycleState::Dead);
        self.event_bus.publish_state(name, LifecycleState::Dead);
    }

    fn spawn_supervision(
        &self,
        name: String,
        sandbox: Arc<Sandbox>,
        mut exit_rx: tokio::sync::watch::Receiver<Option<i32>>,
    ) {
        let registry = self.registry.clone();
        let cache = self.cache.clone();
        let port_allocator = self.port_allocator.clone();
        let anomaly_log = self.anomaly_log.clone();
        let event_bus = self.event_bus.clone();
        let crash_tracker = self
            .crash_trackers
            .get(&name)
            .map(|t| t.clone())
            .unwrap_or_else(|| Arc::new(RapidRestartTracker::new()));

        tokio::spawn(async move {
            let status = loop {
                if let Some(status) = *exit_rx.borrow() {
                    break status;
                }
                if exit_rx.changed().await.is_err() {
                    break -1;
                }
            };

            let uptime = sandbox.uptime().unwrap_or(Duration::from_secs(0));
            sandbox.set_state(LifecycleState::Dead);
            event_bus.publish_state(&name, LifecycleState::Dead);
            event_bus.publish(Event::ProcessExited {
                service: name.clone(),
                status,
            });

            let _ = registry.unregister(&name);
            if let Some(port) = *sandbox.port.read() {
                port_allocator.release(port);
            }
            if let Some(entry) = sandbox.cached_env.read().clone() {
                cache.release(&entry.hash);
            }

            if status != 0 {
                write_crash_report(&sandbox, status, uptime).await;
            }

            if uptime < MIN_UPTIME_FOR_CLEAN_EXIT && crash_tracker.record_exit(uptime) {
                warn!(service = %name, "rapid restart detected");
                let _ = anomaly_log.record(AnomalyEvent::new(
                    AnomalyType::RapidRestart,
                    Severity::Medium,
                    "system",
                    &name,
                    "3 or more early exits within 5 minutes",
                ));
            }
        });
    }

    /// `stop(name)` is a no-op when the sandbox is unknown. Sends SIGTERM,
    /// waits a grace period, then escalates to SIGKILL.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let sandbox = match self.sandboxes.get(name).map(|s| s.clone()) {
            Some(s) => s,
            None => return Ok(()),
        };

        let _guard = sandbox
            .power_lock
            .acquire()
            .await
            .map_err(|e| EngineError::Internal(format!("power lock: {e}")))?;

        sandbox.set_state(LifecycleState::Stopping);
        self.event_bus.publish_state(name, LifecycleState::Stopping);

        if let Some(handle) = sandbox.process.read().clone() {
            ProcessSupervisor::stop(&handle, Some(DEFAULT_STOP_GRACE)).await?;
        }

        if let Some(port) = *sandbox.port.read() {
            self.port_allocator.release(port);
        }
        let _ = self.registry.unregister(name);
        if let Some(entry) = sandbox.cached_env.read().clone() {
            self.cache.release(&entry.hash);
        }

        sandbox.set_state(LifecycleState::Dead);
        self.event_bus.publish_state(name, LifecycleState::Dead);
        Ok(())
    }
}

async fn write_crash_report(sandbox: &Arc<Sandbox>, status: i32, uptime: Duration) {
    let report_path = sandbox.path.join("crash-report.txt");
    let stdout_tail = sandbox
        .process
        .read()
        .as_ref()
        .map(|p| String::from_utf8_lossy(&p.stdout.tail(4096)).into_owned())
        .unwrap_or_default();
    let stderr_tail = sandbox
        .process
        .read()
        .as_ref()
        .map(|p| String::from_utf8_lossy(&p.stderr.tail(4096)).into_owned())
        .unwrap_or_default();

    let listing = list_sandbox_files(&sandbox.path);

    let report = format!(
        "exit status: {status}\nuptime: {uptime:?}\nworking dir: {}\n\n--- stdout (tail) ---\n{stdout_tail}\n\n--- stderr (tail) ---\n{stderr_tail}\n\n--- sandbox files ---\n{listing}\n",
        sandbox.path.display(),
    );

    if let Err(e) = tokio::fs::write(&report_path, report).await {
        error!(error = %e, "failed to write crash report");
    }
}

fn list_sandbox_files(root: &std::path::Path) -> String {
    let mut entries = Vec::new();
    if let Ok(walker) = std::fs::read_dir(root) {
        for entry in walker.flatten() {
            entries.push(entry.path().display().to_string());
        }
    }
    entries.sort();
    entries.join("\n")
}
