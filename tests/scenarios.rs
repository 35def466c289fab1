//! Cross-module scenario coverage against the public `pactown` API.
//!
//! Every fixture "service" is a `sh -c '...'` one-liner answering a bare
//! HTTP 200 on its health path, keeping these hermetic and fast instead
//! of shipping a compiled dummy binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pactown::artifact::{Artifact, ArtifactSource};
use pactown::config::{DependencyRef, RegistryConfig, ServiceSpec};
use pactown::security::{AnomalyLog, SecurityPolicy, Tier, UserProfile};
use pactown::{EcosystemSpec, EngineError, Orchestrator};

struct FixtureSource(HashMap<String, Artifact>);

impl ArtifactSource for FixtureSource {
    fn load(&self, readme: &Path) -> pactown::Result<Artifact> {
        let key = readme.file_stem().unwrap().to_string_lossy().to_string();
        self.0
            .get(&key)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("no fixture for {key}")))
    }
}

fn source(entries: Vec<(&str, Artifact)>) -> Arc<dyn ArtifactSource> {
    Arc::new(FixtureSource(
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    ))
}

/// A shell one-liner that answers a bare `200 OK` on every connection to
/// `$PORT`, forever.
fn http_echo_service(name: &str) -> Artifact {
    Artifact::new(
        name,
        "sh -c 'while true; do printf \"HTTP/1.1 200 OK\\r\\ncontent-length: 0\\r\\n\\r\\n\" | nc -l -p $PORT; done'",
    )
}

/// Same as [`http_echo_service`] but dumps its own environment to
/// `captured_env.txt` in its sandbox directory before serving, so tests
/// can assert on injected dependency variables.
fn http_echo_service_capturing_env(name: &str) -> Artifact {
    Artifact::new(
        name,
        "sh -c 'env > captured_env.txt; while true; do printf \"HTTP/1.1 200 OK\\r\\ncontent-length: 0\\r\\n\\r\\n\" | nc -l -p $PORT; done'",
    )
}

fn base_spec(sandbox_root: &Path) -> EcosystemSpec {
    EcosystemSpec {
        name: "demo".into(),
        version: String::new(),
        description: String::new(),
        base_port: 8000,
        sandbox_root: sandbox_root.to_path_buf(),
        registry: None,
        services: HashMap::new(),
    }
}

fn service(readme: &str, port: Option<u16>, depends_on: Vec<DependencyRef>) -> ServiceSpec {
    ServiceSpec {
        readme: PathBuf::from(readme),
        port,
        health_check: "/health".into(),
        timeout: 3,
        env: HashMap::new(),
        depends_on,
    }
}

/// Scenario 1: two-service happy path with dependency env injection.
#[tokio::test]
async fn two_service_happy_path_injects_dependency_url() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = base_spec(dir.path());
    spec.services.insert("db".into(), service("db.md", None, vec![]));
    spec.services.insert(
        "api".into(),
        service(
            "api.md",
            None,
            vec![DependencyRef {
                name: "db".into(),
                endpoint: None,
                env_var: Some("DATABASE_URL".into()),
            }],
        ),
    );

    let source = source(vec![
        ("db", http_echo_service("db")),
        ("api", http_echo_service_capturing_env("api")),
    ]);
    let orchestrator = Orchestrator::new(spec, source).unwrap();

    let started = orchestrator.up(None).await.unwrap();
    assert_eq!(started, vec!["db".to_string(), "api".to_string()]);

    let db_endpoint = orchestrator.engine().registry.get("db").unwrap();
    let api_endpoint = orchestrator.engine().registry.get("api").unwrap();

    // Give the capturing shell a moment to flush captured_env.txt before
    // it moves on to serving the health check.
    let env_path = dir
        .path()
        .join("sandboxes")
        .join("api")
        .join("captured_env.txt");
    wait_for_file(&env_path, Duration::from_secs(2)).await;
    let captured = std::fs::read_to_string(&env_path).unwrap();
    assert!(captured.contains(&format!("DATABASE_URL=http://127.0.0.1:{}", db_endpoint.port)));

    orchestrator.down().await.unwrap();
    assert!(port_is_free(db_endpoint.port));
    assert!(port_is_free(api_endpoint.port));
}

/// Scenario 2: two services preferring the same port; the second is
/// reassigned within the configured range.
#[tokio::test]
async fn port_collision_reassigns_second_service() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = base_spec(dir.path());
    spec.registry = Some(RegistryConfig {
        port_range: Some((21500, 21600)),
    });
    spec.services.insert("a".into(), service("a.md", Some(21500), vec![]));
    spec.services.insert("b".into(), service("b.md", Some(21500), vec![]));

    let source = source(vec![("a", http_echo_service("a")), ("b", http_echo_service("b"))]);
    let orchestrator = Orchestrator::new(spec, source).unwrap();
    orchestrator.up(None).await.unwrap();

    let a = orchestrator.engine().registry.get("a").unwrap();
    let b = orchestrator.engine().registry.get("b").unwrap();
    assert_ne!(a.port, b.port);
    assert!(a.port == 21500 || b.port == 21500);

    orchestrator.down().await.unwrap();
}

/// Scenario 3: a dependency cycle aborts before any process starts.
#[tokio::test]
async fn cycle_is_rejected_before_starting_anything() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = base_spec(dir.path());
    spec.services.insert(
        "a".into(),
        service(
            "a.md",
            None,
            vec![DependencyRef {
                name: "b".into(),
                endpoint: None,
                env_var: None,
            }],
        ),
    );
    spec.services.insert(
        "b".into(),
        service(
            "b.md",
            None,
            vec![DependencyRef {
                name: "a".into(),
                endpoint: None,
                env_var: None,
            }],
        ),
    );

    let source = source(vec![]);
    let orchestrator = Orchestrator::new(spec, source).unwrap();
    let result = orchestrator.up(None).await;
    match result {
        Err(EngineError::CycleDetected { names }) => {
            assert!(names.contains(&"a".to_string()) || names.contains(&"b".to_string()));
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
}

/// Scenario 4: a service that never binds its port times out and aborts
/// the whole `up` without leaving anything else running.
#[tokio::test]
async fn health_timeout_aborts_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = base_spec(dir.path());
    spec.services.insert("db".into(), service("db.md", None, vec![]));
    spec.services.insert("api".into(), service("api.md", None, vec![]));

    let source = source(vec![
        ("db", http_echo_service("db")),
        ("api", Artifact::new("api", "sh -c 'sleep 30'")),
    ]);
    let orchestrator = Orchestrator::new(spec, source).unwrap();

    let start = Instant::now();
    let result = orchestrator.up(None).await;
    assert!(matches!(result, Err(EngineError::HealthTimeout { .. })));
    // Bounded by the health timeout (3s) plus, worst case, one stop grace
    // period (10s) spent tearing `db` back down.
    assert!(start.elapsed() < Duration::from_secs(15));

    for status in orchestrator.status() {
        assert_ne!(status.state, pactown::events::LifecycleState::Running);
    }
}

/// Scenario 5: two services with equivalent (reordered) dependency lists
/// share one on-disk cache entry instead of building two.
#[tokio::test]
async fn equivalent_dependency_lists_share_one_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = base_spec(dir.path());
    spec.services.insert("a".into(), service("a.md", None, vec![]));
    spec.services.insert("b".into(), service("b.md", None, vec![]));

    let a_artifact = Artifact::new("a", "sh -c 'true'").with_deps(vec!["x".into(), "y".into()]);
    let b_artifact = Artifact::new("b", "sh -c 'true'").with_deps(vec!["y".into(), "x".into()]);
    let source = source(vec![("a", a_artifact), ("b", b_artifact)]);
    let orchestrator = Orchestrator::new(spec, source).unwrap();

    orchestrator.engine().manager.create("a", Path::new("a.md")).unwrap();
    orchestrator.engine().manager.create("b", Path::new("b.md")).unwrap();

    assert_eq!(orchestrator.engine().cache.len(), 1);
}

/// Scenario 6: a free-tier user is admitted for their first 20 starts in
/// a window, denied on the 21st with a positive delay, and recorded
/// exactly once in the anomaly log.
#[tokio::test]
async fn rate_limit_denies_after_capacity_and_logs_once() {
    let dir = tempfile::tempdir().unwrap();
    let anomaly_log = Arc::new(AnomalyLog::new(dir.path()));
    let policy = SecurityPolicy::new(anomaly_log.clone());
    policy.upsert_profile(UserProfile::new("alice", Tier::Free));

    for _ in 0..20 {
        let decision = policy.check_can_start("alice", "svc", 9000, 0);
        assert!(decision.allowed);
    }

    let denied = policy.check_can_start("alice", "svc", 9000, 0);
    assert!(!denied.allowed);
    assert!(denied.delay_seconds > 0.0);

    let events = anomaly_log.read_all().unwrap();
    let rate_limit_events = events
        .iter()
        .filter(|e| e.user_id == "alice" && matches!(e.kind, pactown::security::AnomalyType::RateLimitExceeded))
        .count();
    assert_eq!(rate_limit_events, 1);
}

async fn wait_for_file(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", path.display());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
