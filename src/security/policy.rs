//! Six-check admission policy for starting a service on behalf of a user.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use sysinfo::System;
use tracing::warn;

use super::anomaly::{AnomalyEvent, AnomalyLog, AnomalyType, Severity};
use super::bucket::TokenBucket;
use super::profile::UserProfile;

const SERVER_LOAD_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const CPU_THRESHOLD: f32 = 80.0;
const MEMORY_THRESHOLD: f32 = 85.0;
const HOURLY_WINDOW: Duration = Duration::from_secs(3600);

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub delay_seconds: f64,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            delay_seconds: 0.0,
        }
    }

    fn allow_with_delay(delay_seconds: f64) -> Self {
        Self {
            allowed: true,
            reason: None,
            delay_seconds,
        }
    }

    fn deny(reason: impl Into<String>, delay_seconds: f64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            delay_seconds,
        }
    }
}

struct LoadSample {
    cpu_percent: f32,
    memory_percent: f32,
    sampled_at: Instant,
}

/// Caches the host's CPU/memory load, refreshed lazily at most once per
/// second so a burst of concurrent checks shares one OS sample.
struct LoadSampler {
    system: Mutex<System>,
    cached: Mutex<Option<LoadSample>>,
}

impl LoadSampler {
    fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            cached: Mutex::new(None),
        }
    }

    fn sample(&self) -> (f32, f32) {
        let mut cached = self.cached.lock();
        if let Some(sample) = cached.as_ref() {
            if sample.sampled_at.elapsed() < SERVER_LOAD_SAMPLE_INTERVAL {
                return (sample.cpu_percent, sample.memory_percent);
            }
        }

        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_percent = if system.cpus().is_empty() {
            0.0
        } else {
            system.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / system.cpus().len() as f32
        };
        let memory_percent = if system.total_memory() == 0 {
            0.0
        } else {
            (system.used_memory() as f32 / system.total_memory() as f32) * 100.0
        };

        *cached = Some(LoadSample {
            cpu_percent,
            memory_percent,
            sampled_at: Instant::now(),
        });

        (cpu_percent, memory_percent)
    }
}

struct UserState {
    bucket: TokenBucket,
    hourly_starts: Mutex<VecDeque<Instant>>,
}

/// Admits, denies, or throttles a user's request to start a service.
/// Safe for concurrent `check_can_start` calls.
pub struct SecurityPolicy {
    profiles: DashMap<String, UserProfile>,
    users: DashMap<String, UserState>,
    anomaly_log: Arc<AnomalyLog>,
    load_sampler: LoadSampler,
}

impl SecurityPolicy {
    pub fn new(anomaly_log: Arc<AnomalyLog>) -> Self {
        Self {
            profiles: DashMap::new(),
            users: DashMap::new(),
            anomaly_log,
            load_sampler: LoadSampler::new(),
        }
    }

    pub fn upsert_profile(&self, profile: UserProfile) {
        self.profiles.insert(profile.user_id.clone(), profile);
    }

    pub fn block_user(&self, user_id: &str, reason: impl Into<String>) {
        if let Some(mut profile) = self.profiles.get_mut(user_id) {
            profile.block(reason);
        }
    }

    fn user_state<'a>(&'a self, profile: &UserProfile) -> dashmap::mapref::one::Ref<'a, String, UserState> {
        self.users.entry(profile.user_id.clone()).or_insert_with(|| UserState {
            bucket: TokenBucket::new(profile.max_requests_per_minute),
            hourly_starts: Mutex::new(VecDeque::new()),
        });
        self.users.get(&profile.user_id).unwrap()
    }

    /// Run the six ordered admission checks. `current_concurrent` is the
    /// number of this user's sandboxes currently running, supplied by the
    /// caller so the policy never needs a handle back into the sandbox
    /// manager.
    pub fn check_can_start(
        &self,
        user_id: &str,
        service_id: &str,
        port: u16,
        current_concurrent: u32,
    ) -> Decision {
        let profile = match self.profiles.get(user_id) {
            Some(p) => p.clone(),
            None => UserProfile::new(user_id, super::profile::Tier::Free),
        };

        // 1. Block
        if profile.is_blocked {
            let reason = profile
                .blocked_reason
                .clone()
                .unwrap_or_else(|| "account blocked".to_string());
            self.log_anomaly(
                AnomalyType::UnauthorizedAccess,
                Severity::High,
                user_id,
                service_id,
                &reason,
            );
            return Decision::deny(reason, 0.0);
        }

        // 2. Rate limit
        let state = self.user_state(&profile);
        if let Err(delay) = state.bucket.try_consume() {
            self.log_anomaly(
                AnomalyType::RateLimitExceeded,
                Severity::Low,
                user_id,
                service_id,
                &format!("exceeded {} req/min", profile.max_requests_per_minute),
            );
            return Decision::deny("rate limit exceeded", delay);
        }

        // 3. Concurrent
        if current_concurrent >= profile.max_concurrent_services {
            self.log_anomaly(
                AnomalyType::ConcurrentLimitExceeded,
                Severity::Low,
                user_id,
                service_id,
                &format!("at concurrent limit {}", profile.max_concurrent_services),
            );
            return Decision::deny("concurrent service limit exceeded", 0.0);
        }

        // 4. Hourly
        {
            let mut starts = state.hourly_starts.lock();
            let now = Instant::now();
            while let Some(front) = starts.front() {
                if now.duration_since(*front) > HOURLY_WINDOW {
                    starts.pop_front();
                } else {
                    break;
                }
            }
            if starts.len() as u32 >= profile.max_services_per_hour {
                drop(starts);
                self.log_anomaly(
                    AnomalyType::HourlyLimitExceeded,
                    Severity::Low,
                    user_id,
                    service_id,
                    &format!("exceeded {} starts/hour", profile.max_services_per_hour),
                );
                return Decision::deny("hourly service limit exceeded", 0.0);
            }
            starts.push_back(now);
        }

        // 5. Port allowlist
        if let Some(allowlist) = &profile.port_allowlist {
            if !allowlist.contains(&port) {
                self.log_anomaly(
                    AnomalyType::UnauthorizedAccess,
                    Severity::High,
                    user_id,
                    service_id,
                    &format!("port {port} not in allowlist"),
                );
                return Decision::deny("port not permitted for this user", 0.0);
            }
        }

        // 6. Server load
        let (cpu, memory) = self.load_sampler.sample();
        if cpu > CPU_THRESHOLD || memory > MEMORY_THRESHOLD {
            let overage = ((cpu - CPU_THRESHOLD).max(memory - MEMORY_THRESHOLD)).max(0.0);
            let delay = (overage / 10.0).max(0.1) as f64;
            warn!(cpu, memory, delay, "admission throttled by server load");
            self.log_anomaly(
                AnomalyType::ServerOverloaded,
                Severity::Low,
                user_id,
                service_id,
                &format!("cpu={cpu:.1}% mem={memory:.1}%"),
            );
            return Decision::allow_with_delay(delay);
        }

        Decision::allow()
    }

    fn log_anomaly(
        &self,
        kind: AnomalyType,
        severity: Severity,
        user_id: &str,
        service_id: &str,
        details: &str,
    ) {
        if let Err(e) = self.anomaly_log.record(AnomalyEvent::new(
            kind,
            severity,
            user_id,
            service_id,
            details,
        )) {
            warn!(error = %e, "failed to record anomaly event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::profile::Tier;

    fn policy(dir: &std::path::Path) -> SecurityPolicy {
        SecurityPolicy::new(Arc::new(AnomalyLog::new(dir)))
    }

    #[test]
    fn blocked_user_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let p = policy(dir.path());
        let mut profile = UserProfile::new("u1", Tier::Free);
        profile.block("banned");
        p.upsert_profile(profile);

        let decision = p.check_can_start("u1", "svc", 9000, 0);
        assert!(!decision.allowed);
    }

    #[test]
    fn rate_limit_denies_after_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let p = policy(dir.path());
        p.upsert_profile(UserProfile::new("u1", Tier::Free)); // 20/min

        for _ in 0..20 {
            assert!(p.check_can_start("u1", "svc", 9000, 0).allowed);
        }
        let denied = p.check_can_start("u1", "svc", 9000, 0);
        assert!(!denied.allowed);
        assert!(denied.delay_seconds > 0.0);
    }

    #[test]
    fn concurrent_limit_denies() {
        let dir = tempfile::tempdir().unwrap();
        let p = policy(dir.path());
        p.upsert_profile(UserProfile::new("u1", Tier::Free)); // max 2 concurrent

        assert!(p.check_can_start("u1", "svc1", 9000, 0).allowed);
        assert!(p.check_can_start("u1", "svc2", 9001, 1).allowed);
        let denied = p.check_can_start("u1", "svc3", 9002, 2);
        assert!(!denied.allowed);
    }

    #[test]
    fn port_allowlist_denies_outside_ports() {
        let dir = tempfile::tempdir().unwrap();
        let p = policy(dir.path());
        let mut profile = UserProfile::new("u1", Tier::Pro);
        profile.port_allowlist = Some(vec![9000]);
        p.upsert_profile(profile);

        assert!(p.check_can_start("u1", "svc", 9000, 0).allowed);
        assert!(!p.check_can_start("u1", "svc", 9001, 0).allowed);
    }

    #[test]
    fn unknown_user_gets_free_tier_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = policy(dir.path());
        assert!(p.check_can_start("stranger", "svc", 9000, 0).allowed);
    }
}
