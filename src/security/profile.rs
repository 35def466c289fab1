//! Tier-driven per-tenant limits.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    fn defaults(self) -> TierDefaults {
        match self {
            Tier::Free => TierDefaults {
                max_concurrent_services: 2,
                max_memory_mb: 256,
                max_cpu_percent: 25,
                max_requests_per_minute: 20,
                max_services_per_hour: 5,
            },
            Tier::Basic => TierDefaults {
                max_concurrent_services: 5,
                max_memory_mb: 512,
                max_cpu_percent: 50,
                max_requests_per_minute: 60,
                max_services_per_hour: 20,
            },
            Tier::Pro => TierDefaults {
                max_concurrent_services: 10,
                max_memory_mb: 2048,
                max_cpu_percent: 80,
                max_requests_per_minute: 120,
                max_services_per_hour: 50,
            },
            Tier::Enterprise => TierDefaults {
                max_concurrent_services: 50,
                max_memory_mb: 8192,
                max_cpu_percent: 100,
                max_requests_per_minute: 500,
                max_services_per_hour: 200,
            },
        }
    }
}

struct TierDefaults {
    max_concurrent_services: u32,
    max_memory_mb: u32,
    max_cpu_percent: u32,
    max_requests_per_minute: u32,
    max_services_per_hour: u32,
}

/// One tenant's limits and current block state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub tier: Tier,
    pub max_concurrent_services: u32,
    pub max_memory_mb: u32,
    pub max_cpu_percent: u32,
    pub max_requests_per_minute: u32,
    pub max_services_per_hour: u32,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    /// Optional allowlist of ports this user may request.
    pub port_allowlist: Option<Vec<u16>>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, tier: Tier) -> Self {
        let d = tier.defaults();
        Self {
            user_id: user_id.into(),
            tier,
            max_concurrent_services: d.max_concurrent_services,
            max_memory_mb: d.max_memory_mb,
            max_cpu_percent: d.max_cpu_percent,
            max_requests_per_minute: d.max_requests_per_minute,
            max_services_per_hour: d.max_services_per_hour,
            is_blocked: false,
            blocked_reason: None,
            port_allowlist: None,
        }
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.is_blocked = true;
        self.blocked_reason = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_tier_defaults_match_spec() {
        let profile = UserProfile::new("u1", Tier::Free);
        assert_eq!(profile.max_concurrent_services, 2);
        assert_eq!(profile.max_memory_mb, 256);
        assert_eq!(profile.max_cpu_percent, 25);
        assert_eq!(profile.max_requests_per_minute, 20);
        assert_eq!(profile.max_services_per_hour, 5);
    }

    #[test]
    fn enterprise_tier_defaults_match_spec() {
        let profile = UserProfile::new("u1", Tier::Enterprise);
        assert_eq!(profile.max_concurrent_services, 50);
        assert_eq!(profile.max_requests_per_minute, 500);
    }
}
