//! One materialized service: its files, environment, and supervised
//! process, plus its position in the lifecycle state machine (§3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::CachedEnv;
use crate::events::LifecycleState;
use crate::sandbox::process::ProcessHandle;
use crate::system::Locker;

fn state_to_u8(state: LifecycleState) -> u8 {
    match state {
        LifecycleState::Created => 0,
        LifecycleState::Materialized => 1,
        LifecycleState::Starting => 2,
        LifecycleState::Running => 3,
        LifecycleState::Stopping => 4,
        LifecycleState::Dead => 5,
    }
}

fn u8_to_state(value: u8) -> LifecycleState {
    match value {
        0 => LifecycleState::Created,
        1 => LifecycleState::Materialized,
        2 => LifecycleState::Starting,
        3 => LifecycleState::Running,
        4 => LifecycleState::Stopping,
        _ => LifecycleState::Dead,
    }
}

/// One service's materialized workspace and runtime state.
pub struct Sandbox {
    pub name: String,
    pub path: PathBuf,
    /// The artifact's run command verbatim, captured at materialization
    /// time so `start` never needs to reload the artifact.
    pub run: String,
    state: AtomicU8,
    pub port: RwLock<Option<u16>>,
    pub env: RwLock<HashMap<String, String>>,
    pub cached_env: RwLock<Option<Arc<CachedEnv>>>,
    pub process: RwLock<Option<Arc<ProcessHandle>>>,
    pub running_since: RwLock<Option<std::time::Instant>>,
    /// Serializes start/stop/restart for this one sandbox; never blocks
    /// another sandbox's power operations.
    pub power_lock: Locker,
}

impl Sandbox {
    pub fn new(name: impl Into<String>, path: PathBuf, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path,
            run: run.into(),
            state: AtomicU8::new(state_to_u8(LifecycleState::Created)),
            port: RwLock::new(None),
            env: RwLock::new(HashMap::new()),
            cached_env: RwLock::new(None),
            process: RwLock::new(None),
            running_since: RwLock::new(None),
            power_lock: Locker::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        u8_to_state(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: LifecycleState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), LifecycleState::Starting | LifecycleState::Running)
    }

    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.running_since.read().map(|t| t.elapsed())
    }
}
