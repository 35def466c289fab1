//! Rapid-restart detection: tracks early exits per sandbox name within a
//! rolling window and raises an anomaly once a threshold is crossed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const ROLLING_WINDOW: Duration = Duration::from_secs(5 * 60);
const MIN_UPTIME_FOR_CLEAN_EXIT: Duration = Duration::from_secs(10);
const RESTART_LIMIT: usize = 3;

/// Tracks, per sandbox, exits observed before the sandbox reached
/// `running` for at least [`MIN_UPTIME_FOR_CLEAN_EXIT`].
#[derive(Default)]
pub struct RapidRestartTracker {
    early_exits: Mutex<VecDeque<Instant>>,
}

impl RapidRestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an exit observed after `uptime` since the process was
    /// considered running. Returns `true` the moment the rolling window
    /// accumulates [`RESTART_LIMIT`] or more early exits.
    pub fn record_exit(&self, uptime: Duration) -> bool {
        if uptime >= MIN_UPTIME_FOR_CLEAN_EXIT {
            return false;
        }

        let mut exits = self.early_exits.lock();
        let now = Instant::now();
        while let Some(front) = exits.front() {
            if now.duration_since(*front) > ROLLING_WINDOW {
                exits.pop_front();
            } else {
                break;
            }
        }
        exits.push_back(now);
        exits.len() >= RESTART_LIMIT
    }

    pub fn reset(&self) {
        self.early_exits.lock().clear();
    }
}
