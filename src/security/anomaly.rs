//! Append-only, size-capped anomaly log for admin review.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AnomalyType {
    RateLimitExceeded,
    ConcurrentLimitExceeded,
    HourlyLimitExceeded,
    ServerOverloaded,
    RapidRestart,
    UnauthorizedAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    pub severity: Severity,
    pub user_id: String,
    pub service_id: String,
    pub details: String,
}

impl AnomalyEvent {
    pub fn new(
        kind: AnomalyType,
        severity: Severity,
        user_id: impl Into<String>,
        service_id: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            kind,
            severity,
            user_id: user_id.into(),
            service_id: service_id.into(),
            details: details.into(),
        }
    }
}

/// A callback invoked synchronously whenever an anomaly is recorded, so
/// dashboards or alerters can observe events without polling the log file.
pub type AnomalyHook = Box<dyn Fn(&AnomalyEvent) + Send + Sync>;

/// Append-only JSON-lines anomaly log, capped at `max_events` with
/// oldest-first eviction on overflow.
pub struct AnomalyLog {
    path: PathBuf,
    max_events: usize,
    lock: Mutex<()>,
    hook: Option<AnomalyHook>,
}

impl AnomalyLog {
    pub fn new(sandbox_root: impl AsRef<Path>) -> Self {
        Self {
            path: sandbox_root.as_ref().join("anomalies.jsonl"),
            max_events: 10_000,
            lock: Mutex::new(()),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: AnomalyHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn record(&self, event: AnomalyEvent) -> Result<()> {
        let _guard = self.lock.lock();

        let line = serde_json::to_string(&event)?;
        {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(EngineError::Io)?;
            writeln!(file, "{line}").map_err(EngineError::Io)?;
        }

        self.enforce_cap()?;

        if let Some(hook) = &self.hook {
            hook(&event);
        }

        Ok(())
    }

    fn enforce_cap(&self) -> Result<()> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Ok(()),
        };
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() <= self.max_events {
            return Ok(());
        }

        let trimmed = &lines[lines.len() - self.max_events..];
        let tmp_path = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp_path, trimmed.join("\n") + "\n").map_err(EngineError::Io)?;
        std::fs::rename(&tmp_path, &self.path).map_err(EngineError::Io)?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<AnomalyEvent>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Ok(Vec::new()),
        };
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}
