//! Launches, signals, and observes one OS child process.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::system::SinkPool;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const LOG_BUFFER_CAP: usize = 1024 * 1024;

/// Rewrite literal `--port <N>`, `-p <N>`, and `PORT=<N>` occurrences in a
/// run command to the allocated port. Unrecognized patterns are left
/// untouched; the service is still expected to read `PORT`/`MARKPACT_PORT`
/// from its environment.
pub fn rewrite_port(run: &str, port: u16) -> String {
    let patterns: [(&str, fn(u16) -> String); 3] = [
        (r"--port\s+\d+", |p| format!("--port {p}")),
        (r"-p\s+\d+", |p| format!("-p {p}")),
        (r"PORT=\d+", |p| format!("PORT={p}")),
    ];

    let mut result = run.to_string();
    for (pattern, replacement) in patterns {
        let re = Regex::new(pattern).expect("static port-rewrite pattern is valid");
        result = re.replace_all(&result, replacement(port).as_str()).into_owned();
    }
    result
}

/// A bounded, append-only ring buffer capturing one stream's recent output.
#[derive(Default)]
pub struct LogBuffer {
    data: parking_lot::Mutex<Vec<u8>>,
    cap: usize,
}

impl LogBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: parking_lot::Mutex::new(Vec::new()),
            cap,
        }
    }

    pub fn append(&self, chunk: &[u8]) {
        let mut data = self.data.lock();
        data.extend_from_slice(chunk);
        if data.len() > self.cap {
            let overflow = data.len() - self.cap;
            data.drain(0..overflow);
        }
    }

    pub fn tail(&self, n: usize) -> Vec<u8> {
        let data = self.data.lock();
        let start = data.len().saturating_sub(n);
        data[start..].to_vec()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

/// A handle onto one supervised OS process.
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: std::time::Instant,
    pub stdout: Arc<LogBuffer>,
    pub stderr: Arc<LogBuffer>,
    child: AsyncMutex<Option<Child>>,
}

/// Launches a run command as a child process with the composed
/// environment, capturing stdout/stderr to bounded ring buffers mirrored
/// to a per-service log file and to a [`SinkPool`] for live tailing.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub async fn spawn(
        run: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        log_path: &Path,
        sink: SinkPool,
    ) -> Result<ProcessHandle> {
        let parts = shell_words::split(run)
            .map_err(|e| EngineError::Internal(format!("invalid run command '{run}': {e}")))?;
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| EngineError::Internal("empty run command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Internal(format!("failed to spawn '{run}': {e}")))?;

        let pid = child.id().ok_or_else(|| {
            EngineError::Internal("spawned process has no pid (already reaped)".to_string())
        })?;

        let stdout_buf = Arc::new(LogBuffer::new(LOG_BUFFER_CAP));
        let stderr_buf = Arc::new(LogBuffer::new(LOG_BUFFER_CAP));

        if let Some(stdout) = child.stdout.take() {
            spawn_log_forwarder(stdout, stdout_buf.clone(), log_path.to_path_buf(), sink.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_forwarder(stderr, stderr_buf.clone(), log_path.to_path_buf(), sink);
        }

        Ok(ProcessHandle {
            pid,
            started_at: std::time::Instant::now(),
            stdout: stdout_buf,
            stderr: stderr_buf,
            child: AsyncMutex::new(Some(child)),
        })
    }

    /// Send SIGTERM, wait up to `grace`, then escalate to SIGKILL.
    pub async fn stop(handle: &ProcessHandle, grace: Option<Duration>) -> Result<()> {
        let grace = grace.unwrap_or(DEFAULT_STOP_GRACE);
        let pid = Pid::from_raw(handle.pid as i32);

        if signal::kill(pid, Signal::SIGTERM).is_err() {
            debug!(pid = handle.pid, "process already gone before SIGTERM");
            return Ok(());
        }

        if tokio::time::timeout(grace, Self::wait(handle)).await.is_ok() {
            return Ok(());
        }

        warn!(pid = handle.pid, "graceful stop timed out, escalating to SIGKILL");
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = Self::wait(handle).await;
        Ok(())
    }

    /// Block until the child has exited, returning its raw status.
    /// Negative values encode the terminating signal. Safe to call again
    /// after a cancelled call (e.g. a timed-out graceful stop): the child
    /// stays parked in the mutex until it is actually reaped.
    pub async fn wait(handle: &ProcessHandle) -> Result<i32> {
        let mut guard = handle.child.lock().await;
        let child = guard.as_mut().ok_or_else(|| {
            EngineError::Internal("process already reaped".to_string())
        })?;

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::Internal(format!("wait failed: {e}")))?;
        *guard = None;

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Ok(-signal);
            }
        }
        Ok(status.code().unwrap_or(-1))
    }

    pub async fn is_running(handle: &ProcessHandle) -> bool {
        handle.child.lock().await.is_some()
    }
}

fn spawn_log_forwarder<R>(
    stream: R,
    buffer: Arc<LogBuffer>,
    log_path: std::path::PathBuf,
    sink: SinkPool,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream).lines();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok();

        while let Ok(Some(line)) = reader.next_line().await {
            let mut chunk = line.into_bytes();
            chunk.push(b'\n');
            buffer.append(&chunk);
            sink.push(chunk.clone());
            if let Some(file) = &file {
                use std::io::Write;
                let _ = (&*file).write_all(&chunk);
            }
        }
    });
}
