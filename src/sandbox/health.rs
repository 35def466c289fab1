//! Polls a service's health endpoint with increasing back-off until it
//! succeeds, times out, or the process exits first.

use std::time::Duration;

use tracing::debug;

use crate::error::{EngineError, Result};

const BACKOFF_STEPS_MS: [u64; 5] = [50, 100, 250, 500, 500];

/// Outcome of racing the health probe against a timeout and process exit.
pub enum ProbeOutcome {
    Healthy,
    Timeout,
    ProcessExited(i32),
}

/// Poll `http://{host}:{port}{health_check}` until a 2xx-3xx response is
/// observed, `timeout` elapses, or `exit_signal` resolves first (the
/// child process died during startup).
pub async fn probe_until_healthy<F>(
    client: &reqwest::Client,
    host: &str,
    port: u16,
    health_check: &str,
    timeout: Duration,
    mut exit_signal: F,
) -> Result<ProbeOutcome>
where
    F: std::future::Future<Output = i32> + Unpin,
{
    let url = format!("http://{host}:{port}{health_check}");
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        let step = BACKOFF_STEPS_MS[(attempt as usize).min(BACKOFF_STEPS_MS.len() - 1)];

        tokio::select! {
            biased;

            status = &mut exit_signal => {
                return Ok(ProbeOutcome::ProcessExited(status));
            }

            _ = tokio::time::sleep_until(deadline) => {
                return Ok(ProbeOutcome::Timeout);
            }

            result = client.get(&url).send() => {
                attempt += 1;
                match result {
                    Ok(response) if response.status().as_u16() < 400 => {
                        return Ok(ProbeOutcome::Healthy);
                    }
                    Ok(response) => {
                        debug!(url = %url, status = response.status().as_u16(), attempt, "health probe non-success response");
                    }
                    Err(e) => {
                        debug!(url = %url, error = %e, attempt, "health probe attempt failed");
                    }
                }

                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Ok(ProbeOutcome::Timeout);
                }
                tokio::time::sleep(Duration::from_millis(step).min(remaining)).await;
            }
        }
    }
}

pub fn timeout_error(name: &str, timeout_secs: u64) -> EngineError {
    EngineError::HealthTimeout {
        name: name.to_string(),
        timeout_secs,
    }
}

pub fn process_exited_error(name: &str, status: i32) -> EngineError {
    EngineError::ProcessExited {
        name: name.to_string(),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    async fn spawn_ok_server() -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(c) => c,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        ("127.0.0.1".to_string(), port)
    }

    #[tokio::test]
    async fn succeeds_when_server_responds_2xx() {
        let (host, port) = spawn_ok_server().await;
        let client = reqwest::Client::new();
        let never_exits = std::future::pending::<i32>();
        let result = probe_until_healthy(
            &client,
            &host,
            port,
            "/health",
            Duration::from_secs(5),
            Box::pin(never_exits),
        )
        .await
        .unwrap();
        assert!(matches!(result, ProbeOutcome::Healthy));
    }

    #[tokio::test]
    async fn times_out_when_nothing_listens() {
        let client = reqwest::Client::new();
        let never_exits = std::future::pending::<i32>();
        let result = probe_until_healthy(
            &client,
            "127.0.0.1",
            1, // reserved port, nothing listens
            "/health",
            Duration::from_millis(300),
            Box::pin(never_exits),
        )
        .await
        .unwrap();
        assert!(matches!(result, ProbeOutcome::Timeout));
    }

    #[tokio::test]
    async fn reports_process_exit_before_timeout() {
        let client = reqwest::Client::new();
        let exits_now = std::future::ready(17);
        let result = probe_until_healthy(
            &client,
            "127.0.0.1",
            1,
            "/health",
            Duration::from_secs(30),
            Box::pin(exits_now),
        )
        .await
        .unwrap();
        assert!(matches!(result, ProbeOutcome::ProcessExited(17)));
    }

    #[allow(dead_code)]
    fn _unused(_: Infallible) {}
}
