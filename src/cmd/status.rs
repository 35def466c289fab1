//! `pactown status <config>`: report each declared service's last
//! known lifecycle state.

use std::sync::Arc;

use anyhow::{Context, Result};

use pactown::artifact::InMemoryArtifactSource;
use pactown::{EcosystemSpec, Orchestrator};

use super::{exit_code_for, ExitCode};

pub async fn run(config: &str) -> Result<ExitCode> {
    let spec = match EcosystemSpec::load(config) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(exit_code_for(&e));
        }
    };

    let source = Arc::new(InMemoryArtifactSource);
    let orchestrator =
        Orchestrator::new(spec, source).context("failed to initialize orchestrator")?;

    for status in orchestrator.status() {
        let port = status
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let uptime = status
            .uptime
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<12} port={:<6} uptime={}",
            status.name, status.state, port, uptime
        );
    }

    Ok(ExitCode::Success)
}
