//! `pactown up <config>`: bring an ecosystem up and hold it there until
//! a shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use pactown::artifact::InMemoryArtifactSource;
use pactown::{EcosystemSpec, Orchestrator};

use super::{exit_code_for, ExitCode};

pub async fn run(config: &str, user: Option<&str>) -> Result<ExitCode> {
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

    let cancel = CancellationToken::new();
    let _sweep = orchestrator.spawn_cache_sweep(cancel.clone());

    if let Err(e) = orchestrator.up(user).await {
        eprintln!("error: {e}");
        cancel.cancel();
        return Ok(exit_code_for(&e));
    }

    for status in orchestrator.status() {
        if let Some(port) = status.port {
            println!("{}: {} on port {port}", status.name, status.state);
        }
    }

    info!("ecosystem is up, waiting for shutdown signal");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    cancel.cancel();

    info!("shutdown signal received, tearing down");
    if let Err(e) = orchestrator.down().await {
        eprintln!("error during shutdown: {e}");
        return Ok(exit_code_for(&e));
    }

    Ok(ExitCode::Success)
}
