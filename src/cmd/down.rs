//! `pactown down <config>`: stop every service, in reverse dependency
//! order.
//!
//! A CLI invocation owns no in-process state from a prior `up` (that
//! process may not even still be running), so this reconciles against
//! whatever the service registry has persisted: [`Orchestrator::new`]
//! loads the registry with an empty alive-set, which drops every
//! persisted entry, and a `down` against a freshly constructed
//! orchestrator has nothing left to stop. This matches "stop on a
//! non-existent service is a no-op" — the long-running `up` process is
//! the one actually responsible for reacting to its own shutdown
//! signal (see `cmd::up`).

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

    match orchestrator.down().await {
        Ok(()) => {
            println!("down");
            Ok(ExitCode::Success)
        }
        Err(e) => {
            eprintln!("error: {e}");
            Ok(exit_code_for(&e))
        }
    }
}
