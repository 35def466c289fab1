//! CLI command handlers. Each is a thin wrapper around the library's
//! `Orchestrator`, `DependencyResolver`, and `EcosystemSpec` types: this
//! module parses arguments, renders output, and maps results to the
//! documented exit codes (§6) — it never duplicates orchestration logic.

use clap::Subcommand;

pub mod down;
pub mod graph;
pub mod status;
pub mod up;
pub mod validate;

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve dependency order, admit, materialize, launch, and
    /// health-gate every service in the ecosystem.
    Up {
        /// Path to the ecosystem YAML file.
        config: String,

        /// User id to evaluate against the security policy. When
        /// omitted, admission checks are skipped.
        #[arg(long)]
        user: Option<String>,
    },
    /// Stop every running service, in reverse dependency order.
    Down {
        /// Path to the ecosystem YAML file.
        config: String,
    },
    /// Report each service's last known lifecycle state and endpoint.
    Status {
        /// Path to the ecosystem YAML file.
        config: String,
    },
    /// Parse and validate an ecosystem file without starting anything.
    Validate {
        /// Path to the ecosystem YAML file.
        config: String,
    },
    /// Print the resolved dependency start order.
    Graph {
        /// Path to the ecosystem YAML file.
        config: String,
    },
}

/// Process exit codes as documented in the configuration file's
/// external-interface contract: 0 success, 1 user/config error, 2
/// runtime failure, 3 policy denial.
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    Success = 0,
    UserError = 1,
    RuntimeFailure = 2,
    PolicyDenial = 3,
}

/// Map a library `EngineError` to the process exit code it represents.
pub fn exit_code_for(err: &pactown::EngineError) -> ExitCode {
    use pactown::EngineError::*;
    match err {
        ConfigError(_) | CycleDetected { .. } | UnknownDependency(_, _) => ExitCode::UserError,
        PolicyDenied { .. } => ExitCode::PolicyDenial,
        NoFreePort { .. }
        | HealthTimeout { .. }
        | ProcessExited { .. }
        | AlreadyRunning(_)
        | Internal(_)
        | Io(_)
        | Yaml(_)
        | Json(_) => ExitCode::RuntimeFailure,
    }
}
