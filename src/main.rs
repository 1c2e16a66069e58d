//! Android emulator test orchestrator CLI entry point.
//!
//! Single invocation, no subcommands: loads the merged configuration,
//! drives the orchestrator through its full lifecycle, and exits with
//! the user test command's exit code on the happy path or a non-zero
//! orchestration-failure code otherwise.

use android_test_orchestrator::{Orchestrator, OrchestratorConfig, EXIT_ORCHESTRATION_FAILURE};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,android_test_orchestrator=debug")))
        .init();

    let config = match OrchestratorConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(EXIT_ORCHESTRATION_FAILURE);
        }
    };

    let orchestrator = Orchestrator::new(config);
    let exit_code = orchestrator.run().await;
    std::process::exit(exit_code);
}
