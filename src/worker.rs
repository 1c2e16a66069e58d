//! The contract every worker implements: two transition hooks, entered
//! and exited for each global state the driver walks through.

use crate::session::SessionHandle;
use crate::state::{OrchestratorState, TransitionOutcome};
use async_trait::async_trait;

#[async_trait]
pub trait Worker: Send + Sync {
    /// A short, human-readable name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Invoked when the global state transitions into `state`. Must
    /// return `Noop` with no side effects for states that are not this
    /// worker's concern. May suspend on I/O; must respect the driver's
    /// per-state deadline (enforced by the caller via `tokio::time::timeout`,
    /// not by the worker itself).
    async fn enter(&mut self, state: OrchestratorState, session: &SessionHandle) -> TransitionOutcome;

    /// Invoked when the global state transitions out of `state`. Most
    /// workers in this system only act on entry, so the default is a
    /// no-op.
    async fn exit(&mut self, _state: OrchestratorState, _session: &SessionHandle) -> TransitionOutcome {
        TransitionOutcome::Noop
    }
}
