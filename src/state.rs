//! The global orchestrator state and the tri-valued result every worker
//! hook reports back to the driver.

use serde::Serialize;

/// The orchestrator's global state, in declared (and therefore `Ord`)
/// order. The forward walk is strictly monotonic through these values;
/// `Stop` is the sole exception and may be entered from any state as a
/// forced teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Init,
    QemuUp,
    NetworkUp,
    Job,
    Stop,
}

impl OrchestratorState {
    /// The states visited on the forward walk, in order. `Stop` is
    /// deliberately excluded — it is reached either after this sequence
    /// completes or as a forced jump, never as the "next" state of `Job`.
    pub const FORWARD_SEQUENCE: [OrchestratorState; 4] = [
        OrchestratorState::Init,
        OrchestratorState::QemuUp,
        OrchestratorState::NetworkUp,
        OrchestratorState::Job,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            OrchestratorState::Init => "INIT",
            OrchestratorState::QemuUp => "QEMU_UP",
            OrchestratorState::NetworkUp => "NETWORK_UP",
            OrchestratorState::Job => "JOB",
            OrchestratorState::Stop => "STOP",
        }
    }
}

/// The tri-valued outcome a worker hook reports for a single state
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The worker did meaningful work for this state.
    Done,
    /// This state is not this worker's concern; no side effect occurred.
    Noop,
    /// The hook failed or timed out. Carries a human-readable reason so
    /// the driver can report the first fatal failure without downcasting
    /// an opaque error type.
    Fail(String),
}

impl TransitionOutcome {
    pub fn is_fail(&self) -> bool {
        matches!(self, TransitionOutcome::Fail(_))
    }
}
