//! Log Capturer — on `STOP`, pulls guest diagnostics through `adb` and
//! writes them to the host paths the config names. Best-effort: a failed
//! capture is logged and swallowed, never escalated to `Fail`, since by
//! the time `STOP` runs the guest may already be unreachable.

use crate::session::SessionHandle;
use crate::state::{OrchestratorState, TransitionOutcome};
use crate::worker::Worker;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::warn;

#[derive(Default)]
pub struct LogCapturer;

impl LogCapturer {
    pub fn new() -> Self {
        Self
    }

    /// Runs `adb <args>`, capturing stdout to `output_path`. Returns
    /// whether anything was written.
    async fn capture_stdout(&self, args: &[&str], output_path: &str) -> bool {
        let output = match Command::new("adb").args(args).stderr(Stdio::null()).output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(command = ?args, error = %e, "failed to run adb for log capture");
                return false;
            }
        };
        if let Err(e) = tokio::fs::write(output_path, &output.stdout).await {
            warn!(path = output_path, error = %e, "failed to write captured log to host file");
            return false;
        }
        true
    }

    /// `adb bugreport <path>` writes its zip directly to the given path
    /// rather than to stdout.
    async fn capture_bugreport(&self, output_path: &str) -> bool {
        match Command::new("adb")
            .args(["bugreport", output_path])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(path = output_path, error = %e, "failed to run adb bugreport");
                false
            }
        }
    }

    async fn capture_all(&self, session: &SessionHandle) -> bool {
        let mut did_work = false;

        if let Some(path) = &session.config.logcat_output {
            if self.capture_stdout(&["logcat", "-d"], path).await {
                did_work = true;
            }
        }
        if let Some(path) = &session.config.dmesg_output {
            if self.capture_stdout(&["shell", "dmesg"], path).await {
                did_work = true;
            }
        }
        if let Some(path) = &session.config.bugreport_output {
            if self.capture_bugreport(path).await {
                did_work = true;
            }
        }

        did_work
    }
}

#[async_trait]
impl Worker for LogCapturer {
    fn name(&self) -> &str {
        "Log Capturer"
    }

    async fn enter(&mut self, state: OrchestratorState, session: &SessionHandle) -> TransitionOutcome {
        if state != OrchestratorState::Stop {
            return TransitionOutcome::Noop;
        }
        if self.capture_all(session).await {
            TransitionOutcome::Done
        } else {
            TransitionOutcome::Noop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::session::SessionState;
    use std::sync::Arc;

    #[tokio::test]
    async fn noop_states_do_not_touch_session() {
        let mut worker = LogCapturer::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));
        for state in [OrchestratorState::Init, OrchestratorState::QemuUp, OrchestratorState::NetworkUp, OrchestratorState::Job] {
            assert_eq!(worker.enter(state, &session).await, TransitionOutcome::Noop);
        }
    }

    #[tokio::test]
    async fn stop_with_no_configured_paths_is_noop() {
        let mut worker = LogCapturer::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));
        assert_eq!(worker.enter(OrchestratorState::Stop, &session).await, TransitionOutcome::Noop);
    }
}
