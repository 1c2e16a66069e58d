//! Screen Recorder — optional worker that spawns an external VNC-recording
//! binary against the emulator's VNC display once it has settled.
//!
//! Grounded on `vnc_recorder.py`; the 10 s settle sleep there accounts for
//! guest modesetting, which happens well after `QEMU_UP` starts but before
//! the recorder can usefully attach.

use crate::session::SessionHandle;
use crate::state::{OrchestratorState, TransitionOutcome};
use crate::worker::Worker;
use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Default)]
pub struct ScreenRecorder;

impl ScreenRecorder {
    pub fn new() -> Self {
        Self
    }

    async fn ensure_recorder(&self, session: &SessionHandle) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(10)).await;

        let bin = session.config.vnc_recorder_bin.as_deref().unwrap_or("vnc_recorder");
        let port = session.config.vnc_recorder_port.to_string();
        let mut cmd = Command::new(bin);
        cmd.args(["--password", "", "--port", port.as_str(), "--outfile", session.config.vnc_recorder_output.as_str()])
            .kill_on_drop(true);
        if session.config.vnc_recorder_debug {
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stderr(Stdio::null());
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn VNC recorder binary '{bin}'"))?;
        *session.vnc_recorder_proc.lock().await = Some(child);
        Ok(())
    }

    async fn ensure_stopped(&self, session: &SessionHandle) -> bool {
        let Some(mut child) = session.vnc_recorder_proc.lock().await.take() else {
            return false;
        };
        if let Some(pid) = child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "failed to send SIGTERM to VNC recorder"),
            }
        }
        let _ = child.wait().await;
        true
    }
}

#[async_trait]
impl Worker for ScreenRecorder {
    fn name(&self) -> &str {
        "Screen Recorder"
    }

    async fn enter(&mut self, state: OrchestratorState, session: &SessionHandle) -> TransitionOutcome {
        match state {
            OrchestratorState::QemuUp => {
                if !session.config.vnc_recorder {
                    return TransitionOutcome::Noop;
                }
                match tokio::time::timeout(Duration::from_secs(20), self.ensure_recorder(session)).await {
                    Ok(Ok(())) => {
                        info!("VNC recorder started");
                        TransitionOutcome::Done
                    }
                    Ok(Err(e)) => TransitionOutcome::Fail(e.to_string()),
                    Err(_) => TransitionOutcome::Fail("timed out spawning VNC recorder".to_string()),
                }
            }
            OrchestratorState::Stop => {
                if self.ensure_stopped(session).await {
                    TransitionOutcome::Done
                } else {
                    TransitionOutcome::Noop
                }
            }
            _ => TransitionOutcome::Noop,
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
    async fn disabled_recorder_is_noop_at_qemu_up() {
        let mut worker = ScreenRecorder::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig {
            vnc_recorder: false,
            ..OrchestratorConfig::default()
        }));
        assert_eq!(worker.enter(OrchestratorState::QemuUp, &session).await, TransitionOutcome::Noop);
    }

    #[tokio::test]
    async fn noop_states_do_not_touch_session() {
        let mut worker = ScreenRecorder::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));
        for state in [OrchestratorState::Init, OrchestratorState::NetworkUp, OrchestratorState::Job] {
            assert_eq!(worker.enter(state, &session).await, TransitionOutcome::Noop);
        }
        assert!(session.vnc_recorder_proc.lock().await.is_none());
    }

    #[tokio::test]
    async fn stop_without_a_live_recorder_is_noop() {
        let mut worker = ScreenRecorder::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));
        assert_eq!(worker.enter(OrchestratorState::Stop, &session).await, TransitionOutcome::Noop);
    }
}
