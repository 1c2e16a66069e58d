//! Test Job Runner — spawns the user-supplied test command in the
//! configured working directory, inherits its stdio, and captures its
//! exit code for the driver's final process exit.
//!
//! The only worker whose job is `Done` is the success path for the whole
//! orchestration: per §4.2/§7, a non-zero exit from this command is the
//! test's own verdict, not an orchestration failure, so it is recorded
//! rather than turned into `Fail`.

use crate::session::SessionHandle;
use crate::state::{OrchestratorState, TransitionOutcome};
use crate::worker::Worker;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

#[derive(Default)]
pub struct TestJobRunner;

impl TestJobRunner {
    pub fn new() -> Self {
        Self
    }

    async fn run_job(&self, session: &SessionHandle) -> Result<i32> {
        let mut cmd = shell_command(&session.config.job_command);
        if let Some(workdir) = &session.config.job_workdir {
            cmd.current_dir(workdir);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn test command '{}'", session.config.job_command))?;
        let status = child.wait().await.context("failed to wait on test command")?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[async_trait]
impl Worker for TestJobRunner {
    fn name(&self) -> &str {
        "Test Job Runner"
    }

    async fn enter(&mut self, state: OrchestratorState, session: &SessionHandle) -> TransitionOutcome {
        if state != OrchestratorState::Job {
            return TransitionOutcome::Noop;
        }
        match self.run_job(session).await {
            Ok(code) => {
                info!(code, "test command exited");
                *session.job_exit_code.lock().await = Some(code);
                TransitionOutcome::Done
            }
            Err(e) => TransitionOutcome::Fail(e.to_string()),
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
        let mut worker = TestJobRunner::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));
        for state in [OrchestratorState::Init, OrchestratorState::QemuUp, OrchestratorState::NetworkUp, OrchestratorState::Stop] {
            assert_eq!(worker.enter(state, &session).await, TransitionOutcome::Noop);
        }
        assert!(session.job_exit_code.lock().await.is_none());
    }

    #[tokio::test]
    async fn successful_command_captures_zero_exit_code() {
        let mut worker = TestJobRunner::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig {
            job_command: "true".to_string(),
            ..OrchestratorConfig::default()
        }));
        let outcome = worker.enter(OrchestratorState::Job, &session).await;
        assert_eq!(outcome, TransitionOutcome::Done);
        assert_eq!(*session.job_exit_code.lock().await, Some(0));
    }

    #[tokio::test]
    async fn failing_command_is_recorded_not_failed() {
        let mut worker = TestJobRunner::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig {
            job_command: "false".to_string(),
            ..OrchestratorConfig::default()
        }));
        let outcome = worker.enter(OrchestratorState::Job, &session).await;
        assert_eq!(outcome, TransitionOutcome::Done);
        assert_eq!(*session.job_exit_code.lock().await, Some(1));
    }
}
