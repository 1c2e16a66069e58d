//! Permission Approver — auto-dismisses the USB-permission modal that the
//! VirtWifi installer's activity can trigger, by watching `adb logcat` for
//! a marker line and replaying a fixed key sequence.
//!
//! The watcher runs as an explicit `JoinHandle`; `STOP` aborts it directly
//! rather than relying on process exit to reap it.

use crate::session::SessionHandle;
use crate::state::{OrchestratorState, TransitionOutcome};
use crate::worker::Worker;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const REQUESTED_MARKER: &[u8] = b"USB-PERMISSION-REQUESTED";
const ANY_MARKER: &[u8] = b"USB-PERMISSION";
const KEYPRESS_SPACING: Duration = Duration::from_millis(300);

/// Maps a config-friendly button name to the `adb shell input keyevent`
/// code it sends. Anything not recognized is passed through verbatim
/// (prefixed `KEYCODE_` if it isn't already), so operators can configure
/// exotic codes without a crate update.
fn keycode_for(button: &str) -> String {
    match button.to_ascii_lowercase().as_str() {
        "right" => "KEYCODE_DPAD_RIGHT".to_string(),
        "left" => "KEYCODE_DPAD_LEFT".to_string(),
        "up" => "KEYCODE_DPAD_UP".to_string(),
        "down" => "KEYCODE_DPAD_DOWN".to_string(),
        "ret" | "enter" => "KEYCODE_ENTER".to_string(),
        "esc" | "escape" => "KEYCODE_ESCAPE".to_string(),
        other if other.starts_with("keycode_") => other.to_uppercase(),
        other => format!("KEYCODE_{}", other.to_uppercase()),
    }
}

async fn keypress(code: &str) -> std::io::Result<()> {
    let mut child = Command::new("adb")
        .args(["shell", "input", "keyboard", "keyevent", code])
        .kill_on_drop(true)
        .spawn()?;
    child.wait().await?;
    tokio::time::sleep(KEYPRESS_SPACING).await;
    Ok(())
}

async fn approve_permission(buttons: &[String]) {
    for button in buttons {
        let code = keycode_for(button);
        if let Err(e) = keypress(&code).await {
            warn!(code = %code, error = %e, "failed to send permission-approval keypress");
        }
    }
}

async fn watch_logcat(stdout: tokio::process::ChildStdout, buttons: Vec<String>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let bytes = line.as_bytes();
                if contains(bytes, REQUESTED_MARKER) {
                    approve_permission(&buttons).await;
                }
                if contains(bytes, ANY_MARKER) {
                    return;
                }
            }
            Ok(None) | Err(_) => return,
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len().max(1)).any(|w| w == needle)
}

#[derive(Default)]
pub struct PermissionApprover {
    task: Option<JoinHandle<()>>,
}

impl PermissionApprover {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ensure_approved(&mut self, session: &SessionHandle) -> anyhow::Result<()> {
        let mut child = Command::new("adb")
            .args(["logcat"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("adb logcat spawned without a stdout pipe"))?;

        *session.adb_proc.lock().await = Some(child);

        let buttons = session.config.permission_approve_buttons.clone();
        let task = tokio::spawn(watch_logcat(stdout, buttons));
        self.task = Some(task);

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.kill_adb(session).await;
        Ok(())
    }

    async fn kill_adb(&self, session: &SessionHandle) {
        if let Some(mut child) = session.adb_proc.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }

    async fn cancel_in_flight(&mut self, session: &SessionHandle) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.kill_adb(session).await;
    }
}

#[async_trait]
impl Worker for PermissionApprover {
    fn name(&self) -> &str {
        "Permission Approver"
    }

    async fn enter(&mut self, state: OrchestratorState, session: &SessionHandle) -> TransitionOutcome {
        match state {
            OrchestratorState::Job => {
                if !session.config.permission_approve {
                    return TransitionOutcome::Noop;
                }
                match self.ensure_approved(session).await {
                    Ok(()) => {
                        info!("USB permission watcher settled");
                        TransitionOutcome::Done
                    }
                    Err(e) => TransitionOutcome::Fail(e.to_string()),
                }
            }
            OrchestratorState::Stop => {
                let had_work = self.task.is_some() || session.adb_proc.lock().await.is_some();
                self.cancel_in_flight(session).await;
                if had_work {
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

    #[test]
    fn default_buttons_map_to_expected_keycodes() {
        let buttons = OrchestratorConfig::default().permission_approve_buttons;
        let codes: Vec<String> = buttons.iter().map(|b| keycode_for(b)).collect();
        assert_eq!(codes, vec!["KEYCODE_DPAD_RIGHT", "KEYCODE_DPAD_RIGHT", "KEYCODE_ENTER"]);
    }

    #[test]
    fn unrecognized_button_passes_through_as_keycode() {
        assert_eq!(keycode_for("home"), "KEYCODE_HOME");
        assert_eq!(keycode_for("KEYCODE_BACK"), "KEYCODE_BACK");
    }

    #[tokio::test]
    async fn noop_states_do_not_touch_session() {
        let mut worker = PermissionApprover::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));
        for state in [OrchestratorState::Init, OrchestratorState::QemuUp, OrchestratorState::NetworkUp] {
            assert_eq!(worker.enter(state, &session).await, TransitionOutcome::Noop);
        }
    }

    #[tokio::test]
    async fn disabled_approval_is_noop_at_job() {
        let mut worker = PermissionApprover::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig {
            permission_approve: false,
            ..OrchestratorConfig::default()
        }));
        assert_eq!(worker.enter(OrchestratorState::Job, &session).await, TransitionOutcome::Noop);
    }

    #[tokio::test]
    async fn stop_with_nothing_in_flight_is_noop() {
        let mut worker = PermissionApprover::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));
        assert_eq!(worker.enter(OrchestratorState::Stop, &session).await, TransitionOutcome::Noop);
    }
}
