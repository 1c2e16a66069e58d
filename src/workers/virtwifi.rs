//! VirtWifi Installer — enables the guest's simulated Wi-Fi service and
//! sideloads the VirtWifi connector APK over the serial console.
//!
//! The APK has no sane transport but the guest serial line, so it goes
//! over as a base64 heredoc, chunked at 1 KiB with a 100 ms pause between
//! chunks — the guest shell is line-buffered and drops bytes on larger
//! bursts.

use crate::session::SessionHandle;
use crate::shell;
use crate::state::{OrchestratorState, TransitionOutcome};
use crate::worker::Worker;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::Duration;
use tracing::info;

const CHUNK_SIZE: usize = 1024;
const CHUNK_PAUSE: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct VirtWifiInstaller;

impl VirtWifiInstaller {
    pub fn new() -> Self {
        Self
    }

    async fn ensure_virtwifi(&self, session: &SessionHandle) -> Result<()> {
        let apk_path = &session.config.virtwificonnector_apk;
        let apk_bytes = tokio::fs::read(apk_path)
            .await
            .with_context(|| format!("VirtWifiConnector APK path '{apk_path}' does not exist or is inaccessible"))?;
        let apk_b64 = BASE64.encode(apk_bytes);

        self.send_and_sync(session, "svc wifi enable", Duration::from_secs(30)).await?;

        // Heredoc: the opening line, then the base64 payload in 1 KiB
        // chunks, then the terminator. No single prompt-wait spans the
        // whole heredoc — the shell doesn't echo a prompt until `EOF`.
        let since = session.serial_buffer.len().await;
        {
            let mut guard = session.serial.lock().await;
            let link = guard.as_mut().context("serial link not connected")?;
            link.write_line("base64 -d > /data/local/tmp/app.apk << EOF").await?;
            for chunk in apk_b64.as_bytes().chunks(CHUNK_SIZE) {
                link.write_all(chunk).await?;
                link.write_all(b"\n").await?;
                tokio::time::sleep(CHUNK_PAUSE).await;
            }
            link.write_line("EOF").await?;
        }
        let timeout = session.clock.scaled(Duration::from_secs(120));
        if !shell::wait_shell_prompt(&session.serial_buffer, since, timeout).await {
            bail!("timed out waiting for prompt after APK heredoc");
        }

        self.send_and_sync(session, "pm install /data/local/tmp/app.apk", Duration::from_secs(60))
            .await?;
        self.send_and_sync(session, "rm /data/local/tmp/app.apk", Duration::from_secs(30)).await?;
        self.send_and_sync(
            session,
            "am start -a android.intent.action.MAIN -n eu.depau.virtwificonnector/.MainActivity",
            Duration::from_secs(30),
        )
        .await?;

        // Dismiss the "old API" warning dialog.
        self.send_and_sync(session, "input keyevent KEYCODE_ESCAPE", Duration::from_secs(30))
            .await?;

        session.clock.sleep_scaled(Duration::from_secs(5)).await;
        Ok(())
    }

    async fn send_and_sync(&self, session: &SessionHandle, line: &str, timeout: Duration) -> Result<()> {
        let since = session.serial_buffer.len().await;
        {
            let mut guard = session.serial.lock().await;
            let link = guard.as_mut().context("serial link not connected")?;
            link.write_line(line).await?;
        }
        let scaled = session.clock.scaled(timeout);
        if !shell::wait_shell_prompt(&session.serial_buffer, since, scaled).await {
            bail!("timed out waiting for prompt after '{line}'");
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for VirtWifiInstaller {
    fn name(&self) -> &str {
        "VirtWifi Installer"
    }

    async fn enter(&mut self, state: OrchestratorState, session: &SessionHandle) -> TransitionOutcome {
        if state != OrchestratorState::NetworkUp {
            return TransitionOutcome::Noop;
        }
        if !session.config.virtwifi_hack {
            return TransitionOutcome::Noop;
        }
        let timeout = session.clock.scaled(Duration::from_secs(90));
        match tokio::time::timeout(timeout, self.ensure_virtwifi(session)).await {
            Ok(Ok(())) => {
                info!("VirtWifi installed");
                TransitionOutcome::Done
            }
            Ok(Err(e)) => TransitionOutcome::Fail(e.to_string()),
            Err(_) => TransitionOutcome::Fail("timed out installing VirtWifi".to_string()),
        }
    }

    // Nothing persistent on the host side; STOP is a no-op.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::session::SessionState;
    use std::sync::Arc;

    #[tokio::test]
    async fn noop_states_do_not_touch_session() {
        let mut worker = VirtWifiInstaller::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));
        for state in [OrchestratorState::Init, OrchestratorState::QemuUp, OrchestratorState::Job, OrchestratorState::Stop] {
            assert_eq!(worker.enter(state, &session).await, TransitionOutcome::Noop);
        }
    }

    #[tokio::test]
    async fn disabled_hack_is_noop_even_at_network_up() {
        let mut worker = VirtWifiInstaller::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig {
            virtwifi_hack: false,
            ..OrchestratorConfig::default()
        }));
        assert_eq!(worker.enter(OrchestratorState::NetworkUp, &session).await, TransitionOutcome::Noop);
    }

    #[test]
    fn apk_payload_chunks_at_one_kibibyte_with_a_short_last_chunk() {
        let payload = vec![b'A'; CHUNK_SIZE * 3 + 17];
        let chunks: Vec<&[u8]> = payload.chunks(CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 4);
        assert!(chunks[..3].iter().all(|c| c.len() == CHUNK_SIZE));
        assert_eq!(chunks[3].len(), 17);
    }

    #[tokio::test]
    async fn missing_apk_is_a_clear_config_failure() {
        let mut worker = VirtWifiInstaller::new();
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig {
            virtwifi_hack: true,
            virtwificonnector_apk: "/definitely/not/a/real/apk".to_string(),
            ..OrchestratorConfig::default()
        }));
        let outcome = worker.enter(OrchestratorState::NetworkUp, &session).await;
        assert!(outcome.is_fail());
    }
}
