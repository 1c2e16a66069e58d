//! Emulator Manager — owns the emulator process lifecycle end to end:
//! spawn, connect the serial/monitor consoles, wait for the guest to
//! settle, debloat it, and tear it all down on `Stop`.

use crate::color;
use crate::session::{QemuHandle, SessionHandle};
use crate::shell::{self, ByteAccumulator, SocketLink};
use crate::state::{OrchestratorState, TransitionOutcome};
use crate::worker::Worker;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SERIAL_SOCK_PATH: &str = "/tmp/qemu-android.sock";
const MONITOR_SOCK_PATH: &str = "/tmp/qemu-monitor.sock";

/// Detects host-kernel virtualization acceleration availability. A trait
/// so tests can fake the result instead of depending on `/dev/kvm`.
pub trait AccelDetector: Send + Sync {
    fn detect(&self) -> bool;
}

/// Checks `/dev/kvm` accessibility on Linux hosts.
pub struct KvmDetector;

impl AccelDetector for KvmDetector {
    fn detect(&self) -> bool {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm")
            .is_ok()
    }
}

pub struct EmulatorManager {
    detector: Box<dyn AccelDetector>,
    reader_tasks: Vec<JoinHandle<()>>,
}

impl EmulatorManager {
    pub fn new() -> Self {
        Self::with_detector(Box::new(KvmDetector))
    }

    pub fn with_detector(detector: Box<dyn AccelDetector>) -> Self {
        Self {
            detector,
            reader_tasks: Vec::new(),
        }
    }

    async fn ensure_qemu(&mut self, session: &SessionHandle) -> Result<()> {
        let mut qemu_args = session.config.qemu_args.clone();
        let mut kvm = self.detector.detect();

        if kvm {
            color::success("KVM is available");
        } else {
            color::failure("KVM is not available, performance may be very low");
        }

        if !kvm && session.config.qemu_force_kvm {
            color::warn("Ignoring and forcing KVM on as requested");
            kvm = true;
        }

        if kvm {
            if !qemu_args.iter().any(|a| a == "-enable-kvm") {
                qemu_args.insert(0, "-enable-kvm".to_string());
            }
        } else {
            session.clock.set_multiplier(5);
            qemu_args.retain(|a| a != "-enable-kvm");
        }

        if session.config.qemu_debug {
            debug!(args = ?qemu_args, "QEMU args");
        }

        let mut cmd = Command::new(&session.config.qemu_bin);
        cmd.args(&qemu_args).kill_on_drop(true);
        if let Some(wd) = &session.config.qemu_workdir {
            cmd.current_dir(wd);
        }
        if session.config.qemu_debug {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn emulator binary '{}'", session.config.qemu_bin))?;
        let pid = child.id().context("spawned emulator process has no pid")?;
        info!(pid, "emulator spawned");

        *session.qemu.lock().await = Some(QemuHandle { child, pid });

        tokio::time::sleep(Duration::from_secs(1)).await;
        session.stop_debug.store(false, Ordering::SeqCst);

        if !shell::wait_exists(Path::new(SERIAL_SOCK_PATH), Duration::from_secs(30)).await {
            bail!("timed out waiting for serial socket at {SERIAL_SOCK_PATH}");
        }
        let (serial_read, serial_write) = UnixStream::connect(SERIAL_SOCK_PATH)
            .await
            .context("failed to connect to serial socket")?
            .into_split();
        *session.serial.lock().await = Some(SocketLink::new(serial_write));
        self.reader_tasks.push(spawn_reader(
            "VM",
            serial_read,
            session.serial_buffer.clone(),
            session.stop_debug.clone(),
            session.config.qemu_debug,
        ));
        color::success("Connected to QEMU serial socket");

        if !shell::wait_exists(Path::new(MONITOR_SOCK_PATH), Duration::from_secs(30)).await {
            bail!("timed out waiting for monitor socket at {MONITOR_SOCK_PATH}");
        }
        let (monitor_read, monitor_write) = UnixStream::connect(MONITOR_SOCK_PATH)
            .await
            .context("failed to connect to monitor socket")?
            .into_split();
        *session.monitor.lock().await = Some(SocketLink::new(monitor_write));
        self.reader_tasks.push(spawn_reader(
            "QEMU",
            monitor_read,
            session.monitor_buffer.clone(),
            session.stop_debug.clone(),
            session.config.qemu_debug,
        ));
        color::success("Connected to QEMU monitor socket");

        // Wait for a root shell to show up over serial.
        let boot_timeout = session.clock.scaled(Duration::from_secs(20 * 60));
        if !shell::wait_shell_prompt(&session.serial_buffer, 0, boot_timeout).await {
            color::failure("Warning: timeout while waiting for shell prompt");
            bail!("timed out waiting for shell prompt during boot");
        }

        self.send_and_sync(session, "stty cols 194", Duration::from_secs(30)).await?;
        self.send_and_sync(session, "stty rows 80", Duration::from_secs(30)).await?;

        session.clock.sleep_scaled(Duration::from_secs(10)).await;

        let pm_since = session.serial_buffer.len().await;
        self.write_serial(session, "pm path android && echo PM-READY\n").await?;
        let pm_timeout = session.clock.scaled(Duration::from_secs(60));
        if shell::wait_for_needle(&session.serial_buffer, pm_since, b"PM-READY", pm_timeout).await {
            color::success("Package manager is running");
        } else {
            color::failure("Warning: timeout waiting for package manager");
        }

        self.debloat(session).await?;
        color::success("System debloated");

        tokio::time::sleep(Duration::from_secs(10)).await;
        let resync_since = session.serial_buffer.len().await;
        shell::wait_shell_prompt(&session.serial_buffer, resync_since, Duration::from_secs(30)).await;

        color::success("VM processes (top)");
        {
            let mut guard = session.monitor.lock().await;
            if let Some(link) = guard.as_mut() {
                let _ = link.write_all(b"top\n").await;
            }
        }
        tokio::time::sleep(Duration::from_millis(2700)).await;
        {
            let mut guard = session.monitor.lock().await;
            if let Some(link) = guard.as_mut() {
                let _ = link.write_all(b"q").await;
            }
        }

        let absent_timeout = session.clock.scaled(Duration::from_secs(40));
        {
            let mut guard = session.serial.lock().await;
            let link = guard.as_mut().context("serial link not connected")?;
            shell::run_and_not_expect(
                link,
                &session.serial_buffer,
                b"ps -A | grep dex2oat\n",
                b"dex2oat",
                Duration::from_secs(2),
                absent_timeout,
            )
            .await;
        }
        color::success("dex2oat terminated");

        let absent_timeout = session.clock.scaled(Duration::from_secs(40));
        let bootanim_gone = {
            let mut guard = session.serial.lock().await;
            let link = guard.as_mut().context("serial link not connected")?;
            shell::run_and_not_expect(
                link,
                &session.serial_buffer,
                b"ps -A | grep bootanimation\n",
                b"bootanimation",
                Duration::from_secs(2),
                absent_timeout,
            )
            .await
        };
        if bootanim_gone {
            color::success("Boot animation terminated");
        } else {
            color::failure("Warning: timeout waiting for boot animation to stop");
        }

        Ok(())
    }

    async fn write_serial(&self, session: &SessionHandle, data: &str) -> Result<()> {
        let mut guard = session.serial.lock().await;
        let link = guard.as_mut().context("serial link not connected")?;
        link.write_all(data.as_bytes()).await?;
        Ok(())
    }

    /// Send a line over serial and wait for the prompt, holding the
    /// serial lock across both — the single-writer critical section.
    async fn send_and_sync(&self, session: &SessionHandle, line: &str, timeout: Duration) -> Result<()> {
        let since = session.serial_buffer.len().await;
        {
            let mut guard = session.serial.lock().await;
            let link = guard.as_mut().context("serial link not connected")?;
            link.write_line(line).await?;
            let scaled = session.clock.scaled(timeout);
            if !shell::wait_shell_prompt(&session.serial_buffer, since, scaled).await {
                bail!("timed out waiting for prompt after '{line}'");
            }
        }
        Ok(())
    }

    async fn debloat(&self, session: &SessionHandle) -> Result<()> {
        let mut batch = String::from("(\n");
        for package in &session.config.disable_packages {
            batch.push_str(&format!("pm disable --user 0 {package}\n"));
        }
        batch.push_str(")\n");

        let since = session.serial_buffer.len().await;
        {
            let mut guard = session.serial.lock().await;
            let link = guard.as_mut().context("serial link not connected")?;
            link.write_all(batch.as_bytes()).await?;
        }
        let timeout = session.clock.scaled(Duration::from_secs(30));
        if !shell::wait_shell_prompt(&session.serial_buffer, since, timeout).await {
            bail!("timed out waiting for prompt after debloat batch");
        }
        Ok(())
    }

    async fn ensure_qemu_stopped(&mut self, session: &SessionHandle) -> Result<bool> {
        let Some(handle) = session.qemu.lock().await.take() else {
            // Already torn down — a second `Stop` call is a no-op.
            return Ok(false);
        };
        let QemuHandle { mut child, pid } = handle;

        session.stop_debug.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;

        if let Some(mut link) = session.serial.lock().await.take() {
            let _ = link.write_all(b"").await; // flush any pending writes before close
        }
        session.serial.lock().await.take();
        session.monitor.lock().await.take();

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "failed to send SIGTERM to emulator"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        if matches!(child.try_wait(), Ok(None)) {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "failed to send SIGKILL to emulator"),
            }
        }
        let _ = child.wait().await;

        for mut handle in self.reader_tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle).await.is_err() {
                handle.abort();
            }
        }

        Ok(true)
    }
}

impl Default for EmulatorManager {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reader(
    tag: &'static str,
    read_half: tokio::net::unix::OwnedReadHalf,
    buffer: Arc<ByteAccumulator>,
    stop_debug: Arc<std::sync::atomic::AtomicBool>,
    debug_echo: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(read_half);
        let mut line = Vec::new();
        while !stop_debug.load(Ordering::SeqCst) {
            line.clear();
            match tokio::time::timeout(Duration::from_secs(1), reader.read_until(b'\n', &mut line)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {
                    buffer.push(&line).await;
                    if debug_echo {
                        let stripped = shell::strip_ansi(&line);
                        print!("{tag}: {}", String::from_utf8_lossy(&stripped));
                    }
                }
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }
    })
}

#[async_trait]
impl Worker for EmulatorManager {
    fn name(&self) -> &str {
        "Emulator Manager"
    }

    async fn enter(&mut self, state: OrchestratorState, session: &SessionHandle) -> TransitionOutcome {
        match state {
            OrchestratorState::QemuUp => match self.ensure_qemu(session).await {
                Ok(()) => TransitionOutcome::Done,
                Err(e) => TransitionOutcome::Fail(e.to_string()),
            },
            OrchestratorState::Stop => match self.ensure_qemu_stopped(session).await {
                Ok(true) => TransitionOutcome::Done,
                Ok(false) => TransitionOutcome::Noop,
                Err(e) => TransitionOutcome::Fail(e.to_string()),
            },
            _ => TransitionOutcome::Noop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::session::SessionState;

    struct FakeDetector(bool);
    impl AccelDetector for FakeDetector {
        fn detect(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn noop_states_do_not_touch_session() {
        let mut worker = EmulatorManager::with_detector(Box::new(FakeDetector(true)));
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));

        for state in [OrchestratorState::Init, OrchestratorState::NetworkUp, OrchestratorState::Job] {
            let outcome = worker.enter(state, &session).await;
            assert_eq!(outcome, TransitionOutcome::Noop);
        }
        assert!(session.qemu.lock().await.is_none());
        assert_eq!(session.clock.multiplier(), 1);
    }

    #[tokio::test]
    async fn no_acceleration_sets_multiplier_to_five_before_any_spawn_attempt() {
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig {
            qemu_bin: "/definitely/not/a/real/emulator-binary".to_string(),
            ..OrchestratorConfig::default()
        }));
        let mut worker = EmulatorManager::with_detector(Box::new(FakeDetector(false)));

        let outcome = worker.enter(OrchestratorState::QemuUp, &session).await;
        assert!(outcome.is_fail());
        assert_eq!(session.clock.multiplier(), 5);
    }

    #[tokio::test]
    async fn forced_kvm_skips_multiplier_even_when_unavailable() {
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig {
            qemu_bin: "/definitely/not/a/real/emulator-binary".to_string(),
            qemu_force_kvm: true,
            ..OrchestratorConfig::default()
        }));
        let mut worker = EmulatorManager::with_detector(Box::new(FakeDetector(false)));

        let _ = worker.enter(OrchestratorState::QemuUp, &session).await;
        assert_eq!(session.clock.multiplier(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_with_no_live_emulator() {
        let session: SessionHandle = Arc::new(SessionState::new(OrchestratorConfig::default()));
        let mut worker = EmulatorManager::with_detector(Box::new(FakeDetector(true)));

        let first = worker.enter(OrchestratorState::Stop, &session).await;
        let second = worker.enter(OrchestratorState::Stop, &session).await;
        assert_eq!(first, TransitionOutcome::Noop);
        assert_eq!(second, TransitionOutcome::Noop);
    }
}
