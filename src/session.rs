//! Shared session state — the single in-process object through which
//! workers communicate. Owned by the [`crate::driver::Orchestrator`],
//! handed to every worker by reference. Every field has exactly one
//! documented writer (see `SPEC_FULL.md` §3); this module only enforces
//! the ones that matter at the type level (the serial/monitor links live
//! behind a lock that must be held across a write *and* the matching
//! prompt wait, which is what makes "one writer at a time" structural
//! rather than conventional).

use crate::clock::ScaledClock;
use crate::config::OrchestratorConfig;
use crate::shell::{ByteAccumulator, SocketLink};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::Mutex;

/// A spawned emulator process and the bits of its identity every worker
/// (well, just the Emulator Manager) needs to hold onto.
#[derive(Debug)]
pub struct QemuHandle {
    pub child: Child,
    pub pid: u32,
}

#[derive(Debug, Default)]
pub struct SessionState {
    /// Set once, at construction, by the driver.
    pub config: OrchestratorConfig,

    /// Owner: Emulator Manager. Set exactly once, before `NetworkUp`.
    pub clock: ScaledClock,

    /// Owner: Emulator Manager.
    pub qemu: Mutex<Option<QemuHandle>>,

    /// Owner: Emulator Manager (create/destroy). Held across a write and
    /// its matching prompt wait by whichever worker currently holds the
    /// state's serial turn.
    pub serial: Mutex<Option<SocketLink>>,
    /// Owner: Emulator Manager, exclusively.
    pub monitor: Mutex<Option<SocketLink>>,

    /// Appended to only by the serial reader task spawned by the
    /// Emulator Manager.
    pub serial_buffer: Arc<ByteAccumulator>,
    /// Appended to only by the monitor reader task spawned by the
    /// Emulator Manager.
    pub monitor_buffer: Arc<ByteAccumulator>,

    /// Owner: Emulator Manager. Signals the background reader tasks to
    /// stop polling their sockets.
    pub stop_debug: Arc<AtomicBool>,

    /// Owner: Permission Approver.
    pub adb_proc: Mutex<Option<Child>>,
    /// Owner: Screen Recorder.
    pub vnc_recorder_proc: Mutex<Option<Child>>,
    /// Owner: Test Job Runner. Read by the driver for the final exit code.
    pub job_exit_code: Mutex<Option<i32>>,
}

impl SessionState {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            clock: ScaledClock::new(),
            qemu: Mutex::new(None),
            serial: Mutex::new(None),
            monitor: Mutex::new(None),
            serial_buffer: Arc::new(ByteAccumulator::new()),
            monitor_buffer: Arc::new(ByteAccumulator::new()),
            stop_debug: Arc::new(AtomicBool::new(false)),
            adb_proc: Mutex::new(None),
            vnc_recorder_proc: Mutex::new(None),
            job_exit_code: Mutex::new(None),
        }
    }
}

/// Handle every worker is given a clone of; cheap to clone, shares the
/// single underlying [`SessionState`].
pub type SessionHandle = Arc<SessionState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_session_has_no_live_resources() {
        let session = SessionState::new(OrchestratorConfig::default());
        assert!(session.qemu.lock().await.is_none());
        assert!(session.serial.lock().await.is_none());
        assert!(session.job_exit_code.lock().await.is_none());
        assert_eq!(session.clock.multiplier(), 1);
    }
}
