//! Orchestrator Driver — owns the global state, marches every worker
//! through it in lock-step, enforces per-state deadlines, propagates
//! termination-signal cancellation, and guarantees `STOP` runs for every
//! worker regardless of what came before.
//!
//! Shutdown signaling uses a `watch` channel rather than `Notify` so a
//! signal that arrives between barriers isn't silently missed.

use crate::color;
use crate::config::OrchestratorConfig;
use crate::session::{SessionHandle, SessionState};
use crate::state::{OrchestratorState, TransitionOutcome};
use crate::worker::Worker;
use crate::workers::{emulator::EmulatorManager, job::TestJobRunner, logcapture::LogCapturer, permission::PermissionApprover, recorder::ScreenRecorder, virtwifi::VirtWifiInstaller};
use crate::EXIT_ORCHESTRATION_FAILURE;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const STOP_PER_WORKER_BUDGET: Duration = Duration::from_secs(10);
const QEMU_UP_BUDGET: Duration = Duration::from_secs(25 * 60);
const NETWORK_UP_BUDGET: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
struct FatalFailure {
    worker: String,
    state: OrchestratorState,
    reason: String,
}

#[derive(Clone, Copy)]
enum Hook {
    Enter,
    Exit,
}

type DispatchResults = Vec<(String, TransitionOutcome)>;

/// The multi-worker finite-state-machine orchestrator.
pub struct Orchestrator {
    session: SessionHandle,
    workers: Vec<Box<dyn Worker>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let session: SessionHandle = Arc::new(SessionState::new(config));
        let mut workers: Vec<Box<dyn Worker>> = vec![Box::new(EmulatorManager::new())];

        if session.config.virtwifi_hack {
            workers.push(Box::new(VirtWifiInstaller::new()));
        }
        if session.config.permission_approve {
            workers.push(Box::new(PermissionApprover::new()));
        }
        if session.config.vnc_recorder {
            workers.push(Box::new(ScreenRecorder::new()));
        }
        workers.push(Box::new(TestJobRunner::new()));
        workers.push(Box::new(LogCapturer::new()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            session,
            workers,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Construct with an explicit worker set, bypassing the config-driven
    /// registration above — used by tests that want to observe the
    /// barrier/cancellation/failure behavior without real workers.
    #[cfg(test)]
    pub fn with_workers(config: OrchestratorConfig, workers: Vec<Box<dyn Worker>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            session: Arc::new(SessionState::new(config)),
            workers,
            shutdown_tx,
            shutdown_rx,
        }
    }

    fn deadline_for(&self, state: OrchestratorState) -> Option<Duration> {
        match state {
            OrchestratorState::Init | OrchestratorState::Job => None,
            OrchestratorState::QemuUp => Some(self.session.clock.scaled(QEMU_UP_BUDGET)),
            OrchestratorState::NetworkUp => Some(self.session.clock.scaled(NETWORK_UP_BUDGET)),
            OrchestratorState::Stop => Some(STOP_PER_WORKER_BUDGET),
        }
    }

    /// Installs SIGTERM/SIGINT handlers that request a forced transition
    /// to `Stop`. Spawned once; flips the shared `watch` flag at most once
    /// per run. A `watch` channel is level-triggered — unlike `Notify`, a
    /// signal that lands between two barriers (when nothing is awaiting
    /// it yet) is still observed by the next `dispatch_all` call instead
    /// of being silently dropped.
    #[cfg(unix)]
    fn install_signal_handlers(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, forcing teardown"),
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, forcing teardown"),
            }
            let _ = shutdown_tx.send(true);
        });
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&self) {}

    async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped without ever requesting shutdown: park forever,
        // the other `select!` branch will win.
        std::future::pending::<()>().await;
    }

    /// Invokes `hook(state)` on every worker concurrently, each wrapped in
    /// `deadline` if present. When `cancellable`, each worker's own call is
    /// individually raced against a forced shutdown — dropping that
    /// worker's in-flight future cancels it cooperatively at its next
    /// suspension point — while the task that raced it still owns and
    /// returns the `Box<dyn Worker>` either way, so ownership is never
    /// lost on the cancellation path. `Stop` itself is dispatched with
    /// `cancellable = false` since it must run to completion regardless of
    /// further signals. Workers are handed out to their own tasks and
    /// handed back once settled so the same worker instances persist from
    /// one state to the next.
    async fn dispatch_all(
        &mut self,
        hook: Hook,
        state: OrchestratorState,
        deadline: Option<Duration>,
        cancellable: bool,
    ) -> DispatchResults {
        let workers = std::mem::take(&mut self.workers);
        let n = workers.len();
        let mut set: JoinSet<(usize, Box<dyn Worker>, String, TransitionOutcome)> = JoinSet::new();

        for (idx, mut worker) in workers.into_iter().enumerate() {
            let session = self.session.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            set.spawn(async move {
                let name = worker.name().to_string();
                let call = async {
                    match hook {
                        Hook::Enter => worker.enter(state, &session).await,
                        Hook::Exit => worker.exit(state, &session).await,
                    }
                };
                let timed = async {
                    match deadline {
                        Some(d) => match tokio::time::timeout(d, call).await {
                            Ok(outcome) => outcome,
                            Err(_) => TransitionOutcome::Fail(format!("timed out (budget {d:?})")),
                        },
                        None => call.await,
                    }
                };
                let outcome = if cancellable {
                    tokio::select! {
                        outcome = timed => outcome,
                        _ = Self::wait_for_shutdown(shutdown_rx) => {
                            TransitionOutcome::Fail("cancelled by forced-shutdown signal".to_string())
                        }
                    }
                } else {
                    timed.await
                };
                (idx, worker, name, outcome)
            });
        }

        let mut slots: Vec<Option<Box<dyn Worker>>> = (0..n).map(|_| None).collect();
        let mut results: Vec<Option<(String, TransitionOutcome)>> = (0..n).map(|_| None).collect();

        while let Some(joined) = set.join_next().await {
            if let Ok((idx, worker, name, outcome)) = joined {
                slots[idx] = Some(worker);
                results[idx] = Some((name, outcome));
            }
        }

        self.workers = slots.into_iter().flatten().collect();
        results.into_iter().flatten().collect()
    }

    async fn enter_all(&mut self, state: OrchestratorState, deadline: Option<Duration>) -> DispatchResults {
        self.dispatch_all(Hook::Enter, state, deadline, true).await
    }

    async fn exit_all(&mut self, state: OrchestratorState) {
        // Exit hooks are symmetric no-ops for almost every worker in this
        // system; give them a generous fixed budget rather than the next
        // state's (unrelated) entry deadline.
        let _ = self.dispatch_all(Hook::Exit, state, Some(Duration::from_secs(30)), true).await;
    }

    /// Runs the full lifecycle and returns the process exit code.
    pub async fn run(mut self) -> i32 {
        self.install_signal_handlers();

        let mut fatal: Option<FatalFailure> = None;
        let mut last_entered: Option<OrchestratorState> = None;
        let mut cancelled = false;

        for state in OrchestratorState::FORWARD_SEQUENCE {
            if let Some(prev) = last_entered {
                self.exit_all(prev).await;
            }

            color::success(&format!("==> entering {}", state.label()));
            let deadline = self.deadline_for(state);
            let results = self.enter_all(state, deadline).await;
            last_entered = Some(state);
            for (worker, outcome) in results {
                match outcome {
                    TransitionOutcome::Done => info!(worker = %worker, state = state.label(), "done"),
                    TransitionOutcome::Noop => {}
                    TransitionOutcome::Fail(reason) => {
                        color::failure(&format!("{worker} failed entering {}: {reason}", state.label()));
                        if fatal.is_none() {
                            fatal = Some(FatalFailure {
                                worker,
                                state,
                                reason,
                            });
                        }
                    }
                }
            }

            // A forced-shutdown signal cuts every in-flight worker call
            // short (see `dispatch_all`'s per-task race) rather than
            // aborting the barrier outright, so ownership of every
            // `Box<dyn Worker>` is preserved for the STOP dispatch below.
            if *self.shutdown_rx.borrow() {
                cancelled = true;
                break;
            }
            if fatal.is_some() {
                break;
            }
        }

        // Whatever state we last successfully entered — whether the
        // forward walk completed, failed partway, or was cancelled — gets
        // its exit hook before teardown.
        if let Some(prev) = last_entered {
            self.exit_all(prev).await;
        }

        color::warn("==> entering STOP");
        if cancelled {
            // STOP itself is uncancellable by spec; dispatched below with
            // `cancellable = false`, so a second signal during teardown is
            // swallowed, not honored.
            error!("ignoring forced-shutdown signal, STOP always runs to completion");
        }
        let stop_results = self
            .dispatch_all(Hook::Enter, OrchestratorState::Stop, Some(STOP_PER_WORKER_BUDGET), false)
            .await;
        for (worker, outcome) in stop_results {
            if let TransitionOutcome::Fail(reason) = outcome {
                warn!(worker = %worker, reason = %reason, "STOP hook failed, continuing teardown of remaining workers");
            }
        }

        if let Some(failure) = &fatal {
            error!(worker = %failure.worker, state = failure.state.label(), reason = %failure.reason, "orchestration failed");
            return EXIT_ORCHESTRATION_FAILURE;
        }
        if cancelled {
            warn!("orchestration cancelled by termination signal");
            return EXIT_ORCHESTRATION_FAILURE;
        }

        match *self.session.job_exit_code.lock().await {
            Some(code) => code,
            None => EXIT_ORCHESTRATION_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWorker {
        name: &'static str,
        enters: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        fail_at: Option<OrchestratorState>,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        fn name(&self) -> &str {
            self.name
        }

        async fn enter(&mut self, state: OrchestratorState, _session: &SessionHandle) -> TransitionOutcome {
            self.enters.fetch_add(1, Ordering::SeqCst);
            if state == OrchestratorState::Stop {
                self.stops.fetch_add(1, Ordering::SeqCst);
                return TransitionOutcome::Done;
            }
            if Some(state) == self.fail_at {
                return TransitionOutcome::Fail("boom".to_string());
            }
            if state == OrchestratorState::Job {
                return TransitionOutcome::Noop;
            }
            TransitionOutcome::Done
        }
    }

    #[tokio::test]
    async fn every_worker_sees_stop_exactly_once_on_the_happy_path() {
        let stops = Arc::new(AtomicUsize::new(0));
        let enters = Arc::new(AtomicUsize::new(0));
        let worker = Box::new(CountingWorker {
            name: "counter",
            enters: enters.clone(),
            stops: stops.clone(),
            fail_at: None,
        });
        let orchestrator = Orchestrator::with_workers(
            OrchestratorConfig {
                job_command: "true".to_string(),
                ..OrchestratorConfig::default()
            },
            vec![worker],
        );
        let _code = orchestrator.run().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_fatal_failure_forces_stop_and_nonzero_exit() {
        let stops = Arc::new(AtomicUsize::new(0));
        let enters = Arc::new(AtomicUsize::new(0));
        let worker = Box::new(CountingWorker {
            name: "flaky",
            enters: enters.clone(),
            stops: stops.clone(),
            fail_at: Some(OrchestratorState::NetworkUp),
        });
        let orchestrator = Orchestrator::with_workers(OrchestratorConfig::default(), vec![worker]);
        let code = orchestrator.run().await;
        assert_eq!(code, EXIT_ORCHESTRATION_FAILURE);
        assert_eq!(stops.load(Ordering::SeqCst), 1, "STOP must still run after a fatal failure");
    }

    #[tokio::test]
    async fn stop_runs_for_every_worker_even_when_one_fails_at_stop() {
        struct AlwaysFailsAtStop(Arc<AtomicUsize>);
        #[async_trait]
        impl Worker for AlwaysFailsAtStop {
            fn name(&self) -> &str {
                "always-fails-at-stop"
            }
            async fn enter(&mut self, state: OrchestratorState, _session: &SessionHandle) -> TransitionOutcome {
                if state == OrchestratorState::Stop {
                    return TransitionOutcome::Fail("teardown blew up".to_string());
                }
                TransitionOutcome::Noop
            }
        }

        let stops = Arc::new(AtomicUsize::new(0));
        let well_behaved = Box::new(CountingWorker {
            name: "well-behaved",
            enters: Arc::new(AtomicUsize::new(0)),
            stops: stops.clone(),
            fail_at: None,
        });
        let orchestrator = Orchestrator::with_workers(
            OrchestratorConfig {
                job_command: "true".to_string(),
                ..OrchestratorConfig::default()
            },
            vec![Box::new(AlwaysFailsAtStop(Arc::new(AtomicUsize::new(0)))), well_behaved],
        );
        let _code = orchestrator.run().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1, "a failing STOP hook must not prevent others from running");
    }

    #[tokio::test]
    async fn forced_shutdown_mid_enter_still_runs_stop_on_the_same_worker() {
        struct StuckWorker {
            stops: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Worker for StuckWorker {
            fn name(&self) -> &str {
                "stuck"
            }
            async fn enter(&mut self, state: OrchestratorState, _session: &SessionHandle) -> TransitionOutcome {
                match state {
                    OrchestratorState::Job => {
                        // Never resolves on its own; only a forced shutdown
                        // can cut it short.
                        std::future::pending::<()>().await;
                        unreachable!("pending future never resolves");
                    }
                    OrchestratorState::Stop => {
                        self.stops.fetch_add(1, Ordering::SeqCst);
                        TransitionOutcome::Done
                    }
                    _ => TransitionOutcome::Done,
                }
            }
        }

        let stops = Arc::new(AtomicUsize::new(0));
        let worker = Box::new(StuckWorker { stops: stops.clone() });
        let orchestrator = Orchestrator::with_workers(
            OrchestratorConfig {
                job_command: "true".to_string(),
                ..OrchestratorConfig::default()
            },
            vec![worker],
        );

        let shutdown_tx = orchestrator.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = shutdown_tx.send(true);
        });

        let code = tokio::time::timeout(Duration::from_secs(5), orchestrator.run())
            .await
            .expect("a forced-shutdown signal must cut the stuck worker short instead of hanging run()");
        assert_eq!(code, EXIT_ORCHESTRATION_FAILURE);
        assert_eq!(
            stops.load(Ordering::SeqCst),
            1,
            "the worker stuck mid-enter must not be lost — it has to still be the instance STOP runs on"
        );
    }
}
