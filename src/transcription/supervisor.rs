use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::diagnostics::{snapshot_tail, DiagnosticsBuffer, SharedDiagnostics};
use super::dispatcher::{duration_ms, RequestDispatcher};
use super::error::WorkerError;
use super::framer::LineFramer;
use super::launcher::{LaunchMode, ProcessLauncher};
use super::process::{ChildSpawner, ExitOutcome, SpawnedWorker, WorkerReader, WorkerSpawner, WorkerWriter};
use super::protocol::{Envelope, WorkerCommand};

/// How long stdout/stderr may keep delivering lines after the process exits
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// Read buffer size for worker output streams
const READ_CHUNK: usize = 8 * 1024;

/// Supervisor tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Time allowed between spawn and the ready signal
    pub startup_timeout: Duration,
    /// Wait between the dispose notification and the forced kill
    pub dispose_grace: Duration,
    /// Worker stderr lines retained per process
    pub diagnostics_capacity: usize,
    /// Stderr lines attached to error messages
    pub diagnostics_tail: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(45),
            dispose_grace: Duration::from_millis(500),
            diagnostics_capacity: 80,
            diagnostics_tail: 12,
        }
    }
}

/// Observable lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    /// No process
    Idle,
    /// Process spawned, waiting for the ready signal
    Starting,
    /// Process accepting requests
    Ready,
}

/// One live worker process generation
pub struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    dispatcher: Arc<RequestDispatcher>,
    diagnostics: SharedDiagnostics,
    diagnostics_tail: usize,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    startup_timer: Mutex<Option<JoinHandle<()>>>,
    disposing: AtomicBool,
}

impl WorkerHandle {
    /// Generation counter; increments with every spawn
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// OS process id, when known
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Dispatcher bound to this process
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    /// Most recent stderr lines of this process
    #[must_use]
    pub fn diagnostics_tail(&self) -> String {
        snapshot_tail(&self.diagnostics, self.diagnostics_tail)
    }

    /// True once [`WorkerSupervisor::dispose`] has asked this process to stop
    #[must_use]
    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    /// Sends the kill signal; later calls are no-ops
    fn terminate(&self) {
        self.cancel_startup_timer();
        if let Some(kill) = lock(&self.kill).take() {
            tracing::debug!(generation = self.generation, pid = ?self.pid, "terminating worker process");
            let _ = kill.send(());
        }
    }

    fn cancel_startup_timer(&self) {
        if let Some(timer) = lock(&self.startup_timer).take() {
            timer.abort();
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("generation", &self.generation)
            .field("pid", &self.pid)
            .field("pending", &self.dispatcher.pending_count())
            .finish_non_exhaustive()
    }
}

type StartOutcome = Option<Result<(), WorkerError>>;

#[derive(Default)]
enum Phase {
    #[default]
    Idle,
    Starting {
        worker: Arc<WorkerHandle>,
        outcome: watch::Sender<StartOutcome>,
    },
    Ready(Arc<WorkerHandle>),
}

impl Phase {
    const fn worker(&self) -> Option<&Arc<WorkerHandle>> {
        match self {
            Self::Idle => None,
            Self::Starting { worker, .. } | Self::Ready(worker) => Some(worker),
        }
    }

    fn generation(&self) -> Option<u64> {
        self.worker().map(|worker| worker.generation)
    }

    const fn kind(&self) -> SupervisorPhase {
        match self {
            Self::Idle => SupervisorPhase::Idle,
            Self::Starting { .. } => SupervisorPhase::Starting,
            Self::Ready(_) => SupervisorPhase::Ready,
        }
    }
}

#[derive(Default)]
struct WorkerState {
    generation: u64,
    phase: Phase,
    loaded_config_key: Option<String>,
}

/// State shared with the per-process tasks
struct Core {
    state: Mutex<WorkerState>,
    settings: SupervisorSettings,
}

impl Core {
    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        lock(&self.state)
    }

    /// Takes the phase out (leaving `Idle`) if `matches` accepts it
    fn take_phase(&self, matches: impl FnOnce(&Phase) -> bool) -> Option<Phase> {
        let mut state = self.lock_state();
        if !matches(&state.phase) {
            return None;
        }
        state.loaded_config_key = None;
        Some(std::mem::take(&mut state.phase))
    }

    fn mark_ready(&self, generation: u64) {
        let mut state = self.lock_state();
        state.phase = match std::mem::take(&mut state.phase) {
            Phase::Starting { worker, outcome } if worker.generation == generation => {
                worker.cancel_startup_timer();
                tracing::info!(generation, pid = ?worker.pid, "worker ready");
                outcome.send_replace(Some(Ok(())));
                Phase::Ready(worker)
            }
            other => {
                tracing::warn!(generation, "unexpected ready signal ignored");
                other
            }
        };
    }

    fn startup_timed_out(&self, generation: u64) {
        let Some(phase) = self.take_phase(|phase| {
            matches!(phase, Phase::Starting { worker, .. } if worker.generation == generation)
        }) else {
            return;
        };

        let timeout_ms = duration_ms(self.settings.startup_timeout);
        tracing::error!(generation, timeout_ms, "worker did not signal ready in time");
        retire(phase, None, "worker startup timeout", |diagnostics| {
            WorkerError::StartupTimeout {
                timeout_ms,
                diagnostics,
            }
        });
    }

    fn process_exited(&self, generation: u64, outcome: &ExitOutcome) {
        let Some(phase) = self.take_phase(|phase| phase.generation() == Some(generation)) else {
            tracing::debug!(generation, "exit of retired worker ignored");
            return;
        };

        let (code, mut reason) = match outcome {
            Ok(Some(code)) => (Some(*code), format!("exited with code {code}")),
            Ok(None) => (None, "terminated without an exit code".to_owned()),
            Err(e) => (None, format!("failed to wait for worker: {e}")),
        };
        if matches!(phase, Phase::Starting { .. }) {
            reason.push_str(" before signalling ready");
        }

        if phase.worker().is_some_and(|worker| worker.is_disposing()) {
            tracing::info!(generation, code = ?code, "worker exited after dispose");
        } else {
            tracing::warn!(generation, code = ?code, reason = %reason, "worker process exited unexpectedly");
        }
        retire(phase, code, &reason, |diagnostics| {
            WorkerError::process_exit(code, reason.clone(), diagnostics)
        });
    }

    /// Kills the current process (or only `generation`, when given) and resets state
    fn reset(&self, generation: Option<u64>, reason: &str) {
        let Some(phase) = self.take_phase(|phase| {
            generation.is_none_or(|generation| phase.generation() == Some(generation))
        }) else {
            return;
        };

        if let Some(generation) = phase.generation() {
            tracing::info!(generation, reason, "resetting worker");
        }
        retire(phase, None, reason, |diagnostics| {
            WorkerError::process_exit(None, reason, diagnostics)
        });
    }
}

/// Kills a detached phase's process and fails everything waiting on it
fn retire(
    phase: Phase,
    code: Option<i32>,
    reason: &str,
    start_error: impl FnOnce(String) -> WorkerError,
) {
    let (worker, outcome) = match phase {
        Phase::Idle => return,
        Phase::Starting { worker, outcome } => (worker, Some(outcome)),
        Phase::Ready(worker) => (worker, None),
    };

    worker.terminate();
    worker.dispatcher.reject_all(code, reason);
    if let Some(outcome) = outcome {
        outcome.send_replace(Some(Err(start_error(worker.diagnostics_tail()))));
    }
}

/// Owns the single recognition worker process
///
/// The worker is started lazily by [`ensure_started`](Self::ensure_started).
/// At most one process exists at a time; concurrent starters join the start
/// already in flight. Any process fault (spawn failure, startup timeout,
/// unexpected exit) rejects outstanding requests and returns to
/// [`SupervisorPhase::Idle`] so the next call starts a fresh process.
pub struct WorkerSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    spawner: Arc<dyn WorkerSpawner>,
    mode: LaunchMode,
    core: Arc<Core>,
}

impl WorkerSupervisor {
    /// Creates an idle supervisor
    #[must_use]
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        spawner: Arc<dyn WorkerSpawner>,
        mode: LaunchMode,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            launcher,
            spawner,
            mode,
            core: Arc::new(Core {
                state: Mutex::new(WorkerState::default()),
                settings,
            }),
        }
    }

    /// Creates an idle supervisor that spawns real child processes
    #[must_use]
    pub fn with_child_spawner(
        launcher: Arc<dyn ProcessLauncher>,
        mode: LaunchMode,
        settings: SupervisorSettings,
    ) -> Self {
        Self::new(launcher, Arc::new(ChildSpawner), mode, settings)
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> SupervisorPhase {
        self.core.lock_state().phase.kind()
    }

    /// OS process id of the current worker
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.core.lock_state().phase.worker().and_then(|worker| worker.pid)
    }

    /// Supervisor tuning
    #[must_use]
    pub fn settings(&self) -> &SupervisorSettings {
        &self.core.settings
    }

    /// Returns the ready worker, starting one if needed
    ///
    /// # Errors
    /// Returns [`WorkerError::SpawnFailure`], [`WorkerError::StartupTimeout`]
    /// or [`WorkerError::ProcessExit`] if the worker cannot be brought up
    pub async fn ensure_started(&self) -> Result<Arc<WorkerHandle>, WorkerError> {
        let (worker, mut outcome) = {
            let mut state = self.core.lock_state();
            let joined = match &state.phase {
                Phase::Ready(worker) => return Ok(Arc::clone(worker)),
                Phase::Starting { worker, outcome } => Some((Arc::clone(worker), outcome.subscribe())),
                Phase::Idle => None,
            };
            match joined {
                Some(joined) => {
                    tracing::debug!(generation = joined.0.generation, "joining worker start in flight");
                    joined
                }
                None => self.begin_start(&mut state)?,
            }
        };

        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        match settled {
            Some(Ok(())) => Ok(worker),
            Some(Err(e)) => Err(e),
            None => Err(WorkerError::process_exit(
                None,
                "worker start abandoned",
                worker.diagnostics_tail(),
            )),
        }
    }

    /// Config key loaded into the live worker, if any
    #[must_use]
    pub fn loaded_config_key(&self) -> Option<String> {
        let state = self.core.lock_state();
        match state.phase {
            Phase::Ready(_) => state.loaded_config_key.clone(),
            Phase::Idle | Phase::Starting { .. } => None,
        }
    }

    /// Records that `generation` loaded `config_key`
    ///
    /// Returns `false` (recording nothing) if that process is no longer live.
    pub fn mark_loaded(&self, generation: u64, config_key: &str) -> bool {
        let mut state = self.core.lock_state();
        if !matches!(&state.phase, Phase::Ready(worker) if worker.generation == generation) {
            return false;
        }
        state.loaded_config_key = Some(config_key.to_owned());
        true
    }

    /// Forgets the loaded config key without touching the process
    pub fn clear_loaded_config_key(&self) {
        self.core.lock_state().loaded_config_key = None;
    }

    /// Ready worker that has a configuration loaded
    #[must_use]
    pub fn initialized_worker(&self) -> Option<Arc<WorkerHandle>> {
        let state = self.core.lock_state();
        match &state.phase {
            Phase::Ready(worker) if state.loaded_config_key.is_some() => Some(Arc::clone(worker)),
            _ => None,
        }
    }

    /// Kills the worker (only `generation`, when given) and returns to idle
    ///
    /// Pending requests are rejected with `reason`.
    pub fn force_reset(&self, generation: Option<u64>, reason: &str) {
        self.core.reset(generation, reason);
    }

    /// Asks the worker to shut down, then kills it after the grace period
    pub async fn dispose(&self) {
        let worker = self.core.lock_state().phase.worker().cloned();
        let Some(worker) = worker else {
            self.clear_loaded_config_key();
            return;
        };

        tracing::info!(generation = worker.generation, "disposing worker");
        worker.disposing.store(true, Ordering::SeqCst);
        if let Err(e) = worker.dispatcher.notify(&WorkerCommand::Dispose) {
            tracing::debug!(error = %e, "dispose notification not delivered");
        }
        tokio::time::sleep(self.core.settings.dispose_grace).await;
        // Only the generation asked to stop; a successor may already be running
        self.core.reset(Some(worker.generation), "worker disposed");
    }

    fn begin_start(
        &self,
        state: &mut WorkerState,
    ) -> Result<(Arc<WorkerHandle>, watch::Receiver<StartOutcome>), WorkerError> {
        state.loaded_config_key = None;
        let spec = self.launcher.launch_spec(self.mode)?;

        state.generation += 1;
        let generation = state.generation;
        tracing::info!(
            generation,
            program = %spec.program.display(),
            args = ?spec.args,
            mode = ?self.mode,
            "spawning worker"
        );

        let spawned = self.spawner.spawn(&spec).map_err(|e| {
            tracing::error!(generation, error = %e, "failed to spawn worker");
            WorkerError::SpawnFailure {
                program: spec.program.display().to_string(),
                source: Arc::new(e),
            }
        })?;

        let worker = self.attach(generation, spawned);
        let (outcome, settled) = watch::channel(None);
        state.phase = Phase::Starting {
            worker: Arc::clone(&worker),
            outcome,
        };
        Ok((worker, settled))
    }

    /// Wires a spawned process into framer, diagnostics and dispatcher tasks
    fn attach(&self, generation: u64, spawned: SpawnedWorker) -> Arc<WorkerHandle> {
        let SpawnedWorker {
            pid,
            stdin,
            stdout,
            stderr,
            exited,
            kill,
        } = spawned;
        let settings = &self.core.settings;

        let diagnostics = DiagnosticsBuffer::shared(settings.diagnostics_capacity);
        let (outbound, requests) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(RequestDispatcher::new(
            outbound,
            Arc::clone(&diagnostics),
            settings.diagnostics_tail,
        ));

        tokio::spawn(write_requests(stdin, requests, generation));
        let stderr_task = tokio::spawn(collect_stderr(stderr, Arc::clone(&diagnostics), generation));
        let stdout_task = tokio::spawn(read_stdout(
            stdout,
            Arc::clone(&self.core),
            Arc::clone(&dispatcher),
            generation,
        ));
        tokio::spawn(watch_exit(
            exited,
            stdout_task,
            stderr_task,
            Arc::clone(&self.core),
            generation,
        ));

        let startup_timer = {
            let core = Arc::clone(&self.core);
            let timeout = settings.startup_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                core.startup_timed_out(generation);
            })
        };

        Arc::new(WorkerHandle {
            generation,
            pid,
            dispatcher,
            diagnostics,
            diagnostics_tail: settings.diagnostics_tail,
            kill: Mutex::new(Some(kill)),
            startup_timer: Mutex::new(Some(startup_timer)),
            disposing: AtomicBool::new(false),
        })
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        self.core.reset(None, "supervisor dropped");
    }
}

async fn write_requests(
    mut stdin: WorkerWriter,
    mut requests: mpsc::UnboundedReceiver<String>,
    generation: u64,
) {
    while let Some(mut line) = requests.recv().await {
        line.push('\n');
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(generation, error = %e, "failed to write to worker stdin");
            break;
        }
    }
}

async fn read_stdout(
    mut stdout: WorkerReader,
    core: Arc<Core>,
    dispatcher: Arc<RequestDispatcher>,
    generation: u64,
) {
    let mut framer = LineFramer::new();
    let mut chunk = vec![0_u8; READ_CHUNK];
    loop {
        let read = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) => {
                tracing::warn!(generation, error = %e, "failed to read worker stdout");
                break;
            }
        };
        for line in framer.feed(&chunk[..read]) {
            route_line(&core, &dispatcher, generation, &line);
        }
    }
    if let Some(line) = framer.finish() {
        route_line(&core, &dispatcher, generation, &line);
    }
    tracing::debug!(generation, "worker stdout closed");
}

fn route_line(core: &Core, dispatcher: &RequestDispatcher, generation: u64, line: &str) {
    match Envelope::parse(line) {
        Envelope::Ready => core.mark_ready(generation),
        Envelope::Noise(text) => tracing::info!(generation, line = %text, "worker output"),
        envelope => dispatcher.on_message(envelope),
    }
}

async fn collect_stderr(mut stderr: WorkerReader, diagnostics: SharedDiagnostics, generation: u64) {
    let mut framer = LineFramer::new();
    let mut chunk = vec![0_u8; READ_CHUNK];
    loop {
        let read = match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        record_stderr(&diagnostics, generation, framer.feed(&chunk[..read]));
    }
    record_stderr(&diagnostics, generation, framer.finish());
}

fn record_stderr(
    diagnostics: &SharedDiagnostics,
    generation: u64,
    lines: impl IntoIterator<Item = String>,
) {
    let mut buffer = lock(diagnostics);
    for line in lines {
        tracing::debug!(generation, line = %line, "worker stderr");
        buffer.push(line);
    }
}

async fn watch_exit(
    exited: oneshot::Receiver<ExitOutcome>,
    mut stdout_task: JoinHandle<()>,
    mut stderr_task: JoinHandle<()>,
    core: Arc<Core>,
    generation: u64,
) {
    let outcome = exited.await.unwrap_or(Ok(None));

    // Let output written just before exit reach the dispatcher and diagnostics
    let drained = tokio::time::timeout(OUTPUT_DRAIN, async {
        let _ = (&mut stdout_task).await;
        let _ = (&mut stderr_task).await;
    })
    .await;
    if drained.is_err() {
        tracing::debug!(generation, "worker output still open after exit");
        stdout_task.abort();
        stderr_task.abort();
    }

    core.process_exited(generation, &outcome);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
