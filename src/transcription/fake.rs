//! In-memory worker process for exercising the supervisor without spawning

use serde_json::{Map, Value};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::{mpsc, oneshot};

use super::launcher::{LaunchMode, LaunchSpec, MockProcessLauncher};
use super::process::{ExitOutcome, SpawnedWorker, WorkerSpawner};
use super::supervisor::{SupervisorSettings, WorkerSupervisor};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Test side of one fake worker process
pub struct FakeProcess {
    requests: Lines<BufReader<DuplexStream>>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit: oneshot::Sender<ExitOutcome>,
    kill: oneshot::Receiver<()>,
}

impl FakeProcess {
    /// Writes one stdout line
    pub async fn emit(&mut self, line: &str) {
        self.emit_raw(format!("{line}\n").as_bytes()).await;
    }

    /// Writes raw stdout bytes
    pub async fn emit_raw(&mut self, bytes: &[u8]) {
        self.stdout.write_all(bytes).await.unwrap();
        self.stdout.flush().await.unwrap();
    }

    /// Writes one stderr line
    pub async fn emit_stderr(&mut self, line: &str) {
        self.stderr
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        self.stderr.flush().await.unwrap();
    }

    pub async fn ready(&mut self) {
        self.emit(r#"{"ready":true}"#).await;
    }

    /// Sends `{id, ok: true, ...payload}`
    pub async fn respond_ok(&mut self, id: u64, payload: Value) {
        let mut fields = match payload {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        fields.insert("id".to_owned(), Value::from(id));
        fields.insert("ok".to_owned(), Value::Bool(true));
        self.emit(&Value::Object(fields).to_string()).await;
    }

    /// Sends `{id, ok: false, error}`
    pub async fn respond_error(&mut self, id: u64, error: Value) {
        let line = serde_json::json!({"id": id, "ok": false, "error": error});
        self.emit(&line.to_string()).await;
    }

    /// Sends `{id, progress, status}`
    pub async fn progress(&mut self, id: u64, percent: f64, status: &str) {
        let line = serde_json::json!({"id": id, "progress": percent, "status": status});
        self.emit(&line.to_string()).await;
    }

    /// Next request line written by the supervisor
    pub async fn next_request(&mut self) -> Value {
        let line = self.requests.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// True if no request line arrives within `window`
    pub async fn quiet_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.requests.next_line())
            .await
            .is_err()
    }

    /// Ends the process, closing all of its streams
    pub fn exit(self, code: Option<i32>) {
        let _ = self.exit.send(Ok(code));
    }

    /// Resolves `true` once the supervisor kills the process
    pub async fn wait_killed(&mut self) -> bool {
        (&mut self.kill).await.is_ok()
    }
}

/// Spawner handing each fake process to the test through a channel
pub struct FakeSpawner {
    processes: mpsc::UnboundedSender<FakeProcess>,
    spawned: AtomicUsize,
    fail: AtomicBool,
}

impl FakeSpawner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeProcess>) {
        let (processes, receiver) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            processes,
            spawned: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        });
        (spawner, receiver)
    }

    /// Number of successful spawns
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Makes subsequent spawns fail with `NotFound`
    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(&self, _spec: &LaunchSpec) -> io::Result<SpawnedWorker> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such worker binary"));
        }

        let (stdin, requests) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_reader, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_reader, stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit, exited) = oneshot::channel();
        let (kill, kill_rx) = oneshot::channel();

        let process = FakeProcess {
            requests: BufReader::new(requests).lines(),
            stdout,
            stderr,
            exit,
            kill: kill_rx,
        };
        self.processes
            .send(process)
            .map_err(|_| io::Error::other("test dropped the process receiver"))?;
        let count = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(SpawnedWorker {
            pid: u32::try_from(40_000 + count).ok(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout_reader),
            stderr: Box::new(stderr_reader),
            exited,
            kill,
        })
    }
}

/// Short timings suitable for tests
pub fn test_settings() -> SupervisorSettings {
    SupervisorSettings {
        startup_timeout: Duration::from_secs(2),
        dispose_grace: Duration::from_millis(50),
        diagnostics_capacity: 80,
        diagnostics_tail: 6,
    }
}

/// Supervisor wired to a [`FakeSpawner`]
pub fn fake_supervisor(
    settings: SupervisorSettings,
) -> (
    WorkerSupervisor,
    Arc<FakeSpawner>,
    mpsc::UnboundedReceiver<FakeProcess>,
) {
    let mut launcher = MockProcessLauncher::new();
    launcher
        .expect_launch_spec()
        .returning(|_| Ok(LaunchSpec::new("fake-asr-worker")));
    let (spawner, processes) = FakeSpawner::new();
    let supervisor = WorkerSupervisor::new(
        Arc::new(launcher),
        Arc::clone(&spawner) as Arc<dyn WorkerSpawner>,
        LaunchMode::Bundled,
        settings,
    );
    (supervisor, spawner, processes)
}
