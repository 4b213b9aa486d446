use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::oneshot;

use super::launcher::LaunchSpec;

/// How a worker process ended: exit code (`None` when killed by a signal)
pub type ExitOutcome = Result<Option<i32>, Arc<io::Error>>;

/// Boxed read half of a worker stream
pub type WorkerReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a worker stream
pub type WorkerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Live handles to one spawned worker
pub struct SpawnedWorker {
    /// OS process id, when known
    pub pid: Option<u32>,
    /// Worker stdin
    pub stdin: WorkerWriter,
    /// Worker stdout
    pub stdout: WorkerReader,
    /// Worker stderr
    pub stderr: WorkerReader,
    /// Resolves once the process has exited
    pub exited: oneshot::Receiver<ExitOutcome>,
    /// Send (or drop) to terminate the process
    pub kill: oneshot::Sender<()>,
}

/// Starts worker processes from a launch spec
pub trait WorkerSpawner: Send + Sync {
    /// Spawns the worker with piped standard streams
    ///
    /// # Errors
    /// Returns error if the process cannot be started
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedWorker>;
}

/// Spawns real child processes with `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildSpawner;

impl WorkerSpawner for ChildSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedWorker> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("worker stderr not captured"))?;

        let pid = child.id();
        let (exit_tx, exited) = oneshot::channel();
        let (kill, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill and when the handle is dropped
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(error = %e, "failed to kill worker process");
                    }
                    child.wait().await
                }
            };
            let outcome = status.map(|s| s.code()).map_err(Arc::new);
            let _ = exit_tx.send(outcome);
        });

        Ok(SpawnedWorker {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exited,
            kill,
        })
    }
}
