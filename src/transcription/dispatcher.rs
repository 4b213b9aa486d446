use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::diagnostics::{snapshot_tail, SharedDiagnostics};
use super::error::WorkerError;
use super::protocol::{encode_request, Envelope, Progress, WorkerCommand};

/// Callback invoked for each progress notification of a request
pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

type Settlement = Result<Map<String, Value>, WorkerError>;

/// Per-request options
#[derive(Clone)]
pub struct RequestOptions {
    /// How long to wait for the terminal response
    pub timeout: Duration,
    /// Receives progress notifications, in arrival order
    pub on_progress: Option<ProgressFn>,
}

impl RequestOptions {
    /// Options with a timeout and no progress callback
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            on_progress: None,
        }
    }

    /// Adds a progress callback
    #[must_use]
    pub fn on_progress(mut self, callback: Option<ProgressFn>) -> Self {
        self.on_progress = callback;
        self
    }
}

/// Outstanding request waiting for its terminal response
struct PendingRequest {
    settle: oneshot::Sender<Settlement>,
    on_progress: Option<ProgressFn>,
    timer: JoinHandle<()>,
}

/// Correlates requests and responses for one worker process
///
/// Ids are allocated from a monotonic counter that lives as long as the
/// process, so they are never reused while it runs. Each pending request is
/// removed exactly once: by its response, by its timer, or by [`reject_all`].
///
/// [`reject_all`]: RequestDispatcher::reject_all
pub struct RequestDispatcher {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    notified: Mutex<HashSet<u64>>,
    outbound: mpsc::UnboundedSender<String>,
    diagnostics: SharedDiagnostics,
    diagnostics_tail: usize,
}

impl RequestDispatcher {
    /// Creates a dispatcher writing encoded lines to `outbound`
    #[must_use]
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        diagnostics: SharedDiagnostics,
        diagnostics_tail: usize,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            notified: Mutex::new(HashSet::new()),
            outbound,
            diagnostics,
            diagnostics_tail,
        }
    }

    /// Sends a command and waits for its terminal response
    ///
    /// # Errors
    /// Returns error if the worker answers `ok: false`, the timeout elapses,
    /// the process exits first, or the command cannot be encoded
    pub async fn send(
        self: &Arc<Self>,
        command: &WorkerCommand,
        options: RequestOptions,
    ) -> Result<Map<String, Value>, WorkerError> {
        let id = self.allocate_id();
        let line = encode_request(id, command)?;
        let (settle, settled) = oneshot::channel();

        {
            let mut pending = self.lock_pending();
            let timer = self.spawn_timer(id, options.timeout);
            pending.insert(
                id,
                PendingRequest {
                    settle,
                    on_progress: options.on_progress,
                    timer,
                },
            );
        }

        tracing::debug!(
            id,
            cmd = command.name(),
            timeout_ms = duration_ms(options.timeout),
            "sending worker request"
        );

        if self.outbound.send(line).is_err() {
            if let Some(request) = self.lock_pending().remove(&id) {
                request.timer.abort();
            }
            return Err(self.exit_error(None, "worker stdin closed"));
        }

        settled
            .await
            .unwrap_or_else(|_| Err(self.exit_error(None, "request abandoned")))
    }

    /// Writes a command without waiting for any response
    ///
    /// A reply the worker sends anyway is consumed quietly.
    ///
    /// # Errors
    /// Returns error if the command cannot be encoded or stdin is closed
    pub fn notify(&self, command: &WorkerCommand) -> Result<u64, WorkerError> {
        let id = self.allocate_id();
        let line = encode_request(id, command)?;
        tracing::debug!(id, cmd = command.name(), "sending worker notification");
        self.lock_notified().insert(id);
        if self.outbound.send(line).is_err() {
            self.lock_notified().remove(&id);
            return Err(self.exit_error(None, "worker stdin closed"));
        }
        Ok(id)
    }

    /// Routes one parsed envelope to its waiter
    pub fn on_message(&self, envelope: Envelope) {
        match envelope {
            Envelope::Progress { id, progress } => {
                let callback = match self.lock_pending().get(&id) {
                    Some(request) => request.on_progress.clone(),
                    None => {
                        tracing::debug!(id, "progress for unknown request ignored");
                        return;
                    }
                };
                if let Some(callback) = callback {
                    callback(&progress);
                }
            }
            Envelope::Response(response) => {
                let Some(request) = self.lock_pending().remove(&response.id) else {
                    if self.lock_notified().remove(&response.id) {
                        tracing::debug!(id = response.id, "notification acknowledged");
                    } else {
                        tracing::warn!(id = response.id, "response for unknown or settled request ignored");
                    }
                    return;
                };
                request.timer.abort();
                let settlement = response.outcome.map_err(|report| {
                    tracing::warn!(id = response.id, code = ?report.code, phase = ?report.phase, "worker reported error");
                    WorkerError::WorkerReported {
                        report,
                        diagnostics: self.diagnostics_tail(),
                    }
                });
                // Receiver may already be gone if the caller stopped waiting
                let _ = request.settle.send(settlement);
            }
            Envelope::Ready | Envelope::Noise(_) => {}
        }
    }

    /// Rejects every pending request with a process-exit error
    pub fn reject_all(&self, code: Option<i32>, reason: &str) {
        let drained: Vec<(u64, PendingRequest)> = self.lock_pending().drain().collect();
        if drained.is_empty() {
            return;
        }

        tracing::warn!(count = drained.len(), reason, "rejecting pending worker requests");
        let error = self.exit_error(code, reason);
        for (_, request) in drained {
            request.timer.abort();
            let _ = request.settle.send(Err(error.clone()));
        }
    }

    /// Number of requests still waiting for a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Notifications the worker has not replied to
    #[must_use]
    pub fn unacknowledged_notifications(&self) -> usize {
        self.lock_notified().len()
    }

    fn expire(&self, id: u64, timeout: Duration) {
        let Some(request) = self.lock_pending().remove(&id) else {
            return;
        };
        let duration_ms = duration_ms(timeout);
        tracing::warn!(id, duration_ms, "worker request timed out");
        let _ = request.settle.send(Err(WorkerError::RequestTimeout {
            duration_ms,
            diagnostics: self.diagnostics_tail(),
        }));
    }

    fn spawn_timer(self: &Arc<Self>, id: u64, timeout: Duration) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            dispatcher.expire(id, timeout);
        })
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn exit_error(&self, code: Option<i32>, reason: &str) -> WorkerError {
        WorkerError::process_exit(code, reason, self.diagnostics_tail())
    }

    fn diagnostics_tail(&self) -> String {
        snapshot_tail(&self.diagnostics, self.diagnostics_tail)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_notified(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.notified.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Milliseconds in a duration, saturating
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::diagnostics::DiagnosticsBuffer;
    use crate::transcription::protocol::{Progress, Response};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn dispatcher(tail: usize) -> (Arc<RequestDispatcher>, mpsc::UnboundedReceiver<String>, SharedDiagnostics) {
        let (tx, rx) = mpsc::unbounded_channel();
        let diagnostics = DiagnosticsBuffer::shared(80);
        let dispatcher = Arc::new(RequestDispatcher::new(tx, Arc::clone(&diagnostics), tail));
        (dispatcher, rx, diagnostics)
    }

    fn ok_response(id: u64, payload: Value) -> Envelope {
        let Value::Object(payload) = payload else {
            panic!("payload must be an object");
        };
        Envelope::Response(Response {
            id,
            outcome: Ok(payload),
        })
    }

    fn progress(id: u64, percent: f64) -> Envelope {
        Envelope::Progress {
            id,
            progress: Progress {
                percent,
                status: None,
            },
        }
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let (dispatcher, mut rx, _) = dispatcher(6);
        assert_eq!(dispatcher.notify(&WorkerCommand::Ping).unwrap(), 1);
        assert_eq!(dispatcher.notify(&WorkerCommand::Dispose).unwrap(), 2);
        assert_eq!(next_request(&mut rx).await, json!({"id": 1, "cmd": "ping"}));
        assert_eq!(next_request(&mut rx).await, json!({"id": 2, "cmd": "dispose"}));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notification_reply_is_consumed() {
        let (dispatcher, mut rx, _) = dispatcher(6);
        let id = dispatcher.notify(&WorkerCommand::Dispose).unwrap();
        assert_eq!(next_request(&mut rx).await["cmd"], "dispose");
        assert_eq!(dispatcher.unacknowledged_notifications(), 1);
        assert_eq!(dispatcher.pending_count(), 0);

        dispatcher.on_message(ok_response(id, json!({})));
        assert_eq!(dispatcher.unacknowledged_notifications(), 0);

        // A second reply for the same id is no longer recognized
        dispatcher.on_message(ok_response(id, json!({})));
        assert_eq!(dispatcher.unacknowledged_notifications(), 0);
    }

    #[tokio::test]
    async fn test_response_settles_request() {
        let (dispatcher, mut rx, _) = dispatcher(6);
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .send(&WorkerCommand::Ping, RequestOptions::with_timeout(Duration::from_secs(5)))
                    .await
            })
        };

        let request = next_request(&mut rx).await;
        assert_eq!(request["cmd"], "ping");
        let id = request["id"].as_u64().unwrap();
        dispatcher.on_message(ok_response(id, json!({"pong": true})));

        let payload = task.await.unwrap().unwrap();
        assert_eq!(payload["pong"], true);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_never_settles() {
        let (dispatcher, mut rx, _) = dispatcher(6);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let callback: ProgressFn = {
            let seen = Arc::clone(&seen);
            Arc::new(move |p: &Progress| seen.lock().unwrap().push(p.percent))
        };

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .send(
                        &WorkerCommand::Ping,
                        RequestOptions::with_timeout(Duration::from_secs(5)).on_progress(Some(callback)),
                    )
                    .await
            })
        };

        let id = next_request(&mut rx).await["id"].as_u64().unwrap();
        dispatcher.on_message(progress(id, 40.0));
        dispatcher.on_message(progress(id, 80.0));
        tokio::task::yield_now().await;
        assert!(!task.is_finished());
        assert_eq!(dispatcher.pending_count(), 1);

        dispatcher.on_message(ok_response(id, json!({})));
        assert!(task.await.unwrap().is_ok());
        assert_eq!(*seen.lock().unwrap(), vec![40.0, 80.0]);

        // Late progress and duplicate responses are ignored
        dispatcher.on_message(progress(id, 99.0));
        dispatcher.on_message(ok_response(id, json!({})));
        assert_eq!(*seen.lock().unwrap(), vec![40.0, 80.0]);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (dispatcher, mut rx, _) = dispatcher(6);
        let spawn_send = |dispatcher: Arc<RequestDispatcher>| {
            tokio::spawn(async move {
                dispatcher
                    .send(&WorkerCommand::Ping, RequestOptions::with_timeout(Duration::from_secs(5)))
                    .await
            })
        };
        let first = spawn_send(Arc::clone(&dispatcher));
        let first_id = next_request(&mut rx).await["id"].as_u64().unwrap();
        let second = spawn_send(Arc::clone(&dispatcher));
        let second_id = next_request(&mut rx).await["id"].as_u64().unwrap();
        assert!(second_id > first_id);

        dispatcher.on_message(ok_response(second_id, json!({"which": "second"})));
        assert_eq!(second.await.unwrap().unwrap()["which"], "second");
        assert!(!first.is_finished());

        dispatcher.on_message(ok_response(first_id, json!({"which": "first"})));
        assert_eq!(first.await.unwrap().unwrap()["which"], "first");
    }

    #[tokio::test]
    async fn test_error_response_is_normalized() {
        let (dispatcher, mut rx, diagnostics) = dispatcher(6);
        diagnostics.lock().unwrap().push("Traceback (most recent call last):");

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .send(&WorkerCommand::Ping, RequestOptions::with_timeout(Duration::from_secs(5)))
                    .await
            })
        };
        let id = next_request(&mut rx).await["id"].as_u64().unwrap();
        dispatcher.on_message(Envelope::parse(&format!(
            r#"{{"id":{id},"ok":false,"error":{{"code":"UNKNOWN_COMMAND","message":"unknown command","phase":"router"}}}}"#
        )));

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.report().and_then(|r| r.code.as_deref()), Some("UNKNOWN_COMMAND"));
        let message = err.to_string();
        assert!(message.starts_with("unknown command (code=UNKNOWN_COMMAND, phase=router)"));
        assert!(message.contains("Traceback"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_duration() {
        let (dispatcher, _rx, _) = dispatcher(6);
        let started = tokio::time::Instant::now();
        let err = dispatcher
            .send(&WorkerCommand::Ping, RequestOptions::with_timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(250));
        let message = err.to_string();
        assert!(message.contains("timeout"));
        assert!(message.contains("200"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_includes_only_diagnostics_tail() {
        let (dispatcher, _rx, diagnostics) = dispatcher(6);
        {
            let mut buffer = diagnostics.lock().unwrap();
            for i in 1..=90 {
                buffer.push(format!("stderr-line-{i:03}"));
            }
        }

        let err = dispatcher
            .send(&WorkerCommand::Ping, RequestOptions::with_timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        let message = err.to_string();
        for i in 85..=90 {
            assert!(message.contains(&format!("stderr-line-{i:03}")));
        }
        assert!(!message.contains("stderr-line-084"));
        assert!(!message.contains("stderr-line-001"));
    }

    #[tokio::test]
    async fn test_reject_all_settles_every_request() {
        let (dispatcher, mut rx, diagnostics) = dispatcher(6);
        diagnostics.lock().unwrap().push("Segmentation fault");

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .send(&WorkerCommand::Ping, RequestOptions::with_timeout(Duration::from_secs(30)))
                        .await
                })
            })
            .collect();
        for _ in 0..3 {
            next_request(&mut rx).await;
        }
        assert_eq!(dispatcher.pending_count(), 3);

        dispatcher.reject_all(Some(1), "exited with code 1");
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            let message = err.to_string();
            assert!(message.contains("exit"));
            assert!(message.contains('1'));
            assert!(message.contains("Segmentation fault"));
            assert!(matches!(err, WorkerError::ProcessExit { code: Some(1), .. }));
        }
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_after_stdin_closed() {
        let (dispatcher, rx, _) = dispatcher(6);
        drop(rx);
        let err = dispatcher
            .send(&WorkerCommand::Ping, RequestOptions::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ProcessExit { .. }));
        assert_eq!(dispatcher.pending_count(), 0);
        assert!(dispatcher.notify(&WorkerCommand::Dispose).is_err());
        assert_eq!(dispatcher.unacknowledged_notifications(), 0);
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(Duration::from_secs(45)), 45_000);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }
}
