use std::time::Duration;

use super::dispatcher::{ProgressFn, RequestOptions};
use super::error::WorkerError;
use super::protocol::{
    AudioPayload, InitOutcome, ModelFields, ModelParams, RecognitionResult, Response, StatusReport,
    WorkerCommand,
};
use super::supervisor::WorkerSupervisor;

/// Per-command request timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    /// `init` may download models, so it gets a long budget
    pub init: Duration,
    /// `recognize`
    pub recognize: Duration,
    /// `check` and `ping`
    pub check: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(600),
            recognize: Duration::from_secs(30),
            check: Duration::from_secs(15),
        }
    }
}

/// Speech recognition on top of the supervised worker
///
/// Loaded models are tracked by config key: initializing with the key that the
/// live worker already holds returns immediately without talking to it.
pub struct Recognizer {
    supervisor: WorkerSupervisor,
    timeouts: RequestTimeouts,
}

impl Recognizer {
    /// Creates a recognizer over an idle or running supervisor
    #[must_use]
    pub const fn new(supervisor: WorkerSupervisor, timeouts: RequestTimeouts) -> Self {
        Self {
            supervisor,
            timeouts,
        }
    }

    /// Underlying supervisor
    #[must_use]
    pub const fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    /// Loads `params`, keyed by their canonical wire encoding
    ///
    /// # Errors
    /// Returns [`WorkerError::InitializeFailed`] if the worker cannot be
    /// started or fails to load the models
    pub async fn initialize(
        &self,
        params: &ModelParams,
        on_progress: Option<ProgressFn>,
    ) -> Result<InitOutcome, WorkerError> {
        self.initialize_with_key(&params.config_key(), params, on_progress)
            .await
    }

    /// Loads `params` unless the live worker already holds `config_key`
    ///
    /// On failure the worker is killed and the loaded key forgotten, so the
    /// next call starts from a fresh process.
    ///
    /// # Errors
    /// Returns [`WorkerError::InitializeFailed`] wrapping the underlying error
    pub async fn initialize_with_key(
        &self,
        config_key: &str,
        params: &ModelParams,
        on_progress: Option<ProgressFn>,
    ) -> Result<InitOutcome, WorkerError> {
        if self.supervisor.loaded_config_key().as_deref() == Some(config_key) {
            tracing::debug!(model = %params.asr.model_name, "model already loaded");
            return Ok(InitOutcome {
                reused: true,
                ..InitOutcome::default()
            });
        }

        let worker = match self.supervisor.ensure_started().await {
            Ok(worker) => worker,
            Err(e) => return Err(self.initialize_failed(params, None, e)),
        };

        tracing::info!(
            generation = worker.generation(),
            model = %params.asr.model_name,
            backend = %params.asr.backend,
            hotwords = params.hotwords.len(),
            "initializing recognizer"
        );
        let options = RequestOptions::with_timeout(self.timeouts.init).on_progress(on_progress);
        let loaded = worker
            .dispatcher()
            .send(&WorkerCommand::Init(ModelFields::from(params)), options)
            .await
            .and_then(Response::decode::<InitOutcome>);

        let outcome = match loaded {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.initialize_failed(params, Some(worker.generation()), e)),
        };
        if !self.supervisor.mark_loaded(worker.generation(), config_key) {
            let e = WorkerError::process_exit(
                None,
                "worker exited during initialization",
                worker.diagnostics_tail(),
            );
            return Err(self.initialize_failed(params, None, e));
        }

        tracing::info!(generation = worker.generation(), model = %params.asr.model_name, "recognizer initialized");
        Ok(outcome)
    }

    /// Transcribes one clip with the loaded models
    ///
    /// # Errors
    /// Returns [`WorkerError::NotInitialized`] without touching the worker if
    /// no model is loaded in the live process, otherwise any request error
    pub async fn recognize(&self, audio: AudioPayload) -> Result<RecognitionResult, WorkerError> {
        let worker = self
            .supervisor
            .initialized_worker()
            .ok_or(WorkerError::NotInitialized)?;

        let payload = worker
            .dispatcher()
            .send(
                &WorkerCommand::Recognize(audio),
                RequestOptions::with_timeout(self.timeouts.recognize),
            )
            .await?;
        let result: RecognitionResult = Response::decode(payload)?;
        tracing::debug!(
            chars = result.text.chars().count(),
            segments = result.segment_count,
            passes = result.asr_passes,
            "recognition complete"
        );
        Ok(result)
    }

    /// Transcribes a 16 kHz mono 16-bit WAV file
    ///
    /// # Errors
    /// Same as [`recognize`](Self::recognize)
    pub async fn recognize_wav(&self, wav: &[u8]) -> Result<RecognitionResult, WorkerError> {
        self.recognize(AudioPayload::from_wav_bytes(wav)).await
    }

    /// Asks the worker which model files for `params` are present locally
    ///
    /// # Errors
    /// Returns error if the worker cannot be started or the request fails
    pub async fn check_status(&self, params: &ModelParams) -> Result<StatusReport, WorkerError> {
        let worker = self.supervisor.ensure_started().await?;
        let payload = worker
            .dispatcher()
            .send(
                &WorkerCommand::Check(ModelFields::from(params)),
                RequestOptions::with_timeout(self.timeouts.check),
            )
            .await?;
        Response::decode(payload)
    }

    /// Round-trips a `ping` through the worker
    ///
    /// # Errors
    /// Returns error if the worker cannot be started or does not answer
    pub async fn ping(&self) -> Result<(), WorkerError> {
        let worker = self.supervisor.ensure_started().await?;
        worker
            .dispatcher()
            .send(&WorkerCommand::Ping, RequestOptions::with_timeout(self.timeouts.check))
            .await?;
        Ok(())
    }

    /// Shuts the worker down and forgets the loaded models
    pub async fn dispose(&self) {
        self.supervisor.dispose().await;
    }

    fn initialize_failed(
        &self,
        params: &ModelParams,
        generation: Option<u64>,
        error: WorkerError,
    ) -> WorkerError {
        tracing::error!(model = %params.asr.model_name, error = %error, "recognizer initialization failed");
        self.supervisor.clear_loaded_config_key();
        if let Some(generation) = generation {
            self.supervisor
                .force_reset(Some(generation), "initialization failed");
        }
        WorkerError::InitializeFailed {
            model: params.asr.model_name.clone(),
            summary: error.headline(),
            source: Box::new(error),
        }
    }
}
