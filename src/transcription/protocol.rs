//! Line-delimited JSON protocol spoken with the recognition worker.
//!
//! Requests are `{ "id": n, "cmd": "...", ...fields }`. The worker answers
//! with terminal responses (`ok` present), progress notifications (numeric
//! `progress`, no `ok`), and a single `{ "ready": true }` at startup.

use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::error::WorkerError;
use super::normalize::{normalize, NormalizedError};

/// Commands understood by the worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum WorkerCommand {
    /// Load (downloading if needed) the configured models
    Init(ModelFields),
    /// Transcribe one audio clip
    Recognize(AudioPayload),
    /// Report which model files are present
    Check(ModelFields),
    /// Release models before shutdown
    Dispose,
    /// Liveness probe
    Ping,
}

impl WorkerCommand {
    /// Wire name of the command
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Recognize(_) => "recognize",
            Self::Check(_) => "check",
            Self::Dispose => "dispose",
            Self::Ping => "ping",
        }
    }
}

/// Serializes a command as one request line (without the trailing newline)
///
/// # Errors
/// Returns error if the command cannot be represented as a JSON object
pub fn encode_request(id: u64, command: &WorkerCommand) -> Result<String, WorkerError> {
    let mut value =
        serde_json::to_value(command).map_err(|e| WorkerError::Encode(Arc::new(e)))?;
    if let Value::Object(fields) = &mut value {
        fields.insert("id".to_owned(), Value::from(id));
    }
    serde_json::to_string(&value).map_err(|e| WorkerError::Encode(Arc::new(e)))
}

/// Automatic speech recognition model selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsrModel {
    /// Model id or short name
    pub model_name: String,
    /// Inference backend
    #[serde(default = "default_asr_backend")]
    pub backend: String,
    /// Use the quantized model files
    #[serde(default)]
    pub quantize: bool,
}

/// Voice activity detection model selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VadModel {
    /// Model id or short name
    pub model_name: String,
    /// Inference backend
    #[serde(default = "default_vad_backend")]
    pub backend: String,
    /// Use the quantized model files
    #[serde(default = "default_true")]
    pub quantize: bool,
}

/// Punctuation restoration model selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuncModel {
    /// Model id or short name
    pub model_name: String,
    /// Inference backend
    #[serde(default = "default_punc_backend")]
    pub backend: String,
}

/// Everything the worker needs to load a recognition pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Recognition model
    #[serde(flatten)]
    pub asr: AsrModel,
    /// Optional voice activity detection
    #[serde(default)]
    pub vad: Option<VadModel>,
    /// Optional punctuation restoration
    #[serde(default)]
    pub punc: Option<PuncModel>,
    /// Domain terms to bias recognition towards
    #[serde(default)]
    pub hotwords: Vec<String>,
}

impl ModelParams {
    /// Params for a bare recognition model with no VAD, punctuation or hotwords
    #[must_use]
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            asr: AsrModel {
                model_name: model_name.into(),
                backend: default_asr_backend(),
                quantize: false,
            },
            vad: None,
            punc: None,
            hotwords: Vec::new(),
        }
    }

    /// Stable key identifying this exact configuration
    ///
    /// Two params produce the same key iff they encode to the same wire fields.
    #[must_use]
    pub fn config_key(&self) -> String {
        serde_json::to_string(&ModelFields::from(self)).unwrap_or_else(|_| self.asr.model_name.clone())
    }
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            asr: AsrModel {
                model_name: "iic/speech_paraformer-large-contextual_asr_nat-zh-cn-16k-common-vocab8404-onnx"
                    .to_owned(),
                backend: default_asr_backend(),
                quantize: false,
            },
            vad: Some(VadModel {
                model_name: "iic/speech_fsmn_vad_zh-cn-16k-common-onnx".to_owned(),
                backend: default_vad_backend(),
                quantize: true,
            }),
            punc: Some(PuncModel {
                model_name: "damo/punc_ct-transformer_cn-en-common-vocab471067-large-onnx"
                    .to_owned(),
                backend: default_punc_backend(),
            }),
            hotwords: Vec::new(),
        }
    }
}

fn default_asr_backend() -> String {
    "funasr_onnx_contextual".to_owned()
}

fn default_vad_backend() -> String {
    "funasr_onnx_vad".to_owned()
}

fn default_punc_backend() -> String {
    "funasr_onnx_punc".to_owned()
}

const fn default_true() -> bool {
    true
}

/// Wire fields shared by `init` and `check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFields {
    model_name: String,
    backend: String,
    quantize: bool,
    vad_model_name: String,
    vad_backend: String,
    vad_quantize: bool,
    use_punc: bool,
    punc_model_name: String,
    punc_backend: String,
    hotwords: String,
}

impl From<&ModelParams> for ModelFields {
    fn from(params: &ModelParams) -> Self {
        let (vad_model_name, vad_backend, vad_quantize) = params.vad.as_ref().map_or_else(
            || (String::new(), default_vad_backend(), true),
            |vad| (vad.model_name.clone(), vad.backend.clone(), vad.quantize),
        );
        let (punc_model_name, punc_backend) = params.punc.as_ref().map_or_else(
            || (String::new(), String::new()),
            |punc| (punc.model_name.clone(), punc.backend.clone()),
        );
        let hotwords = params
            .hotwords
            .iter()
            .map(|word| word.trim())
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            model_name: params.asr.model_name.clone(),
            backend: params.asr.backend.clone(),
            quantize: params.asr.quantize,
            vad_model_name,
            vad_backend,
            vad_quantize,
            use_punc: params.punc.is_some(),
            punc_model_name,
            punc_backend,
            hotwords,
        }
    }
}

/// Audio sent with a `recognize` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioPayload {
    /// Base64 of a 16 kHz mono 16-bit PCM WAV file
    #[serde(rename = "wavBase64")]
    pub wav_base64: String,
}

impl AudioPayload {
    /// Wraps raw WAV file bytes
    #[must_use]
    pub fn from_wav_bytes(wav: &[u8]) -> Self {
        Self {
            wav_base64: base64::engine::general_purpose::STANDARD.encode(wav),
        }
    }
}

/// Result of a successful `init`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOutcome {
    /// Hotword diagnostics reported by the worker
    #[serde(default)]
    pub hotword_stats: Option<Value>,
    /// True when the worker already had this configuration loaded
    #[serde(skip)]
    pub reused: bool,
}

/// Result of a successful `recognize`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    /// Final text with punctuation
    pub text: String,
    /// Text before punctuation restoration
    #[serde(default)]
    pub raw_text: String,
    /// Number of VAD segments
    #[serde(default)]
    pub segment_count: u32,
    /// Number of recognition passes
    #[serde(default)]
    pub asr_passes: u32,
}

/// Download state of one model dependency
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyStatus {
    /// `ASR`, `VAD` or `PUNC`
    pub role: String,
    /// Model id or short name
    pub model_name: String,
    /// Inference backend
    #[serde(default)]
    pub backend: String,
    /// Quantized files requested
    #[serde(default)]
    pub quantize: bool,
    /// Some files exist in the local cache
    #[serde(default)]
    pub cached: bool,
    /// Every required file exists
    #[serde(default)]
    pub complete: bool,
    /// Required files that are absent
    #[serde(default)]
    pub missing_files: Vec<String>,
    /// Human-readable problem, empty when complete
    #[serde(default)]
    pub issue: String,
}

/// Completeness report returned by `check`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusReport {
    /// All dependencies are complete
    pub downloaded: bool,
    /// The recognition model is partially downloaded
    #[serde(default)]
    pub incomplete: bool,
    /// Per-dependency details
    #[serde(default)]
    pub dependencies: Vec<DependencyStatus>,
}

/// Partial-completion notification for a pending request
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Percent complete, as reported by the worker
    pub percent: f64,
    /// Optional status text
    pub status: Option<String>,
}

/// Terminal response from the worker
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Correlation id
    pub id: u64,
    /// Success payload, or the decoded error
    pub outcome: Result<Map<String, Value>, NormalizedError>,
}

impl Response {
    /// Deserializes the success payload into a typed result
    ///
    /// # Errors
    /// Returns error if the payload does not match `T`
    pub fn decode<T: DeserializeOwned>(payload: Map<String, Value>) -> Result<T, WorkerError> {
        Ok(serde_json::from_value(Value::Object(payload))?)
    }
}

/// One classified line from the worker's stdout
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Worker finished starting up
    Ready,
    /// Progress for a pending request
    Progress {
        /// Correlation id
        id: u64,
        /// Progress details
        progress: Progress,
    },
    /// Terminal response
    Response(Response),
    /// Anything that is not a protocol message
    Noise(String),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    ready: Option<bool>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl Envelope {
    /// Classifies one line of worker output
    ///
    /// Lines that do not start with `{` are never handed to the JSON parser.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Self::Noise(line.to_owned());
        }

        let raw = match serde_json::from_str::<RawEnvelope>(trimmed) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, line = trimmed, "unparseable worker line");
                return Self::Noise(line.to_owned());
            }
        };

        match raw {
            RawEnvelope {
                id: Some(id),
                ok: Some(ok),
                error,
                rest,
                ..
            } => {
                let outcome = if ok {
                    Ok(rest)
                } else {
                    Err(normalize(&error.unwrap_or(Value::Null)))
                };
                Self::Response(Response { id, outcome })
            }
            RawEnvelope {
                id: Some(id),
                ok: None,
                progress: Some(percent),
                status,
                ..
            } => Self::Progress {
                id,
                progress: Progress { percent, status },
            },
            RawEnvelope {
                id: None,
                ok: None,
                ready: Some(true),
                ..
            } => Self::Ready,
            _ => Self::Noise(line.to_owned()),
        }
    }
}
