use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transcription::{
    LaunchMode, ModelParams, RequestTimeouts, SidecarLauncher, SupervisorSettings,
};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub model: ModelParams,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub mode: LaunchMode,
    pub python: String,
    pub script: String,
    pub sidecar_dir: String,
    pub startup_timeout_secs: u64,
    pub init_timeout_secs: u64,
    pub recognize_timeout_secs: u64,
    pub check_timeout_secs: u64,
    pub dispose_grace_ms: u64,
    pub diagnostics_capacity: usize,
    pub diagnostics_tail: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: LaunchMode::default(),
            python: "python3".to_owned(),
            script: "python/asr_server.py".to_owned(),
            sidecar_dir: "~/.hotkey-asr/sidecar".to_owned(),
            startup_timeout_secs: 45,
            init_timeout_secs: 600,
            recognize_timeout_secs: 30,
            check_timeout_secs: 15,
            dispose_grace_ms: 500,
            diagnostics_capacity: 80,
            diagnostics_tail: 12,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub const fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            dispose_grace: Duration::from_millis(self.dispose_grace_ms),
            diagnostics_capacity: self.diagnostics_capacity,
            diagnostics_tail: self.diagnostics_tail,
        }
    }

    #[must_use]
    pub const fn request_timeouts(&self) -> RequestTimeouts {
        RequestTimeouts {
            init: Duration::from_secs(self.init_timeout_secs),
            recognize: Duration::from_secs(self.recognize_timeout_secs),
            check: Duration::from_secs(self.check_timeout_secs),
        }
    }

    /// Launcher for the sidecar, with `~` expanded in its paths
    ///
    /// # Errors
    /// Returns error if a path needs `HOME` and it is not set
    pub fn launcher(&self) -> Result<SidecarLauncher> {
        Ok(SidecarLauncher {
            python: self.python.clone(),
            script: Config::expand_path(&self.script)?,
            sidecar_dir: Config::expand_path(&self.sidecar_dir)?,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub log_path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: "~/.hotkey-asr/hotkey-asr.log".to_owned(),
        }
    }
}

const DEFAULT_CONFIG: &str = r#"[worker]
# "bundled" runs <sidecar_dir>/<platform>/asr_server, "development" runs the Python script
mode = "bundled"
python = "python3"
script = "python/asr_server.py"
sidecar_dir = "~/.hotkey-asr/sidecar"
startup_timeout_secs = 45
init_timeout_secs = 600
recognize_timeout_secs = 30
check_timeout_secs = 15
dispose_grace_ms = 500
diagnostics_capacity = 80
diagnostics_tail = 12

[model]
model_name = "iic/speech_paraformer-large-contextual_asr_nat-zh-cn-16k-common-vocab8404-onnx"
backend = "funasr_onnx_contextual"
quantize = false
hotwords = []

[model.vad]
model_name = "iic/speech_fsmn_vad_zh-cn-16k-common-onnx"
backend = "funasr_onnx_vad"
quantize = true

[model.punc]
model_name = "damo/punc_ct-transformer_cn-en-common-vocab471067-large-onnx"
backend = "funasr_onnx_punc"

[telemetry]
enabled = false
log_path = "~/.hotkey-asr/hotkey-asr.log"
"#;

impl Config {
    /// Load config from ~/.hotkey-asr.toml, creating it with defaults first if missing
    ///
    /// # Errors
    /// Returns error if the file cannot be created, read or parsed
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default(&config_path).context("failed to create default config")?;
        }

        Self::load_from(&config_path)
    }

    /// Load config from an explicit path
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    /// Parse config from TOML text
    ///
    /// # Errors
    /// Returns error if the TOML is invalid or has unexpected types
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse config TOML")
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".hotkey-asr.toml"))
    }

    fn create_default(path: &Path) -> Result<()> {
        fs::write(path, DEFAULT_CONFIG).context("failed to write default config")?;
        Ok(())
    }

    /// Expand ~ in paths to home directory
    ///
    /// # Errors
    /// Returns error if the path starts with `~/` and `HOME` is not set
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}
