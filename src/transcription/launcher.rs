use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::WorkerError;

/// How the worker is deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Run the Python script with a local interpreter
    Development,
    /// Run the frozen single-file sidecar binary
    #[default]
    Bundled,
}

/// Program, arguments and environment used to start the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable to run
    pub program: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Spec running `program` with no arguments or extra environment
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Resolves how to start the worker for a deployment mode
#[cfg_attr(test, mockall::automock)]
pub trait ProcessLauncher: Send + Sync {
    /// Returns the launch spec for `mode`
    ///
    /// # Errors
    /// Returns [`WorkerError::SpawnFailure`] if the worker cannot be located
    fn launch_spec(&self, mode: LaunchMode) -> Result<LaunchSpec, WorkerError>;
}

/// A fixed spec launches the same way in every mode
impl ProcessLauncher for LaunchSpec {
    fn launch_spec(&self, _mode: LaunchMode) -> Result<LaunchSpec, WorkerError> {
        Ok(self.clone())
    }
}

/// Locates the ASR sidecar for development and bundled deployments
#[derive(Debug, Clone)]
pub struct SidecarLauncher {
    /// Interpreter used in development mode
    pub python: String,
    /// Worker script used in development mode
    pub script: PathBuf,
    /// Directory holding `<platform>/asr_server[.exe]`
    pub sidecar_dir: PathBuf,
}

impl SidecarLauncher {
    /// Bundled binary name for the current platform
    #[must_use]
    pub const fn binary_name() -> &'static str {
        if cfg!(windows) {
            "asr_server.exe"
        } else {
            "asr_server"
        }
    }

    /// Platform directory the sidecar build writes to
    #[must_use]
    pub const fn platform_dir() -> &'static str {
        if cfg!(target_os = "macos") {
            "mac"
        } else if cfg!(windows) {
            "win"
        } else {
            "linux"
        }
    }

    /// Full path of the bundled binary
    #[must_use]
    pub fn bundled_path(&self) -> PathBuf {
        self.sidecar_dir
            .join(Self::platform_dir())
            .join(Self::binary_name())
    }
}

impl ProcessLauncher for SidecarLauncher {
    fn launch_spec(&self, mode: LaunchMode) -> Result<LaunchSpec, WorkerError> {
        match mode {
            LaunchMode::Development => Ok(LaunchSpec::new(&self.python)
                .args(["-u".to_owned(), self.script.display().to_string()])
                .env("PYTHONUNBUFFERED", "1")
                .env("PYTHONIOENCODING", "utf-8")),
            LaunchMode::Bundled => {
                let path = self.bundled_path();
                ensure_exists(&path)?;
                Ok(LaunchSpec::new(path).env("PYTHONIOENCODING", "utf-8"))
            }
        }
    }
}

fn ensure_exists(path: &Path) -> Result<(), WorkerError> {
    if path.is_file() {
        return Ok(());
    }
    Err(WorkerError::SpawnFailure {
        program: path.display().to_string(),
        source: Arc::new(io::Error::new(
            io::ErrorKind::NotFound,
            "bundled worker binary not found",
        )),
    })
}
