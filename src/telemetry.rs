use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// Filter used when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "info";

/// Initialize logging
///
/// Logs go to the configured file when telemetry is enabled, stdout otherwise.
///
/// # Errors
/// Returns error if the log file or its directory cannot be created
pub fn init(config: &TelemetryConfig) -> Result<()> {
    if !config.enabled {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .init();
        return Ok(());
    }

    let expanded_path = expand_log_path(&config.log_path)?;

    // Create parent directory if needed
    if let Some(parent) = expanded_path.parent() {
        fs::create_dir_all(parent).context("failed to create log directory")?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&expanded_path)
        .context("failed to open log file")?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(file)
        .with_target(false)
        .with_ansi(false)
        .init();

    tracing::info!(path = %expanded_path.display(), "telemetry initialized");

    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn expand_log_path(path: &str) -> Result<PathBuf> {
    if let Some(stripped) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(stripped))
    } else {
        Ok(PathBuf::from(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_log_path_with_tilde() {
        let home = env::var("HOME").expect("HOME not set");
        let result = expand_log_path("~/.hotkey-asr/worker.log").unwrap();
        assert_eq!(result, PathBuf::from(home).join(".hotkey-asr/worker.log"));
    }

    #[test]
    fn test_expand_log_path_without_tilde() {
        let result = expand_log_path("/var/log/hotkey-asr.log").unwrap();
        assert_eq!(result, PathBuf::from("/var/log/hotkey-asr.log"));
    }

    #[test]
    #[ignore = "installs the global tracing subscriber, which can only happen once per process"]
    fn test_init_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("nested/hotkey-asr.log");
        let config = TelemetryConfig {
            enabled: true,
            log_path: log_path.display().to_string(),
        };
        init(&config).unwrap();
        assert!(log_path.exists());
    }
}
