//! Hotkey ASR - supervised out-of-process speech recognition
//!
//! This library exports core modules for testing and potential future reuse.

/// WAV payload encoding
pub mod audio;
/// Configuration management
pub mod config;
/// Logging setup
pub mod telemetry;
/// Recognition worker supervision and protocol
pub mod transcription;
