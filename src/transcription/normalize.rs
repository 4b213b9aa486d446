use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message used when a structured worker error carries no message
pub const DEFAULT_ERROR_MESSAGE: &str = "worker reported an error";

/// Worker error payload decoded at the protocol boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedError {
    /// Machine-readable error code (e.g. `ASR_MODEL_INIT_FAILED`)
    pub code: Option<String>,
    /// Worker phase that failed (e.g. `init/asr`)
    pub phase: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Free-form details, usually a stack trace
    pub details: Option<String>,
    /// Arbitrary structured context
    pub data: Option<Value>,
}

/// Raw `error` field as the worker sends it
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawWorkerError {
    Message(String),
    Structured(StructuredError),
    Other(Value),
}

#[derive(Debug, Deserialize)]
struct StructuredError {
    code: Option<Value>,
    phase: Option<Value>,
    message: Option<Value>,
    details: Option<Value>,
    data: Option<Value>,
}

impl NormalizedError {
    /// Error with only a message
    #[must_use]
    pub fn message_only(message: impl Into<String>) -> Self {
        Self {
            code: None,
            phase: None,
            message: message.into(),
            details: None,
            data: None,
        }
    }
}

/// Converts a raw worker error payload into a [`NormalizedError`]
///
/// Plain strings become the message. Objects have their known fields pulled
/// out; non-string scalars are rendered as JSON text. Anything else is
/// rendered whole as the message.
#[must_use]
pub fn normalize(raw: &Value) -> NormalizedError {
    match serde_json::from_value::<RawWorkerError>(raw.clone()) {
        Ok(RawWorkerError::Message(message)) => NormalizedError::message_only(message),
        Ok(RawWorkerError::Structured(fields)) if raw.is_object() => NormalizedError {
            code: fields.code.as_ref().and_then(text_of),
            phase: fields.phase.as_ref().and_then(text_of),
            message: fields
                .message
                .as_ref()
                .and_then(text_of)
                .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_owned()),
            details: fields.details.as_ref().and_then(text_of),
            data: fields.data.filter(|value| !value.is_null()),
        },
        Ok(RawWorkerError::Structured(_) | RawWorkerError::Other(_)) | Err(_) => match raw {
            Value::Null => NormalizedError::message_only(DEFAULT_ERROR_MESSAGE),
            other => NormalizedError::message_only(other.to_string()),
        },
    }
}

/// Builds `message (code=…, phase=…, <first meaningful detail line>)`
#[must_use]
pub fn summarize(error: &NormalizedError) -> String {
    let mut parts = Vec::new();
    if let Some(code) = &error.code {
        parts.push(format!("code={code}"));
    }
    if let Some(phase) = &error.phase {
        parts.push(format!("phase={phase}"));
    }
    if let Some(line) = error.details.as_deref().and_then(first_meaningful_line) {
        if line != error.message {
            parts.push(line);
        }
    }

    if parts.is_empty() {
        error.message.clone()
    } else {
        format!("{} ({})", error.message, parts.join(", "))
    }
}

/// First line of `details` that is not stack-trace framing
///
/// Falls back to the whole trimmed text when every line is framing. Returns
/// `None` only for blank input.
#[must_use]
pub fn first_meaningful_line(details: &str) -> Option<String> {
    let trimmed = details.trim();
    if trimmed.is_empty() {
        return None;
    }

    let line = details
        .lines()
        .find(|line| !is_framing_line(line))
        .map_or(trimmed, str::trim);
    Some(line.to_owned())
}

fn is_framing_line(line: &str) -> bool {
    if line.trim().is_empty() || line.starts_with(char::is_whitespace) {
        return true;
    }
    let line = line.trim();
    line == "Traceback (most recent call last):"
        || line.starts_with("During handling of the above exception")
        || line.starts_with("The above exception was the direct cause")
        || line.starts_with("at ")
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}
