use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Diagnostics buffer shared between the stderr reader and the dispatcher
pub type SharedDiagnostics = Arc<Mutex<DiagnosticsBuffer>>;

/// Fixed-capacity FIFO of the most recent worker stderr lines
#[derive(Debug)]
pub struct DiagnosticsBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticsBuffer {
    /// Creates a buffer holding at most `capacity` lines
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Creates a buffer wrapped for sharing across tasks
    #[must_use]
    pub fn shared(capacity: usize) -> SharedDiagnostics {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// Appends a line, evicting the oldest one when full
    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Returns up to `count` of the most recent lines, oldest first
    #[must_use]
    pub fn tail(&self, count: usize) -> Vec<&str> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).map(String::as_str).collect()
    }

    /// Most recent `count` lines joined with newlines (empty if none)
    #[must_use]
    pub fn tail_text(&self, count: usize) -> String {
        self.tail(count).join("\n")
    }

    /// Number of retained lines
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether no lines are retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Maximum number of retained lines
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Reads the tail from a shared buffer, recovering from a poisoned lock
pub fn snapshot_tail(diagnostics: &SharedDiagnostics, count: usize) -> String {
    diagnostics
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .tail_text(count)
}
