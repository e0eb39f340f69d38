//! Status messages shown to the user.
//!
//! Workers and callbacks push short messages here; the front end reads
//! whatever is new on each render tick.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    /// Progress information.
    Info,
    /// A failed operation.
    Error,
}

/// A single status line.
#[derive(Debug, Clone)]
pub struct StatusMessage {
    /// Severity.
    pub level: StatusLevel,
    /// Text to display.
    pub text: String,
    /// When the message was pushed.
    pub at: DateTime<Utc>,
}

/// Shared append-only list of status messages.
#[derive(Debug, Clone, Default)]
pub struct StatusLog {
    messages: Arc<Mutex<Vec<StatusMessage>>>,
}

impl StatusLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message.
    pub fn push(&self, level: StatusLevel, text: impl Into<String>) {
        let message = StatusMessage {
            level,
            text: text.into(),
            at: Utc::now(),
        };
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    /// Appends an informational message.
    pub fn info(&self, text: impl Into<String>) {
        self.push(StatusLevel::Info, text);
    }

    /// Appends an error message.
    pub fn error(&self, text: impl Into<String>) {
        self.push(StatusLevel::Error, text);
    }

    /// Number of messages pushed so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing was pushed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages pushed at or after position `from`.
    #[must_use]
    pub fn since(&self, from: usize) -> Vec<StatusMessage> {
        let messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        messages.get(from..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// The most recent message, if any.
    #[must_use]
    pub fn last(&self) -> Option<StatusMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}
