//! Messages emitted by running actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::element::ElementRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// An activity started.
    Start,
    /// An activity completed successfully.
    Success,
    /// An activity failed.
    Fail,
    Info,
    Warn,
    Error,
    /// A line of output from a subprocess.
    Log,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Start => "START",
            MessageType::Success => "SUCCESS",
            MessageType::Fail => "FAIL",
            MessageType::Info => "INFO",
            MessageType::Warn => "WARN",
            MessageType::Error => "ERROR",
            MessageType::Log => "LOG",
        }
    }

    /// Whether messages of this type carry an elapsed time.
    pub fn is_completion(&self) -> bool {
        matches!(self, MessageType::Success | MessageType::Fail)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    pub text: String,
    pub element: Option<ElementRef>,
    /// Optional multi-line detail.
    pub detail: Option<String>,
    pub elapsed: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(message_type: MessageType, text: impl Into<String>) -> Self {
        Self {
            message_type,
            text: text.into(),
            element: None,
            detail: None,
            elapsed: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_element(mut self, element: ElementRef) -> Self {
        self.element = Some(element);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

/// Receives messages from a running action.
///
/// Implementations must not block: they are called from inside the
/// action's execution context.
pub trait MessageSink: Send + Sync {
    fn message(&self, message: Message);
}

/// Discards all messages.
pub struct NullSink;

impl MessageSink for NullSink {
    fn message(&self, _message: Message) {}
}
