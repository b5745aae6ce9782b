//! Action trait and related types.
//!
//! An action is one kind of work performed on an element. The scheduler
//! treats it as an opaque callable with a declared kind.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::artifact::ArtifactRef;
use crate::cancel::CancelScope;
use crate::element::ElementRef;
use crate::id::JobId;
use crate::message::{Message, MessageSink, MessageType};

/// The closed set of action kinds, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Track,
    Pull,
    Fetch,
    Build,
    Push,
}

impl ActionKind {
    /// Every kind, in the order their queues are serviced.
    pub const PIPELINE: [ActionKind; 5] = [
        ActionKind::Track,
        ActionKind::Pull,
        ActionKind::Fetch,
        ActionKind::Build,
        ActionKind::Push,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Track => "track",
            ActionKind::Pull => "pull",
            ActionKind::Fetch => "fetch",
            ActionKind::Build => "build",
            ActionKind::Push => "push",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ActionKind::PIPELINE
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown action kind: {}", s))
    }
}

/// Whether retrying a failed action might succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Retryable,
    Fatal,
}

/// A logical failure of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ActionError {
    pub kind: FailureKind,
    pub message: String,
    pub detail: Option<String>,
}

impl ActionError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
            detail: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

/// What a successful action produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOutput {
    pub artifact: Option<ArtifactRef>,
    pub detail: Option<String>,
}

impl ActionOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub type ActionResult = std::result::Result<ActionOutput, ActionError>;

/// Everything a running action may use besides its element.
#[derive(Clone)]
pub struct ActionContext {
    pub job: JobId,
    pub element: ElementRef,
    pub kind: ActionKind,
    /// 1 for the first dispatch, incremented on each retry.
    pub attempt: u32,
    cancel: CancelScope,
    sink: Arc<dyn MessageSink>,
}

impl ActionContext {
    pub fn new(
        job: JobId,
        element: ElementRef,
        kind: ActionKind,
        attempt: u32,
        cancel: CancelScope,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            job,
            element,
            kind,
            attempt,
            cancel,
            sink,
        }
    }

    pub fn cancel_scope(&self) -> &CancelScope {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until this job is asked to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn message(&self, message_type: MessageType, text: impl Into<String>) {
        self.sink
            .message(Message::new(message_type, text).with_element(self.element.clone()));
    }

    pub fn message_with_detail(
        &self,
        message_type: MessageType,
        text: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.sink.message(
            Message::new(message_type, text)
                .with_element(self.element.clone())
                .with_detail(detail),
        );
    }

    pub fn info(&self, text: impl Into<String>) {
        self.message(MessageType::Info, text)
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.message(MessageType::Warn, text)
    }

    /// Run `activity`, reporting its start and its success or failure with
    /// the elapsed time.
    pub async fn timed_activity<T, F>(
        &self,
        name: impl Into<String>,
        activity: F,
    ) -> std::result::Result<T, ActionError>
    where
        F: Future<Output = std::result::Result<T, ActionError>>,
    {
        let name = name.into();
        let started = Instant::now();
        self.message(MessageType::Start, name.clone());

        let result = activity.await;
        let message_type = if result.is_ok() {
            MessageType::Success
        } else {
            MessageType::Fail
        };
        self.sink.message(
            Message::new(message_type, name)
                .with_element(self.element.clone())
                .with_elapsed(started.elapsed()),
        );
        result
    }
}

/// A kind of work the scheduler can run.
#[async_trait]
pub trait Action: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// Whether the action may be interrupted part way through. Actions
    /// that return false are always allowed to run to completion.
    fn is_cancellable(&self) -> bool {
        true
    }

    async fn execute(&self, element: &ElementRef, ctx: &ActionContext) -> ActionResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Message>>);

    impl MessageSink for Recorder {
        fn message(&self, message: Message) {
            self.0.lock().unwrap().push(message);
        }
    }

    fn context(sink: Arc<Recorder>) -> ActionContext {
        ActionContext::new(
            JobId::new(0),
            ElementRef::new("base"),
            ActionKind::Build,
            1,
            CancelScope::new(),
            sink,
        )
    }

    #[test]
    fn test_action_kind_roundtrip_names() {
        for kind in ActionKind::PIPELINE {
            assert_eq!(kind.as_str().parse::<ActionKind>(), Ok(kind));
        }
        assert!("compile".parse::<ActionKind>().is_err());
    }

    #[tokio::test]
    async fn test_timed_activity_success() {
        let sink = Arc::new(Recorder::default());
        let ctx = context(sink.clone());

        let value = ctx
            .timed_activity("Staging", async { Ok::<_, ActionError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let messages = sink.0.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, MessageType::Start);
        assert!(messages[0].elapsed.is_none());
        assert_eq!(messages[1].message_type, MessageType::Success);
        assert!(messages[1].elapsed.is_some());
        assert_eq!(messages[1].element.as_ref().unwrap().as_str(), "base");
    }

    #[tokio::test]
    async fn test_timed_activity_failure_is_returned() {
        let sink = Arc::new(Recorder::default());
        let ctx = context(sink.clone());

        let err = ctx
            .timed_activity("Staging", async {
                Err::<(), _>(ActionError::fatal("no space left"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.message, "no space left");

        let messages = sink.0.lock().unwrap();
        assert_eq!(messages[1].message_type, MessageType::Fail);
    }
}
