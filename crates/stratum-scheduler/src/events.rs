//! Progress events for observers of a run.
//!
//! Delivery is best effort: events go over a bounded channel with
//! `try_send`, and anything that does not fit is dropped and counted. The
//! scheduling loop never waits on an observer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use stratum_core::{ActionKind, ElementRef, JobId, JobKey, JobState, Message};
use stratum_executor::MessageForwarder;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::summary::RunSummary;

/// One job state transition.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub element: ElementRef,
    pub action: ActionKind,
    pub old_state: JobState,
    pub new_state: JobState,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Event emitted during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobStateChanged(JobEvent),
    JobMessage {
        job_id: JobId,
        job: JobKey,
        message: Message,
    },
    RunCompleted(RunSummary),
}

/// Sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SchedulerEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Create a sink and its receiver. A capacity of zero is treated as one.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn emit(&self, event: SchedulerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            // Nobody is listening any more.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Events discarded because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MessageForwarder for EventSink {
    fn forward(&self, job: JobId, key: &JobKey, message: &Message) {
        self.emit(SchedulerEvent::JobMessage {
            job_id: job,
            job: key.clone(),
            message: message.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::MessageType;

    fn event(new_state: JobState) -> SchedulerEvent {
        SchedulerEvent::JobStateChanged(JobEvent {
            job_id: JobId::new(0),
            element: ElementRef::new("base"),
            action: ActionKind::Build,
            old_state: JobState::Queued,
            new_state,
            timestamp: Utc::now(),
            detail: None,
        })
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(event(JobState::Running));
        sink.emit(event(JobState::Success));

        assert_eq!(sink.dropped(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            SchedulerEvent::JobStateChanged(JobEvent {
                new_state: JobState::Running,
                ..
            })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        sink.emit(event(JobState::Running));
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_forwarded_messages_become_events() {
        let (sink, mut rx) = EventSink::channel(4);
        let key = JobKey::new("base", ActionKind::Fetch);
        sink.forward(JobId::new(2), &key, &Message::new(MessageType::Log, "cloning"));

        match rx.try_recv().unwrap() {
            SchedulerEvent::JobMessage { job_id, job, message } => {
                assert_eq!(job_id, JobId::new(2));
                assert_eq!(job, key);
                assert_eq!(message.text, "cloning");
            }
            other => panic!("Expected JobMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(event(JobState::Running)).unwrap();
        assert_eq!(json["event"], "job_state_changed");
        assert_eq!(json["new_state"], "RUNNING");
        assert_eq!(json["action"], "build");
    }
}
