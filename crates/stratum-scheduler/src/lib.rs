//! Job scheduling for the Stratum build scheduler.
//!
//! Turns a build plan into jobs, holds them in per-kind queues, and runs
//! them on a bounded worker pool in dependency order.

pub mod events;
pub mod graph;
pub mod job;
pub mod queue;
pub mod ranking;
pub mod scheduler;
pub mod summary;

pub use events::{EventSink, JobEvent, SchedulerEvent};
pub use graph::JobGraph;
pub use job::Job;
pub use queue::{Queue, QueueStats};
pub use ranking::{Fifo, Ranking, UnblockingFirst};
pub use scheduler::{ActionRegistry, Scheduler, SchedulerHandle};
pub use summary::{FailureDetail, RunSummary, StopReason};
