//! Core domain types and traits for the Stratum build scheduler.
//!
//! This crate contains:
//! - Element references and job identity
//! - The job state machine and outcomes
//! - The action trait and its execution context
//! - Cancellation scopes
//! - Build plans (the dependency contract)
//! - Artifact cache abstractions
//! - Messages emitted by running actions

pub mod action;
pub mod artifact;
pub mod cancel;
pub mod element;
pub mod error;
pub mod id;
pub mod job;
pub mod message;
pub mod plan;

pub use action::{
    Action, ActionContext, ActionError, ActionKind, ActionOutput, ActionResult, FailureKind,
};
pub use artifact::{ArtifactRef, ArtifactStore, CacheError, CacheKey};
pub use cancel::{CancelReason, CancelScope};
pub use element::{Element, ElementRef};
pub use error::{Error, Result};
pub use id::{JobId, RunId};
pub use job::{JobKey, JobOutcome, JobState};
pub use message::{Message, MessageSink, MessageType, NullSink};
pub use plan::{BuildPlan, PlannedJob};
