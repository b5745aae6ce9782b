//! Job execution for the Stratum build scheduler.
//!
//! Provides the pieces that run a single job:
//! - A bounded pool of worker slots
//! - The job runner, which turns every way an action can end into one outcome
//! - Recorded per-job logs
//! - Shell command actions and artifact transfer actions

pub mod command;
pub mod log;
pub mod pool;
pub mod process;
pub mod runner;

pub use command::{BuildAction, CommandTable, ElementCommands, PullAction, PushAction, ShellAction};
pub use log::{JobLog, JobMessenger, MessageForwarder, format_message};
pub use pool::{WorkerPool, WorkerSlot};
pub use process::run_shell;
pub use runner::{ExecutionReport, JobRequest, JobRunner};
