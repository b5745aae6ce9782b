//! Error types for Stratum.

use thiserror::Error;

use crate::action::ActionError;
use crate::artifact::CacheError;
use crate::cancel::CancelReason;

#[derive(Debug, Error)]
pub enum Error {
    #[error("action failed: {0}")]
    Action(#[from] ActionError),

    #[error("cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the run itself cannot continue, as opposed
    /// to a single job failing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhaustion(_) | Error::InvariantViolation(_) | Error::InvalidPlan(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
