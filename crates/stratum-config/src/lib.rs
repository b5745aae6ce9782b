//! KDL configuration parsing for Stratum.
//!
//! This crate handles parsing of:
//! - Build plans (stratum.plan.kdl): elements, dependencies and commands
//! - System configuration (stratum.kdl): scheduler, cache and logging

pub mod error;
mod node;
pub mod plan;
pub mod scheduler;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use plan::{PlanElement, PlanFile, parse_plan};
pub use scheduler::{ErrorPolicy, SchedulerConfig};
pub use system::{CacheConfig, LoggingConfig, SystemConfig, parse_system_config};
