//! System configuration parsing.

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use stratum_core::ActionKind;

use crate::node::{get_bool_arg, get_uint_arg, require_string_arg};
use crate::scheduler::{ErrorPolicy, SchedulerConfig};
use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Local artifact cache directory.
    pub directory: PathBuf,
    /// Shared artifact cache to pull from and push to.
    pub remote: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".stratum/cache"),
            remote: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for per-job log files. No job logs are recorded when unset.
    pub directory: Option<PathBuf>,
    /// Emit tracing output as JSON.
    pub json: bool,
}

/// Parse system configuration from KDL text.
///
/// Every section is optional; omitted settings keep their defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "cache" => parse_cache(node, &mut config.cache)?,
            "logging" => parse_logging(node, &mut config.logging)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if config.scheduler.max_jobs == 0 {
        return Err(ConfigError::invalid("scheduler.max-jobs", "must be at least 1"));
    }

    Ok(config)
}

fn parse_scheduler(node: &KdlNode, config: &mut SchedulerConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let name = child.name().value();
        match name {
            "max-jobs" => config.max_jobs = get_uint_arg(child, "scheduler.max-jobs")? as usize,
            "trackers" | "pullers" | "fetchers" | "builders" | "pushers" => {
                let kind = limit_kind(name);
                let limit = get_uint_arg(child, &format!("scheduler.{}", name))? as usize;
                config.limits.insert(kind, limit);
            }
            "on-error" => {
                let value = require_string_arg(child, "scheduler.on-error")?;
                config.on_error = value
                    .parse::<ErrorPolicy>()
                    .map_err(|message| ConfigError::invalid("scheduler.on-error", message))?;
            }
            "retries" => {
                for (kind, n) in parse_kind_table(child, "scheduler.retries")? {
                    let n = u32::try_from(n).map_err(|_| {
                        ConfigError::invalid("scheduler.retries", format!("{} retries is too many", n))
                    })?;
                    config.retries.insert(kind, n);
                }
            }
            "timeout" => {
                for (kind, secs) in parse_kind_table(child, "scheduler.timeout")? {
                    config.timeouts.insert(kind, Duration::from_secs(secs));
                }
            }
            "abort-grace" => {
                config.abort_grace =
                    Duration::from_secs(get_uint_arg(child, "scheduler.abort-grace")?);
            }
            "event-buffer" => {
                config.event_buffer = get_uint_arg(child, "scheduler.event-buffer")? as usize;
            }
            _ => {}
        }
    }

    Ok(())
}

fn limit_kind(name: &str) -> ActionKind {
    match name {
        "trackers" => ActionKind::Track,
        "pullers" => ActionKind::Pull,
        "fetchers" => ActionKind::Fetch,
        "builders" => ActionKind::Build,
        _ => ActionKind::Push,
    }
}

/// Parse a block of `<kind> <integer>` entries.
fn parse_kind_table(node: &KdlNode, field: &str) -> ConfigResult<Vec<(ActionKind, u64)>> {
    let mut table = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let kind = child
                .name()
                .value()
                .parse::<ActionKind>()
                .map_err(|message| ConfigError::invalid(field, message))?;
            table.push((kind, get_uint_arg(child, field)?));
        }
    }
    Ok(table)
}

fn parse_cache(node: &KdlNode, config: &mut CacheConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "directory" => {
                    config.directory = require_string_arg(child, "cache.directory")?.into();
                }
                "remote" => {
                    config.remote = Some(require_string_arg(child, "cache.remote")?.into());
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn parse_logging(node: &KdlNode, config: &mut LoggingConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "directory" => {
                    config.directory = Some(require_string_arg(child, "logging.directory")?.into());
                }
                "json" => config.json = get_bool_arg(child).unwrap_or(true),
                _ => {}
            }
        }
    }
    Ok(())
}
