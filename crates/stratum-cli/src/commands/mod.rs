//! CLI command implementations.

pub mod build;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use stratum_config::{PlanFile, SystemConfig};
use stratum_core::{ActionKind, BuildPlan, Element};
use stratum_executor::CommandTable;

/// Load the system configuration, falling back to defaults when the file
/// does not exist.
pub fn load_system_config(path: &Path) -> Result<SystemConfig> {
    if !path.exists() {
        return Ok(SystemConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    stratum_config::parse_system_config(&content)
        .with_context(|| format!("Invalid configuration in {}", path.display()))
}

pub fn load_plan(path: &Path) -> Result<PlanFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    stratum_config::parse_plan(&content)
        .with_context(|| format!("Invalid build plan in {}", path.display()))
}

/// Directory the plan's relative paths are resolved against.
pub fn workspace_dir(plan_path: &Path) -> Result<PathBuf> {
    let parent = match plan_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    parent
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", parent.display()))
}

/// Commands and cache keys for `elements`, which are in dependency order.
pub fn command_table(plan: &PlanFile, elements: &[Element]) -> Result<CommandTable> {
    let mut table = CommandTable::new();
    for element in elements {
        let declared = plan
            .get(element.name.as_str())
            .with_context(|| format!("Element '{}' is not declared", element.name))?;
        table.insert(
            element.name.clone(),
            declared.commands.clone(),
            declared.env.clone(),
            &element.dependencies,
        )?;
    }
    Ok(table)
}

/// Action kinds a build runs.
pub fn pipeline_kinds(track: bool, remote: bool) -> Vec<ActionKind> {
    ActionKind::PIPELINE
        .into_iter()
        .filter(|kind| match kind {
            ActionKind::Track => track,
            ActionKind::Pull | ActionKind::Push => remote,
            ActionKind::Fetch | ActionKind::Build => true,
        })
        .collect()
}

pub fn validate(plan_path: &Path) -> Result<()> {
    let plan = load_plan(plan_path)?;
    let elements = plan.resolve(&[])?;
    command_table(&plan, &elements)?;
    println!("Configuration is valid");
    Ok(())
}

/// Print the jobs a build would run, in plan order.
pub fn show(plan_path: &Path, config: &SystemConfig, targets: &[String], track: bool) -> Result<()> {
    let plan_file = load_plan(plan_path)?;
    let elements = plan_file.resolve(targets)?;
    let table = command_table(&plan_file, &elements)?;
    let plan = BuildPlan::standard(&elements, &pipeline_kinds(track, config.cache.remote.is_some()));

    println!("{} jobs for {} elements", plan.len(), elements.len());
    for job in plan.jobs() {
        let key = table
            .get(&job.key.element)
            .map(|c| c.key.short().to_string())
            .unwrap_or_default();
        print!("  {:<32} {}", job.key.to_string(), key);
        if !job.prerequisites.is_empty() {
            let after: Vec<String> = job.prerequisites.iter().map(ToString::to_string).collect();
            print!("  after {}", after.join(", "));
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
element "base" {
    build "make"
}
element "app" {
    depends "base"
    fetch "git clone repo ."
    build "make app"
}
"#;

    #[test]
    fn test_pipeline_kinds() {
        assert_eq!(
            pipeline_kinds(false, false),
            vec![ActionKind::Fetch, ActionKind::Build]
        );
        assert_eq!(pipeline_kinds(true, true), ActionKind::PIPELINE.to_vec());
    }

    #[test]
    fn test_command_table_follows_resolution_order() {
        let plan = stratum_config::parse_plan(PLAN).unwrap();
        let elements = plan.resolve(&["app".to_string()]).unwrap();
        let table = command_table(&plan, &elements).unwrap();

        let app = table.get(&"app".into()).unwrap();
        assert_eq!(app.commands(ActionKind::Build), ["make app".to_string()]);
        assert!(table.get(&"base".into()).is_ok());
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let path = std::env::temp_dir().join(format!("stratum-missing-{}.kdl", uuid::Uuid::new_v4()));
        let config = load_system_config(&path).unwrap();
        assert_eq!(config.scheduler.max_jobs, SystemConfig::default().scheduler.max_jobs);
    }
}
