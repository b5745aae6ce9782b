//! Build plan file parsing.
//!
//! ```kdl
//! element "base" {
//!     fetch "git clone https://example.com/base.git src"
//!     build "make -C src install DESTDIR=$STRATUM_INSTALL_DIR"
//! }
//!
//! element "app" depends="base" {
//!     build "make -C app install DESTDIR=$STRATUM_INSTALL_DIR"
//!     env {
//!         CFLAGS "-O2"
//!     }
//! }
//! ```

use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;
use stratum_core::{ActionKind, Element, ElementRef};

use crate::node::{get_first_string_arg, get_string_list_prop, require_string_arg};
use crate::{ConfigError, ConfigResult};

static ELEMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+/-]*$").expect("valid regex"));

/// An element as declared in a plan file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanElement {
    pub name: String,
    pub depends: Vec<String>,
    /// Shell commands per action kind, run in order.
    pub commands: BTreeMap<ActionKind, Vec<String>>,
    pub env: BTreeMap<String, String>,
}

impl PlanElement {
    pub fn commands(&self, kind: ActionKind) -> &[String] {
        self.commands.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
    pub elements: Vec<PlanElement>,
}

impl PlanFile {
    pub fn get(&self, name: &str) -> Option<&PlanElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Resolve `targets` and everything they depend on, dependencies first.
    ///
    /// An empty target list selects every element.
    pub fn resolve(&self, targets: &[String]) -> ConfigResult<Vec<Element>> {
        let by_name: HashMap<&str, &PlanElement> =
            self.elements.iter().map(|e| (e.name.as_str(), e)).collect();

        let roots: Vec<&str> = if targets.is_empty() {
            self.elements.iter().map(|e| e.name.as_str()).collect()
        } else {
            targets.iter().map(String::as_str).collect()
        };

        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for root in roots {
            if !by_name.contains_key(root) {
                return Err(ConfigError::InvalidReference(format!(
                    "unknown target element '{}'",
                    root
                )));
            }
            topo_visit(root, &by_name, &mut visited, &mut order);
        }

        Ok(order
            .into_iter()
            .map(|name| {
                let element = by_name[name];
                Element {
                    name: ElementRef::new(name),
                    dependencies: element.depends.iter().map(ElementRef::new).collect(),
                }
            })
            .collect())
    }
}

fn topo_visit<'a>(
    name: &'a str,
    by_name: &HashMap<&'a str, &'a PlanElement>,
    visited: &mut HashSet<&'a str>,
    order: &mut Vec<&'a str>,
) {
    if !visited.insert(name) {
        return;
    }

    if let Some(&element) = by_name.get(name) {
        for dep in &element.depends {
            topo_visit(dep.as_str(), by_name, visited, order);
        }
    }

    order.push(name);
}

/// Parse a build plan from KDL text.
pub fn parse_plan(kdl: &str) -> ConfigResult<PlanFile> {
    let doc: KdlDocument = kdl.parse()?;
    let mut elements: Vec<PlanElement> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "element" => {
                let element = parse_element(node)?;
                if elements.iter().any(|e| e.name == element.name) {
                    return Err(ConfigError::Duplicate(format!("element '{}'", element.name)));
                }
                elements.push(element);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    // Validate DAG - check for missing dependencies
    let names: HashSet<&str> = elements.iter().map(|e| e.name.as_str()).collect();
    for element in &elements {
        for dep in &element.depends {
            if !names.contains(dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "element '{}' depends on unknown element '{}'",
                    element.name, dep
                )));
            }
        }
    }

    if let Err(cycle) = detect_cycle(&elements) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    Ok(PlanFile { elements })
}

fn parse_element(node: &KdlNode) -> ConfigResult<PlanElement> {
    let name = require_string_arg(node, "element name")?;
    if !ELEMENT_NAME.is_match(&name) {
        return Err(ConfigError::invalid(
            "element name",
            format!("'{}' contains characters outside [A-Za-z0-9._+/-]", name),
        ));
    }
    // Names become paths under the work and log directories.
    if name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ConfigError::invalid(
            "element name",
            format!("'{}' has an empty, '.' or '..' path segment", name),
        ));
    }

    let depends = get_string_list_prop(node, "depends");
    let mut commands: BTreeMap<ActionKind, Vec<String>> = BTreeMap::new();
    let mut env = BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let child_name = child.name().value();
            match child_name {
                "env" => {
                    if let Some(vars) = child.children() {
                        for var in vars.nodes() {
                            if let Some(val) = get_first_string_arg(var) {
                                env.insert(var.name().value().to_string(), val);
                            }
                        }
                    }
                }
                "depends" => {}
                _ => {
                    let kind = child_name.parse::<ActionKind>().map_err(|message| {
                        ConfigError::invalid(format!("element '{}'", name), message)
                    })?;
                    let command = require_string_arg(
                        child,
                        &format!("{} command for element '{}'", kind, name),
                    )?;
                    commands.entry(kind).or_default().push(command);
                }
            }
        }
    }

    Ok(PlanElement {
        name,
        depends,
        commands,
        env,
    })
}

/// Detect cycles in the element dependency graph using DFS.
fn detect_cycle(elements: &[PlanElement]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let element_map: HashMap<&str, &PlanElement> =
        elements.iter().map(|e| (e.name.as_str(), e)).collect();

    for element in elements {
        if !visited.contains_key(element.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(&element.name, &element_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    element_map: &'a HashMap<&'a str, &'a PlanElement>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(element) = element_map.get(node) {
        for dep in &element.depends {
            let dep_str: &'a str = dep.as_str();
            if !visited.contains_key(dep_str) {
                if let Some(cycle) = dfs_detect_cycle(dep_str, element_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
