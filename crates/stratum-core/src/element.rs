//! Element references.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name of an element, shared cheaply between jobs, events and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(from = "String", into = "String")]
#[display("{_0}")]
pub struct ElementRef(Arc<str>);

impl ElementRef {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ElementRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ElementRef {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<ElementRef> for String {
    fn from(element: ElementRef) -> Self {
        element.0.to_string()
    }
}

/// A resolved element: its name and the elements it depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub name: ElementRef,
    /// Direct dependencies, in declaration order.
    pub dependencies: Vec<ElementRef>,
}

impl Element {
    pub fn new(name: impl Into<ElementRef>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<ElementRef>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}
