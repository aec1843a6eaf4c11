//! Component definitions.
//!
//! Components are owned by the application description layer; the
//! orchestrator never mutates them. Only the fields it reads are modelled
//! here: the agent-boundary flag and the exported variables, including
//! which of them should receive a randomly allocated port.

use serde::{Deserialize, Serialize};

/// A variable a component exports to the rest of the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedVariable {
    /// Variable name, unique within the component.
    pub name: String,
    /// Default value from the component definition, if any.
    pub value: Option<String>,
    /// Whether the value is a port to be allocated at deployment time.
    #[serde(default)]
    pub random_port: bool,
}

impl ExportedVariable {
    /// A plain exported variable with a fixed default value.
    #[must_use]
    pub fn fixed(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            random_port: false,
        }
    }

    /// An exported variable whose value is a randomly allocated port.
    #[must_use]
    pub fn random_port(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            random_port: true,
        }
    }
}

/// A component definition, referenced by instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    /// Component name.
    pub name: String,
    /// Whether instances of this component are agent boundaries
    /// (own their machine). Root instances are boundaries regardless.
    #[serde(default)]
    pub scoped: bool,
    /// Variables exported by this component.
    #[serde(default)]
    pub exports: Vec<ExportedVariable>,
}

impl Component {
    /// Create a non-scoped component with no exports.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scoped: false,
            exports: Vec::new(),
        }
    }

    /// Mark the component as an agent boundary.
    #[must_use]
    pub const fn scoped(mut self) -> Self {
        self.scoped = true;
        self
    }

    /// Add an exported variable.
    #[must_use]
    pub fn with_export(mut self, export: ExportedVariable) -> Self {
        self.exports.push(export);
        self
    }

    /// The exported variables flagged for random port allocation.
    pub fn random_port_exports(&self) -> impl Iterator<Item = &ExportedVariable> {
        self.exports.iter().filter(|e| e.random_port)
    }
}
