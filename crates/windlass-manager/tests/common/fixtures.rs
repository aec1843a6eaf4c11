//! Test fixtures for manager integration tests.

use std::sync::Arc;

use windlass_manager::TargetProperties;
use windlass_model::{Application, Component, ExportedVariable, Instance, InstancePath};

/// Builder for creating test applications with an instance tree.
pub struct ApplicationBuilder {
    application: Application,
}

impl ApplicationBuilder {
    /// Creates a builder for an application with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            application: Application::new(name, "test"),
        }
    }

    /// Adds a root instance (always an agent boundary).
    pub fn with_root(self, name: &str) -> Self {
        self.with_instance(InstancePath::root(name), Component::new("vm"))
    }

    /// Adds a non-scoped child instance under an existing parent path.
    pub fn with_child(self, parent: &str, name: &str) -> Self {
        let path = InstancePath::parse(parent).unwrap().child(name);
        self.with_instance(path, Component::new(name))
    }

    /// Adds a child instance whose component exports a random port.
    pub fn with_port_child(self, parent: &str, name: &str, export: &str) -> Self {
        let path = InstancePath::parse(parent).unwrap().child(name);
        let component = Component::new(name).with_export(ExportedVariable::random_port(export));
        self.with_instance(path, component)
    }

    /// Adds a scoped (agent-boundary) child instance.
    pub fn with_scoped_child(self, parent: &str, name: &str) -> Self {
        let path = InstancePath::parse(parent).unwrap().child(name);
        self.with_instance(path, Component::new(name).scoped())
    }

    fn with_instance(self, path: InstancePath, component: Component) -> Self {
        self.application
            .insert(Instance::new(path, Arc::new(component)))
            .unwrap();
        self
    }

    /// Returns the built application.
    pub fn build(self) -> Application {
        self.application
    }
}

/// A target definition driven by the mock handler.
pub fn mock_target(id: &str) -> TargetProperties {
    TargetProperties::new(id, "mock", format!("Target {id}"))
        .with_property("region", "test-1")
}
