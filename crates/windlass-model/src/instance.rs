//! Instances and their orchestration bookkeeping.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::path::InstancePath;
use crate::status::InstanceStatus;

/// Orchestration bookkeeping attached to an instance.
///
/// This is the only place the orchestrator persists cross-call state about
/// a machine. The named fields replace the original design's untyped
/// string map; `extra` remains for driver-specific passthrough properties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceData {
    /// Machine id returned by the target handler. Non-empty iff a creation
    /// call returned successfully and termination has not yet completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,

    /// One-shot marker: the machine is ready for post-creation
    /// configuration. Cleared by the machine configurator when consumed.
    #[serde(default)]
    pub awaiting_configuration: bool,

    /// Defer model removal until the instance has been undeployed.
    #[serde(default)]
    pub delete_when_undeployed: bool,

    /// Human-readable reason for the last failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,

    /// Public address of the machine, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,

    /// Driver-specific passthrough properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A node in an application's instance tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Hierarchical path, immutable once created.
    pub path: InstancePath,
    /// The component this instance realizes. Owned externally.
    pub component: Arc<Component>,
    /// Lifecycle state. Mutated only by the instance orchestrator.
    pub status: InstanceStatus,
    /// Orchestration bookkeeping.
    #[serde(default)]
    pub data: InstanceData,
    /// Instance-local values for exported variables, including allocated
    /// random ports.
    #[serde(default)]
    pub overridden_exports: BTreeMap<String, String>,
}

impl Instance {
    /// Create a new, not yet deployed instance.
    #[must_use]
    pub fn new(path: InstancePath, component: Arc<Component>) -> Self {
        Self {
            path,
            component,
            status: InstanceStatus::NotDeployed,
            data: InstanceData::default(),
            overridden_exports: BTreeMap::new(),
        }
    }

    /// Whether this instance is an agent boundary: a root instance, or one
    /// whose component is flagged scoped.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.path.parent().is_none() || self.component.scoped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;

    #[test]
    fn roots_are_scoped() {
        let plain = Arc::new(Component::new("tomcat"));
        let root = Instance::new(InstancePath::root("vm"), plain.clone());
        assert!(root.is_scoped());

        let child = Instance::new(InstancePath::root("vm").child("app"), plain);
        assert!(!child.is_scoped());
    }

    #[test]
    fn scoped_component_makes_child_scoped() {
        let boundary = Arc::new(Component::new("docker-vm").scoped());
        let child = Instance::new(InstancePath::root("vm").child("nested"), boundary);
        assert!(child.is_scoped());
    }
}
