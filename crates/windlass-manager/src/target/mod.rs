//! Targets: infrastructure configurations, their persistence, the handler
//! contract and the registry resolving which target an instance uses.
//!
//! A *target* is a named infrastructure configuration (credentials plus
//! driver selection). *Association* is configuration — which target an
//! instance would use; *usage* is runtime fact — a machine is using that
//! target right now. The registry tracks both separately.

mod handler;
mod registry;
mod store;
mod workflow;

pub use handler::{HandlerResolver, MachineParams, MockTargetHandler, TargetHandler};
pub use registry::{TargetRegistry, UsageStatistics};
pub use store::{FileTargetStore, MemoryTargetStore, TargetRecord, TargetStore};
pub use workflow::{ProvisionOps, ProvisionStage, ProvisioningWorkflow};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use windlass_model::InstancePath;

use crate::error::{ManagerError, ManagerResult};

/// A target definition: an opaque id, the handler that drives it and the
/// driver-specific properties it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetProperties {
    /// Opaque target id.
    pub id: String,
    /// Name of the handler implementation driving this target.
    pub handler: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Driver-specific key/value properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl TargetProperties {
    /// Create a minimal target definition.
    #[must_use]
    pub fn new(id: impl Into<String>, handler: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler: handler.into(),
            name: name.into(),
            description: None,
            properties: BTreeMap::new(),
        }
    }

    /// Add a driver-specific property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Validate the definition. Missing id, handler or name are rejected
    /// before any side effect.
    pub fn validate(&self) -> ManagerResult<()> {
        let mut missing = Vec::new();
        if self.id.trim().is_empty() {
            missing.push("id");
        }
        if self.handler.trim().is_empty() {
            missing.push("handler");
        }
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::validation(format!(
                "target definition is missing: {}",
                missing.join(", ")
            )))
        }
    }
}

/// What an association binds a target to, within one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssociationScope {
    /// Default target for the whole application.
    ApplicationDefault,
    /// Default target for every instance of a component.
    Component {
        /// Component name.
        name: String,
    },
    /// Exact target for one instance path.
    Instance {
        /// Instance path.
        path: InstancePath,
    },
}

/// An association key: application plus scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssociationKey {
    /// Application name.
    pub application: String,
    /// What the target is bound to.
    #[serde(flatten)]
    pub scope: AssociationScope,
}

impl AssociationKey {
    /// Create a new association key.
    #[must_use]
    pub fn new(application: impl Into<String>, scope: AssociationScope) -> Self {
        Self {
            application: application.into(),
            scope,
        }
    }
}
