//! Agent contexts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::path::InstancePath;

/// Identifies one provisioned machine: the pair of application name and
/// scoped instance path.
///
/// Used as the allocation scope for random ports, the key of the message
/// mediator's pending queues and the lock key for target usage records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentContext {
    /// Application name.
    pub application: String,
    /// Path of the scoped instance owning the machine.
    pub scoped_path: InstancePath,
}

impl AgentContext {
    /// Create a new agent context.
    #[must_use]
    pub fn new(application: impl Into<String>, scoped_path: InstancePath) -> Self {
        Self {
            application: application.into(),
            scoped_path,
        }
    }
}

impl fmt::Display for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.scoped_path, self.application)
    }
}
