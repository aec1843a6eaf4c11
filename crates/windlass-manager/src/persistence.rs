//! Instance model persistence boundary.
//!
//! The broader application model is persisted by a collaborator; the
//! orchestrator only promises to call `save` after every mutating
//! operation.

use async_trait::async_trait;
use windlass_model::Application;

use crate::error::ManagerResult;

/// Saves the instance model after orchestrator mutations.
#[async_trait]
pub trait ModelSaver: Send + Sync {
    /// Persist the application's current instance tree.
    async fn save(&self, application: &Application) -> ManagerResult<()>;
}

/// A saver that does nothing, for tests and embedders that persist
/// elsewhere.
#[derive(Debug, Default)]
pub struct NoopSaver;

#[async_trait]
impl ModelSaver for NoopSaver {
    async fn save(&self, _application: &Application) -> ManagerResult<()> {
        Ok(())
    }
}
