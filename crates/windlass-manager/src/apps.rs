//! Registry of managed applications.

use std::sync::Arc;

use dashmap::DashMap;
use windlass_model::Application;

use crate::error::{ManagerError, ManagerResult};

/// The applications this manager currently drives.
#[derive(Debug, Default)]
pub struct ApplicationRegistry {
    applications: DashMap<String, Arc<Application>>,
}

impl ApplicationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application under its own name.
    pub fn insert(&self, application: Application) -> ManagerResult<Arc<Application>> {
        let name = application.name().to_owned();
        if self.applications.contains_key(&name) {
            return Err(ManagerError::validation(format!(
                "application already registered: {name}"
            )));
        }
        let application = Arc::new(application);
        self.applications.insert(name, Arc::clone(&application));
        Ok(application)
    }

    /// Get an application by name.
    pub fn get(&self, name: &str) -> ManagerResult<Arc<Application>> {
        self.applications
            .get(name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| ManagerError::ApplicationNotFound(name.to_owned()))
    }

    /// Remove an application.
    pub fn remove(&self, name: &str) -> Option<Arc<Application>> {
        self.applications.remove(name).map(|(_, app)| app)
    }

    /// Names of all registered applications.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.applications.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }
}
