//! Applications and their instance trees.

use dashmap::DashMap;

use crate::context::AgentContext;
use crate::error::{ModelError, ModelResult};
use crate::instance::Instance;
use crate::path::InstancePath;

/// A deployed application: a name, a domain and a tree of instances.
///
/// The tree is stored as a concurrent table keyed by path; parent/child
/// edges are derived from path prefixes. All reads hand out clones so no
/// map lock is held across orchestration calls.
#[derive(Debug)]
pub struct Application {
    name: String,
    domain: String,
    instances: DashMap<InstancePath, Instance>,
}

impl Application {
    /// Create an empty application.
    #[must_use]
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            instances: DashMap::new(),
        }
    }

    /// Application name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Domain this application is deployed under.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Insert an instance into the tree.
    ///
    /// The parent (derived from the path) must already exist, and the path
    /// must not be taken.
    pub fn insert(&self, instance: Instance) -> ModelResult<()> {
        if let Some(parent) = instance.path.parent() {
            if !self.instances.contains_key(&parent) {
                return Err(ModelError::ParentNotFound(parent.to_string()));
            }
        }
        if self.instances.contains_key(&instance.path) {
            return Err(ModelError::DuplicateInstance(instance.path.to_string()));
        }
        self.instances.insert(instance.path.clone(), instance);
        Ok(())
    }

    /// Remove an instance and its whole subtree.
    ///
    /// Rejected while any instance in the subtree is still deployed,
    /// unless that instance carries the delete-when-undeployed marker.
    pub fn remove(&self, path: &InstancePath) -> ModelResult<Vec<Instance>> {
        let paths = self.subtree(path);
        if paths.is_empty() {
            return Err(ModelError::InstanceNotFound(path.to_string()));
        }

        for p in &paths {
            if let Some(instance) = self.instances.get(p) {
                if instance.status.is_deployed() && !instance.data.delete_when_undeployed {
                    return Err(ModelError::StillDeployed(p.to_string()));
                }
            }
        }

        let mut removed = Vec::with_capacity(paths.len());
        for p in &paths {
            if let Some((_, instance)) = self.instances.remove(p) {
                removed.push(instance);
            }
        }
        Ok(removed)
    }

    /// Get a snapshot of an instance.
    #[must_use]
    pub fn get(&self, path: &InstancePath) -> Option<Instance> {
        self.instances.get(path).map(|r| r.clone())
    }

    /// Whether an instance exists at the given path.
    #[must_use]
    pub fn contains(&self, path: &InstancePath) -> bool {
        self.instances.contains_key(path)
    }

    /// Mutate an instance in place.
    pub fn update<R>(
        &self,
        path: &InstancePath,
        f: impl FnOnce(&mut Instance) -> R,
    ) -> ModelResult<R> {
        let mut entry = self
            .instances
            .get_mut(path)
            .ok_or_else(|| ModelError::InstanceNotFound(path.to_string()))?;
        Ok(f(entry.value_mut()))
    }

    /// All paths in the subtree rooted at `path` (including `path` itself),
    /// in depth-first order.
    #[must_use]
    pub fn subtree(&self, path: &InstancePath) -> Vec<InstancePath> {
        let mut paths: Vec<_> = self
            .instances
            .iter()
            .map(|r| r.key().clone())
            .filter(|p| path.contains(p))
            .collect();
        paths.sort();
        paths
    }

    /// Direct children of an instance.
    #[must_use]
    pub fn children(&self, path: &InstancePath) -> Vec<InstancePath> {
        self.instances
            .iter()
            .map(|r| r.key().clone())
            .filter(|p| p.parent().as_ref() == Some(path))
            .collect()
    }

    /// Root instances of the application.
    #[must_use]
    pub fn roots(&self) -> Vec<InstancePath> {
        let mut roots: Vec<_> = self
            .instances
            .iter()
            .map(|r| r.key().clone())
            .filter(|p| p.parent().is_none())
            .collect();
        roots.sort();
        roots
    }

    /// All scoped instances (agent boundaries).
    #[must_use]
    pub fn scoped_instances(&self) -> Vec<InstancePath> {
        let mut scoped: Vec<_> = self
            .instances
            .iter()
            .filter(|r| r.value().is_scoped())
            .map(|r| r.key().clone())
            .collect();
        scoped.sort();
        scoped
    }

    /// The nearest self-or-ancestor scoped instance owning `path`'s machine.
    pub fn scoped_owner(&self, path: &InstancePath) -> ModelResult<InstancePath> {
        let mut current = path.clone();
        loop {
            let instance = self
                .instances
                .get(&current)
                .ok_or_else(|| ModelError::InstanceNotFound(current.to_string()))?;
            if instance.is_scoped() {
                return Ok(current);
            }
            drop(instance);
            match current.parent() {
                Some(parent) => current = parent,
                // Unreachable for a well-formed tree: roots are scoped.
                None => return Ok(current),
            }
        }
    }

    /// The agent context owning `path`'s machine.
    pub fn agent_context(&self, path: &InstancePath) -> ModelResult<AgentContext> {
        let owner = self.scoped_owner(path)?;
        Ok(AgentContext::new(self.name.clone(), owner))
    }
}
