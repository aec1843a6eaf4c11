//! Target registry: definitions, associations, usage and hints.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};
use windlass_model::{AgentContext, Application, InstancePath, InstanceStatus};

use crate::error::{ManagerError, ManagerResult};

use super::store::{TargetRecord, TargetStore};
use super::{AssociationKey, AssociationScope, TargetProperties};

/// Which applications reference a target (have an association) versus
/// actively use it (hold a usage record) right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageStatistics {
    /// Applications with at least one association to the target.
    pub referencing: Vec<String>,
    /// Applications with at least one machine currently using the target.
    pub using: Vec<String>,
}

/// Durable store of target configurations, with in-memory caches for O(1)
/// resolution.
///
/// All state is reachable only through this handle; there are no
/// process-wide singletons. Every mutation is written through to the
/// backing [`TargetStore`].
pub struct TargetRegistry {
    store: Arc<dyn TargetStore>,
    targets: DashMap<String, TargetProperties>,
    associations: DashMap<AssociationKey, String>,
    usage: DashMap<String, HashSet<AgentContext>>,
    hints: DashMap<String, HashSet<String>>,
}

impl TargetRegistry {
    /// Create a registry over a persisted store.
    #[must_use]
    pub fn new(store: Arc<dyn TargetStore>) -> Self {
        Self {
            store,
            targets: DashMap::new(),
            associations: DashMap::new(),
            usage: DashMap::new(),
            hints: DashMap::new(),
        }
    }

    /// Restore the in-memory caches from the persisted store.
    pub async fn restore(&self) -> ManagerResult<()> {
        let records = self.store.load_all().await?;
        let count = records.len();
        for record in records {
            let id = record.properties.id.clone();
            for key in record.associations {
                self.associations.insert(key, id.clone());
            }
            self.usage
                .insert(id.clone(), record.usage.into_iter().collect());
            self.hints
                .insert(id.clone(), record.hints.into_iter().collect());
            self.targets.insert(id, record.properties);
        }
        info!(targets = count, "restored target registry");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Register a new target definition. Returns its id.
    pub async fn create_target(&self, properties: TargetProperties) -> ManagerResult<String> {
        properties.validate()?;
        let id = properties.id.clone();
        if self.targets.contains_key(&id) {
            return Err(ManagerError::validation(format!(
                "target already exists: {id}"
            )));
        }
        self.targets.insert(id.clone(), properties);
        self.persist(&id).await?;
        info!(target = %id, "target created");
        Ok(id)
    }

    /// Replace an existing target definition.
    pub async fn update_target(&self, properties: TargetProperties) -> ManagerResult<()> {
        properties.validate()?;
        let id = properties.id.clone();
        if !self.targets.contains_key(&id) {
            return Err(ManagerError::TargetNotFound(id));
        }
        self.targets.insert(id.clone(), properties);
        self.persist(&id).await
    }

    /// Delete a target definition.
    ///
    /// Rejected while any machine holds a usage record for it.
    pub async fn delete_target(&self, target_id: &str) -> ManagerResult<()> {
        if !self.targets.contains_key(target_id) {
            return Err(ManagerError::TargetNotFound(target_id.to_owned()));
        }

        let in_use = self
            .usage
            .get(target_id)
            .is_some_and(|set| !set.is_empty());
        if in_use {
            return Err(ManagerError::unauthorized(format!(
                "target {target_id} is in use and cannot be deleted"
            )));
        }

        self.targets.remove(target_id);
        self.usage.remove(target_id);
        self.hints.remove(target_id);
        self.associations.retain(|_, id| id != target_id);
        self.store.delete(target_id).await?;
        info!(target = %target_id, "target deleted");
        Ok(())
    }

    /// Get a target definition.
    pub fn get_target(&self, target_id: &str) -> ManagerResult<TargetProperties> {
        self.targets
            .get(target_id)
            .map(|r| r.clone())
            .ok_or_else(|| ManagerError::TargetNotFound(target_id.to_owned()))
    }

    /// All registered target definitions.
    #[must_use]
    pub fn list_targets(&self) -> Vec<TargetProperties> {
        let mut targets: Vec<_> = self.targets.iter().map(|r| r.clone()).collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        targets
    }

    // ------------------------------------------------------------------
    // Associations
    // ------------------------------------------------------------------

    /// Associate a target with an application default, a component default
    /// or an exact instance path.
    ///
    /// An exact-instance association is only accepted while that instance
    /// exists, is a scoped instance and is not deployed; anything else is
    /// a user error, rejected without side effect.
    pub async fn associate(
        &self,
        app: &Application,
        scope: AssociationScope,
        target_id: &str,
    ) -> ManagerResult<()> {
        if !self.targets.contains_key(target_id) {
            return Err(ManagerError::TargetNotFound(target_id.to_owned()));
        }
        self.check_instance_scope(app, &scope)?;

        let key = AssociationKey::new(app.name(), scope);
        let previous = self.associations.insert(key, target_id.to_owned());
        self.persist(target_id).await?;
        if let Some(previous_id) = previous {
            if previous_id != target_id {
                self.persist(&previous_id).await?;
            }
        }
        debug!(target = %target_id, application = app.name(), "target associated");
        Ok(())
    }

    /// Remove an association.
    pub async fn dissociate(&self, app: &Application, scope: AssociationScope) -> ManagerResult<()> {
        self.check_instance_scope(app, &scope)?;
        let key = AssociationKey::new(app.name(), scope);
        if let Some((_, target_id)) = self.associations.remove(&key) {
            self.persist(&target_id).await?;
        }
        Ok(())
    }

    /// Resolve the target id for an instance.
    ///
    /// Precedence: exact instance association, then the component default,
    /// then the application default. With `strict`, only an exact
    /// association counts (used for "does this exact key have an explicit
    /// mapping" checks).
    #[must_use]
    pub fn find_target_id(
        &self,
        app: &Application,
        path: &InstancePath,
        strict: bool,
    ) -> Option<String> {
        let exact = AssociationKey::new(
            app.name(),
            AssociationScope::Instance { path: path.clone() },
        );
        if let Some(id) = self.associations.get(&exact) {
            return Some(id.clone());
        }
        if strict {
            return None;
        }

        if let Some(instance) = app.get(path) {
            let component = AssociationKey::new(
                app.name(),
                AssociationScope::Component {
                    name: instance.component.name.clone(),
                },
            );
            if let Some(id) = self.associations.get(&component) {
                return Some(id.clone());
            }
        }

        let default = AssociationKey::new(app.name(), AssociationScope::ApplicationDefault);
        self.associations.get(&default).map(|id| id.clone())
    }

    // ------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------

    /// Resolve and lock the target for a scoped instance about to be
    /// deployed. Returns the target id and its definition.
    pub async fn lock(
        &self,
        app: &Application,
        path: &InstancePath,
    ) -> ManagerResult<(String, TargetProperties)> {
        let target_id =
            self.find_target_id(app, path, false)
                .ok_or_else(|| ManagerError::NoTargetAssociated {
                    application: app.name().to_owned(),
                    path: path.clone(),
                })?;
        let properties = self.get_target(&target_id)?;

        let context = AgentContext::new(app.name(), path.clone());
        self.usage
            .entry(target_id.clone())
            .or_default()
            .insert(context);
        self.persist(&target_id).await?;
        debug!(target = %target_id, instance = %path, "target locked");
        Ok((target_id, properties))
    }

    /// Release the usage record a machine holds, if any.
    pub async fn unlock(&self, context: &AgentContext) -> ManagerResult<()> {
        let mut touched = Vec::new();
        for mut entry in self.usage.iter_mut() {
            if entry.value_mut().remove(context) {
                touched.push(entry.key().clone());
            }
        }
        for target_id in touched {
            self.persist(&target_id).await?;
            debug!(target = %target_id, context = %context, "target unlocked");
        }
        Ok(())
    }

    /// The target a machine currently holds a usage record for.
    #[must_use]
    pub fn usage_target(&self, context: &AgentContext) -> Option<String> {
        self.usage
            .iter()
            .find(|entry| entry.value().contains(context))
            .map(|entry| entry.key().clone())
    }

    /// Usage statistics for one target.
    pub fn usage_statistics(&self, target_id: &str) -> ManagerResult<UsageStatistics> {
        if !self.targets.contains_key(target_id) {
            return Err(ManagerError::TargetNotFound(target_id.to_owned()));
        }

        let referencing: BTreeSet<String> = self
            .associations
            .iter()
            .filter(|r| r.value() == target_id)
            .map(|r| r.key().application.clone())
            .collect();

        let using: BTreeSet<String> = self
            .usage
            .get(target_id)
            .map(|set| set.iter().map(|ctx| ctx.application.clone()).collect())
            .unwrap_or_default();

        Ok(UsageStatistics {
            referencing: referencing.into_iter().collect(),
            using: using.into_iter().collect(),
        })
    }

    // ------------------------------------------------------------------
    // Hints
    // ------------------------------------------------------------------

    /// Scope a target's visibility to an application. A target with no
    /// hints is visible everywhere; hints only affect selection, never
    /// behavior.
    pub async fn add_hint(&self, target_id: &str, application: &str) -> ManagerResult<()> {
        if !self.targets.contains_key(target_id) {
            return Err(ManagerError::TargetNotFound(target_id.to_owned()));
        }
        self.hints
            .entry(target_id.to_owned())
            .or_default()
            .insert(application.to_owned());
        self.persist(target_id).await
    }

    /// Remove a visibility hint.
    pub async fn remove_hint(&self, target_id: &str, application: &str) -> ManagerResult<()> {
        if let Some(mut set) = self.hints.get_mut(target_id) {
            set.remove(application);
        }
        self.persist(target_id).await
    }

    /// The targets selectable by an application: those with no hints plus
    /// those hinted at it.
    #[must_use]
    pub fn visible_targets(&self, application: &str) -> Vec<TargetProperties> {
        let mut visible: Vec<_> = self
            .targets
            .iter()
            .filter(|r| {
                self.hints
                    .get(r.key())
                    .map_or(true, |set| set.is_empty() || set.contains(application))
            })
            .map(|r| r.clone())
            .collect();
        visible.sort_by(|a, b| a.id.cmp(&b.id));
        visible
    }

    // ------------------------------------------------------------------

    fn check_instance_scope(
        &self,
        app: &Application,
        scope: &AssociationScope,
    ) -> ManagerResult<()> {
        let AssociationScope::Instance { path } = scope else {
            return Ok(());
        };

        let instance = app.get(path).ok_or_else(|| {
            ManagerError::unauthorized(format!(
                "cannot bind a target to unknown instance {path}"
            ))
        })?;
        if !instance.is_scoped() {
            return Err(ManagerError::unauthorized(format!(
                "{path} is not a scoped instance"
            )));
        }
        if instance.status != InstanceStatus::NotDeployed {
            return Err(ManagerError::unauthorized(format!(
                "{path} is deployed; its target mapping cannot change"
            )));
        }
        Ok(())
    }

    /// Write the full record for one target through to the store.
    async fn persist(&self, target_id: &str) -> ManagerResult<()> {
        let Some(properties) = self.targets.get(target_id).map(|r| r.clone()) else {
            // Deleted concurrently; the store delete path handles it.
            return Ok(());
        };

        let mut associations: Vec<_> = self
            .associations
            .iter()
            .filter(|r| r.value() == target_id)
            .map(|r| r.key().clone())
            .collect();
        associations.sort();

        let mut usage: Vec<_> = self
            .usage
            .get(target_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        usage.sort();

        let mut hints: Vec<_> = self
            .hints
            .get(target_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        hints.sort();

        self.store
            .save(&TargetRecord {
                properties,
                associations,
                usage,
                hints,
            })
            .await
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::MemoryTargetStore;
    use std::sync::Arc as StdArc;
    use windlass_model::{Component, Instance};

    fn registry() -> TargetRegistry {
        TargetRegistry::new(Arc::new(MemoryTargetStore::new()))
    }

    fn app() -> Application {
        let app = Application::new("demo", "local");
        let vm = StdArc::new(Component::new("vm"));
        let server = StdArc::new(Component::new("server"));
        app.insert(Instance::new(InstancePath::root("vm1"), vm.clone()))
            .unwrap();
        app.insert(Instance::new(InstancePath::root("vm2"), vm))
            .unwrap();
        app.insert(Instance::new(
            InstancePath::root("vm1").child("tomcat"),
            server,
        ))
        .unwrap();
        app
    }

    async fn seeded() -> (TargetRegistry, Application) {
        let registry = registry();
        for id in ["t-exact", "t-component", "t-default", "t-spare"] {
            registry
                .create_target(TargetProperties::new(id, "mock", id))
                .await
                .unwrap();
        }
        (registry, app())
    }

    #[tokio::test]
    async fn create_rejects_invalid_and_duplicate() {
        let registry = registry();
        assert!(matches!(
            registry
                .create_target(TargetProperties::new("", "mock", "x"))
                .await,
            Err(ManagerError::Validation(_))
        ));

        registry
            .create_target(TargetProperties::new("t1", "mock", "x"))
            .await
            .unwrap();
        assert!(registry
            .create_target(TargetProperties::new("t1", "mock", "x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn resolution_precedence_with_all_levels_populated() {
        let (registry, app) = seeded().await;
        let vm1 = InstancePath::root("vm1");

        registry
            .associate(&app, AssociationScope::ApplicationDefault, "t-default")
            .await
            .unwrap();
        registry
            .associate(
                &app,
                AssociationScope::Component {
                    name: "vm".to_owned(),
                },
                "t-component",
            )
            .await
            .unwrap();
        registry
            .associate(
                &app,
                AssociationScope::Instance { path: vm1.clone() },
                "t-exact",
            )
            .await
            .unwrap();

        // Exact wins.
        assert_eq!(
            registry.find_target_id(&app, &vm1, false).as_deref(),
            Some("t-exact")
        );
        // Component default for a sibling without an exact mapping.
        assert_eq!(
            registry
                .find_target_id(&app, &InstancePath::root("vm2"), false)
                .as_deref(),
            Some("t-component")
        );
        // Application default for an instance of another component.
        assert_eq!(
            registry
                .find_target_id(&app, &vm1.child("tomcat"), false)
                .as_deref(),
            Some("t-default")
        );
        // Strict only sees the exact mapping.
        assert_eq!(
            registry.find_target_id(&app, &vm1, true).as_deref(),
            Some("t-exact")
        );
        assert_eq!(
            registry.find_target_id(&app, &InstancePath::root("vm2"), true),
            None
        );
    }

    #[tokio::test]
    async fn resolution_without_any_association() {
        let (registry, app) = seeded().await;
        assert_eq!(
            registry.find_target_id(&app, &InstancePath::root("vm1"), false),
            None
        );
    }

    #[tokio::test]
    async fn exact_association_requires_scoped_not_deployed() {
        let (registry, app) = seeded().await;

        // Non-scoped instance rejected.
        let err = registry
            .associate(
                &app,
                AssociationScope::Instance {
                    path: InstancePath::root("vm1").child("tomcat"),
                },
                "t-exact",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Unauthorized(_)));

        // Deployed scoped instance rejected.
        app.update(&InstancePath::root("vm1"), |i| {
            i.status = InstanceStatus::DeployedStarted;
        })
        .unwrap();
        let err = registry
            .associate(
                &app,
                AssociationScope::Instance {
                    path: InstancePath::root("vm1"),
                },
                "t-exact",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Unauthorized(_)));

        // Not-deployed scoped instance accepted.
        registry
            .associate(
                &app,
                AssociationScope::Instance {
                    path: InstancePath::root("vm2"),
                },
                "t-exact",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lock_records_usage_and_blocks_deletion() {
        let (registry, app) = seeded().await;
        registry
            .associate(&app, AssociationScope::ApplicationDefault, "t-default")
            .await
            .unwrap();

        let vm1 = InstancePath::root("vm1");
        let (target_id, _) = registry.lock(&app, &vm1).await.unwrap();
        assert_eq!(target_id, "t-default");

        let context = AgentContext::new("demo", vm1);
        assert_eq!(registry.usage_target(&context).as_deref(), Some("t-default"));

        let stats = registry.usage_statistics("t-default").unwrap();
        assert_eq!(stats.referencing, vec!["demo"]);
        assert_eq!(stats.using, vec!["demo"]);

        assert!(matches!(
            registry.delete_target("t-default").await,
            Err(ManagerError::Unauthorized(_))
        ));

        registry.unlock(&context).await.unwrap();
        assert_eq!(registry.usage_target(&context), None);
        registry.delete_target("t-default").await.unwrap();
    }

    #[tokio::test]
    async fn lock_without_association_is_distinct_error() {
        let (registry, app) = seeded().await;
        let err = registry
            .lock(&app, &InstancePath::root("vm1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NoTargetAssociated { .. }));
    }

    #[tokio::test]
    async fn hints_scope_visibility() {
        let (registry, _) = seeded().await;

        registry.add_hint("t-exact", "other-app").await.unwrap();

        let visible: Vec<_> = registry
            .visible_targets("demo")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(!visible.contains(&"t-exact".to_owned()));
        assert!(visible.contains(&"t-default".to_owned()));

        let visible_other: Vec<_> = registry
            .visible_targets("other-app")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(visible_other.contains(&"t-exact".to_owned()));
    }

    #[tokio::test]
    async fn restore_from_store() {
        let store = Arc::new(MemoryTargetStore::new());
        {
            let registry = TargetRegistry::new(Arc::clone(&store) as Arc<dyn TargetStore>);
            let app = app();
            registry
                .create_target(TargetProperties::new("t1", "mock", "One"))
                .await
                .unwrap();
            registry
                .associate(&app, AssociationScope::ApplicationDefault, "t1")
                .await
                .unwrap();
            registry.lock(&app, &InstancePath::root("vm1")).await.unwrap();
        }

        let restored = TargetRegistry::new(store as Arc<dyn TargetStore>);
        restored.restore().await.unwrap();
        let app = app();
        assert_eq!(
            restored
                .find_target_id(&app, &InstancePath::root("vm1"), false)
                .as_deref(),
            Some("t1")
        );
        let context = AgentContext::new("demo", InstancePath::root("vm1"));
        assert_eq!(restored.usage_target(&context).as_deref(), Some("t1"));
    }
}
