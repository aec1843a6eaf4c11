//! Instance lifecycle orchestration.
//!
//! The orchestrator is the single writer of instance state. Scoped
//! instances map to machines: deploying one locks a target, resolves its
//! handler, creates the machine and drives it to the started state.
//! Non-scoped instances live on an agent; their lifecycle changes are
//! delegated as commands through the message mediator.
//!
//! Lifecycle states:
//!
//! ```text
//!   not_deployed -> deploying -> deployed_started <-> deployed_stopped
//!        ^                            |
//!        +------- undeploying <------+        (problem on failure)
//! ```
//!
//! Every mutating operation persists the model through the configured
//! [`ModelSaver`] before returning.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use windlass_model::{
    AgentContext, Application, Instance, InstancePath, InstanceStatus, ModelError,
};

use crate::apps::ApplicationRegistry;
use crate::configurator::MachineConfigurator;
use crate::error::{BatchFailure, ManagerError, ManagerResult};
use crate::messaging::{AgentCommand, MessageMediator};
use crate::persistence::ModelSaver;
use crate::ports::PortAllocator;
use crate::target::{HandlerResolver, MachineParams, TargetRegistry};

/// Drives instances through their lifecycle.
pub struct InstanceOrchestrator {
    applications: Arc<ApplicationRegistry>,
    targets: Arc<TargetRegistry>,
    handlers: Arc<HandlerResolver>,
    configurator: Arc<MachineConfigurator>,
    ports: Arc<PortAllocator>,
    mediator: Arc<MessageMediator>,
    saver: Arc<dyn ModelSaver>,
    domain: String,
    // Presence marks an in-flight machine creation for the context.
    // Insert-as-test-and-set makes concurrent deploys of the same scoped
    // instance collapse into one creation.
    creation_locks: DashMap<AgentContext, ()>,
}

impl InstanceOrchestrator {
    /// Wire up an orchestrator from its collaborators.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        applications: Arc<ApplicationRegistry>,
        targets: Arc<TargetRegistry>,
        handlers: Arc<HandlerResolver>,
        configurator: Arc<MachineConfigurator>,
        ports: Arc<PortAllocator>,
        mediator: Arc<MessageMediator>,
        saver: Arc<dyn ModelSaver>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            applications,
            targets,
            handlers,
            configurator,
            ports,
            mediator,
            saver,
            domain: domain.into(),
            creation_locks: DashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Application management
    // ------------------------------------------------------------------

    /// Register an application with the orchestrator.
    pub fn register_application(&self, application: Application) -> ManagerResult<Arc<Application>> {
        let app = self.applications.insert(application)?;
        info!(application = app.name(), "application registered");
        Ok(app)
    }

    /// Unregister an application. Refused while any of its instances is
    /// still deployed.
    pub fn unregister_application(&self, name: &str) -> ManagerResult<()> {
        let app = self.applications.get(name)?;
        for path in self.collect(&app, None) {
            if let Some(instance) = app.get(&path) {
                if instance.status.is_deployed() || instance.data.machine_id.is_some() {
                    return Err(ManagerError::unauthorized(format!(
                        "cannot unregister {name}: {path} is still deployed"
                    )));
                }
            }
        }

        self.applications.remove(name);
        self.ports.release_application(name);
        self.creation_locks.retain(|ctx, ()| ctx.application != name);
        info!(application = name, "application unregistered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Single-instance lifecycle
    // ------------------------------------------------------------------

    /// Deploy one instance.
    ///
    /// Scoped instances get a machine created and are driven synchronously
    /// to the started state. Non-scoped instances are delegated to their
    /// agent, which deploys without starting.
    pub async fn deploy(&self, application: &str, path: &InstancePath) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let instance = app
            .get(path)
            .ok_or_else(|| ManagerError::Model(ModelError::InstanceNotFound(path.to_string())))?;

        if instance.is_scoped() {
            self.deploy_scoped(&app, path, &instance).await
        } else {
            self.delegate_transition(
                &app,
                path,
                InstanceStatus::Deploying,
                InstanceStatus::DeployedStopped,
            )
            .await
        }
    }

    /// Start a deployed-but-stopped instance. Scoped instances are started
    /// by [`deploy`](Self::deploy); starting one here is only valid as a
    /// no-op when it already runs.
    pub async fn start(&self, application: &str, path: &InstancePath) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let instance = app
            .get(path)
            .ok_or_else(|| ManagerError::Model(ModelError::InstanceNotFound(path.to_string())))?;

        if instance.is_scoped() {
            if instance.status == InstanceStatus::DeployedStarted {
                return Ok(());
            }
            return Err(ManagerError::validation(format!(
                "{path} is a scoped instance; deploy it to start its machine"
            )));
        }

        self.delegate_transition(
            &app,
            path,
            InstanceStatus::Starting,
            InstanceStatus::DeployedStarted,
        )
        .await
    }

    /// Stop a started instance without undeploying it. Not applicable to
    /// scoped instances, whose machine is either up or gone.
    pub async fn stop(&self, application: &str, path: &InstancePath) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let instance = app
            .get(path)
            .ok_or_else(|| ManagerError::Model(ModelError::InstanceNotFound(path.to_string())))?;

        if instance.is_scoped() {
            return Err(ManagerError::validation(format!(
                "{path} is a scoped instance; undeploy it to stop its machine"
            )));
        }

        self.delegate_transition(
            &app,
            path,
            InstanceStatus::Stopping,
            InstanceStatus::DeployedStopped,
        )
        .await
    }

    /// Undeploy one instance.
    ///
    /// For a scoped instance this terminates the machine and resets the
    /// whole subtree; for a non-scoped one it delegates to the agent.
    pub async fn undeploy(&self, application: &str, path: &InstancePath) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let instance = app
            .get(path)
            .ok_or_else(|| ManagerError::Model(ModelError::InstanceNotFound(path.to_string())))?;

        if instance.is_scoped() {
            self.undeploy_scoped(&app, path, &instance).await
        } else {
            self.delegate_transition(
                &app,
                path,
                InstanceStatus::Undeploying,
                InstanceStatus::NotDeployed,
            )
            .await
        }
    }

    async fn deploy_scoped(
        &self,
        app: &Arc<Application>,
        path: &InstancePath,
        instance: &Instance,
    ) -> ManagerResult<()> {
        // A machine id means creation already happened (possibly in a past
        // manager run); deploying again is a no-op.
        if instance.data.machine_id.is_some() {
            debug!(instance = %path, "machine already created, skipping");
            return Ok(());
        }

        let context = AgentContext::new(app.name(), path.clone());
        if self.creation_locks.insert(context.clone(), ()).is_some() {
            debug!(instance = %path, "machine creation already in progress");
            return Ok(());
        }

        let previous = instance.status;
        app.update(path, |i| i.status = InstanceStatus::Deploying)?;
        self.saver.save(app).await?;
        info!(instance = %path, application = app.name(), "deploying scoped instance");

        let (target_id, target) = match self.targets.lock(app, path).await {
            Ok(locked) => locked,
            Err(e) => {
                return Err(self.abort_creation(app, path, &context, previous, false, e).await);
            }
        };

        let handler = match self.handlers.resolve(&target) {
            Ok(handler) => handler,
            Err(e) => {
                return Err(self.abort_creation(app, path, &context, previous, true, e).await);
            }
        };

        let params = MachineParams {
            target,
            context: context.clone(),
            domain: self.domain.clone(),
        };

        let machine_id = match handler.create_machine(&params).await {
            Ok(machine_id) => machine_id,
            Err(e) => {
                return Err(self.abort_creation(app, path, &context, previous, true, e).await);
            }
        };
        info!(instance = %path, machine_id = %machine_id, "machine created");

        app.update(path, |i| {
            i.data.machine_id = Some(machine_id.clone());
            i.data.awaiting_configuration = true;
            i.data.last_failure = None;
        })?;
        // The machine id now guards against duplicate creation.
        self.creation_locks.remove(&context);
        self.saver.save(app).await?;

        match handler.retrieve_public_address(&params, &machine_id).await {
            Ok(address) => {
                app.update(path, |i| i.data.public_address = address)?;
            }
            Err(e) => {
                warn!(instance = %path, error = %e, "public address not available yet");
            }
        }

        self.configurator.register_candidate(context.clone(), &target_id);
        self.assign_random_ports(app, path, &context)?;

        if let Err(e) = handler.configure_machine(&params, &machine_id).await {
            warn!(instance = %path, error = %e, "machine configuration failed");
            app.update(path, |i| {
                i.status = InstanceStatus::Problem;
                i.data.last_failure = Some(e.to_string());
            })?;
            self.saver.save(app).await?;
            return Err(e);
        }

        app.update(path, |i| i.status = InstanceStatus::DeployedStarted)?;
        self.saver.save(app).await?;

        let instances: Vec<Instance> = app
            .subtree(path)
            .iter()
            .filter_map(|p| app.get(p))
            .collect();
        self.mediator
            .send_safely(app, &context, AgentCommand::SendInstances { instances })
            .await?;

        info!(instance = %path, "scoped instance deployed and started");
        Ok(())
    }

    /// Roll back a failed machine creation and hand the error back.
    async fn abort_creation(
        &self,
        app: &Arc<Application>,
        path: &InstancePath,
        context: &AgentContext,
        previous: InstanceStatus,
        unlock_target: bool,
        error: ManagerError,
    ) -> ManagerError {
        warn!(instance = %path, error = %error, "machine creation aborted");
        if unlock_target {
            if let Err(e) = self.targets.unlock(context).await {
                warn!(instance = %path, error = %e, "target unlock failed during rollback");
            }
        }
        self.creation_locks.remove(context);
        if let Err(e) = app.update(path, |i| i.status = previous) {
            warn!(instance = %path, error = %e, "status rollback failed");
        }
        if let Err(e) = self.saver.save(app).await {
            warn!(instance = %path, error = %e, "model save failed during rollback");
        }
        error
    }

    async fn undeploy_scoped(
        &self,
        app: &Arc<Application>,
        path: &InstancePath,
        instance: &Instance,
    ) -> ManagerResult<()> {
        // Nested scoped descendants run machines of their own: tear them
        // down first so their machines, target locks, ports and queues
        // are released, not just their model state.
        let nested: Vec<InstancePath> = app
            .subtree(path)
            .into_iter()
            .filter(|p| p != path && app.get(p).is_some_and(|i| i.is_scoped()))
            .collect();
        for p in &nested {
            // Recursion reaches the deeper levels; skip the ones it covers.
            if nested.iter().any(|s| s != p && s.contains(p)) {
                continue;
            }
            let Some(nested_instance) = app.get(p) else {
                continue;
            };
            Box::pin(self.undeploy_scoped(app, p, &nested_instance)).await?;
        }

        if instance.status == InstanceStatus::NotDeployed && instance.data.machine_id.is_none() {
            return Ok(());
        }

        let context = AgentContext::new(app.name(), path.clone());
        let previous = instance.status;
        app.update(path, |i| i.status = InstanceStatus::Undeploying)?;
        self.saver.save(app).await?;
        info!(instance = %path, application = app.name(), "undeploying scoped instance");

        self.configurator.cancel(&context);

        if let Some(machine_id) = instance.data.machine_id.clone() {
            let target_id = self
                .targets
                .usage_target(&context)
                .or_else(|| self.targets.find_target_id(app, path, false))
                .ok_or_else(|| ManagerError::NoTargetAssociated {
                    application: app.name().to_owned(),
                    path: path.clone(),
                })?;
            let target = self.targets.get_target(&target_id)?;
            let handler = self.handlers.resolve(&target)?;
            let params = MachineParams {
                target,
                context: context.clone(),
                domain: self.domain.clone(),
            };

            if let Err(e) = handler.terminate_machine(&params, &machine_id).await {
                warn!(instance = %path, error = %e, "machine termination failed");
                // The machine may still be up: keep its id and restore the
                // status so the operation can be retried.
                app.update(path, |i| {
                    i.status = previous;
                    i.data.last_failure = Some(e.to_string());
                })?;
                self.saver.save(app).await?;
                return Err(e);
            }
            info!(instance = %path, machine_id = %machine_id, "machine terminated");
        }

        self.targets.unlock(&context).await?;
        self.ports.release_context(&context);
        self.mediator.drop_queue(&context);
        self.creation_locks.remove(&context);

        let mut deferred = Vec::new();
        for p in app.subtree(path) {
            let delete = app.update(&p, |i| {
                i.status = InstanceStatus::NotDeployed;
                i.data.machine_id = None;
                i.data.awaiting_configuration = false;
                i.data.public_address = None;
                i.data.delete_when_undeployed
            })?;
            if delete {
                deferred.push(p);
            }
        }
        // Deepest first so parents are removed after their children.
        for p in deferred.into_iter().rev() {
            if app.contains(&p) {
                app.remove(&p)?;
                debug!(instance = %p, "deferred deletion applied");
            }
        }
        self.saver.save(app).await?;

        info!(instance = %path, "scoped instance undeployed");
        Ok(())
    }

    /// Delegate a lifecycle transition of a non-scoped instance to the
    /// agent hosting it.
    async fn delegate_transition(
        &self,
        app: &Arc<Application>,
        path: &InstancePath,
        optimistic: InstanceStatus,
        target_status: InstanceStatus,
    ) -> ManagerResult<()> {
        let context = app.agent_context(path)?;
        app.update(path, |i| i.status = optimistic)?;
        self.saver.save(app).await?;
        self.mediator
            .send_safely(
                app,
                &context,
                AgentCommand::ChangeInstanceState {
                    path: path.clone(),
                    target_status,
                },
            )
            .await
    }

    fn assign_random_ports(
        &self,
        app: &Arc<Application>,
        path: &InstancePath,
        context: &AgentContext,
    ) -> ManagerResult<()> {
        for p in app.subtree(path) {
            let Some(instance) = app.get(&p) else {
                continue;
            };
            for export in instance.component.random_port_exports() {
                let restored = instance
                    .overridden_exports
                    .get(&export.name)
                    .and_then(|v| v.parse::<u16>().ok());
                let port = self.ports.acknowledge_or_allocate(context, restored)?;
                let name = export.name.clone();
                app.update(&p, |i| {
                    i.overridden_exports.insert(name, port.to_string());
                })?;
                debug!(instance = %p, export = %export.name, port, "random port assigned");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------

    /// Deploy and start every instance under `path` (the whole application
    /// when `None`). Every instance is attempted; failures are aggregated.
    pub async fn deploy_and_start_all(
        &self,
        application: &str,
        path: Option<&InstancePath>,
    ) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let paths = self.collect(&app, path);
        let mut batch = BatchFailure {
            attempted: paths.len(),
            ..BatchFailure::default()
        };

        for p in paths {
            let result = match app.get(&p) {
                Some(instance) if instance.is_scoped() => self.deploy(application, &p).await,
                Some(_) => {
                    self.delegate_transition(
                        &app,
                        &p,
                        InstanceStatus::Deploying,
                        InstanceStatus::DeployedStarted,
                    )
                    .await
                }
                None => continue,
            };
            if let Err(e) = result {
                batch.record(p, &e);
            }
        }
        batch.into_result()
    }

    /// Stop every non-scoped instance under `path` (the whole application
    /// when `None`).
    pub async fn stop_all(
        &self,
        application: &str,
        path: Option<&InstancePath>,
    ) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let paths: Vec<_> = self
            .collect(&app, path)
            .into_iter()
            .filter(|p| app.get(p).is_some_and(|i| !i.is_scoped()))
            .collect();
        let mut batch = BatchFailure {
            attempted: paths.len(),
            ..BatchFailure::default()
        };

        for p in paths {
            if let Err(e) = self.stop(application, &p).await {
                batch.record(p, &e);
            }
        }
        batch.into_result()
    }

    /// Undeploy everything under `path` (the whole application when
    /// `None`). Scoped instances tear their machine down, which covers
    /// their subtree; non-scoped instances outside any selected scoped
    /// instance are delegated individually.
    pub async fn undeploy_all(
        &self,
        application: &str,
        path: Option<&InstancePath>,
    ) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let paths = self.collect(&app, path);
        let scoped: Vec<InstancePath> = paths
            .iter()
            .filter(|p| app.get(p).is_some_and(|i| i.is_scoped()))
            .cloned()
            .collect();

        let mut attempted = 0;
        let mut batch = BatchFailure::default();
        for p in &paths {
            let covered_by_scoped = scoped.iter().any(|s| s != p && s.contains(p));
            if covered_by_scoped {
                continue;
            }
            attempted += 1;
            if let Err(e) = self.undeploy(application, p).await {
                batch.record(p.clone(), &e);
            }
        }
        batch.attempted = attempted;
        batch.into_result()
    }

    /// Ask every running agent of an application to report its state.
    pub async fn resynchronize(&self, application: &str) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let scoped = app.scoped_instances();
        let mut batch = BatchFailure::default();

        for path in scoped {
            let Some(instance) = app.get(&path) else {
                continue;
            };
            if instance.status != InstanceStatus::DeployedStarted {
                continue;
            }
            batch.attempted += 1;
            let context = AgentContext::new(app.name(), path.clone());
            if let Err(e) = self
                .mediator
                .send_directly(&context, &AgentCommand::Resynchronize)
                .await
            {
                batch.record(path, &ManagerError::Transport(e));
            }
        }
        info!(application, attempted = batch.attempted, "resynchronization requested");
        batch.into_result()
    }

    fn collect(&self, app: &Arc<Application>, path: Option<&InstancePath>) -> Vec<InstancePath> {
        match path {
            Some(p) => app.subtree(p),
            None => {
                let mut all = Vec::new();
                for root in app.roots() {
                    all.extend(app.subtree(&root));
                }
                all
            }
        }
    }

    // ------------------------------------------------------------------
    // Model edits
    // ------------------------------------------------------------------

    /// Add an instance to a running application and notify the agent
    /// hosting it, if any.
    pub async fn add_instance(&self, application: &str, instance: Instance) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let path = instance.path.clone();
        app.insert(instance.clone())?;
        self.saver.save(&app).await?;
        info!(instance = %path, application, "instance added");

        // Only notify an agent that actually exists: the owner's machine
        // must be deployed. A later deploy pushes the full model anyway.
        if path.parent().is_some() {
            let context = app.agent_context(&path)?;
            let owner_deployed = app
                .get(&context.scoped_path)
                .is_some_and(|i| i.data.machine_id.is_some());
            if owner_deployed {
                self.mediator
                    .send_safely(&app, &context, AgentCommand::AddInstance { instance })
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove an instance (and its subtree) from an application. Refused
    /// while the instance is deployed, unless it was marked for deferred
    /// deletion.
    pub async fn remove_instance(&self, application: &str, path: &InstancePath) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        let context = app.agent_context(path).ok();
        let removed_ports = self.subtree_ports(&app, path);

        match app.remove(path) {
            Ok(_) => {}
            Err(ModelError::StillDeployed(p)) => {
                return Err(ManagerError::unauthorized(format!(
                    "cannot remove {p}: still deployed"
                )));
            }
            Err(e) => return Err(e.into()),
        }
        self.saver.save(&app).await?;
        info!(instance = %path, application, "instance removed");

        // Tell the agent, unless the removed instance was the agent itself
        // or the machine never existed.
        if let Some(context) = context {
            self.ports.release_ports(&context, &removed_ports);
            let owner_deployed = app
                .get(&context.scoped_path)
                .is_some_and(|i| i.data.machine_id.is_some());
            if context.scoped_path != *path && owner_deployed {
                self.mediator
                    .send_safely(
                        &app,
                        &context,
                        AgentCommand::RemoveInstance { path: path.clone() },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Random ports currently held by the exported variables of a subtree.
    fn subtree_ports(&self, app: &Arc<Application>, path: &InstancePath) -> Vec<u16> {
        let mut ports = Vec::new();
        for p in app.subtree(path) {
            let Some(instance) = app.get(&p) else {
                continue;
            };
            for export in instance.component.random_port_exports() {
                if let Some(port) = instance
                    .overridden_exports
                    .get(&export.name)
                    .and_then(|v| v.parse::<u16>().ok())
                {
                    ports.push(port);
                }
            }
        }
        ports
    }

    /// Mark an instance so it is deleted automatically when its machine is
    /// next undeployed.
    pub async fn mark_for_deferred_deletion(
        &self,
        application: &str,
        path: &InstancePath,
    ) -> ManagerResult<()> {
        let app = self.applications.get(application)?;
        app.update(path, |i| i.data.delete_when_undeployed = true)?;
        self.saver.save(&app).await?;
        debug!(instance = %path, application, "marked for deferred deletion");
        Ok(())
    }
}

impl std::fmt::Debug for InstanceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceOrchestrator")
            .field("domain", &self.domain)
            .field("creation_locks", &self.creation_locks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{ConfiguratorConfig, PortRangeConfig};
    use crate::messaging::MockTransport;
    use crate::persistence::NoopSaver;
    use crate::target::{
        AssociationScope, MemoryTargetStore, MockTargetHandler, TargetProperties,
    };
    use windlass_model::{Component, ExportedVariable};

    struct Harness {
        orchestrator: InstanceOrchestrator,
        transport: Arc<MockTransport>,
        handler: Arc<MockTargetHandler>,
        targets: Arc<TargetRegistry>,
        configurator: Arc<MachineConfigurator>,
        ports: Arc<PortAllocator>,
        app: Arc<Application>,
    }

    /// One application: scoped roots vm1/vm2, with /vm1/db carrying a
    /// random port export.
    async fn harness() -> Harness {
        let applications = Arc::new(ApplicationRegistry::new());
        let app = Application::new("demo", "local");
        let vm = Arc::new(Component::new("vm"));
        let db = Arc::new(
            Component::new("db").with_export(ExportedVariable::random_port("db.port")),
        );
        app.insert(Instance::new(InstancePath::root("vm1"), Arc::clone(&vm)))
            .unwrap();
        app.insert(Instance::new(
            InstancePath::root("vm1").child("db"),
            db,
        ))
        .unwrap();
        app.insert(Instance::new(InstancePath::root("vm2"), vm))
            .unwrap();
        let app = applications.insert(app).unwrap();

        let targets = Arc::new(TargetRegistry::new(Arc::new(MemoryTargetStore::new())));
        targets
            .create_target(TargetProperties::new("t1", "mock", "Mock target"))
            .await
            .unwrap();
        targets
            .associate(&app, AssociationScope::ApplicationDefault, "t1")
            .await
            .unwrap();

        let handler = Arc::new(MockTargetHandler::new());
        let handlers = Arc::new(HandlerResolver::new());
        handlers.register(Arc::clone(&handler) as Arc<dyn crate::target::TargetHandler>);

        let configurator = Arc::new(MachineConfigurator::new(
            Arc::clone(&applications),
            &ConfiguratorConfig::default(),
            "local",
        ));
        let ports = Arc::new(PortAllocator::new(&PortRangeConfig::default()));
        let transport = Arc::new(MockTransport::connected());
        let mediator = Arc::new(MessageMediator::new(
            Arc::clone(&transport) as Arc<dyn crate::messaging::AgentTransport>
        ));

        let orchestrator = InstanceOrchestrator::new(
            applications,
            Arc::clone(&targets),
            handlers,
            Arc::clone(&configurator),
            Arc::clone(&ports),
            mediator,
            Arc::new(NoopSaver),
            "local",
        );

        Harness {
            orchestrator,
            transport,
            handler,
            targets,
            configurator,
            ports,
            app,
        }
    }

    fn vm1() -> InstancePath {
        InstancePath::root("vm1")
    }

    #[tokio::test]
    async fn deploy_scoped_creates_machine_and_starts() {
        let h = harness().await;
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();

        let instance = h.app.get(&vm1()).unwrap();
        assert_eq!(instance.status, InstanceStatus::DeployedStarted);
        let machine_id = instance.data.machine_id.unwrap();
        assert!(machine_id.starts_with("mock-vm1-"));
        assert_eq!(instance.data.public_address.as_deref(), Some("192.0.2.10"));
        assert!(instance.data.awaiting_configuration);
        assert_eq!(h.configurator.candidate_count(), 1);

        // The machine is registered as using the target.
        let context = AgentContext::new("demo", vm1());
        assert_eq!(h.targets.usage_target(&context).as_deref(), Some("t1"));

        // The model subtree was pushed to the new agent.
        let delivered = h.transport.take_delivered();
        assert!(delivered.iter().any(|(_, c)| matches!(
            c,
            AgentCommand::SendInstances { instances } if instances.len() == 2
        )));

        // Random port exports in the subtree got values.
        let db = h.app.get(&vm1().child("db")).unwrap();
        let port: u16 = db.overridden_exports["db.port"].parse().unwrap();
        assert!((10_000..=65_500).contains(&port));
    }

    #[tokio::test]
    async fn deploy_short_circuits_on_existing_machine() {
        let h = harness().await;
        h.app
            .update(&vm1(), |i| i.data.machine_id = Some("m-existing".to_owned()))
            .unwrap();

        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        assert_eq!(h.handler.create_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_deploys_create_one_machine() {
        let h = harness().await;
        let id = vm1();
        let (a, b) = tokio::join!(
            h.orchestrator.deploy("demo", &id),
            h.orchestrator.deploy("demo", &id),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(h.handler.create_calls(), 1);
    }

    #[tokio::test]
    async fn deploy_without_target_rolls_back() {
        let h = harness().await;
        h.targets
            .dissociate(&h.app, AssociationScope::ApplicationDefault)
            .await
            .unwrap();

        let err = h.orchestrator.deploy("demo", &vm1()).await.unwrap_err();
        assert!(matches!(err, ManagerError::NoTargetAssociated { .. }));
        assert_eq!(h.app.get(&vm1()).unwrap().status, InstanceStatus::NotDeployed);

        // The rollback released the creation lock: a retry succeeds.
        h.targets
            .associate(&h.app, AssociationScope::ApplicationDefault, "t1")
            .await
            .unwrap();
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        assert_eq!(h.handler.create_calls(), 1);
    }

    #[tokio::test]
    async fn configure_failure_leaves_problem_with_machine_id() {
        let h = harness().await;
        h.handler.fail_configure(true);

        h.orchestrator.deploy("demo", &vm1()).await.unwrap_err();

        let instance = h.app.get(&vm1()).unwrap();
        assert_eq!(instance.status, InstanceStatus::Problem);
        assert!(instance.data.machine_id.is_some());
        assert!(instance.data.last_failure.is_some());

        // Undeploy recovers: the retained machine id lets it terminate.
        h.orchestrator.undeploy("demo", &vm1()).await.unwrap();
        let instance = h.app.get(&vm1()).unwrap();
        assert_eq!(instance.status, InstanceStatus::NotDeployed);
        assert!(instance.data.machine_id.is_none());
        assert!(h.handler.machine_ids().is_empty());
    }

    #[tokio::test]
    async fn undeploy_resets_subtree_and_unlocks_target() {
        let h = harness().await;
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        h.orchestrator.undeploy("demo", &vm1()).await.unwrap();

        for path in [vm1(), vm1().child("db")] {
            let instance = h.app.get(&path).unwrap();
            assert_eq!(instance.status, InstanceStatus::NotDeployed);
            assert!(instance.data.machine_id.is_none());
            assert!(instance.data.public_address.is_none());
        }
        let context = AgentContext::new("demo", vm1());
        assert_eq!(h.targets.usage_target(&context), None);
        assert_eq!(h.configurator.candidate_count(), 0);

        // Undeploying again is a no-op.
        h.orchestrator.undeploy("demo", &vm1()).await.unwrap();
    }

    #[tokio::test]
    async fn termination_failure_keeps_machine_retryable() {
        let h = harness().await;
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();

        h.handler.fail_terminate(true);
        h.orchestrator.undeploy("demo", &vm1()).await.unwrap_err();

        let instance = h.app.get(&vm1()).unwrap();
        assert_eq!(instance.status, InstanceStatus::DeployedStarted);
        assert!(instance.data.machine_id.is_some());

        h.handler.fail_terminate(false);
        h.orchestrator.undeploy("demo", &vm1()).await.unwrap();
        assert!(h.app.get(&vm1()).unwrap().data.machine_id.is_none());
    }

    #[tokio::test]
    async fn non_scoped_lifecycle_is_delegated() {
        let h = harness().await;
        let db = vm1().child("db");
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        h.transport.take_delivered();

        h.orchestrator.deploy("demo", &db).await.unwrap();
        assert_eq!(h.app.get(&db).unwrap().status, InstanceStatus::Deploying);

        h.orchestrator.start("demo", &db).await.unwrap();
        h.orchestrator.stop("demo", &db).await.unwrap();
        h.orchestrator.undeploy("demo", &db).await.unwrap();

        let delivered: Vec<_> = h
            .transport
            .take_delivered()
            .into_iter()
            .map(|(_, c)| c.summary())
            .collect();
        assert_eq!(
            delivered,
            vec![
                "change_state(/vm1/db -> deployed_stopped)",
                "change_state(/vm1/db -> deployed_started)",
                "change_state(/vm1/db -> deployed_stopped)",
                "change_state(/vm1/db -> not_deployed)",
            ]
        );
    }

    #[tokio::test]
    async fn scoped_start_and_stop_are_rejected() {
        let h = harness().await;
        assert!(h.orchestrator.start("demo", &vm1()).await.is_err());
        assert!(h.orchestrator.stop("demo", &vm1()).await.is_err());

        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        // Starting an already-running scoped instance is a no-op.
        h.orchestrator.start("demo", &vm1()).await.unwrap();
    }

    #[tokio::test]
    async fn bulk_deploy_attempts_every_instance() {
        let h = harness().await;
        // Make vm2's deployment fail by scoping it to a missing handler.
        h.targets
            .create_target(TargetProperties::new("t2", "absent", "No handler"))
            .await
            .unwrap();
        h.targets
            .associate(
                &h.app,
                AssociationScope::Instance {
                    path: InstancePath::root("vm2"),
                },
                "t2",
            )
            .await
            .unwrap();

        let err = h
            .orchestrator
            .deploy_and_start_all("demo", None)
            .await
            .unwrap_err();
        let ManagerError::PartialBatch(batch) = err else {
            panic!("expected a partial batch failure");
        };
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, InstancePath::root("vm2"));

        // vm1 still went through.
        assert_eq!(
            h.app.get(&vm1()).unwrap().status,
            InstanceStatus::DeployedStarted
        );
    }

    #[tokio::test]
    async fn undeploy_all_covers_machine_subtrees() {
        let h = harness().await;
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        h.orchestrator.undeploy_all("demo", None).await.unwrap();

        assert_eq!(h.app.get(&vm1()).unwrap().status, InstanceStatus::NotDeployed);
        assert!(h.handler.machine_ids().is_empty());
    }

    #[tokio::test]
    async fn resynchronize_targets_started_machines() {
        let h = harness().await;
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        h.transport.take_delivered();

        h.orchestrator.resynchronize("demo").await.unwrap();
        let delivered = h.transport.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert!(matches!(delivered[0].1, AgentCommand::Resynchronize));
        assert_eq!(delivered[0].0, AgentContext::new("demo", vm1()));
    }

    #[tokio::test]
    async fn deferred_deletion_applies_on_undeploy() {
        let h = harness().await;
        let db = vm1().child("db");
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        h.orchestrator.deploy("demo", &db).await.unwrap();

        // Removal of a deployed subtree is refused without the marker.
        let err = h.orchestrator.remove_instance("demo", &db).await.unwrap_err();
        assert!(matches!(err, ManagerError::Unauthorized(_)));

        h.orchestrator
            .mark_for_deferred_deletion("demo", &db)
            .await
            .unwrap();
        h.orchestrator.undeploy("demo", &vm1()).await.unwrap();
        assert!(!h.app.contains(&db));
        assert!(h.app.contains(&vm1()));
    }

    #[tokio::test]
    async fn add_instance_notifies_running_agent() {
        let h = harness().await;
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        h.transport.take_delivered();

        let web = Instance::new(
            vm1().child("web"),
            Arc::new(Component::new("web")),
        );
        h.orchestrator.add_instance("demo", web).await.unwrap();

        let delivered = h.transport.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert!(matches!(
            &delivered[0].1,
            AgentCommand::AddInstance { instance } if instance.path.as_str() == "/vm1/web"
        ));
    }

    #[tokio::test]
    async fn remove_instance_releases_its_ports() {
        let h = harness().await;
        let db = vm1().child("db");
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();

        let context = AgentContext::new("demo", vm1());
        let port: u16 = h.app.get(&db).unwrap().overridden_exports["db.port"]
            .parse()
            .unwrap();
        assert!(h.ports.allocated(&context).contains(&port));

        h.orchestrator.remove_instance("demo", &db).await.unwrap();
        assert!(!h.ports.allocated(&context).contains(&port));
    }

    #[tokio::test]
    async fn unregister_refused_while_deployed() {
        let h = harness().await;
        h.orchestrator.deploy("demo", &vm1()).await.unwrap();
        assert!(h.orchestrator.unregister_application("demo").is_err());

        h.orchestrator.undeploy("demo", &vm1()).await.unwrap();
        h.orchestrator.unregister_application("demo").unwrap();
    }
}
