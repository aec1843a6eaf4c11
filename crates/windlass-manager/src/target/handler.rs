//! Target handler contract and resolution.
//!
//! A handler is the driver implementation for one infrastructure kind. The
//! resolver is a pure registry: given a target's properties, extract the
//! declared handler name and return the matching registered capability
//! implementation. Handlers are hot-pluggable; resolution is a map lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;
use windlass_model::AgentContext;

use crate::error::{ManagerError, ManagerResult};

use super::workflow::{ProvisionOps, ProvisioningWorkflow};
use super::TargetProperties;

/// Everything a handler needs to act on one machine.
#[derive(Debug, Clone)]
pub struct MachineParams {
    /// The resolved target definition (credentials, driver properties).
    pub target: TargetProperties,
    /// The agent context the machine belongs to.
    pub context: AgentContext,
    /// Domain the manager operates in.
    pub domain: String,
}

/// Capability set implemented by every infrastructure driver.
///
/// Calls are potentially slow network I/O; the orchestrator never holds a
/// model lock across them.
#[async_trait]
pub trait TargetHandler: Send + Sync {
    /// The name this handler registers under, matched against the
    /// `handler` property of target definitions.
    fn name(&self) -> &str;

    /// Request a new machine. Returns the driver's machine id.
    async fn create_machine(&self, params: &MachineParams) -> ManagerResult<String>;

    /// Whether the machine is currently running.
    async fn is_machine_running(&self, params: &MachineParams, machine_id: &str)
        -> ManagerResult<bool>;

    /// Terminate the machine.
    async fn terminate_machine(&self, params: &MachineParams, machine_id: &str)
        -> ManagerResult<()>;

    /// The machine's public address, if it has one yet.
    async fn retrieve_public_address(
        &self,
        params: &MachineParams,
        machine_id: &str,
    ) -> ManagerResult<Option<String>>;

    /// Driver-specific post-creation setup (tagging, volumes...).
    ///
    /// May be a no-op. Long-running drivers run their own provisioning
    /// workflow here, advanced step by step until complete.
    async fn configure_machine(&self, params: &MachineParams, machine_id: &str)
        -> ManagerResult<()>;
}

/// Registry mapping handler names to implementations.
///
/// Handlers may be added and removed at runtime without disrupting
/// in-flight operations: resolution hands out an `Arc` clone.
#[derive(Default)]
pub struct HandlerResolver {
    handlers: DashMap<String, Arc<dyn TargetHandler>>,
}

impl HandlerResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&self, handler: Arc<dyn TargetHandler>) {
        info!(handler = handler.name(), "registering target handler");
        self.handlers.insert(handler.name().to_owned(), handler);
    }

    /// Remove a handler. In-flight operations keep their `Arc`.
    pub fn deregister(&self, name: &str) -> Option<Arc<dyn TargetHandler>> {
        self.handlers.remove(name).map(|(_, h)| h)
    }

    /// Resolve the handler a target declares.
    pub fn resolve(&self, target: &TargetProperties) -> ManagerResult<Arc<dyn TargetHandler>> {
        self.handlers
            .get(&target.handler)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| ManagerError::NoHandler(target.handler.clone()))
    }

    /// Names of all registered handlers.
    #[must_use]
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.iter().map(|r| r.key().clone()).collect()
    }
}

impl std::fmt::Debug for HandlerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerResolver")
            .field("handlers", &self.handler_names())
            .finish()
    }
}

/// Mock target handler for testing.
///
/// Machines live in memory; failures can be injected per capability.
#[derive(Debug, Default)]
pub struct MockTargetHandler {
    machines: RwLock<HashMap<String, MockMachine>>,
    create_calls: AtomicUsize,
    fail_create: AtomicBool,
    fail_terminate: AtomicBool,
    fail_configure: AtomicBool,
}

#[derive(Debug, Clone)]
struct MockMachine {
    running: bool,
    configured: bool,
    tagged: bool,
    address_assigned: bool,
    volume: Option<String>,
    volume_attached: bool,
}

impl MockTargetHandler {
    /// Create a new mock handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `create_machine` has been invoked.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Make subsequent `create_machine` calls fail.
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `terminate_machine` calls fail.
    pub fn fail_terminate(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `configure_machine` calls fail.
    pub fn fail_configure(&self, fail: bool) {
        self.fail_configure.store(fail, Ordering::SeqCst);
    }

    /// Ids of all machines that currently exist.
    #[must_use]
    pub fn machine_ids(&self) -> Vec<String> {
        match self.machines.read() {
            Ok(machines) => machines.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn with_machine<R>(
        &self,
        machine_id: &str,
        f: impl FnOnce(&mut MockMachine) -> R,
    ) -> ManagerResult<R> {
        let mut machines = self
            .machines
            .write()
            .map_err(|_| ManagerError::internal("lock poisoned"))?;
        let machine = machines
            .get_mut(machine_id)
            .ok_or_else(|| ManagerError::target(format!("machine not found: {machine_id}")))?;
        Ok(f(machine))
    }
}

#[async_trait]
impl TargetHandler for MockTargetHandler {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_machine(&self, params: &MachineParams) -> ManagerResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ManagerError::target("injected creation failure"));
        }

        let machine_id = format!(
            "mock-{}-{}",
            params.context.scoped_path.name(),
            ulid::Ulid::new().to_string().to_lowercase()
        );

        let mut machines = self
            .machines
            .write()
            .map_err(|_| ManagerError::internal("lock poisoned"))?;
        machines.insert(
            machine_id.clone(),
            MockMachine {
                running: true,
                configured: false,
                tagged: false,
                address_assigned: false,
                volume: None,
                volume_attached: false,
            },
        );

        Ok(machine_id)
    }

    async fn is_machine_running(
        &self,
        _params: &MachineParams,
        machine_id: &str,
    ) -> ManagerResult<bool> {
        let machines = self
            .machines
            .read()
            .map_err(|_| ManagerError::internal("lock poisoned"))?;
        Ok(machines.get(machine_id).is_some_and(|m| m.running))
    }

    async fn terminate_machine(
        &self,
        _params: &MachineParams,
        machine_id: &str,
    ) -> ManagerResult<()> {
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(ManagerError::target("injected termination failure"));
        }

        let mut machines = self
            .machines
            .write()
            .map_err(|_| ManagerError::internal("lock poisoned"))?;
        if machines.remove(machine_id).is_none() {
            return Err(ManagerError::target(format!(
                "machine not found: {machine_id}"
            )));
        }
        Ok(())
    }

    async fn retrieve_public_address(
        &self,
        _params: &MachineParams,
        machine_id: &str,
    ) -> ManagerResult<Option<String>> {
        self.with_machine(machine_id, |m| {
            if m.running {
                Some("192.0.2.10".to_owned())
            } else {
                None
            }
        })
    }

    async fn configure_machine(
        &self,
        _params: &MachineParams,
        machine_id: &str,
    ) -> ManagerResult<()> {
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(ManagerError::target("injected configuration failure"));
        }

        // Drive the multi-step provisioning workflow to completion, the way
        // a real driver advances its own setup from a scheduler.
        let mut workflow = ProvisioningWorkflow::new(machine_id);
        while !workflow.is_complete() {
            workflow.advance(self).await?;
        }

        self.with_machine(machine_id, |m| m.configured = true)
    }
}

#[async_trait]
impl ProvisionOps for MockTargetHandler {
    async fn tag_machine(&self, machine_id: &str) -> ManagerResult<()> {
        self.with_machine(machine_id, |m| m.tagged = true)
    }

    async fn machine_running(&self, machine_id: &str) -> ManagerResult<bool> {
        let machines = self
            .machines
            .read()
            .map_err(|_| ManagerError::internal("lock poisoned"))?;
        Ok(machines.get(machine_id).is_some_and(|m| m.running))
    }

    async fn assign_address(&self, machine_id: &str) -> ManagerResult<()> {
        self.with_machine(machine_id, |m| m.address_assigned = true)
    }

    async fn create_volume(&self, machine_id: &str) -> ManagerResult<String> {
        let volume_id = format!("vol-{machine_id}");
        self.with_machine(machine_id, |m| m.volume = Some(volume_id.clone()))?;
        Ok(volume_id)
    }

    async fn volume_ready(&self, _volume_id: &str) -> ManagerResult<bool> {
        Ok(true)
    }

    async fn attach_volume(&self, machine_id: &str, _volume_id: &str) -> ManagerResult<()> {
        self.with_machine(machine_id, |m| m.volume_attached = true)
    }
}
