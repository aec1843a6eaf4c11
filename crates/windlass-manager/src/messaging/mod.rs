//! Agent-bound commands and the transport boundary.
//!
//! The manager does not define a wire encoding; it hands typed commands to
//! an [`AgentTransport`] and only relies on the ordering, retry and
//! buffering contracts of the [`MessageMediator`].

mod mediator;

pub use mediator::MessageMediator;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use windlass_model::{AgentContext, Instance, InstancePath, InstanceStatus};

/// Commands sent to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Drive an instance on the agent towards a lifecycle state.
    ChangeInstanceState {
        /// The instance to act on.
        path: InstancePath,
        /// The state the agent should reach.
        target_status: InstanceStatus,
    },
    /// Push the scoped instance's model subtree to a fresh agent.
    SendInstances {
        /// The subtree, parents before children.
        instances: Vec<Instance>,
    },
    /// Add one instance to the agent's model.
    AddInstance {
        /// The new instance.
        instance: Instance,
    },
    /// Remove one instance from the agent's model.
    RemoveInstance {
        /// The instance to remove.
        path: InstancePath,
    },
    /// Ask the agent to report its full current state.
    Resynchronize,
}

impl AgentCommand {
    /// Short human-readable summary for logging.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::ChangeInstanceState {
                path,
                target_status,
            } => format!("change_state({path} -> {target_status})"),
            Self::SendInstances { instances } => {
                format!("send_instances({} instance(s))", instances.len())
            }
            Self::AddInstance { instance } => format!("add_instance({})", instance.path),
            Self::RemoveInstance { path } => format!("remove_instance({path})"),
            Self::Resynchronize => "resynchronize".to_owned(),
        }
    }
}

/// Messaging I/O failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The transport has no route to the agent right now.
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    /// The transport failed mid-delivery.
    #[error("messaging i/o failure: {0}")]
    Io(String),
}

/// The message transport the manager consumes.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Deliver one command to the agent owning `context`.
    async fn send_to_agent(
        &self,
        context: &AgentContext,
        command: &AgentCommand,
    ) -> Result<(), TransportError>;

    /// Whether the transport currently has connectivity at all.
    fn is_connected(&self) -> bool;
}

/// In-memory transport double for testing.
///
/// Connectivity and per-call failures are scripted by the test; delivered
/// commands are recorded in order.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    fail_next: AtomicUsize,
    delivered: Mutex<VecDeque<(AgentContext, AgentCommand)>>,
}

impl MockTransport {
    /// A connected mock transport.
    #[must_use]
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.set_connected(true);
        transport
    }

    /// Toggle connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next `count` deliveries fail with an I/O error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Drain the commands delivered so far, in delivery order.
    #[must_use]
    pub fn take_delivered(&self) -> Vec<(AgentContext, AgentCommand)> {
        match self.delivered.lock() {
            Ok(mut delivered) => delivered.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl AgentTransport for MockTransport {
    async fn send_to_agent(
        &self,
        context: &AgentContext,
        command: &AgentCommand,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unreachable(context.to_string()));
        }

        let remaining = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(TransportError::Io("injected delivery failure".to_owned()));
        }

        let mut delivered = self
            .delivered
            .lock()
            .map_err(|_| TransportError::Io("lock poisoned".to_owned()))?;
        delivered.push_back((context.clone(), command.clone()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
