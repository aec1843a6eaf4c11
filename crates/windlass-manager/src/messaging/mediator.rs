//! Ordered, buffered delivery of agent commands.
//!
//! Commands addressed to an agent that is not reachable yet are held in a
//! per-context FIFO queue and flushed once the agent's scoped instance is
//! started and the transport is connected. A failed delivery puts the
//! command back at the head of its queue so relative order is never lost.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use windlass_model::{AgentContext, Application, InstanceStatus};

use crate::error::ManagerResult;

use super::{AgentCommand, AgentTransport, TransportError};

type Queue = Arc<Mutex<VecDeque<AgentCommand>>>;

/// Buffers and orders commands bound for agents.
pub struct MessageMediator {
    transport: Arc<dyn AgentTransport>,
    queues: DashMap<AgentContext, Queue>,
}

impl MessageMediator {
    /// Create a mediator over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            transport,
            queues: DashMap::new(),
        }
    }

    fn queue(&self, context: &AgentContext) -> Queue {
        Arc::clone(
            self.queues
                .entry(context.clone())
                .or_default()
                .value(),
        )
    }

    /// Enqueue a command for the agent owning `context` and attempt to
    /// flush. Never fails on transport trouble: undelivered commands stay
    /// queued for a later flush.
    pub async fn send_safely(
        &self,
        application: &Application,
        context: &AgentContext,
        command: AgentCommand,
    ) -> ManagerResult<()> {
        debug!(context = %context, command = %command.summary(), "command queued");
        let queue = self.queue(context);
        {
            let mut pending = queue.lock().await;
            pending.push_back(command);
        }
        self.flush(application, context).await;
        Ok(())
    }

    /// Send a command immediately, bypassing the queue. Transport failures
    /// propagate to the caller.
    pub async fn send_directly(
        &self,
        context: &AgentContext,
        command: &AgentCommand,
    ) -> Result<(), TransportError> {
        debug!(context = %context, command = %command.summary(), "direct send");
        self.transport.send_to_agent(context, command).await
    }

    /// Deliver as much of a context's queue as currently possible.
    ///
    /// Delivery only proceeds while the transport is connected and the
    /// scoped instance owning the context is started; otherwise the queue
    /// is left untouched. The queue lock is held across the whole flush so
    /// concurrent senders cannot interleave deliveries.
    pub async fn flush(&self, application: &Application, context: &AgentContext) {
        if !self.transport.is_connected() {
            return;
        }
        let started = application
            .get(&context.scoped_path)
            .map(|i| i.status == InstanceStatus::DeployedStarted)
            .unwrap_or(false);
        if !started {
            return;
        }

        let Some(queue) = self.queues.get(context).map(|r| Arc::clone(r.value())) else {
            return;
        };
        let mut pending = queue.lock().await;
        while let Some(command) = pending.pop_front() {
            if let Err(e) = self.transport.send_to_agent(context, &command).await {
                warn!(
                    context = %context,
                    command = %command.summary(),
                    error = %e,
                    "delivery failed, command retained"
                );
                pending.push_front(command);
                return;
            }
        }
    }

    /// Number of commands waiting for a context's agent.
    pub async fn pending(&self, context: &AgentContext) -> usize {
        match self.queues.get(context).map(|r| Arc::clone(r.value())) {
            Some(queue) => queue.lock().await.len(),
            None => 0,
        }
    }

    /// Discard a context's queue (its machine is being torn down).
    pub fn drop_queue(&self, context: &AgentContext) {
        if self.queues.remove(context).is_some() {
            debug!(context = %context, "pending commands discarded");
        }
    }
}

impl std::fmt::Debug for MessageMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageMediator")
            .field("queues", &self.queues.len())
            .finish_non_exhaustive()
    }
}
