//! Random port allocation.
//!
//! Exported variables flagged as random ports get collision-free values,
//! scoped per agent context. Values restored from persisted state are
//! *acknowledged* (registered without regeneration) when still free, and
//! regenerated when another variable in the same context already claims
//! them.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;
use windlass_model::AgentContext;

use crate::config::PortRangeConfig;
use crate::error::{ManagerError, ManagerResult};

/// In-memory port allocation table, keyed by agent context.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    forbidden: HashSet<u16>,
    allocations: DashMap<AgentContext, HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator for the configured range.
    #[must_use]
    pub fn new(config: &PortRangeConfig) -> Self {
        Self {
            min: config.min,
            max: config.max,
            forbidden: config.forbidden.iter().copied().collect(),
            allocations: DashMap::new(),
        }
    }

    /// Register a restored port value without generating a new one.
    ///
    /// Fails when the value is forbidden or already claimed within the
    /// context; the caller then allocates a fresh one.
    pub fn acknowledge(&self, context: &AgentContext, port: u16) -> ManagerResult<()> {
        if self.forbidden.contains(&port) {
            return Err(ManagerError::PortConflict {
                port,
                context: context.to_string(),
            });
        }

        let mut allocated = self.allocations.entry(context.clone()).or_default();
        if !allocated.insert(port) {
            return Err(ManagerError::PortConflict {
                port,
                context: context.to_string(),
            });
        }
        debug!(context = %context, port, "port acknowledged");
        Ok(())
    }

    /// Allocate a fresh port: the lowest free value in the range that is
    /// neither forbidden nor already claimed within the context.
    pub fn allocate(&self, context: &AgentContext) -> ManagerResult<u16> {
        let mut allocated = self.allocations.entry(context.clone()).or_default();
        for port in self.min..=self.max {
            if self.forbidden.contains(&port) || allocated.contains(&port) {
                continue;
            }
            allocated.insert(port);
            debug!(context = %context, port, "port allocated");
            return Ok(port);
        }
        Err(ManagerError::PortsExhausted(context.to_string()))
    }

    /// Acknowledge a restored value when possible, otherwise allocate a
    /// different one. Returns the port to use.
    pub fn acknowledge_or_allocate(
        &self,
        context: &AgentContext,
        restored: Option<u16>,
    ) -> ManagerResult<u16> {
        if let Some(port) = restored {
            match self.acknowledge(context, port) {
                Ok(()) => return Ok(port),
                Err(ManagerError::PortConflict { .. }) => {
                    debug!(context = %context, port, "restored port already claimed, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
        self.allocate(context)
    }

    /// Release specific ports within a context (an instance's share).
    pub fn release_ports(&self, context: &AgentContext, ports: &[u16]) {
        if let Some(mut allocated) = self.allocations.get_mut(context) {
            for port in ports {
                allocated.remove(port);
            }
        }
    }

    /// Release everything allocated under a context (its machine is gone).
    pub fn release_context(&self, context: &AgentContext) {
        self.allocations.remove(context);
    }

    /// Release every context belonging to an application.
    pub fn release_application(&self, application: &str) {
        self.allocations
            .retain(|ctx, _| ctx.application != application);
    }

    /// Snapshot of the ports allocated under a context.
    #[must_use]
    pub fn allocated(&self, context: &AgentContext) -> HashSet<u16> {
        self.allocations
            .get(context)
            .map(|set| set.clone())
            .unwrap_or_default()
    }
}
