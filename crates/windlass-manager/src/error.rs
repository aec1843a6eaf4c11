//! Error types for windlass-manager.

use windlass_model::{InstancePath, ModelError};

use crate::messaging::TransportError;

/// Result type alias using [`ManagerError`].
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors that can occur in the deployment manager.
///
/// Expected conditions get their own variants (`NoTargetAssociated`,
/// `NoHandler`, `PortConflict`) so callers can distinguish "not configured
/// yet" from infrastructure failure without string matching.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Malformed input rejected before any side effect.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation forbidden by the current state. No side effect occurred.
    #[error("unauthorized action: {0}")]
    Unauthorized(String),

    /// No application registered under this name.
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    /// No target is associated, directly or by default, with this instance.
    #[error("no target associated with {application}:{path}")]
    NoTargetAssociated {
        /// Application name.
        application: String,
        /// Instance path.
        path: InstancePath,
    },

    /// No target definition exists for this id.
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// No handler registered under the name a target declares.
    #[error("no target handler registered for '{0}'")]
    NoHandler(String),

    /// Infrastructure driver failure.
    #[error("target error: {0}")]
    Target(String),

    /// Messaging I/O failure (direct sends only; safe sends are queued).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Persisted target store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Instance model error.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// A restored port value is already claimed within its agent context.
    #[error("port {port} already allocated in context {context}")]
    PortConflict {
        /// The conflicting port.
        port: u16,
        /// The agent context holding it.
        context: String,
    },

    /// The configured port range has no free value left for a context.
    #[error("no free port left in range for context {0}")]
    PortsExhausted(String),

    /// A bulk operation attempted every instance; some failed.
    #[error("batch failed for {} of {} instance(s)", .0.failures.len(), .0.attempted)]
    PartialBatch(BatchFailure),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unauthorized-action error.
    #[must_use]
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a target (infrastructure driver) error.
    #[must_use]
    pub fn target(msg: impl Into<String>) -> Self {
        Self::Target(msg.into())
    }

    /// Create a store error.
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Per-instance failures collected by a bulk operation.
#[derive(Debug, Default)]
pub struct BatchFailure {
    /// How many instances the batch attempted.
    pub attempted: usize,
    /// The instances that failed, with the failure rendered as text.
    pub failures: Vec<(InstancePath, String)>,
}

impl BatchFailure {
    /// Record one failed instance.
    pub fn record(&mut self, path: InstancePath, error: &ManagerError) {
        self.failures.push((path, error.to_string()));
    }

    /// Turn the collected failures into a result: `Ok` when none failed.
    pub fn into_result(self) -> ManagerResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::PartialBatch(self))
        }
    }
}
