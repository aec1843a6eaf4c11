//! Error types for the instance model.

/// Result type alias using [`ModelError`].
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised by model mutations.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// No instance exists at the given path.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// An instance already exists at the given path.
    #[error("instance already exists: {0}")]
    DuplicateInstance(String),

    /// The parent of an inserted instance does not exist.
    #[error("parent instance not found: {0}")]
    ParentNotFound(String),

    /// Removal of an instance that is still deployed.
    #[error("instance {0} is still deployed and not marked for deferred deletion")]
    StillDeployed(String),

    /// An instance path that does not start with `/` or contains empty segments.
    #[error("malformed instance path: {0}")]
    MalformedPath(String),
}
