//! Hierarchical instance paths.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// The identity of an instance: root-to-node names joined by `/`.
///
/// Paths are immutable once created. `/db-vm/mysql` names the instance
/// `mysql` under the root instance `db-vm`.
///
/// Deserialization goes through [`parse`](Self::parse), so persisted data
/// cannot smuggle in a malformed path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct InstancePath(String);

impl InstancePath {
    /// Parse a path of the form `/name(/name)*`.
    pub fn parse(raw: impl Into<String>) -> ModelResult<Self> {
        let raw = raw.into();
        if !raw.starts_with('/') || raw.len() < 2 || raw.ends_with('/') {
            return Err(ModelError::MalformedPath(raw));
        }
        if raw[1..].split('/').any(str::is_empty) {
            return Err(ModelError::MalformedPath(raw));
        }
        Ok(Self(raw))
    }

    /// Create a root path from a single instance name.
    #[must_use]
    pub fn root(name: &str) -> Self {
        Self(format!("/{name}"))
    }

    /// Create the path of a child of this instance.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}/{name}", self.0))
    }

    /// The parent path, or `None` for a root instance.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let idx = self.0.rfind('/')?;
        if idx == 0 {
            None
        } else {
            Some(Self(self.0[..idx].to_owned()))
        }
    }

    /// The last path segment (the instance's own name).
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Whether `other` is this path or lies underneath it.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.0 == self.0 || other.0.starts_with(&format!("{}/", self.0))
    }

    /// The path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstancePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for InstancePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InstancePath {
    type Error = ModelError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<InstancePath> for String {
    fn from(path: InstancePath) -> Self {
        path.0
    }
}
