//! Instance lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The lifecycle state of an instance.
///
/// Scoped instances move through
/// `NotDeployed → Deploying → DeployedStarted ⇄ DeployedStopped →
/// Undeploying → NotDeployed`, with `Problem` reachable on unrecoverable
/// configuration failure. `Starting` and `Stopping` are transient states
/// for non-scoped instances awaiting agent acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// No machine or agent-side deployment exists for this instance.
    NotDeployed,
    /// A machine is being created or the agent is deploying the instance.
    Deploying,
    /// Agent-side start requested, acknowledgment pending.
    Starting,
    /// Deployed and running.
    DeployedStarted,
    /// Agent-side stop requested, acknowledgment pending.
    Stopping,
    /// Deployed but not running.
    DeployedStopped,
    /// Machine termination or agent-side undeploy in progress.
    Undeploying,
    /// Unrecoverable failure; manual intervention required.
    Problem,
}

impl InstanceStatus {
    /// Whether this is a settled state rather than a transition.
    #[must_use]
    pub const fn is_stable(self) -> bool {
        matches!(
            self,
            Self::NotDeployed | Self::DeployedStarted | Self::DeployedStopped | Self::Problem
        )
    }

    /// Whether anything (machine or agent-side artifacts) is deployed.
    #[must_use]
    pub const fn is_deployed(self) -> bool {
        !matches!(self, Self::NotDeployed)
    }

    /// The state name as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotDeployed => "not_deployed",
            Self::Deploying => "deploying",
            Self::Starting => "starting",
            Self::DeployedStarted => "deployed_started",
            Self::Stopping => "stopping",
            Self::DeployedStopped => "deployed_stopped",
            Self::Undeploying => "undeploying",
            Self::Problem => "problem",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_deployed" => Ok(Self::NotDeployed),
            "deploying" => Ok(Self::Deploying),
            "starting" => Ok(Self::Starting),
            "deployed_started" => Ok(Self::DeployedStarted),
            "stopping" => Ok(Self::Stopping),
            "deployed_stopped" => Ok(Self::DeployedStopped),
            "undeploying" => Ok(Self::Undeploying),
            "problem" => Ok(Self::Problem),
            _ => Err(format!("unknown instance status: {s}")),
        }
    }
}
