//! Driver-internal asynchronous provisioning workflow.
//!
//! Cloud drivers often need a multi-step setup after the creation call
//! returns: tag the machine, wait for it to run, assign a public address,
//! create and attach a volume. The workflow is an explicit state machine
//! with an idempotent `advance()`: each call checks the current sub-state's
//! completion condition and, when satisfied, performs the next action and
//! moves on. It is safe to call repeatedly from a scheduler until it
//! reports completion, tolerating partial completion across calls.

use async_trait::async_trait;
use tracing::debug;

use crate::error::ManagerResult;

/// The sub-states of the provisioning workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    /// Tag the machine with its deployment metadata.
    Tag,
    /// Wait for the machine to report running.
    AwaitRunning,
    /// Assign the machine's public address.
    AssignAddress,
    /// Create the data volume.
    CreateVolume,
    /// Wait for the volume and attach it.
    AttachVolume,
    /// Nothing left to do.
    Complete,
}

/// Driver operations the workflow advances through.
#[async_trait]
pub trait ProvisionOps: Send + Sync {
    /// Tag the machine.
    async fn tag_machine(&self, machine_id: &str) -> ManagerResult<()>;

    /// Whether the machine is running yet.
    async fn machine_running(&self, machine_id: &str) -> ManagerResult<bool>;

    /// Assign the machine's public address.
    async fn assign_address(&self, machine_id: &str) -> ManagerResult<()>;

    /// Create a volume for the machine; returns the volume id.
    async fn create_volume(&self, machine_id: &str) -> ManagerResult<String>;

    /// Whether the volume is ready to be attached.
    async fn volume_ready(&self, volume_id: &str) -> ManagerResult<bool>;

    /// Attach the volume to the machine.
    async fn attach_volume(&self, machine_id: &str, volume_id: &str) -> ManagerResult<()>;
}

/// Per-machine provisioning state.
#[derive(Debug)]
pub struct ProvisioningWorkflow {
    machine_id: String,
    stage: ProvisionStage,
    volume_id: Option<String>,
}

impl ProvisioningWorkflow {
    /// Start a workflow for a freshly created machine.
    #[must_use]
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            stage: ProvisionStage::Tag,
            volume_id: None,
        }
    }

    /// The current sub-state.
    #[must_use]
    pub const fn stage(&self) -> ProvisionStage {
        self.stage
    }

    /// Whether the workflow reached its terminal state.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.stage == ProvisionStage::Complete
    }

    /// Perform at most one step.
    ///
    /// Waiting stages (`AwaitRunning`, `AttachVolume`) re-check their
    /// condition and stay put until it holds; action stages perform their
    /// action exactly once. Returns the stage after the call.
    pub async fn advance(&mut self, ops: &dyn ProvisionOps) -> ManagerResult<ProvisionStage> {
        match self.stage {
            ProvisionStage::Tag => {
                ops.tag_machine(&self.machine_id).await?;
                self.stage = ProvisionStage::AwaitRunning;
            }
            ProvisionStage::AwaitRunning => {
                if ops.machine_running(&self.machine_id).await? {
                    self.stage = ProvisionStage::AssignAddress;
                }
            }
            ProvisionStage::AssignAddress => {
                ops.assign_address(&self.machine_id).await?;
                self.stage = ProvisionStage::CreateVolume;
            }
            ProvisionStage::CreateVolume => {
                let volume_id = ops.create_volume(&self.machine_id).await?;
                self.volume_id = Some(volume_id);
                self.stage = ProvisionStage::AttachVolume;
            }
            ProvisionStage::AttachVolume => {
                // volume_id is always set once this stage is reached.
                if let Some(volume_id) = self.volume_id.clone() {
                    if ops.volume_ready(&volume_id).await? {
                        ops.attach_volume(&self.machine_id, &volume_id).await?;
                        self.stage = ProvisionStage::Complete;
                    }
                } else {
                    self.stage = ProvisionStage::CreateVolume;
                }
            }
            ProvisionStage::Complete => {}
        }

        debug!(machine_id = %self.machine_id, stage = ?self.stage, "workflow advanced");
        Ok(self.stage)
    }
}
