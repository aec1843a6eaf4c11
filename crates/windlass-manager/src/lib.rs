//! windlass-manager: the deployment manager.
//!
//! The manager holds the instance model of every registered application
//! and drives instances through their lifecycle. *Scoped* instances own a
//! machine: deploying one resolves the target associated with it, asks the
//! matching handler to create the machine and configures it to the started
//! state. Everything below a scoped instance lives on that machine's agent
//! and is driven remotely through commands.
//!
//! ```text
//!                +---------------------+
//!   operations ->| InstanceOrchestrator|--- lock/unlock ---> TargetRegistry
//!                +---------------------+                          |
//!                  |        |       |                       TargetStore
//!                  |        |       +-- create/terminate --> TargetHandler
//!                  |        +---------- commands ----------> MessageMediator
//!                  +------------------- candidates --------> MachineConfigurator
//! ```
//!
//! Infrastructure kinds plug in as [`target::TargetHandler`]
//! implementations; the transport to agents plugs in as
//! [`messaging::AgentTransport`].

pub mod apps;
pub mod config;
pub mod configurator;
pub mod error;
pub mod messaging;
pub mod orchestrator;
pub mod persistence;
pub mod ports;
pub mod target;

pub use apps::ApplicationRegistry;
pub use config::ManagerConfig;
pub use configurator::MachineConfigurator;
pub use error::{ManagerError, ManagerResult};
pub use messaging::{AgentCommand, AgentTransport, MessageMediator};
pub use orchestrator::InstanceOrchestrator;
pub use persistence::{ModelSaver, NoopSaver};
pub use ports::PortAllocator;
pub use target::{
    HandlerResolver, MachineParams, TargetHandler, TargetProperties, TargetRegistry,
};
