//! Windlass instance model.
//!
//! This crate holds the data model shared by every part of the Windlass
//! deployment manager: applications, their instance trees, component
//! definitions and the orchestration bookkeeping attached to each instance.
//!
//! The model is deliberately small. Parsing and validating application
//! descriptions, persistence of the broader application catalogue and the
//! presentation layer all live elsewhere; this crate only knows about the
//! tree the orchestrator walks and mutates.
//!
//! # Scoped instances
//!
//! An instance is *scoped* when it owns a machine and the agent running on
//! it: every root instance is scoped, and so is any instance whose
//! component is flagged as an agent boundary. Non-scoped descendants share
//! their nearest scoped ancestor's machine.

#![forbid(unsafe_code)]

pub mod application;
pub mod component;
pub mod context;
pub mod error;
pub mod instance;
pub mod path;
pub mod status;

pub use application::Application;
pub use component::{Component, ExportedVariable};
pub use context::AgentContext;
pub use error::{ModelError, ModelResult};
pub use instance::{Instance, InstanceData};
pub use path::InstancePath;
pub use status::InstanceStatus;
