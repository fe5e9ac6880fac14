//! VM migration orchestrator
//!
//! - [`orchestrator`]: the fan-out that records an attempt and starts the
//!   compute side
//! - [`state`]: the pure state machine deciding each transition
//! - [`controller`]: the VirtualMachine controller that drives an attempt to
//!   Succeeded or Failed
//!
//! The orchestrator never calls the disk coordinators. It declares volumes in
//! the VM's `migrationState` and reads each disk's `migrationState` back.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod error;
pub mod orchestrator;
pub mod state;

#[cfg(test)]
mod test_support;

pub use client::{KubeClient, KubeClientImpl, VmStatusPatch};
pub use controller::{error_policy, reconcile, Context, ContextBuilder, CONTROLLER_NAME};
pub use error::OrchestratorError;
pub use orchestrator::{MigrationOrchestrator, Orchestrator};
pub use state::{
    determine_step, DiskProgress, OperationPresence, OrchestrationInput, OrchestrationState,
    OrchestrationStep,
};
