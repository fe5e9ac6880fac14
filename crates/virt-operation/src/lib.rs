//! VirtualMachineOperation handler for Migrate and Evict
//!
//! Validates a migration request, hands it to the orchestrator exactly once
//! and projects the attempt's progress back onto the operation's status.
//! Deleting an operation mid-flight cancels the migration.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod error;
pub mod progress;
pub mod validation;

pub use client::{KubeClient, KubeClientImpl};
pub use controller::{error_policy, reconcile, Context, ContextBuilder, CONTROLLER_NAME};
pub use error::OperationError;
pub use progress::{own_attempt, sync_progress};
pub use validation::{validate_preconditions, HotplugDisk, PreconditionView, Rejection};
