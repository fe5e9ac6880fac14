//! Compute migration driver for the virtualization controllers
//!
//! Creates, observes and aborts the hypervisor layer's migration instances.
//! Callers see the compute side only through [`ComputeObservation`].

#![deny(missing_docs)]

pub mod driver;
pub mod observation;

pub use driver::{
    build_instance, instance_name, owned_by, pod_unschedulable_message, ComputeMigrationDriver,
    KubeComputeDriver,
};
pub use observation::{AbortOutcome, AbortState, ComputeObservation, ComputePhase};
