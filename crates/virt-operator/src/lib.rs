//! Virtualization operator - runs the VM and volume migration controllers
//!
//! - [`config`]: CLI and environment settings
//! - [`crds`]: CRD generation and startup installation
//! - [`controller_runner`]: controller wiring and watch mappers

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;
pub mod crds;
