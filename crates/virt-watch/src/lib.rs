//! Watch layer for the migration controllers
//!
//! kube-rs `.watches()` mappers only see the new version of an object. This
//! crate turns that into `(old, new)` transition checks so that a controller
//! is woken only when a field or condition it decides on actually changed:
//!
//! - [`triggers`]: pure predicates over `(old, new)` pairs
//! - [`TransitionFilter`]: remembers the last-seen object per key
//! - [`ReferenceIndex`]: maps a referenced object to the objects that depend on it
//!
//! Everything here is a wake-up hint. Reconcilers always re-read the
//! objects they decide on.

#![deny(missing_docs)]

pub mod filter;
pub mod index;
pub mod triggers;

pub use filter::TransitionFilter;
pub use index::ReferenceIndex;

/// Object key used by the filters and indexes: (namespace, name)
pub type ObjectKey = (String, String);
