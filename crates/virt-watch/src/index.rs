//! Reverse reference index
//!
//! Reconcilers record which objects a dependent refers to (an operation's
//! VM, a VM's declared disks, a disk's attached VMs). Watch mappers then ask
//! for the dependents of a changed object instead of listing the namespace.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::ObjectKey;

/// Thread-safe index from referenced objects to their dependents.
///
/// Both sides are namespaced by the same namespace; cross-namespace
/// references are not tracked.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    /// dependent -> objects it references
    edges_out: DashMap<ObjectKey, HashSet<String>>,
    /// referenced object -> dependents
    edges_in: DashMap<ObjectKey, HashSet<String>>,
}

impl ReferenceIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the references recorded for `dependent`
    pub fn put<I, S>(&self, namespace: &str, dependent: &str, references: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remove(namespace, dependent);

        let references: HashSet<String> = references.into_iter().map(Into::into).collect();
        if references.is_empty() {
            return;
        }

        for referenced in &references {
            self.edges_in
                .entry((namespace.to_string(), referenced.clone()))
                .or_default()
                .insert(dependent.to_string());
        }
        self.edges_out
            .insert((namespace.to_string(), dependent.to_string()), references);
    }

    /// Drop everything recorded for `dependent`
    pub fn remove(&self, namespace: &str, dependent: &str) {
        let key = (namespace.to_string(), dependent.to_string());
        let Some((_, old)) = self.edges_out.remove(&key) else {
            return;
        };

        for referenced in old {
            let in_key = (namespace.to_string(), referenced);
            let now_empty = match self.edges_in.get_mut(&in_key) {
                Some(mut dependents) => {
                    dependents.remove(dependent);
                    dependents.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.edges_in.remove_if(&in_key, |_, d| d.is_empty());
            }
        }
    }

    /// Dependents that reference `referenced`, sorted
    pub fn dependents(&self, namespace: &str, referenced: &str) -> Vec<String> {
        let key = (namespace.to_string(), referenced.to_string());
        let mut out: Vec<String> = self
            .edges_in
            .get(&key)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Objects `dependent` references, sorted
    pub fn references(&self, namespace: &str, dependent: &str) -> Vec<String> {
        let key = (namespace.to_string(), dependent.to_string());
        let mut out: Vec<String> = self
            .edges_out
            .get(&key)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Number of dependents with at least one reference
    pub fn len(&self) -> usize {
        self.edges_out.len()
    }

    /// Whether nothing is recorded
    pub fn is_empty(&self) -> bool {
        self.edges_out.is_empty()
    }
}
