//! Last-seen transition filter for watch mappers

use dashmap::{DashMap, DashSet};
use kube::runtime::watcher::Event;
use kube::ResourceExt;

use crate::ObjectKey;

/// Remembers the last version of each object a mapper saw and admits a new
/// version only when `changed(old, new)` holds.
///
/// The first sighting of an object is always admitted, so a watcher re-list
/// after restart wakes every dependent once.
///
/// Mappers never see deletions as such, so entries are dropped from a
/// separate watch fed through [`TransitionFilter::track`].
pub struct TransitionFilter<K> {
    seen: DashMap<ObjectKey, K>,
    relisted: DashSet<ObjectKey>,
    changed: fn(&K, &K) -> bool,
}

impl<K> TransitionFilter<K>
where
    K: kube::Resource + Clone,
{
    /// Create a filter driven by the given predicate
    pub fn new(changed: fn(&K, &K) -> bool) -> Self {
        Self {
            seen: DashMap::new(),
            relisted: DashSet::new(),
            changed,
        }
    }

    /// Record `obj` and return whether it differs from the last sighting
    ///
    /// An object being deleted is admitted and no longer tracked.
    pub fn admit(&self, obj: &K) -> bool {
        let key = key_of(obj);
        if obj.meta().deletion_timestamp.is_some() {
            self.seen.remove(&key);
            return true;
        }
        match self.seen.insert(key, obj.clone()) {
            Some(old) => (self.changed)(&old, obj),
            None => true,
        }
    }

    /// Forget an object, so its next sighting is admitted
    pub fn forget(&self, namespace: &str, name: &str) {
        self.seen.remove(&(namespace.to_string(), name.to_string()));
    }

    /// Drop entries for objects the API server no longer has
    ///
    /// A re-list (`Init` .. `InitDone`) also drops every entry it did not
    /// return, covering deletions missed while the watch was down.
    pub fn track(&self, event: &Event<K>) {
        match event {
            Event::Delete(obj) => {
                self.seen.remove(&key_of(obj));
            }
            Event::Init => self.relisted.clear(),
            Event::InitApply(obj) => {
                self.relisted.insert(key_of(obj));
            }
            Event::InitDone => {
                self.seen.retain(|key, _| self.relisted.contains(key));
                self.relisted.clear();
            }
            Event::Apply(_) => {}
        }
    }

    /// Number of tracked objects
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn key_of<K: kube::Resource>(obj: &K) -> ObjectKey {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

impl<K> std::fmt::Debug for TransitionFilter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionFilter")
            .field("tracked", &self.seen.len())
            .finish()
    }
}
