//! Shared object registry
//!
//! Native objects exposed to scripts are owned by the registry of exactly one
//! runtime. Scripts only ever see an [`ObjectId`]; releasing the identity is
//! the single path that tears the native object down.

use crate::class::ClassDefinition;
use crate::error::{BridgeError, Result};
use dashmap::DashMap;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Identity of a shared object as seen from a script.
///
/// Drawn from a per-runtime monotonically increasing counter, so a released
/// identity is never handed out again by the same runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Rebuild an identity reported by an engine.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Upcasting helper so registered objects can be downcast to their concrete type.
pub trait AsAny: Any + Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Native object that can be handed to scripts.
pub trait SharedObject: AsAny {
    /// Called exactly once, when the registry releases the object.
    fn on_release(&self) {}

    /// Other shared objects this one holds on to. Teardown releases referrers
    /// before the objects they reference.
    fn references(&self) -> Vec<ObjectId> {
        Vec::new()
    }
}

/// Downcast a registered object to its concrete type.
pub fn downcast_shared<T: SharedObject>(object: Arc<dyn SharedObject>) -> Option<Arc<T>> {
    AsAny::into_any(object).downcast::<T>().ok()
}

#[derive(Clone)]
struct Entry {
    object: Arc<dyn SharedObject>,
    class: Arc<ClassDefinition>,
}

/// Per-runtime table of shared objects.
pub struct SharedObjectRegistry {
    next_id: AtomicU64,
    entries: DashMap<ObjectId, Entry>,
    /// `true` once the owning runtime tore the registry down.
    closed: RwLock<bool>,
}

impl SharedObjectRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
            closed: RwLock::new(false),
        }
    }

    /// Take ownership of `object` and hand out a fresh identity for it.
    pub fn register(
        &self,
        object: Arc<dyn SharedObject>,
        class: Arc<ClassDefinition>,
    ) -> Result<ObjectId> {
        let closed = self.closed.read().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return Err(BridgeError::context_lost(
                "shared object registry has been torn down",
            ));
        }
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, class = class.name(), "registered shared object");
        self.entries.insert(id, Entry { object, class });
        Ok(id)
    }

    pub fn resolve(&self, id: ObjectId) -> Result<Arc<dyn SharedObject>> {
        self.entries
            .get(&id)
            .map(|entry| entry.object.clone())
            .ok_or(BridgeError::ObjectNotFound { id })
    }

    /// Resolve and downcast in one step. A type mismatch is reported as a miss.
    pub fn resolve_as<T: SharedObject>(&self, id: ObjectId) -> Result<Arc<T>> {
        self.resolve(id)
            .and_then(|object| downcast_shared::<T>(object).ok_or(BridgeError::ObjectNotFound { id }))
    }

    pub fn class_of(&self, id: ObjectId) -> Option<Arc<ClassDefinition>> {
        self.entries.get(&id).map(|entry| entry.class.clone())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove the entry and release the native object.
    ///
    /// Unknown identities are ignored: garbage-collection notices can race
    /// with explicit teardown. Returns whether anything was released.
    pub fn release(&self, id: ObjectId) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                tracing::debug!(%id, class = entry.class.name(), "released shared object");
                entry.object.on_release();
                true
            }
            None => {
                tracing::trace!(%id, "release of unknown shared object ignored");
                false
            }
        }
    }

    /// Remove the entry without releasing the object, for hand-off to
    /// another runtime.
    pub(crate) fn detach(
        &self,
        id: ObjectId,
    ) -> Option<(Arc<dyn SharedObject>, Arc<ClassDefinition>)> {
        self.entries
            .remove(&id)
            .map(|(_, entry)| (entry.object, entry.class))
    }

    /// Put a detached object back under its old identity. Fails once the
    /// registry is closed.
    pub(crate) fn reattach(
        &self,
        id: ObjectId,
        object: Arc<dyn SharedObject>,
        class: Arc<ClassDefinition>,
    ) -> bool {
        let closed = self.closed.read().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return false;
        }
        self.entries.insert(id, Entry { object, class });
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close the registry and release every remaining object.
    ///
    /// Objects referencing others are released first; members of a reference
    /// cycle fall back to descending identity. Returns the number released.
    pub fn release_all(&self) -> usize {
        let mut closed = self.closed.write().unwrap_or_else(|e| e.into_inner());
        *closed = true;

        let ids: Vec<ObjectId> = self.entries.iter().map(|entry| *entry.key()).collect();
        let mut remaining: HashMap<ObjectId, Entry> = ids
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect();
        drop(closed);

        let mut released = 0;
        for id in teardown_order(&remaining) {
            if let Some(entry) = remaining.remove(&id) {
                tracing::debug!(%id, class = entry.class.name(), "releasing shared object on teardown");
                entry.object.on_release();
                released += 1;
            }
        }
        released
    }
}

impl Default for SharedObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Referrers first, then whatever they referenced.
fn teardown_order(entries: &HashMap<ObjectId, Entry>) -> Vec<ObjectId> {
    let edges: HashMap<ObjectId, Vec<ObjectId>> = entries
        .iter()
        .map(|(id, entry)| {
            let refs = entry
                .object
                .references()
                .into_iter()
                .filter(|target| target != id && entries.contains_key(target))
                .collect();
            (*id, refs)
        })
        .collect();

    let mut incoming: HashMap<ObjectId, usize> = entries.keys().map(|id| (*id, 0)).collect();
    for targets in edges.values() {
        for target in targets {
            *incoming.entry(*target).or_default() += 1;
        }
    }

    let mut order = Vec::with_capacity(entries.len());
    let mut done: HashSet<ObjectId> = HashSet::new();
    while order.len() < entries.len() {
        let mut ready: Vec<ObjectId> = incoming
            .iter()
            .filter(|(id, count)| **count == 0 && !done.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            // Only cycles are left; break one at the newest object.
            if let Some(newest) = incoming.keys().filter(|id| !done.contains(*id)).max() {
                ready.push(*newest);
            }
        }
        ready.sort_unstable_by(|a, b| b.cmp(a));
        for id in ready {
            done.insert(id);
            order.push(id);
            for target in edges.get(&id).into_iter().flatten() {
                if let Some(count) = incoming.get_mut(target) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }
    order
}
