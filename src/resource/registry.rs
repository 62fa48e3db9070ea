//! Identity and lifetime bookkeeping shared by every resource type.
//!
//! Mirrors the split in the system this is based on: the registry
//! never holds a resource's payload directly, only its ref count,
//! visibility, and name; the payload lives in the type's
//! [`super::ResourceManager`], which the registry calls back into to
//! run a release handler or to actually drop a value.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use rand::RngCore;

use crate::error::{Error, Result};

use super::ResourceFlags;

/// Process-unique identifier for a registered resource type, derived
/// from Rust's own [`TypeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceType(TypeId);

impl ResourceType {
    pub fn of<T: 'static>() -> Self {
        ResourceType(TypeId::of::<T>())
    }
}

/// Identifier for a single resource instance, unique for the lifetime
/// of the process across every registered type.
///
/// `ResourceId(0)` is never issued by [`ResourceSystem::mint_id`]; it
/// is reserved as the sentinel a loader sees while a load is still in
/// progress (see [`super::ResourceNameReservation`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) u64);

impl ResourceId {
    pub const INVALID: ResourceId = ResourceId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleState {
    New,
    Active,
    Releasing,
    Deleting,
}

pub(crate) struct ResourceRecord {
    pub(crate) flags: ResourceFlags,
    pub(crate) ref_count: AtomicI32,
    pub(crate) state: Mutex<LifecycleState>,
    pub(crate) name: Option<String>,
}

impl ResourceRecord {
    fn new(flags: ResourceFlags, name: Option<String>) -> Self {
        ResourceRecord {
            flags,
            ref_count: AtomicI32::new(1),
            state: Mutex::new(LifecycleState::New),
            name,
        }
    }

    /// `Resource::AddRef`: the first external reference to an
    /// auto-visible resource also makes it visible, under its state
    /// mutex, before the count is bumped; every call (first or later)
    /// increments the count.
    pub(crate) fn add_ref(&self) {
        if self.flags.contains(ResourceFlags::AUTO_VISIBLE)
            && self.ref_count.load(Ordering::Acquire) == 1
        {
            let mut state = self.state.lock().unwrap();
            if *state == LifecycleState::New {
                *state = LifecycleState::Active;
            }
        }
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// `Resource::RemoveRef`: always decrements; returns true if this
    /// call brought the count down to "manager only" and auto_release
    /// is set, meaning the caller must run the release path.
    pub(crate) fn remove_ref(&self) -> bool {
        let new_count = self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        self.flags.contains(ResourceFlags::AUTO_RELEASE) && new_count == 1
    }

    pub(crate) fn is_visible(&self) -> bool {
        matches!(*self.state.lock().unwrap(), LifecycleState::Active)
    }
}

/// Callbacks a [`super::ResourceManager`] registers with the system
/// so the system can drive the release/delete side of the lifecycle
/// for the types it doesn't otherwise know anything about.
pub(crate) trait ManagerHooks: Send + Sync {
    /// Runs the type's release handler for `id`. The registry always
    /// attempts maybe-delete itself right after this returns; a type
    /// only needs this hook for teardown side effects that must run
    /// before that attempt (logging, returning a buffer to a pool).
    fn release(&self, id: ResourceId);
    /// Drops the stored value for `id`. Only ever called once, after
    /// the registry has confirmed the resource has no references
    /// left.
    fn delete(&self, id: ResourceId);
    /// Reports `id`'s declared dependencies, if the type registered a
    /// dependency resolver. Empty by default.
    fn dependencies(&self, id: ResourceId) -> Vec<(ResourceType, ResourceId)> {
        let _ = id;
        Vec::new()
    }
}

struct Inner {
    managers: HashMap<ResourceType, std::sync::Arc<dyn ManagerHooks>>,
    records: HashMap<(ResourceType, ResourceId), std::sync::Arc<ResourceRecord>>,
    names: HashMap<(ResourceType, String), ResourceId>,
    reserved_names: std::collections::HashSet<(ResourceType, String)>,
    next_resource_id: u64,
}

/// The shared registry: type bindings, per-resource ref counts,
/// visibility, and the name <-> id maps.
///
/// Lock order, observed everywhere in this module: the registry's own
/// mutex is always acquired before a resource's own `state` mutex,
/// never the reverse.
pub struct ResourceSystem {
    inner: Mutex<Inner>,
}

impl Default for ResourceSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSystem {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let time_part = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let random_part = rng.next_u64() & 0xFFFF;
        let seed = ((time_part << 32) | (random_part << 16)).wrapping_add(1);
        ResourceSystem {
            inner: Mutex::new(Inner {
                managers: HashMap::new(),
                records: HashMap::new(),
                names: HashMap::new(),
                reserved_names: std::collections::HashSet::new(),
                next_resource_id: seed.max(1),
            }),
        }
    }

    pub(crate) fn register_manager(
        &self,
        resource_type: ResourceType,
        hooks: std::sync::Arc<dyn ManagerHooks>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.managers.contains_key(&resource_type) {
            return Err(Error::TypeAlreadyRegistered);
        }
        inner.managers.insert(resource_type, hooks);
        Ok(())
    }

    /// Force-removes every resource of `resource_type`, logging an
    /// error for each one that still had outstanding references, and
    /// drops the manager binding itself.
    pub(crate) fn remove_manager(&self, resource_type: ResourceType) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<ResourceId> = inner
            .records
            .keys()
            .filter(|(t, _)| *t == resource_type)
            .map(|(_, id)| *id)
            .collect();
        for id in ids {
            if let Some(record) = inner.records.remove(&(resource_type, id)) {
                if record.ref_count.load(Ordering::Acquire) > 0 {
                    log::error!(
                        "removing resource manager with a resource still referenced: {:?}",
                        id
                    );
                }
                if let Some(name) = &record.name {
                    inner.names.remove(&(resource_type, name.clone()));
                }
            }
        }
        inner.managers.remove(&resource_type);
    }

    /// Mints a globally unique, non-zero resource id.
    pub(crate) fn mint_id(&self, inner: &mut Inner) -> ResourceId {
        loop {
            inner.next_resource_id = inner.next_resource_id.wrapping_add(1).max(1);
            let candidate = ResourceId(inner.next_resource_id);
            if !inner.records.keys().any(|(_, id)| *id == candidate) {
                return candidate;
            }
        }
    }

    pub(crate) fn add_resource(
        &self,
        resource_type: ResourceType,
        id: ResourceId,
        name: Option<String>,
        flags: ResourceFlags,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.records.contains_key(&(resource_type, id)) {
            return Err(Error::DuplicateEntry);
        }
        if let Some(name) = &name {
            if inner.names.contains_key(&(resource_type, name.clone())) {
                return Err(Error::DuplicateName);
            }
        }
        if let Some(name) = &name {
            inner.names.insert((resource_type, name.clone()), id);
        }
        inner
            .records
            .insert((resource_type, id), std::sync::Arc::new(ResourceRecord::new(flags, name)));
        Ok(())
    }

    fn record(&self, resource_type: ResourceType, id: ResourceId) -> Option<std::sync::Arc<ResourceRecord>> {
        self.inner.lock().unwrap().records.get(&(resource_type, id)).cloned()
    }

    /// Looks up a resource by id, adding a reference if it is visible
    /// and not in the process of being deleted. Returns `None`
    /// otherwise (nil, in the original's terms).
    pub(crate) fn get(&self, resource_type: ResourceType, id: ResourceId) -> Option<()> {
        let record = self.record(resource_type, id)?;
        if !record.is_visible() {
            return None;
        }
        record.add_ref();
        Some(())
    }

    pub(crate) fn get_id_by_name(&self, resource_type: ResourceType, name: &str) -> Option<ResourceId> {
        self.inner.lock().unwrap().names.get(&(resource_type, name.to_string())).copied()
    }

    pub(crate) fn get_name(&self, resource_type: ResourceType, id: ResourceId) -> Option<String> {
        self.record(resource_type, id)?.name.clone()
    }

    /// Adds an external reference to an already-visible resource
    /// (used by [`super::ResourcePtr::clone`]).
    pub(crate) fn add_ref(&self, resource_type: ResourceType, id: ResourceId) {
        if let Some(record) = self.record(resource_type, id) {
            record.add_ref();
        }
    }

    /// Removes an external reference, running the release path if
    /// this was the threshold-crossing drop (used by
    /// [`super::ResourcePtr`]'s `Drop`).
    pub(crate) fn remove_ref(&self, resource_type: ResourceType, id: ResourceId) {
        let Some(record) = self.record(resource_type, id) else { return };
        if record.remove_ref() {
            self.release(resource_type, id);
        }
    }

    /// Explicitly releases a resource (bypassing the ref-count
    /// threshold check), as when a manager force-releases one, or a
    /// [`super::ResourceEntry`] is abandoned before ever being shared.
    ///
    /// Runs the type's release handler (default: maybe-delete) and,
    /// if nothing raced in a new reference while that handler ran,
    /// the resource ends up deleted; otherwise it reverts to *active*.
    pub(crate) fn release(&self, resource_type: ResourceType, id: ResourceId) {
        let Some(record) = self.record(resource_type, id) else { return };
        {
            let mut state = record.state.lock().unwrap();
            if *state == LifecycleState::Deleting {
                return;
            }
            *state = LifecycleState::Releasing;
        }
        let handler = self.inner.lock().unwrap().managers.get(&resource_type).cloned();
        if let Some(handler) = handler {
            handler.release(id);
        }
        if !self.maybe_delete(resource_type, id) {
            let mut state = record.state.lock().unwrap();
            if *state == LifecycleState::Releasing {
                *state = LifecycleState::Active;
            }
        }
    }

    /// Removes `id` from the registry and asks its manager to drop
    /// the stored value, but only if it truly has no references left
    /// (the count is at the "manager only" value of 1). Returns
    /// whether the delete happened.
    pub(crate) fn maybe_delete(&self, resource_type: ResourceType, id: ResourceId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.records.get(&(resource_type, id)).cloned() else { return false };
        if record.ref_count.compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        *record.state.lock().unwrap() = LifecycleState::Deleting;
        let name = record.name.clone();
        inner.records.remove(&(resource_type, id));
        if let Some(name) = name {
            inner.names.remove(&(resource_type, name));
        }
        let handler = inner.managers.get(&resource_type).cloned();
        drop(inner);
        if let Some(handler) = handler {
            handler.delete(id);
        }
        true
    }

    pub(crate) fn reserve_name(&self, resource_type: ResourceType, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (resource_type, name.to_string());
        if inner.names.contains_key(&key) || inner.reserved_names.contains(&key) {
            return Err(Error::DuplicateName);
        }
        inner.reserved_names.insert(key);
        Ok(())
    }

    pub(crate) fn release_reserved_name(&self, resource_type: ResourceType, name: &str) {
        self.inner.lock().unwrap().reserved_names.remove(&(resource_type, name.to_string()));
    }

    pub(crate) fn apply_reserved_name(&self, resource_type: ResourceType, name: &str, id: ResourceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.reserved_names.remove(&(resource_type, name.to_string()));
        inner.names.insert((resource_type, name.to_string()), id);
    }

    pub(crate) fn mint_resource_id(&self) -> ResourceId {
        let mut inner = self.inner.lock().unwrap();
        self.mint_id(&mut inner)
    }

    /// Declared dependencies for `(resource_type, id)`, as reported by
    /// the type's registered dependency resolver (empty if it has
    /// none, or the resource's manager has already gone away).
    pub(crate) fn dependencies(
        &self,
        resource_type: ResourceType,
        id: ResourceId,
    ) -> Vec<(ResourceType, ResourceId)> {
        let handler = self.inner.lock().unwrap().managers.get(&resource_type).cloned();
        handler.map(|handler| handler.dependencies(id)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_resource_id_is_never_zero() {
        let system = ResourceSystem::new();
        for _ in 0..100 {
            assert!(system.mint_resource_id().is_valid());
        }
    }

    #[test]
    fn reserve_name_twice_fails() {
        let system = ResourceSystem::new();
        let t = ResourceType::of::<u32>();
        system.reserve_name(t, "foo").unwrap();
        assert!(matches!(system.reserve_name(t, "foo"), Err(Error::DuplicateName)));
    }
}
