//! Bulk, deterministic-release collection of strong resource
//! references, spanning any number of registered types.
//!
//! A [`ResourceSet`] deliberately doesn't know `T`: it tracks
//! membership and the corresponding add_ref/remove_ref bookkeeping by
//! `(ResourceType, ResourceId)` alone, so one set can hold a texture,
//! a mesh and a material side by side (the usual "everything a level
//! needs" grouping).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::entry::{ResourceEntry, ResourcePtr};
use super::registry::{ResourceId, ResourceSystem, ResourceType};

/// Owned collection of strong references, released together.
///
/// Cloning the set is not supported (it would double the ref count
/// held on every member with no way to express that at the type
/// level); share a `ResourceSet` behind an `Arc` if multiple owners
/// need to observe the same membership.
pub struct ResourceSet {
    system: Arc<ResourceSystem>,
    members: Mutex<HashSet<(ResourceType, ResourceId)>>,
}

impl ResourceSet {
    /// Creates an empty set bound to `system`.
    pub fn new(system: Arc<ResourceSystem>) -> Self {
        ResourceSet { system, members: Mutex::new(HashSet::new()) }
    }

    /// Adds an already-referenced `resource` to the set, taking an
    /// additional strong reference on top of the one `resource`
    /// itself holds.
    ///
    /// A no-op (but still a success) if `resource` is already a
    /// member. When `also_add_deps` is set, recursively adds every
    /// dependency `resource`'s type reported via
    /// [`super::ResourceManager::set_dependencies`]; cycles are
    /// broken by the membership check, since a dependency already
    /// present is never re-added.
    pub fn add<T: Send + 'static>(&self, resource: &ResourcePtr<T>, also_add_deps: bool) {
        self.add_key(resource.resource_type(), resource.id(), also_add_deps);
    }

    /// Hands a freshly minted [`ResourceEntry`] straight into the set,
    /// without ever going through [`ResourceEntry::publish`].
    ///
    /// This is how an auto-visible resource is meant to be published:
    /// the set's own `AddRef` is the resource's first external
    /// reference, which is exactly the event that flips it from *new*
    /// to *active*. Loading straight into a set and never holding a
    /// bare [`ResourcePtr`] is the common case for batch-owned
    /// resources (e.g. "everything this level needs").
    pub fn insert<T: Send + 'static>(&self, entry: ResourceEntry<T>, also_add_deps: bool) {
        let (resource_type, id) = entry.take_identity();
        self.add_key(resource_type, id, also_add_deps);
    }

    fn add_key(&self, resource_type: ResourceType, id: ResourceId, also_add_deps: bool) {
        {
            let mut members = self.members.lock().unwrap();
            if !members.insert((resource_type, id)) {
                return;
            }
        }
        self.system.add_ref(resource_type, id);
        if also_add_deps {
            for (dep_type, dep_id) in self.system.dependencies(resource_type, id) {
                self.add_key(dep_type, dep_id, true);
            }
        }
    }

    /// Whether `(resource_type, id)` is currently a member.
    pub fn contains(&self, resource_type: ResourceType, id: ResourceId) -> bool {
        self.members.lock().unwrap().contains(&(resource_type, id))
    }

    /// Removes `(resource_type, id)` from the set.
    ///
    /// When `release` is true (the default caller intent), the set's
    /// own reference is dropped immediately. When false, the set
    /// forgets the member without releasing it — the caller is
    /// thereby accepting responsibility for the reference it held.
    pub fn remove(&self, resource_type: ResourceType, id: ResourceId, release: bool) {
        let removed = self.members.lock().unwrap().remove(&(resource_type, id));
        if removed && release {
            self.system.remove_ref(resource_type, id);
        }
    }

    /// Releases every member. Order is unspecified.
    pub fn remove_all(&self) {
        let members: Vec<_> = self.members.lock().unwrap().drain().collect();
        for (resource_type, id) in members {
            self.system.remove_ref(resource_type, id);
        }
    }

    /// Number of members currently held.
    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        self.remove_all();
    }
}
