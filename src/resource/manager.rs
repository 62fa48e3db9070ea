//! Typed storage and construction policy for one resource type.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::entry::{ResourceEntry, ResourcePtr};
use super::registry::{ManagerHooks, ResourceId, ResourceSystem, ResourceType};
use super::reservation::ResourceNameReservation;
use super::ResourceFlags;
use crate::error::Result;

pub(super) struct Storage<T> {
    pub(super) values: Mutex<HashMap<ResourceId, T>>,
    pub(super) loader: Mutex<Option<Arc<dyn Fn(&str) -> Option<T> + Send + Sync>>>,
    pub(super) dependencies_fn:
        Mutex<Option<Arc<dyn Fn(&T) -> Vec<(ResourceType, ResourceId)> + Send + Sync>>>,
}

impl<T> Storage<T> {
    pub(super) fn empty() -> Self {
        Storage {
            values: Mutex::new(HashMap::new()),
            loader: Mutex::new(None),
            dependencies_fn: Mutex::new(None),
        }
    }
}

impl<T: Send + 'static> ManagerHooks for Storage<T> {
    fn release(&self, id: ResourceId) {
        // The default policy for this core has no per-type release
        // handler hook beyond the registry's own ref-count bookkeeping;
        // a type that needs one wraps its `T` to run teardown logic in
        // its `Drop` impl, invoked from `delete` below.
        let _ = id;
    }

    fn delete(&self, id: ResourceId) {
        self.values.lock().unwrap().remove(&id);
    }

    fn dependencies(&self, id: ResourceId) -> Vec<(ResourceType, ResourceId)> {
        let Some(resolver) = self.dependencies_fn.lock().unwrap().clone() else {
            return Vec::new();
        };
        match self.values.lock().unwrap().get(&id) {
            Some(value) => resolver(value),
            None => Vec::new(),
        }
    }
}

/// Owns the storage for every resource of type `T` registered with a
/// [`ResourceSystem`], and is the only way to create or name one.
pub struct ResourceManager<T: Any + Send + Sync> {
    system: Arc<ResourceSystem>,
    resource_type: ResourceType,
    storage: Arc<Storage<T>>,
}

impl<T: Any + Send + Sync> Clone for ResourceManager<T> {
    fn clone(&self) -> Self {
        ResourceManager {
            system: self.system.clone(),
            resource_type: self.resource_type,
            storage: self.storage.clone(),
        }
    }
}

impl<T: Any + Send + Sync> ResourceManager<T> {
    /// Registers `T` with `system`. Fails if `T` is already bound to a
    /// manager on this system.
    pub fn register(system: Arc<ResourceSystem>) -> Result<Self> {
        let resource_type = ResourceType::of::<T>();
        let storage = Arc::new(Storage::empty());
        system.register_manager(resource_type, storage.clone())?;
        Ok(ResourceManager { system, resource_type, storage })
    }

    /// Registers the per-type loader invoked by [`ResourceManager::load`]
    /// for names that are not yet resolved. Replaces any loader set
    /// earlier.
    pub fn set_loader(&self, loader: impl Fn(&str) -> Option<T> + Send + Sync + 'static) {
        *self.storage.loader.lock().unwrap() = Some(Arc::new(loader));
    }

    /// Registers the function used to report `T`'s dependencies to
    /// [`super::ResourceSet::add`]. Resources with no dependencies
    /// don't need to call this; the default resolver reports none.
    pub fn set_dependencies(
        &self,
        resolver: impl Fn(&T) -> Vec<(ResourceType, ResourceId)> + Send + Sync + 'static,
    ) {
        *self.storage.dependencies_fn.lock().unwrap() = Some(Arc::new(resolver));
    }

    /// Resolves `name` to a resource, loading it if necessary.
    ///
    /// If `name` is already mapped to a resource, returns it directly.
    /// Otherwise reserves the name (so a concurrent second caller sees
    /// it as contested rather than double-loading) and runs the loader
    /// registered via [`ResourceManager::set_loader`]. Returns `None`
    /// if no loader is registered, the name is already being loaded by
    /// another caller, or the loader itself fails.
    pub fn load(&self, name: &str) -> Option<ResourcePtr<T>> {
        if let Some(ptr) = self.get_by_name(name) {
            return Some(ptr);
        }
        let reservation = self.reserve_name(name).ok()?;
        let loader = self.storage.loader.lock().unwrap().clone()?;
        let value = loader(name)?;
        let entry = self.new_resource_with_reservation(reservation, value).ok()?;
        Some(entry.publish())
    }

    /// Creates a new, unnamed resource and returns its construction
    /// token. Call [`ResourceEntry::publish`] to make it visible to
    /// lookups.
    pub fn new_resource(&self, value: T) -> Result<ResourceEntry<T>> {
        let id = self.system.mint_resource_id();
        self.system.add_resource(self.resource_type, id, None, ResourceFlags::default())?;
        self.storage.values.lock().unwrap().insert(id, value);
        Ok(ResourceEntry::new(self.system.clone(), self.resource_type, id, self.storage.clone()))
    }

    /// Creates a new, unnamed resource at a caller-chosen id rather
    /// than minting one.
    ///
    /// Fails with [`crate::error::Error::DuplicateEntry`] if `id` is
    /// already allocated to a live resource of this type. Mainly
    /// useful for reconstructing a resource at a previously persisted
    /// id; ordinary construction should prefer [`ResourceManager::new_resource`].
    pub fn new_resource_at(&self, id: ResourceId, value: T) -> Result<ResourceEntry<T>> {
        self.system.add_resource(self.resource_type, id, None, ResourceFlags::default())?;
        self.storage.values.lock().unwrap().insert(id, value);
        Ok(ResourceEntry::new(self.system.clone(), self.resource_type, id, self.storage.clone()))
    }

    /// Creates a resource under a name reserved earlier via
    /// [`ResourceManager::reserve_name`], committing the reservation
    /// to the new id.
    pub fn new_resource_with_reservation(
        &self,
        reservation: ResourceNameReservation,
        value: T,
    ) -> Result<ResourceEntry<T>> {
        let id = self.system.mint_resource_id();
        let name = reservation.name().to_string();
        self.system.add_resource(self.resource_type, id, Some(name.clone()), ResourceFlags::default())?;
        self.storage.values.lock().unwrap().insert(id, value);
        reservation.apply(id);
        Ok(ResourceEntry::new(self.system.clone(), self.resource_type, id, self.storage.clone()))
    }

    /// Reserves `name` for this type so a loader can mint an id and
    /// build the value before any other caller can claim the same
    /// name. Fails if the name is already reserved or in use.
    pub fn reserve_name(&self, name: impl Into<String>) -> Result<ResourceNameReservation> {
        let name = name.into();
        self.system.reserve_name(self.resource_type, &name)?;
        Ok(ResourceNameReservation::new(self.system.clone(), self.resource_type, name))
    }

    /// Looks up a visible resource by id.
    pub fn get(&self, id: ResourceId) -> Option<ResourcePtr<T>> {
        self.system.get(self.resource_type, id)?;
        Some(ResourcePtr::new(self.system.clone(), self.resource_type, id, self.storage.clone()))
    }

    /// Looks up a visible resource by name.
    pub fn get_by_name(&self, name: &str) -> Option<ResourcePtr<T>> {
        let id = self.system.get_id_by_name(self.resource_type, name)?;
        self.get(id)
    }

    /// The name a resource was created or reserved with, if any.
    pub fn name_of(&self, id: ResourceId) -> Option<String> {
        self.system.get_name(self.resource_type, id)
    }

    /// Removes `id` from this manager's storage and the registry's
    /// bookkeeping immediately, regardless of remaining references.
    /// Used by the default generic release handler and available
    /// directly for manager-driven teardown.
    pub fn maybe_delete(&self, id: ResourceId) {
        self.system.maybe_delete(self.resource_type, id);
    }
}

impl<T: Any + Send + Sync> Drop for ResourceManager<T> {
    fn drop(&mut self) {
        // Only the last clone (holding the final `Arc` to storage) should
        // tear the type binding down; cheap check avoids double-removal
        // noise from `remove_manager` when the manager is simply cloned
        // and one clone goes out of scope.
        if Arc::strong_count(&self.storage) == 1 {
            self.system.remove_manager(self.resource_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_invokes_loader_once_and_caches_by_name() {
        let system = Arc::new(ResourceSystem::new());
        let manager = ResourceManager::<String>::register(system).unwrap();
        let call_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let call_count_clone = call_count.clone();
        manager.set_loader(move |name| {
            call_count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some(format!("contents of {name}"))
        });

        let first = manager.load("level.tex").unwrap();
        assert_eq!(first.with(|v| v.clone()), "contents of level.tex");
        let second = manager.load("level.tex").unwrap();
        assert_eq!(second.id(), first.id());
        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn load_with_no_registered_loader_returns_none() {
        let system = Arc::new(ResourceSystem::new());
        let manager = ResourceManager::<u32>::register(system).unwrap();
        assert!(manager.load("missing").is_none());
    }

    #[test]
    fn new_resource_at_rejects_a_duplicate_id() {
        let system = Arc::new(ResourceSystem::new());
        let manager = ResourceManager::<u32>::register(system).unwrap();
        let first = manager.new_resource(1).unwrap();
        let id = first.id();
        assert!(manager.new_resource_at(id, 2).is_err());
        drop(first);
        assert!(manager.new_resource_at(id, 2).is_ok());
    }

    #[test]
    fn load_returns_none_when_loader_fails() {
        let system = Arc::new(ResourceSystem::new());
        let manager = ResourceManager::<u32>::register(system).unwrap();
        manager.set_loader(|_name| None);
        assert!(manager.load("broken.tex").is_none());
        // The failed load must not leave the name permanently reserved.
        manager.set_loader(|_name| Some(42));
        assert!(manager.load("broken.tex").is_some());
    }
}
