//! RAII handles into a resource's storage: [`ResourceEntry`] for the
//! brief window between minting an id and publishing it, and
//! [`ResourcePtr`] for ordinary shared ownership afterward.

use std::sync::Arc;

use super::manager::Storage;
use super::registry::{ResourceId, ResourceSystem, ResourceType};

/// A freshly created resource, not yet visible to `get`/`get_by_name`.
///
/// Move-only: dropping an entry without calling [`ResourceEntry::publish`]
/// releases the resource immediately, as if it had never been
/// referenced, which is the right behavior for a loader that fails
/// partway through construction.
pub struct ResourceEntry<T: Send + 'static> {
    system: Arc<ResourceSystem>,
    resource_type: ResourceType,
    id: ResourceId,
    storage: Arc<Storage<T>>,
    published: bool,
}

impl<T: Send + 'static> ResourceEntry<T> {
    pub(crate) fn new(
        system: Arc<ResourceSystem>,
        resource_type: ResourceType,
        id: ResourceId,
        storage: Arc<Storage<T>>,
    ) -> Self {
        ResourceEntry { system, resource_type, id, storage, published: false }
    }

    /// The id this resource will have once published.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Takes the entry's first external reference and returns a
    /// [`ResourcePtr`] to it.
    ///
    /// This is an ordinary `AddRef`: for the default auto-visible
    /// policy, this is the call that flips the resource from *new* to
    /// *active*; a resource that instead gets its first reference through
    /// [`super::ResourceSet::insert`] becomes visible there instead,
    /// with no difference in outcome.
    pub fn publish(mut self) -> ResourcePtr<T> {
        self.system.add_ref(self.resource_type, self.id);
        self.published = true;
        ResourcePtr::new(self.system.clone(), self.resource_type, self.id, self.storage.clone())
    }

    /// Abandons construction, releasing the resource immediately. Not
    /// usually called directly; equivalent to letting the entry drop.
    pub fn free(mut self) {
        self.published = true;
        self.system.release(self.resource_type, self.id);
    }

    /// Consumes the entry without taking a reference, handing its
    /// identity to a caller (namely [`super::ResourceSet::insert`])
    /// that will perform the `AddRef` itself.
    pub(crate) fn take_identity(mut self) -> (ResourceType, ResourceId) {
        self.published = true;
        (self.resource_type, self.id)
    }
}

impl<T: Send + 'static> Drop for ResourceEntry<T> {
    fn drop(&mut self) {
        if !self.published {
            self.system.release(self.resource_type, self.id);
        }
    }
}

/// A shared, ref-counted handle to a published resource.
///
/// Cloning adds a reference (`Resource::AddRef`); dropping the last
/// clone runs the release path for this resource
/// (`Resource::RemoveRef`), which — for the default auto-release
/// policy — tears it down immediately.
pub struct ResourcePtr<T: Send + 'static> {
    system: Arc<ResourceSystem>,
    resource_type: ResourceType,
    id: ResourceId,
    storage: Arc<Storage<T>>,
}

impl<T: Send + 'static> ResourcePtr<T> {
    pub(crate) fn new(
        system: Arc<ResourceSystem>,
        resource_type: ResourceType,
        id: ResourceId,
        storage: Arc<Storage<T>>,
    ) -> Self {
        ResourcePtr { system, resource_type, id, storage }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// The resource type this handle belongs to; used by
    /// [`super::ResourceSet::add`] to key its membership map without
    /// needing to know `T` itself.
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Runs `f` with a reference to the underlying value.
    ///
    /// The value lives behind the manager's storage lock rather than
    /// behind this handle directly, so access is scoped rather than a
    /// plain `Deref`; this matches resources being mutable in place
    /// (e.g. reloaded) while other handles are outstanding.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let values = self.storage.values.lock().unwrap();
        let value = values.get(&self.id).expect("resource ptr outlived its storage entry");
        f(value)
    }

    /// Runs `f` with a mutable reference to the underlying value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut values = self.storage.values.lock().unwrap();
        let value = values.get_mut(&self.id).expect("resource ptr outlived its storage entry");
        f(value)
    }
}

impl<T: Send + 'static> Clone for ResourcePtr<T> {
    fn clone(&self) -> Self {
        self.system.add_ref(self.resource_type, self.id);
        ResourcePtr {
            system: self.system.clone(),
            resource_type: self.resource_type,
            id: self.id,
            storage: self.storage.clone(),
        }
    }
}

impl<T: Send + 'static> Drop for ResourcePtr<T> {
    fn drop(&mut self) {
        self.system.remove_ref(self.resource_type, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::super::manager::Storage;
    use super::*;

    fn fresh_entry(system: Arc<ResourceSystem>, resource_type: ResourceType, value: u32) -> ResourceEntry<u32> {
        let storage = Arc::new(Storage::empty());
        let id = system.mint_resource_id();
        system.add_resource(resource_type, id, None, super::ResourceFlags::default()).unwrap();
        storage.values.lock().unwrap().insert(id, value);
        ResourceEntry::new(system, resource_type, id, storage)
    }

    #[test]
    fn publish_makes_resource_visible() {
        let system = Arc::new(ResourceSystem::new());
        let resource_type = ResourceType::of::<u32>();
        let entry = fresh_entry(system.clone(), resource_type, 7);
        let id = entry.id();
        let ptr = entry.publish();
        assert_eq!(ptr.id(), id);
        assert!(system.get(resource_type, id).is_some());
    }

    #[test]
    fn dropping_unpublished_entry_releases_it() {
        let system = Arc::new(ResourceSystem::new());
        let resource_type = ResourceType::of::<u32>();
        let entry = fresh_entry(system.clone(), resource_type, 7);
        let id = entry.id();
        drop(entry);
        assert!(system.get(resource_type, id).is_none());
    }

    #[test]
    fn clone_and_drop_round_trips_ref_count() {
        let system = Arc::new(ResourceSystem::new());
        let resource_type = ResourceType::of::<u32>();
        let entry = fresh_entry(system.clone(), resource_type, 7);
        let ptr = entry.publish();
        let ptr2 = ptr.clone();
        assert_eq!(ptr2.with(|v| *v), 7);
        drop(ptr2);
        drop(ptr);
    }
}
