//! Name reservation: claim a name before the resource behind it
//! exists, so concurrent loaders racing on the same name fail fast
//! instead of double-loading.

use std::sync::Arc;

use super::registry::{ResourceId, ResourceSystem, ResourceType};

/// A reserved, not-yet-applied resource name.
///
/// Move-only. Dropping a reservation without applying it releases the
/// name back for others to claim.
pub struct ResourceNameReservation {
    system: Arc<ResourceSystem>,
    resource_type: ResourceType,
    name: String,
    applied: bool,
}

impl ResourceNameReservation {
    pub(crate) fn new(system: Arc<ResourceSystem>, resource_type: ResourceType, name: String) -> Self {
        ResourceNameReservation { system, resource_type, name, applied: false }
    }

    /// The reserved name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commits the reservation to `id`, making `name` resolve to it.
    /// Consumes the reservation; normally called only from
    /// [`super::ResourceManager::new_resource_with_reservation`].
    pub(crate) fn apply(mut self, id: ResourceId) {
        self.system.apply_reserved_name(self.resource_type, &self.name, id);
        self.applied = true;
    }
}

impl Drop for ResourceNameReservation {
    fn drop(&mut self) {
        if !self.applied {
            self.system.release_reserved_name(self.resource_type, &self.name);
        }
    }
}
