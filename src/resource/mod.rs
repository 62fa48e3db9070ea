//! Reference-counted resource registry.
//!
//! A [`ResourceSystem`] tracks identity and lifetime for resources of
//! any number of registered types; each type's storage and
//! construction/teardown policy lives in its own [`ResourceManager`].
//! Consumers hold resources through [`ResourcePtr`], a ref-counted
//! handle whose clone/drop implement the auto-visible/auto-release
//! bookkeeping described for this system; [`ResourceNameReservation`]
//! lets a loader claim a name before the resource behind it exists.

mod entry;
mod manager;
mod registry;
mod reservation;
mod set;

pub use entry::{ResourceEntry, ResourcePtr};
pub use manager::ResourceManager;
pub use registry::{ResourceId, ResourceSystem, ResourceType};
pub use reservation::ResourceNameReservation;
pub use set::ResourceSet;

bitflags::bitflags! {
    /// Lifecycle policy for a single resource.
    pub struct ResourceFlags: u32 {
        /// The resource becomes visible to `get_by_name`/`get` lookups
        /// on its first external reference rather than immediately on
        /// creation.
        const AUTO_VISIBLE = 0b0000_0001;
        /// The resource is released as soon as its last external
        /// reference is dropped, rather than staying registered until
        /// its manager explicitly releases it.
        const AUTO_RELEASE = 0b0000_0010;
    }
}

impl Default for ResourceFlags {
    fn default() -> Self {
        ResourceFlags::AUTO_VISIBLE | ResourceFlags::AUTO_RELEASE
    }
}
