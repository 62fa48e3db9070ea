//! Heterogeneous, type-keyed context map used for job and
//! resource-construction inputs.
//!
//! A [`Context`] stores at most one value per `(TypeId, Option<name>)`
//! pair. Values may be owned or borrowed for the lifetime of the
//! context; no serialization format is defined.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;

/// Name this crate stores its own [`Clock`] entry under, so that a
/// caller's own `"Clock"`-named entry (if any) can never collide with
/// it: `Context::set_clock`/`clock` key on `Arc<dyn Clock>` under this
/// private constant, never on the bare string a caller might also
/// reach for by convention.
const CLOCK_KEY: &str = "gbcore::context::clock";

enum Slot {
    Owned(Box<dyn Any + Send + Sync>),
    Borrowed(*const (dyn Any + Send + Sync)),
}

// SAFETY: `Borrowed` only stores pointers that outlive the context (the
// caller of `Context::set_ref` is required to uphold this, documented
// on that method); the pointee itself is `Any + Send + Sync`.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

#[derive(Default)]
struct Key {
    type_id: TypeId,
    name: Option<String>,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.name == other.name
    }
}
impl Eq for Key {}
impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.name.hash(state);
    }
}

/// A heterogeneous map keyed by type, and optionally also by name.
///
/// This is the job-context and resource-construction-input map
/// referenced throughout the job and resource systems: submitters
/// populate it before calling `run`, and the running job (or a
/// resource loader) reads it back by type.
#[derive(Default)]
pub struct Context {
    values: HashMap<Key, Slot>,
}

impl Context {
    /// Creates an empty context.
    pub fn new() -> Self {
        Context::default()
    }

    /// Sets the value for `T`, overwriting any previous value of the
    /// same type with no name.
    pub fn set<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(
            Key { type_id: TypeId::of::<T>(), name: None },
            Slot::Owned(Box::new(value)),
        );
    }

    /// Sets the value for `T` under `name`, independent of any unnamed
    /// `T` or `T` stored under a different name.
    pub fn set_named<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.values.insert(
            Key { type_id: TypeId::of::<T>(), name: Some(name.into()) },
            Slot::Owned(Box::new(value)),
        );
    }

    /// Stores a borrowed reference to `value` under `T` (and
    /// optionally `name`).
    ///
    /// # Safety
    ///
    /// The caller must ensure `value` outlives every use of this
    /// context entry; the context has no way to enforce this borrow
    /// statically because it type-erases the reference.
    pub unsafe fn set_ref<T: Any + Send + Sync>(&mut self, name: Option<&str>, value: &T) {
        let ptr: *const (dyn Any + Send + Sync) = value as &(dyn Any + Send + Sync);
        self.values.insert(
            Key { type_id: TypeId::of::<T>(), name: name.map(String::from) },
            Slot::Borrowed(ptr),
        );
    }

    /// Returns the value for `T`, if set.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.get_named::<T>(None)
    }

    /// Returns the value for `T` stored under `name`, if set.
    pub fn get_named<T: Any + Send + Sync>(&self, name: Option<&str>) -> Option<&T> {
        let key = Key { type_id: TypeId::of::<T>(), name: name.map(String::from) };
        match self.values.get(&key)? {
            Slot::Owned(boxed) => boxed.downcast_ref::<T>(),
            // SAFETY: see `set_ref`.
            Slot::Borrowed(ptr) => unsafe { (**ptr).downcast_ref::<T>() },
        }
    }

    /// Returns a mutable reference to the owned value for `T`, if set
    /// and owned (borrowed entries cannot be mutated through the
    /// context).
    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        let key = Key { type_id: TypeId::of::<T>(), name: None };
        match self.values.get_mut(&key)? {
            Slot::Owned(boxed) => boxed.downcast_mut::<T>(),
            Slot::Borrowed(_) => None,
        }
    }

    /// Returns true if no values are set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stores this context's [`Clock`], keyed under [`CLOCK_KEY`]
    /// rather than a bare type entry so a caller's own unrelated
    /// `Arc<dyn Clock>` entry (if any) can never collide with it.
    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.set_named(CLOCK_KEY, clock);
    }

    /// Returns the [`Clock`] set via [`Context::set_clock`], if any.
    pub fn clock(&self) -> Option<Arc<dyn Clock>> {
        self.get_named::<Arc<dyn Clock>>(Some(CLOCK_KEY)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_by_type() {
        let mut ctx = Context::new();
        ctx.set(42u32);
        ctx.set("hello".to_string());
        assert_eq!(ctx.get::<u32>(), Some(&42));
        assert_eq!(ctx.get::<String>(), Some(&"hello".to_string()));
    }

    #[test]
    fn named_entries_are_independent_of_unnamed() {
        let mut ctx = Context::new();
        ctx.set(1u32);
        ctx.set_named("other", 2u32);
        assert_eq!(ctx.get::<u32>(), Some(&1));
        assert_eq!(ctx.get_named::<u32>(Some("other")), Some(&2));
        assert_eq!(ctx.get_named::<u32>(Some("missing")), None);
    }

    #[test]
    fn missing_type_returns_none() {
        let ctx = Context::new();
        assert_eq!(ctx.get::<u32>(), None);
    }

    #[test]
    fn set_ref_is_visible_through_get() {
        let value = 99i64;
        let mut ctx = Context::new();
        unsafe { ctx.set_ref(None, &value) };
        assert_eq!(ctx.get::<i64>(), Some(&99));
    }

    #[test]
    fn set_clock_is_visible_through_clock_and_independent_of_user_keys() {
        use crate::clock::FakeClock;

        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let mut ctx = Context::new();
        ctx.set_clock(clock.clone());
        // A caller's own unnamed `Arc<dyn Clock>` entry must not shadow
        // or be shadowed by the crate's reserved-key slot.
        ctx.set(clock.clone());

        assert!(ctx.clock().is_some());
        assert!(ctx.get::<Arc<dyn Clock>>().is_some());
        assert_eq!(ctx.get_named::<Arc<dyn Clock>>(Some("other")), None);
    }

    #[test]
    fn clock_is_none_when_never_set() {
        let ctx = Context::new();
        assert!(ctx.clock().is_none());
    }
}
