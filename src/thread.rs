//! OS thread primitive: a named, joinable-or-detachable handle with
//! optional hardware-affinity pinning.
//!
//! An owning handle guards its join/detach state and display name
//! behind a mutex, and a thread-local records "the handle of the
//! thread I'm running on" so [`this_thread`] can answer without a
//! registry lookup.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::UsageError;

const MAX_NAME_LEN: usize = 128;

static THREAD_INDEX: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
static ACTIVE_THREAD_COUNT: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(0);

thread_local! {
    static THIS_THREAD: std::cell::RefCell<Option<Thread>> = const { std::cell::RefCell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Running,
    Joined,
    Detached,
}

struct Inner {
    name: Mutex<String>,
    state: Mutex<LifecycleState>,
    affinity: u64,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

/// An owning handle to an OS thread created by [`create`].
///
/// Exactly one of `join` or `detach` must eventually be called; both
/// are one-shot and a second call is a usage error that is logged and
/// ignored.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<Inner>,
}

impl Thread {
    /// Returns the thread's current display name.
    pub fn name(&self) -> String {
        self.inner.name.lock().unwrap().clone()
    }

    /// Sets the thread's display name, truncating to 127 bytes plus a
    /// terminator if necessary.
    pub fn set_name(&self, name: &str) {
        let mut truncated = name.to_string();
        truncated.truncate(MAX_NAME_LEN - 1);
        *self.inner.name.lock().unwrap() = truncated;
    }

    /// The hardware affinity mask this thread was created with (zero
    /// means unpinned).
    pub fn affinity(&self) -> u64 {
        self.inner.affinity
    }

    /// Blocks until the thread exits, then releases its resources.
    /// Calling this a second time (or after [`detach`](Self::detach))
    /// is a usage error that is logged and ignored.
    pub fn join(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if *state != LifecycleState::Running {
            drop(state);
            UsageError("join called on a thread that was already joined or detached").log();
            return;
        }
        let handle = self.inner.join_handle.lock().unwrap().take();
        *state = LifecycleState::Joined;
        drop(state);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Releases ownership of the thread; its resources are reclaimed
    /// automatically when it exits. Calling this a second time (or
    /// after [`join`](Self::join)) is a usage error that is logged and
    /// ignored.
    pub fn detach(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if *state != LifecycleState::Running {
            drop(state);
            UsageError("detach called on a thread that was already joined or detached").log();
            return;
        }
        *state = LifecycleState::Detached;
        // The underlying std::thread::JoinHandle is already detached in
        // the sense that not joining it lets the OS thread run free; we
        // simply drop our handle to it.
        self.inner.join_handle.lock().unwrap().take();
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Thread {}

/// Spawns a new OS thread running `entry(user_data)`.
///
/// `affinity == 0` means "no pinning". The thread must later be
/// joined or detached exactly once via the returned [`Thread`].
pub fn create<F>(affinity: u64, stack_size: usize, entry: F) -> crate::error::Result<Thread>
where
    F: FnOnce() + Send + 'static,
{
    let index = THREAD_INDEX.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let inner = Arc::new(Inner {
        name: Mutex::new(format!("Thread-{index}")),
        state: Mutex::new(LifecycleState::Running),
        affinity,
        join_handle: Mutex::new(None),
    });
    let handle_for_body = Thread { inner: inner.clone() };

    let mut builder = std::thread::Builder::new().name(inner.name.lock().unwrap().clone());
    if stack_size > 0 {
        builder = builder.stack_size(stack_size);
    }

    ACTIVE_THREAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let spawn_result = builder.spawn(move || {
        THIS_THREAD.with(|cell| *cell.borrow_mut() = Some(handle_for_body.clone()));
        if affinity != 0 {
            pin_to_affinity_mask(affinity);
        }
        entry();
        ACTIVE_THREAD_COUNT.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    });

    match spawn_result {
        Ok(join_handle) => {
            *inner.join_handle.lock().unwrap() = Some(join_handle);
            Ok(Thread { inner })
        }
        Err(_) => {
            ACTIVE_THREAD_COUNT.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            Err(crate::error::Error::ThreadCreateFailed)
        }
    }
}

fn pin_to_affinity_mask(mask: u64) {
    let Some(cores) = core_affinity::get_core_ids() else {
        return;
    };
    for (bit, core) in cores.into_iter().enumerate() {
        if mask & (1u64 << bit) != 0 {
            core_affinity::set_for_current(core);
            return;
        }
    }
}

/// Returns the handle for the calling thread if it was created via
/// [`create`], or `None` otherwise.
pub fn this_thread() -> Option<Thread> {
    THIS_THREAD.with(|cell| cell.borrow().clone())
}

/// Positive hardware-concurrency hint, floor-clamped to 1.
pub fn max_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Enumerates per-hardware-thread affinity masks available to the
/// process, one bit per core; empty if the platform cannot report
/// this.
pub fn hardware_affinities() -> Vec<u64> {
    core_affinity::get_core_ids()
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(bit, _)| 1u64 << bit)
        .collect()
}

/// Process-global count of threads created via [`create`] that have
/// not yet run their entry function to completion.
pub fn active_thread_count() -> i64 {
    ACTIVE_THREAD_COUNT.load(std::sync::atomic::Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn create_runs_entry_and_joins() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();
        let thread = create(0, 0, move || {
            flag_clone.store(true, Ordering::SeqCst);
        })
        .unwrap();
        thread.join();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn this_thread_observes_handle_while_running() {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = create(0, 0, move || {
            tx.send(this_thread().is_some()).unwrap();
        })
        .unwrap();
        assert!(rx.recv().unwrap());
        thread.join();
    }

    #[test]
    fn this_thread_is_none_outside_a_created_thread() {
        assert!(this_thread().is_none());
    }

    #[test]
    fn double_join_is_logged_and_ignored() {
        let thread = create(0, 0, || {}).unwrap();
        thread.join();
        thread.join();
    }

    #[test]
    fn max_concurrency_is_positive() {
        assert!(max_concurrency() >= 1);
    }

    #[test]
    fn set_name_truncates_long_names() {
        let thread = create(0, 0, || {}).unwrap();
        thread.set_name(&"x".repeat(500));
        assert!(thread.name().len() < 500);
        thread.join();
    }
}
