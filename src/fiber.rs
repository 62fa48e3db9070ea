//! Stackful fiber primitive.
//!
//! A [`Fiber`] is a suspended execution context with its own stack. It
//! is a cheap handle (an [`Arc`]) around a state machine that is
//! either [`FiberState::Suspended`] (holding the saved CPU context to
//! resume), [`FiberState::Running`], or [`FiberState::Finished`].
//!
//! Switching is symmetric: [`switch_to`] suspends whatever fiber is
//! running on the calling OS thread and resumes the target in its
//! place, exactly like `SwitchToFiber` on Windows or `swapcontext` on
//! POSIX. A fiber may be resumed on a different OS thread than the one
//! that suspended it; the job system relies on this to hand a
//! blocked job's fiber off to whichever worker thread picks it back
//! up, identified only by the thread's current handle at hand-off
//! time, not by the thread that originally ran it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use crate::error::{Error, Result};

/// Default stack size for a fiber that doesn't request one explicitly.
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static RUNNING_COUNT: AtomicI64 = AtomicI64::new(0);

enum FiberState {
    Suspended(Context),
    Running,
    Finished,
}

struct Shared {
    id: u64,
    state: Mutex<FiberState>,
    name: Mutex<String>,
    // The `(Fiber, entry)` pair the trampoline needs on its one and
    // only invocation, stashed here by `create` rather than behind a
    // thread-local: the first `switch_to` targeting this fiber may run
    // on a different OS thread than the one that created it (that's
    // the whole point of letting a free fiber sit in a shared pool
    // before anyone resumes it), so a thread-local slot set at create
    // time would not be visible to the resuming thread's trampoline.
    pending_entry: Mutex<Option<usize>>,
    // Kept alive for the lifetime of the fiber; `Context` only borrows
    // the memory, it does not own it.
    _stack: ProtectedFixedSizeStack,
}

struct PendingEntry {
    fiber: Fiber,
    entry: Box<dyn FnOnce() + Send>,
}

/// A stackful, switchable execution context.
///
/// Cloning a `Fiber` shares the same underlying context; all clones
/// refer to the same fiber.
#[derive(Clone)]
pub struct Fiber {
    shared: Arc<Shared>,
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
impl Eq for Fiber {}

thread_local! {
    // The fiber currently executing on this OS thread, if any. `None`
    // on a thread that has never run a fiber.
    static CURRENT: RefCell<Option<Fiber>> = const { RefCell::new(None) };
}

extern "C" fn trampoline(t: Transfer) -> ! {
    // SAFETY: `t.data` is exactly the pointer `switch_to` passed to
    // `resume` for this, the one and only time this context is
    // entered via its trampoline; `create` boxed and leaked it for
    // this purpose.
    let boot = unsafe { Box::from_raw(t.data as *mut PendingEntry) };
    let PendingEntry { fiber, entry } = *boot;
    CURRENT.with(|cell| *cell.borrow_mut() = Some(fiber.clone()));

    // `t.context` is the context of whoever resumed us; stash it so a
    // future `switch_to` targeting our caller can find it, mirroring
    // what `switch_to` does for ordinary suspensions.
    let caller = t.context;
    entry();

    *fiber.shared.state.lock().unwrap() = FiberState::Finished;
    RUNNING_COUNT.fetch_sub(1, Ordering::Relaxed);
    // The fiber's body never returns by falling off the end once it's
    // finished; it yields control back to whoever resumed it for the
    // last time and never runs again. `caller.resume` does not
    // normally return in that case because nothing should resume a
    // finished fiber, but if it ever does (a caller bug), we land
    // back here and loop forever rather than returning through
    // undefined assembly.
    let mut current = caller;
    loop {
        let transfer = unsafe { current.resume(0) };
        current = transfer.context;
    }
}

/// Creates a new fiber with `stack_size` bytes of stack (rounded up to
/// the platform page size) that will run `entry` when first resumed.
pub fn create<F>(stack_size: usize, entry: F) -> Result<Fiber>
where
    F: FnOnce() + Send + 'static,
{
    let stack_size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
    let stack = ProtectedFixedSizeStack::new(stack_size).map_err(|_| Error::FiberPoolExhausted)?;
    let ctx = Context::new(&stack, trampoline);
    let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
    let fiber = Fiber {
        shared: Arc::new(Shared {
            id,
            state: Mutex::new(FiberState::Suspended(ctx)),
            name: Mutex::new(String::new()),
            pending_entry: Mutex::new(None),
            _stack: stack,
        }),
    };
    let boot = Box::new(PendingEntry { fiber: fiber.clone(), entry: Box::new(entry) });
    *fiber.shared.pending_entry.lock().unwrap() = Some(Box::into_raw(boot) as usize);
    Ok(fiber)
}

/// Wraps the calling OS thread itself as a fiber, so it can
/// participate in [`switch_to`] hand-offs (mirroring
/// `ConvertThreadToFiber`). Every worker thread in the job system
/// calls this once before entering its scheduling loop.
pub fn convert_thread_to_fiber() -> Fiber {
    let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
    // A thread's native fiber has no fiber-owned stack of its own (it
    // runs on the thread's OS stack); we park a minimal stack here
    // purely so `Shared` has somewhere to put a context if this fiber
    // is ever suspended and resumed as a target, which never happens
    // for the thread-native fiber in practice (only `switch_to`'s
    // "from" slot is ever written into it).
    let stack = ProtectedFixedSizeStack::new(DEFAULT_STACK_SIZE).expect("stack allocation");
    let placeholder = Context::new(&stack, trampoline);
    let fiber = Fiber {
        shared: Arc::new(Shared {
            id,
            state: Mutex::new(FiberState::Running),
            name: Mutex::new(String::new()),
            pending_entry: Mutex::new(None),
            _stack: stack,
        }),
    };
    let _ = placeholder;
    RUNNING_COUNT.fetch_add(1, Ordering::Relaxed);
    CURRENT.with(|cell| *cell.borrow_mut() = Some(fiber.clone()));
    fiber
}

/// Returns the fiber currently executing on the calling OS thread, if
/// any fiber has been created or converted on it yet.
pub fn this_fiber() -> Option<Fiber> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Suspends whatever fiber is running on the calling thread and
/// resumes `target` in its place.
///
/// # Panics
///
/// Panics (a programming error, not a recoverable usage error) if
/// called from a thread with no current fiber, or if `target` is not
/// currently suspended (it is already running somewhere, or it has
/// already finished).
pub fn switch_to(target: &Fiber) {
    let from = CURRENT
        .with(|cell| cell.borrow().clone())
        .expect("switch_to called with no fiber running on this thread");

    let target_ctx = {
        let mut state = target.shared.state.lock().unwrap();
        match std::mem::replace(&mut *state, FiberState::Running) {
            FiberState::Suspended(ctx) => ctx,
            FiberState::Running => panic!("switch_to target is already running"),
            FiberState::Finished => panic!("switch_to target has already finished"),
        }
    };

    if !matches!(*from.shared.state.lock().unwrap(), FiberState::Running) {
        panic!("the fiber currently on this thread is not marked running");
    }

    RUNNING_COUNT.fetch_add(1, Ordering::Relaxed);
    CURRENT.with(|cell| *cell.borrow_mut() = Some(target.clone()));

    // If `target` was just created and never resumed, hand its
    // trampoline the boot pointer `create` stashed; any later resume
    // of an already-started fiber ignores the argument (the
    // trampoline only runs once, on the first resume).
    let boot = target.shared.pending_entry.lock().unwrap().take().unwrap_or(0);
    let transfer = unsafe { target_ctx.resume(boot) };

    RUNNING_COUNT.fetch_sub(1, Ordering::Relaxed);

    // We've been switched back into. `transfer.context` belongs to
    // whoever just switched into `from` (normally `target`, yielding
    // back); store it so `from` can be resumed again later.
    *from.shared.state.lock().unwrap() = FiberState::Suspended(transfer.context);
    CURRENT.with(|cell| *cell.borrow_mut() = Some(from));
}

impl Fiber {
    /// A process-wide identifier, stable for the fiber's lifetime.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// True if this fiber is currently executing on some OS thread.
    pub fn is_running(&self) -> bool {
        matches!(*self.shared.state.lock().unwrap(), FiberState::Running)
    }

    /// True once the fiber's entry function has returned.
    pub fn is_finished(&self) -> bool {
        matches!(*self.shared.state.lock().unwrap(), FiberState::Finished)
    }

    /// The fiber's display name, empty until [`Fiber::set_name`] is
    /// called (purely diagnostic; never consulted by `switch_to`).
    pub fn name(&self) -> String {
        self.shared.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.shared.name.lock().unwrap() = name.into();
    }
}

/// Total number of fibers (across all threads) currently executing.
pub fn running_count() -> i64 {
    RUNNING_COUNT.load(Ordering::Relaxed)
}

/// Whether this target has an assembly trampoline in the `context`
/// crate backing [`create`]/[`switch_to`].
///
/// [`crate::job::JobSystem::new`] checks this before spawning any
/// worker and fails construction rather than falling back to a
/// blocking thread-per-wait design, per the platform-fibers design
/// note: that fallback would change the memory and ordering semantics
/// `wait` promises.
pub const fn supports_fibers() -> bool {
    cfg!(any(
        target_arch = "x86_64",
        target_arch = "x86",
        target_arch = "aarch64",
        target_arch = "arm",
    ))
}
