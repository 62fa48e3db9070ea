//! Fiber-backed job scheduler.
//!
//! Worker threads run an endless loop (`worker_main`) that repeatedly:
//! resumes a fiber that became ready to continue after a wait, or
//! runs the next pending job inline on whichever fiber is already
//! executing the loop, or blocks for more work. A job that calls
//! [`JobSystem::wait`] on a counter that hasn't reached zero parks its
//! own fiber and switches the OS thread onto a freshly created one so
//! the thread keeps making progress on other jobs while it waits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::context::Context as JobContext;
use crate::error::{Error, Result};
use crate::fiber::{self, Fiber};
use crate::job::counter::JobCounter;
use crate::thread::{self, Thread};

/// Hard ceiling on worker threads, matching the scheduler's fixed-size
/// internal bookkeeping (thread ids are small indices, not a general
/// pool).
pub const MAX_THREAD_COUNT: usize = 128;

/// Per-job-system slot count for [`JobSystem::alloc_data_handle`].
pub const MAX_JOB_DATA_HANDLES: usize = 128;

/// Returned by [`JobSystem::alloc_data_handle`] before any handle has
/// been allocated; never returned by a successful allocation.
pub const INVALID_JOB_DATA_HANDLE: JobDataHandle = 0;

pub type JobDataHandle = usize;

/// How many worker OS threads [`JobSystem::new`] should start.
#[derive(Clone, Copy, Debug)]
pub enum ThreadCount {
    /// Start exactly this many workers.
    Exact(usize),
    /// One worker per hardware thread, per [`thread::max_concurrency`].
    AllHardware,
    /// Hardware threads plus `offset` (which may be negative to leave
    /// some hardware threads free for other work), clamped to at
    /// least one worker.
    RelativeToHardware(i32),
}

impl Default for ThreadCount {
    fn default() -> Self {
        ThreadCount::AllHardware
    }
}

impl ThreadCount {
    fn resolve(self) -> usize {
        match self {
            ThreadCount::Exact(n) => n,
            ThreadCount::AllHardware => thread::max_concurrency(),
            ThreadCount::RelativeToHardware(offset) => {
                let hardware = thread::max_concurrency() as i64;
                (hardware + offset as i64).max(1) as usize
            }
        }
    }
}

/// Configuration for [`JobSystem::new`].
#[derive(Clone)]
pub struct JobSystemConfig {
    /// Worker OS threads to start.
    pub thread_count: ThreadCount,
    /// Stack size for each worker thread.
    pub thread_stack_size: usize,
    /// Stack size for each fiber the scheduler creates.
    pub fiber_stack_size: usize,
    /// Pin each worker thread to a distinct hardware thread, cycling
    /// through [`thread::hardware_affinities`] if there are more
    /// threads than hardware contexts.
    pub pin_threads: bool,
    /// While a named job runs, rename the worker thread and its
    /// fiber to the job's name (restored to a generic name once it
    /// returns). Off by default; the original project enables this
    /// only in debug builds, but leaving the choice to the caller
    /// avoids baking a build-profile dependency into the scheduler.
    pub set_fiber_names: bool,
    /// Bound on the number of jobs that may be queued (not yet
    /// attached to a fiber) at once. Zero means unbounded, growing the
    /// queue as needed. A submit against a full queue returns
    /// [`Error::JobPoolExhausted`] rather than blocking.
    pub job_pool_capacity: usize,
    /// Bound on fiber-state records retained in the unused-fiber pool
    /// for reuse by [`JobSystem::wait`]. Zero means unbounded. Beyond
    /// this, finished fibers are dropped instead of recycled; it only
    /// affects steady-state allocation, not correctness.
    pub fiber_pool_capacity: usize,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        JobSystemConfig {
            thread_count: ThreadCount::default(),
            thread_stack_size: 0,
            fiber_stack_size: fiber::DEFAULT_STACK_SIZE,
            pin_threads: false,
            set_fiber_names: false,
            job_pool_capacity: 0,
            fiber_pool_capacity: 0,
        }
    }
}

struct Job {
    name: Option<String>,
    callback: Box<dyn FnOnce() + Send>,
    counter: Option<Arc<JobCounter>>,
    context: Option<Arc<JobContext>>,
}

struct FiberState {
    fiber: Fiber,
    job: Mutex<Option<Job>>,
}

impl PartialEq for FiberState {
    fn eq(&self, other: &Self) -> bool {
        self.fiber == other.fiber
    }
}
impl Eq for FiberState {}

struct Inner {
    running: bool,
    pending_jobs: VecDeque<Job>,
    pending_fibers: VecDeque<Arc<FiberState>>,
    idle_fibers: Vec<Arc<FiberState>>,
    running_fibers: Vec<Arc<FiberState>>,
    waiting_fibers: HashMap<usize, Vec<Arc<FiberState>>>,
    unused_fibers: Vec<Fiber>,
}

/// A fiber-backed job scheduler.
///
/// Construct with [`JobSystem::new`]; the returned handle must be
/// kept alive (and wrapped in [`Arc`]) for as long as jobs may be
/// submitted. Dropping the last `Arc` stops all workers once any
/// in-flight jobs finish.
type DataCtor = Arc<dyn Fn() -> Box<dyn std::any::Any + Send + Sync> + Send + Sync>;

pub struct JobSystem {
    inner: Mutex<Inner>,
    condvar: Condvar,
    config: JobSystemConfig,
    threads: Mutex<Vec<Thread>>,
    data_ctors: Mutex<Vec<Option<DataCtor>>>,
    next_data_handle: AtomicUsize,
}

thread_local! {
    static CURRENT_SYSTEM: std::cell::RefCell<Option<Arc<JobSystem>>> = const { std::cell::RefCell::new(None) };
    static CURRENT_CONTEXT: std::cell::RefCell<Option<Arc<JobContext>>> = const { std::cell::RefCell::new(None) };
    // Per-job-invocation slots for `JobSystem::with_data`, sized and
    // reset around every callback run in `job_main`.
    static CURRENT_JOB_DATA: std::cell::RefCell<Option<Vec<Option<Box<dyn std::any::Any + Send + Sync>>>>> =
        const { std::cell::RefCell::new(None) };
}

impl JobSystem {
    /// Starts the scheduler: spawns worker threads, each of which
    /// converts itself into the thread's native fiber and enters the
    /// scheduling loop.
    pub fn new(config: JobSystemConfig) -> Result<Arc<JobSystem>> {
        if !fiber::supports_fibers() {
            return Err(Error::FibersUnsupported);
        }
        let thread_count = config.thread_count.resolve();
        if thread_count == 0 || thread_count > MAX_THREAD_COUNT {
            return Err(Error::InvalidConfig("thread_count out of range"));
        }

        let system = Arc::new(JobSystem {
            inner: Mutex::new(Inner {
                running: true,
                pending_jobs: VecDeque::new(),
                pending_fibers: VecDeque::new(),
                idle_fibers: Vec::new(),
                running_fibers: Vec::new(),
                waiting_fibers: HashMap::new(),
                unused_fibers: Vec::new(),
            }),
            condvar: Condvar::new(),
            config,
            threads: Mutex::new(Vec::new()),
            data_ctors: Mutex::new(Vec::new()),
            next_data_handle: AtomicUsize::new(1),
        });

        let affinities = thread::hardware_affinities();
        let mut handles = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let system_clone = system.clone();
            let affinity = if system.config.pin_threads && !affinities.is_empty() {
                affinities[i % affinities.len()]
            } else {
                0
            };
            let handle = thread::create(affinity, system.config.thread_stack_size, move || {
                system_clone.worker_main();
            })?;
            handles.push(handle);
        }
        *system.threads.lock().unwrap() = handles;

        Ok(system)
    }

    fn worker_main(self: Arc<Self>) {
        CURRENT_SYSTEM.with(|cell| *cell.borrow_mut() = Some(self.clone()));
        fiber::convert_thread_to_fiber();
        self.job_main();
    }

    /// The scheduling loop run by every worker thread and every fiber
    /// created to resume after a wait.
    fn job_main(&self) {
        let mut guard = self.inner.lock().unwrap();
        let this_fiber = fiber::this_fiber().expect("job_main entered off a fiber");
        loop {
            if !guard.running {
                break;
            }

            if let Some(ready) = guard.pending_fibers.pop_front() {
                guard.unused_fibers.push(this_fiber.clone());
                let cap = self.config.fiber_pool_capacity;
                if cap > 0 && guard.unused_fibers.len() > cap {
                    let overflow = guard.unused_fibers.len() - cap;
                    guard.unused_fibers.drain(0..overflow);
                }
                guard.running_fibers.push(ready.clone());
                drop(guard);
                fiber::switch_to(&ready.fiber);
                guard = self.inner.lock().unwrap();
                continue;
            }

            let state = if let Some(job) = guard.pending_jobs.pop_front() {
                Arc::new(FiberState { fiber: this_fiber.clone(), job: Mutex::new(Some(job)) })
            } else {
                let state = Arc::new(FiberState { fiber: this_fiber.clone(), job: Mutex::new(None) });
                guard.idle_fibers.push(state.clone());
                guard = self
                    .condvar
                    .wait_while(guard, |inner| {
                        !inner
                            .idle_fibers
                            .iter()
                            .find(|candidate| Arc::ptr_eq(candidate, &state))
                            .map(|candidate| candidate.job.lock().unwrap().is_some())
                            .unwrap_or(true)
                            && inner.running
                    })
                    .unwrap();
                if !guard.running {
                    guard.idle_fibers.retain(|candidate| !Arc::ptr_eq(candidate, &state));
                    break;
                }
                guard.idle_fibers.retain(|candidate| !Arc::ptr_eq(candidate, &state));
                state
            };

            guard.running_fibers.push(state.clone());
            drop(guard);

            let job = state.job.lock().unwrap().take();
            if let Some(job) = job {
                CURRENT_CONTEXT.with(|cell| *cell.borrow_mut() = job.context.clone());
                let slot_count = self.data_ctors.lock().unwrap().len();
                CURRENT_JOB_DATA
                    .with(|cell| *cell.borrow_mut() = Some((0..slot_count).map(|_| None).collect()));

                let renamed = self.config.set_fiber_names && job.name.is_some();
                if renamed {
                    let name = job.name.as_deref().unwrap_or_default();
                    state.fiber.set_name(name);
                    if let Some(thread) = thread::this_thread() {
                        thread.set_name(name);
                    }
                }

                (job.callback)();

                if renamed {
                    state.fiber.set_name("");
                    if let Some(thread) = thread::this_thread() {
                        thread.set_name("");
                    }
                }
                CURRENT_CONTEXT.with(|cell| *cell.borrow_mut() = None);
                CURRENT_JOB_DATA.with(|cell| *cell.borrow_mut() = None);

                if let Some(counter) = &job.counter {
                    if counter.decrement() == 0 {
                        let mut guard = self.inner.lock().unwrap();
                        let key = Arc::as_ptr(counter) as usize;
                        if let Some(waiters) = guard.waiting_fibers.remove(&key) {
                            for waiter in waiters {
                                guard.pending_fibers.push_back(waiter);
                            }
                            self.condvar.notify_all();
                        }
                    }
                }
            }

            guard = self.inner.lock().unwrap();
            guard.running_fibers.retain(|candidate| !Arc::ptr_eq(candidate, &state));
        }
        drop(guard);
    }

    fn submit(
        &self,
        name: Option<String>,
        counter: Option<Arc<JobCounter>>,
        context: Option<Arc<JobContext>>,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if guard.idle_fibers.is_empty() {
            let capacity = self.config.job_pool_capacity;
            if capacity > 0 && guard.pending_jobs.len() >= capacity {
                return Err(Error::JobPoolExhausted);
            }
        }
        if let Some(counter) = &counter {
            counter.increment()?;
        }
        let job = Job { name, callback, counter, context };
        if let Some(idle) = guard.idle_fibers.pop() {
            *idle.job.lock().unwrap() = Some(job);
        } else {
            guard.pending_jobs.push_back(job);
        }
        self.condvar.notify_all();
        Ok(())
    }

    /// Submits `callback` to run on any worker thread.
    pub fn run(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.submit(None, None, None, Box::new(callback))
    }

    /// Submits `callback` under `name`, used only for diagnostics.
    pub fn run_named(&self, name: impl Into<String>, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.submit(Some(name.into()), None, None, Box::new(callback))
    }

    /// Submits `callback`, incrementing `counter` before queuing it
    /// and decrementing it once the callback returns.
    pub fn run_with_counter(
        &self,
        counter: Arc<JobCounter>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.submit(None, Some(counter), None, Box::new(callback))
    }

    /// Submits `callback` with a context reachable from within it via
    /// [`JobSystem::context`].
    pub fn run_with_context(
        &self,
        context: Arc<JobContext>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.submit(None, None, Some(context), Box::new(callback))
    }

    /// Starts building a job with any combination of name, counter and
    /// context set before submitting; `run`/`run_named`/
    /// `run_with_counter`/`run_with_context` are shorthands for the
    /// single-option cases.
    pub fn job(&self) -> JobBuilder<'_> {
        JobBuilder { system: self, name: None, counter: None, context: None }
    }

    /// Blocks the calling fiber until `counter` reaches zero.
    ///
    /// Must be called from within a job running on this job system;
    /// calling it from outside a job is a usage error that is logged
    /// and ignored (the call returns immediately).
    pub fn wait(&self, counter: &JobCounter) {
        if counter.get() == 0 {
            return;
        }
        let Some(this_fiber) = fiber::this_fiber() else {
            crate::error::UsageError("wait called from a thread with no running fiber").log();
            return;
        };

        let key = counter as *const JobCounter as usize;
        let recycled = {
            let mut guard = self.inner.lock().unwrap();
            let index = guard
                .running_fibers
                .iter()
                .position(|candidate| candidate.fiber == this_fiber);
            let Some(index) = index else {
                crate::error::UsageError("wait called outside of a running job").log();
                return;
            };
            let state = guard.running_fibers.remove(index);
            guard.waiting_fibers.entry(key).or_default().push(state);
            // A fiber in `unused_fibers` is a loop fiber some other
            // worker displaced while resuming a woken waiter (see
            // `job_main`); it's suspended mid-loop, right after its own
            // `switch_to`, so resuming it here drops straight back into
            // `job_main`'s `continue` with no need to spin up a fresh
            // stack. Only once the pool is empty do we pay for a new one.
            guard.unused_fibers.pop()
        };

        let resume_fiber = match recycled {
            Some(fiber) => fiber,
            None => fiber::create(self.config.fiber_stack_size, {
                let this = self.self_arc();
                move || this.job_main()
            })
            .expect("failed to create resume fiber"),
        };
        fiber::switch_to(&resume_fiber);
    }

    fn self_arc(&self) -> Arc<JobSystem> {
        CURRENT_SYSTEM
            .with(|cell| cell.borrow().clone())
            .expect("job_main fiber without a registered job system")
    }

    /// Returns the context associated with the job currently running
    /// on the calling fiber, if it was submitted with one.
    pub fn context(&self) -> Option<Arc<JobContext>> {
        CURRENT_CONTEXT.with(|cell| cell.borrow().clone())
    }

    /// Reserves a process-wide slot for per-job data of type `T`,
    /// built lazily from `ctor` the first time [`JobSystem::with_data`]
    /// is called for this handle within a given job. Returns
    /// [`INVALID_JOB_DATA_HANDLE`] once [`MAX_JOB_DATA_HANDLES`] slots
    /// are in use rather than failing outright — callers are expected
    /// to check against the sentinel, matching a one-time startup
    /// registration that has no recovery path anyway.
    pub fn alloc_data_handle<T: std::any::Any + Send + Sync>(
        &self,
        ctor: impl Fn() -> T + Send + Sync + 'static,
    ) -> JobDataHandle {
        let handle = self.next_data_handle.fetch_add(1, Ordering::Relaxed);
        if handle >= MAX_JOB_DATA_HANDLES {
            return INVALID_JOB_DATA_HANDLE;
        }
        let mut ctors = self.data_ctors.lock().unwrap();
        if ctors.len() <= handle {
            ctors.resize_with(handle + 1, || None);
        }
        ctors[handle] = Some(Arc::new(move || Box::new(ctor()) as Box<dyn std::any::Any + Send + Sync>));
        handle
    }

    /// Runs `f` against the per-job value at `handle`, constructing it
    /// on first access within the currently running job via the
    /// constructor passed to [`JobSystem::alloc_data_handle`].
    ///
    /// Returns `None` if called outside a job, with an invalid/unset
    /// handle, or if `T` doesn't match the type the handle was
    /// allocated with.
    pub fn with_data<T: std::any::Any + Send + Sync, R>(
        &self,
        handle: JobDataHandle,
        f: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        if handle == INVALID_JOB_DATA_HANDLE {
            return None;
        }
        CURRENT_JOB_DATA.with(|cell| {
            let mut guard = cell.borrow_mut();
            let slots = guard.as_mut()?;
            if handle >= slots.len() {
                return None;
            }
            if slots[handle].is_none() {
                let ctor = self.data_ctors.lock().unwrap().get(handle)?.clone()?;
                slots[handle] = Some(ctor());
            }
            slots[handle].as_deref()?.downcast_ref::<T>().map(f)
        })
    }

    /// Current job system for the calling thread, if it is running
    /// inside a worker thread belonging to one.
    pub fn current() -> Option<Arc<JobSystem>> {
        CURRENT_SYSTEM.with(|cell| cell.borrow().clone())
    }
}

/// Builder for a job with any combination of name, counter and context,
/// returned by [`JobSystem::job`].
pub struct JobBuilder<'a> {
    system: &'a JobSystem,
    name: Option<String>,
    counter: Option<Arc<JobCounter>>,
    context: Option<Arc<JobContext>>,
}

impl<'a> JobBuilder<'a> {
    /// Sets the job's debug name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Increments `counter` before the job is queued and decrements it
    /// once the callback returns.
    pub fn counter(mut self, counter: Arc<JobCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Makes `context` reachable from within the job via
    /// [`JobSystem::context`].
    pub fn context(mut self, context: Arc<JobContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Submits the job, consuming the builder.
    pub fn run(self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.system.submit(self.name, self.counter, self.context, Box::new(callback))
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.running = false;
        }
        self.condvar.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            handle.join();
        }
    }
}
