//! Fiber-based job scheduler: submit closures to run across worker
//! threads, group them under a [`JobCounter`], and block a running
//! job on one via [`JobSystem::wait`] without blocking the OS thread
//! underneath it.

mod counter;
mod system;

pub use counter::JobCounter;
pub use system::{
    JobBuilder, JobDataHandle, JobSystem, JobSystemConfig, ThreadCount, INVALID_JOB_DATA_HANDLE,
    MAX_JOB_DATA_HANDLES, MAX_THREAD_COUNT,
};
