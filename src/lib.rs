//! Fiber-based job scheduler and reference-counted resource registry
//! for a modular game engine core.
//!
//! See [`job`] for submitting and waiting on work, [`resource`] for
//! typed, ref-counted resource ownership, and [`thread`]/[`fiber`]
//! for the primitives both are built on.

pub mod clock;
pub mod context;
pub mod error;
pub mod fiber;
pub mod job;
pub mod resource;
pub mod thread;
