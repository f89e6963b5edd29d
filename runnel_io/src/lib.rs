//! # Runnel IO
//!
//! Runtime plumbing for the runnel stream engine: the lock primitives every
//! stream uses for its state, and the [`Scheduler`] task queue that replaces an
//! implicit "next tick". Streams never block; when they need to defer work they
//! append a task to the scheduler, and the owner of the scheduler drains it once
//! the current call stack has unwound.
#![forbid(unsafe_code)]

pub mod scheduler;
pub mod standard;

pub use scheduler::{Scheduler, Task};
pub use standard::locks::*;

#[cfg(feature = "deadlock-detection")]
pub use parking_lot::deadlock;

pub use tokio;
