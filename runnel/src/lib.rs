//! # Runnel
//!
//! A cooperative, backpressure-aware streaming library: readable, writable,
//! duplex and transform streams that move chunks of bytes between producers and
//! consumers, plus a piping protocol that connects them with flow control.
//!
//! ## Features
//!
//! - **Readable streams**: pull-based sources with a bounded read-ahead buffer,
//!   consumed by explicit reads or as a flowing series of `data` events
//! - **Writable streams**: at most one write in flight, ordered completions,
//!   `drain` after backpressure, corking and batched writes
//! - **Duplex and Transform**: two sides sharing one event channel; transforms
//!   run a single step per written chunk
//! - **Piping**: pause on backpressure, resume on `drain`, end propagation and
//!   listener cleanup on unpipe
//! - **Async bridge**: chunk streams and completion futures for `futures` code
//! - **Zero Unsafe Code**
//!
//! ## Core Components
//!
//! - `stream`: the hook traits ([`Source`], [`Sink`], [`Transformer`]) and the
//!   operations shared by every stream kind
//! - `readable`, `writable`, `duplex`, `transform`: the stream kinds
//! - `pipe`: source to destination wiring
//! - `pass_through`: ready-made transforms
//! - `events`: the per-stream event channel
//! - `bridge`: async adapters
//!
//! ## Scheduling
//!
//! Nothing here spawns threads or tasks. Work that must not run inside the
//! current call (end notifications, deferred completions, read-ahead) is
//! appended to a [`Scheduler`], which the application drains with
//! [`Scheduler::run_until_idle`] or drives alongside a future with
//! [`Scheduler::run_until`].
//!
//! ## Example
//!
//! ```rust
//! use runnel::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let upper = through(
//!     &scheduler,
//!     |chunk: WriteChunk, _: &Readable, done: TransformCallback| {
//!         done(Ok(Some(chunk.chunk.to_ascii_uppercase().into())))
//!     },
//!     None::<FlushFn>,
//! );
//! let sink = Writable::new(
//!     &scheduler,
//!     |chunk: WriteChunk, done: WriteCallback| {
//!         println!("{:?}", chunk.chunk);
//!         done(Ok(()))
//!     },
//!     WritableOptions::default(),
//! );
//!
//! upper.pipe(&sink);
//! upper.write("hello");
//! upper.end();
//! scheduler.run_until_idle();
//! ```
#![forbid(unsafe_code)]

mod engine;

pub mod bridge;
pub mod duplex;
pub mod error;
pub mod events;
pub mod options;
pub mod pass_through;
pub mod pipe;
pub mod readable;
pub mod stream;
pub mod test_utils;
pub mod transform;
pub mod writable;

pub use runnel_io;
pub use runnel_io::Scheduler;
pub use stream::{Sink, Source, Transformer};

pub mod prelude {
    pub use crate::bridge::{ReadableStreamExt, WritableStreamExt};
    pub use crate::duplex::Duplex;
    pub use crate::error::StreamError;
    pub use crate::events::{Event, EventKind, ListenerId};
    pub use crate::options::{DuplexOptions, PipeOptions, ReadableOptions, WritableOptions};
    pub use crate::pass_through::{pass_through, through, FlushFn, PassThrough};
    pub use crate::readable::Readable;
    pub use crate::stream::{
        Chunk, EndCallback, Encoding, EventSource, FlushCallback, ReadableStream, Sink, Source,
        StreamId, TransformCallback, Transformer, WritableStream, WriteCallback, WriteChunk,
    };
    pub use crate::transform::Transform;
    pub use crate::writable::Writable;
    pub use runnel_io::Scheduler;
}
