//! Shared vocabulary of the stream engine: chunks, identifiers, the hook traits
//! implementors supply ([`Source`], [`Sink`], [`Transformer`]) and the capability
//! traits every stream handle exposes ([`EventSource`], [`ReadableStream`],
//! [`WritableStream`]).
//!
//! The capability traits are sealed. Their methods are provided once here and
//! shared by [`Readable`], [`Writable`](crate::writable::Writable),
//! [`Duplex`](crate::duplex::Duplex) and [`Transform`](crate::transform::Transform).

use crate::error::StreamError;
use crate::events::{Event, EventKind, ListenerId};
use crate::options::PipeOptions;
use crate::readable::Readable;
use bytes::Bytes;
use runnel_io::Scheduler;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque unit of data. Length and content are never interpreted.
pub type Chunk = Bytes;

/// An encoding label carried alongside a write. It is never interpreted.
pub type Encoding = String;

/// Completion of a single write (or of every write in a batch)
pub type WriteCallback = Box<dyn FnOnce(Result<(), StreamError>) + Send + 'static>;
/// Completion of a transform step, optionally carrying one output chunk
pub type TransformCallback = Box<dyn FnOnce(Result<Option<Chunk>, StreamError>) + Send + 'static>;
/// Completion of a transform's flush
pub type FlushCallback = Box<dyn FnOnce(Result<(), StreamError>) + Send + 'static>;
/// Runs once the writable side has finished
pub type EndCallback = Box<dyn FnOnce() + Send + 'static>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a stream, carried by `pipe` and `unpipe` events
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamId(u64);

impl StreamId {
    pub fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// A chunk as handed to a sink or transformer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteChunk {
    pub chunk: Chunk,
    pub encoding: Option<Encoding>,
}

impl WriteChunk {
    pub fn new<T: Into<Chunk>>(chunk: T) -> Self {
        Self {
            chunk: chunk.into(),
            encoding: None,
        }
    }
}

/// Produces data for a readable stream on demand. `read` is a request, not a
/// call that must answer immediately: the implementation pushes chunks into
/// `stream` now or later, and pushes `None` once it is exhausted.
pub trait Source: Send + Sync + 'static {
    fn read(&self, stream: &Readable, size: usize);
}

impl<F> Source for F
where
    F: Fn(&Readable, usize) + Send + Sync + 'static,
{
    fn read(&self, stream: &Readable, size: usize) {
        (self)(stream, size)
    }
}

/// Consumes data written to a writable stream. At most one call is in flight
/// at a time; the next one is made only after `done` has been invoked.
pub trait Sink: Send + Sync + 'static {
    fn write(&self, chunk: WriteChunk, done: WriteCallback);

    /// Receives every queued write at once. Only used when
    /// [`Sink::supports_writev`] returns true.
    fn writev(&self, chunks: Vec<WriteChunk>, done: WriteCallback) {
        let _ = chunks;
        done(Err(StreamError::NotImplemented("writev")))
    }

    fn supports_writev(&self) -> bool {
        false
    }
}

impl<F> Sink for F
where
    F: Fn(WriteChunk, WriteCallback) + Send + Sync + 'static,
{
    fn write(&self, chunk: WriteChunk, done: WriteCallback) {
        (self)(chunk, done)
    }
}

/// The processing step of a [`Transform`](crate::transform::Transform)
pub trait Transformer: Send + Sync + 'static {
    /// Called exactly once per written chunk. Output may be pushed onto
    /// `output` directly, or handed back through `done`.
    fn transform(&self, chunk: WriteChunk, output: &Readable, done: TransformCallback);

    /// Called once the writable side has drained, before the readable side ends
    fn flush(&self, output: &Readable, done: FlushCallback) {
        let _ = output;
        done(Ok(()))
    }
}

/// Point-in-time view of a readable side
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReadableSnapshot {
    pub length: usize,
    pub high_water_mark: usize,
    pub flowing: Option<bool>,
    pub ended: bool,
    pub emitted_end: bool,
    pub reading: bool,
    pub need_readable: bool,
    pub pipes_count: usize,
    pub await_drain: usize,
}

/// Point-in-time view of a writable side
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WritableSnapshot {
    pub length: usize,
    pub buffered: usize,
    pub high_water_mark: usize,
    pub writing: bool,
    pub corked: usize,
    pub ending: bool,
    pub prefinished: bool,
    pub finished: bool,
    pub pending_callbacks: usize,
    pub need_drain: bool,
    pub errored: bool,
    pub persistent: bool,
}

pub(crate) mod private {
    use crate::engine::StreamCore;
    use std::sync::Arc;

    pub trait Sealed {
        fn core(&self) -> &Arc<StreamCore>;
    }
}

/// Event subscription, shared by every stream kind
pub trait EventSource: private::Sealed {
    fn id(&self) -> StreamId {
        self.core().id
    }

    fn scheduler(&self) -> &Scheduler {
        &self.core().scheduler
    }

    /// Subscribing to [`EventKind::Data`] switches a readable stream into flowing
    /// mode unless it was explicitly paused. Subscribing to
    /// [`EventKind::Readable`] arms `readable` notifications.
    fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.core().on(kind, listener)
    }

    fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        self.core().once(kind, listener)
    }

    fn prepend_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.core().events.prepend(kind, listener)
    }

    fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.core().events.remove_listener(kind, id)
    }

    fn remove_all_listeners(&self, kind: Option<EventKind>) {
        self.core().events.remove_all_listeners(kind)
    }

    fn listener_count(&self, kind: EventKind) -> usize {
        self.core().events.listener_count(kind)
    }

    fn set_max_listeners(&self, max: usize) {
        self.core().events.set_max_listeners(max)
    }

    /// # Panics
    /// If `event` is an error and nothing listens for errors
    fn emit(&self, event: Event) -> bool {
        self.core().emit(event)
    }
}

/// Operations of a stream with a readable side
pub trait ReadableStream: EventSource {
    /// Offers a chunk, or `None` to signal the end of data. Returns whether
    /// the producer should keep producing.
    fn push(&self, chunk: Option<Chunk>) -> bool {
        self.core().readable_add_chunk(chunk, false)
    }

    /// Puts a chunk back at the front of the buffer
    fn unshift(&self, chunk: Chunk) -> bool {
        self.core().readable_add_chunk(Some(chunk), true)
    }

    /// `Some(0)` primes the producer without consuming anything. Any other
    /// request consumes at most one chunk.
    fn read(&self, size: Option<usize>) -> Option<Chunk> {
        self.core().readable_read(size)
    }

    fn pause(&self) {
        self.core().readable_pause()
    }

    fn resume(&self) {
        self.core().readable_resume()
    }

    fn is_paused(&self) -> bool {
        self.core().readable_is_paused()
    }

    /// Forwards every chunk into `dest`, pausing while `dest` applies
    /// backpressure, and ends `dest` when this stream ends.
    fn pipe<D>(&self, dest: &D) -> D
    where
        D: WritableStream + Clone,
        Self: Sized,
    {
        self.pipe_with(dest, PipeOptions::default())
    }

    fn pipe_with<D>(&self, dest: &D, options: PipeOptions) -> D
    where
        D: WritableStream + Clone,
        Self: Sized,
    {
        self.core().pipe(dest.core(), options);
        dest.clone()
    }

    /// Detaches `dest`. Does nothing if it is not piped from this stream.
    fn unpipe<D>(&self, dest: &D)
    where
        D: WritableStream,
        Self: Sized,
    {
        self.core().unpipe(Some(dest.id()))
    }

    fn unpipe_all(&self) {
        self.core().unpipe(None)
    }

    fn readable_state(&self) -> ReadableSnapshot {
        self.core().readable_snapshot()
    }

    /// False once `end` has been emitted, or if the readable side was disabled
    fn is_readable(&self) -> bool {
        self.core().is_readable()
    }
}

/// Operations of a stream with a writable side
pub trait WritableStream: EventSource {
    /// Returns false once the high-water mark is reached. Keep writing if you
    /// must; the chunk is queued either way. Wait for `drain` to be polite.
    fn write<C: Into<Chunk>>(&self, chunk: C) -> bool
    where
        Self: Sized,
    {
        self.core().writable_write(chunk.into(), None, None)
    }

    fn write_with(
        &self,
        chunk: Chunk,
        encoding: Option<Encoding>,
        callback: Option<WriteCallback>,
    ) -> bool {
        self.core().writable_write(chunk, encoding, callback)
    }

    fn write_then<C, F>(&self, chunk: C, callback: F) -> bool
    where
        C: Into<Chunk>,
        F: FnOnce(Result<(), StreamError>) + Send + 'static,
        Self: Sized,
    {
        self.core()
            .writable_write(chunk.into(), None, Some(Box::new(callback)))
    }

    fn end(&self) {
        self.core().writable_end(None, None, None)
    }

    /// Optionally writes a final chunk, then ends. `callback` runs on `finish`.
    fn end_with(
        &self,
        chunk: Option<Chunk>,
        encoding: Option<Encoding>,
        callback: Option<EndCallback>,
    ) {
        self.core().writable_end(chunk, encoding, callback)
    }

    fn end_then<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.core().writable_end(None, None, Some(Box::new(callback)))
    }

    /// Holds writes in the buffer until a matching [`WritableStream::uncork`]
    fn cork(&self) {
        self.core().writable_cork()
    }

    fn uncork(&self) {
        self.core().writable_uncork()
    }

    fn writable_state(&self) -> WritableSnapshot {
        self.core().writable_snapshot()
    }

    fn is_writable(&self) -> bool {
        self.core().is_writable()
    }
}
