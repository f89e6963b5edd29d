//! # Writable Side
//!
//! The consumer-facing half of a stream. Writes are handed to a [`Sink`] one at
//! a time; while a write is in flight (or while the stream is corked) further
//! writes queue up and are dispatched in order as completions arrive.
//!
//! [`WritableStream::write`] returns false once the number of outstanding writes
//! reaches the high-water mark. A `drain` event follows when every outstanding
//! write has completed. After [`WritableStream::end`], `prefinish` and then
//! `finish` fire once all writes and their completion callbacks are done.
//!
//! Completions reported synchronously from inside [`Sink::write`] are
//! delivered on the next tick, so write callbacks and `drain` never run inside
//! the `write` call that triggered them.

use crate::engine::StreamCore;
use crate::error::StreamError;
use crate::events::{Event, EventKind};
use crate::options::WritableOptions;
use crate::stream::private::Sealed;
use crate::stream::{
    Chunk, EndCallback, Encoding, EventSource, Sink, WritableSnapshot, WritableStream,
    WriteCallback, WriteChunk,
};
use runnel_io::{Mutex, Scheduler};
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub(crate) struct WriteRequest {
    chunk: WriteChunk,
    callback: WriteCallback,
}

pub(crate) struct WritableState {
    pub(crate) buffer: VecDeque<WriteRequest>,
    pub(crate) high_water_mark: usize,
    pub(crate) length: usize,
    pub(crate) writing: bool,
    /// A synchronous completion whose callback has not run yet
    pub(crate) after_write_pending: bool,
    pub(crate) corked: usize,
    pub(crate) ending: bool,
    pub(crate) prefinished: bool,
    pub(crate) finished: bool,
    pub(crate) pending_callbacks: usize,
    pub(crate) need_drain: bool,
    pub(crate) sync: bool,
    pub(crate) buffer_processing: bool,
    pub(crate) write_len: usize,
    pub(crate) write_callback: Option<WriteCallback>,
    pub(crate) default_encoding: Option<Encoding>,
    pub(crate) errored: bool,
    pub(crate) persistent: bool,
    pub(crate) writable: bool,
}

impl WritableState {
    fn new(options: &WritableOptions) -> Self {
        Self {
            buffer: VecDeque::new(),
            high_water_mark: options.high_water_mark,
            length: 0,
            writing: false,
            after_write_pending: false,
            corked: 0,
            ending: false,
            prefinished: false,
            finished: false,
            pending_callbacks: 0,
            need_drain: false,
            sync: true,
            buffer_processing: false,
            write_len: 0,
            write_callback: None,
            default_encoding: options.default_encoding.clone(),
            errored: false,
            persistent: options.persistent,
            writable: true,
        }
    }

    fn need_finish(&self) -> bool {
        self.ending && self.length == 0 && !self.finished && !self.writing
    }

    fn must_queue(&self) -> bool {
        self.writing || self.after_write_pending || self.corked > 0 || !self.buffer.is_empty()
    }

    fn can_clear_buffer(&self) -> bool {
        !self.writing
            && !self.after_write_pending
            && self.corked == 0
            && !self.finished
            && !self.buffer_processing
            && !self.buffer.is_empty()
    }

    fn snapshot(&self) -> WritableSnapshot {
        WritableSnapshot {
            length: self.length,
            buffered: self.buffer.len(),
            high_water_mark: self.high_water_mark,
            writing: self.writing,
            corked: self.corked,
            ending: self.ending,
            prefinished: self.prefinished,
            finished: self.finished,
            pending_callbacks: self.pending_callbacks,
            need_drain: self.need_drain,
            errored: self.errored,
            persistent: self.persistent,
        }
    }
}

pub(crate) struct WritableSide {
    pub(crate) state: Mutex<WritableState>,
    sink: Option<Box<dyn Sink>>,
}

impl WritableSide {
    pub(crate) fn new(options: &WritableOptions, sink: Option<Box<dyn Sink>>) -> Self {
        Self {
            state: Mutex::new(WritableState::new(options)),
            sink,
        }
    }

    fn supports_writev(&self) -> bool {
        self.sink
            .as_ref()
            .map(|sink| sink.supports_writev())
            .unwrap_or(false)
    }
}

enum WritePayload {
    Single(WriteChunk),
    Vectored(Vec<WriteChunk>),
}

/// A stream that only consumes data
#[derive(Clone)]
pub struct Writable {
    core: Arc<StreamCore>,
}

impl Writable {
    pub fn new<S: Sink>(scheduler: &Scheduler, sink: S, options: WritableOptions) -> Self {
        let writable = WritableSide::new(&options, Some(Box::new(sink)));
        Self {
            core: StreamCore::new(scheduler, None, Some(writable), None),
        }
    }
}

impl Sealed for Writable {
    fn core(&self) -> &Arc<StreamCore> {
        &self.core
    }
}

impl EventSource for Writable {}
impl WritableStream for Writable {}

impl Debug for Writable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.core, f)
    }
}

impl StreamCore {
    pub(crate) fn writable_write(
        self: &Arc<Self>,
        chunk: Chunk,
        encoding: Option<Encoding>,
        callback: Option<WriteCallback>,
    ) -> bool {
        let Some(ws) = &self.writable else {
            log::warn!(target: "runnel", "{self:?} has no writable side, dropping write");
            return false;
        };

        let callback: WriteCallback =
            callback.unwrap_or_else(|| Box::new(|_: Result<(), StreamError>| {}));

        let encoding = {
            let mut state = ws.state.lock();
            if state.ending {
                None
            } else {
                state.pending_callbacks += 1;
                Some(encoding.or_else(|| state.default_encoding.clone()))
            }
        };

        let Some(encoding) = encoding else {
            self.write_after_end(callback);
            return false;
        };

        let weak = Arc::downgrade(self);
        let callback: WriteCallback = Box::new(move |result| {
            if let Some(core) = weak.upgrade() {
                if let Some(ws) = &core.writable {
                    ws.state.lock().pending_callbacks -= 1;
                }
            }

            callback(result)
        });

        self.write_or_buffer(ws, WriteChunk { chunk, encoding }, callback)
    }

    fn write_after_end(self: &Arc<Self>, callback: WriteCallback) {
        let _ = self.emit(Event::Error(StreamError::WriteAfterEnd));
        self.scheduler
            .schedule(move || callback(Err(StreamError::WriteAfterEnd)));
    }

    fn write_or_buffer(
        self: &Arc<Self>,
        ws: &WritableSide,
        chunk: WriteChunk,
        callback: WriteCallback,
    ) -> bool {
        let (below_high_water_mark, dispatch) = {
            let mut state = ws.state.lock();
            state.length += 1;
            let below_high_water_mark = state.length < state.high_water_mark;
            if !below_high_water_mark {
                state.need_drain = true;
            }

            if state.must_queue() {
                state.buffer.push_back(WriteRequest { chunk, callback });
                (below_high_water_mark, None)
            } else {
                (below_high_water_mark, Some((chunk, callback)))
            }
        };

        if let Some((chunk, callback)) = dispatch {
            self.do_write(ws, WritePayload::Single(chunk), 1, callback);
        }

        below_high_water_mark
    }

    fn do_write(
        self: &Arc<Self>,
        ws: &WritableSide,
        payload: WritePayload,
        len: usize,
        callback: WriteCallback,
    ) {
        {
            let mut state = ws.state.lock();
            state.write_len = len;
            state.write_callback = Some(callback);
            state.writing = true;
            state.sync = true;
        }

        let core = self.clone();
        let done: WriteCallback = Box::new(move |result| core.on_write(result));

        match payload {
            WritePayload::Single(chunk) => {
                if self.transform.is_some() {
                    self.transform_write(chunk, done);
                } else if let Some(sink) = &ws.sink {
                    sink.write(chunk, done);
                } else {
                    done(Err(StreamError::NotImplemented("write")));
                }
            }

            WritePayload::Vectored(chunks) => match &ws.sink {
                Some(sink) => sink.writev(chunks, done),
                None => done(Err(StreamError::NotImplemented("writev"))),
            },
        }

        ws.state.lock().sync = false;
    }

    fn on_write(self: &Arc<Self>, result: Result<(), StreamError>) {
        let Some(ws) = &self.writable else {
            return;
        };

        let completion = {
            let mut state = ws.state.lock();
            state.write_callback.take().map(|callback| {
                state.writing = false;
                state.length -= state.write_len;
                state.write_len = 0;

                // queued writes fail with the one in flight, in order
                let failed = if result.is_err() {
                    state.errored = true;
                    let failed: Vec<WriteRequest> = state.buffer.drain(..).collect();
                    state.length -= failed.len();
                    failed
                } else {
                    Vec::new()
                };

                // held until the deferred callback ran, so the next write cannot overtake it
                state.after_write_pending = state.sync;
                (callback, failed, state.need_finish(), state.sync)
            })
        };

        let Some((callback, failed, finished, sync)) = completion else {
            log::warn!(target: "runnel", "{self:?} received a write completion with no write in flight");
            return;
        };

        let err = result.as_ref().err().cloned();
        if let Some(err) = &err {
            log::trace!(target: "runnel", "{self:?} write failed: {err}");
        }

        if sync {
            self.defer(move |core| core.after_write(result, finished, callback, failed));
        } else {
            self.after_write(result, finished, callback, failed);
        }

        if let Some(err) = err {
            let _ = self.emit(Event::Error(err));
        }
    }

    fn after_write(
        self: &Arc<Self>,
        result: Result<(), StreamError>,
        finished: bool,
        callback: WriteCallback,
        failed: Vec<WriteRequest>,
    ) {
        let Some(ws) = &self.writable else {
            return;
        };

        match result {
            Ok(()) => {
                if !finished {
                    let drain = {
                        let mut state = ws.state.lock();
                        if state.length == 0 && state.need_drain {
                            state.need_drain = false;
                            true
                        } else {
                            false
                        }
                    };

                    if drain {
                        log::trace!(target: "runnel", "{self:?} drained");
                        let _ = self.emit(Event::Drain);
                    }
                }

                callback(Ok(()));
            }

            Err(err) => {
                callback(Err(err.clone()));
                for request in failed {
                    (request.callback)(Err(err.clone()));
                }
            }
        }

        let clear = {
            let mut state = ws.state.lock();
            state.after_write_pending = false;
            state.can_clear_buffer()
        };

        if clear {
            self.clear_buffer(ws);
        }

        self.maybe_finish(ws);
    }

    fn clear_buffer(self: &Arc<Self>, ws: &WritableSide) {
        let batch = {
            let mut state = ws.state.lock();
            state.buffer_processing = true;
            if self.transform.is_none() && ws.supports_writev() && state.buffer.len() > 1 {
                Some(state.buffer.drain(..).collect::<Vec<_>>())
            } else {
                None
            }
        };

        match batch {
            Some(requests) => {
                let len = requests.len();
                let (chunks, callbacks): (Vec<WriteChunk>, Vec<WriteCallback>) = requests
                    .into_iter()
                    .map(|request| (request.chunk, request.callback))
                    .unzip();

                let callback: WriteCallback = Box::new(move |result| {
                    for callback in callbacks {
                        callback(result.clone());
                    }
                });

                self.do_write(ws, WritePayload::Vectored(chunks), len, callback);
            }

            None => loop {
                let next = {
                    let mut state = ws.state.lock();
                    if state.writing || state.after_write_pending || state.corked > 0 {
                        None
                    } else {
                        state.buffer.pop_front()
                    }
                };

                let Some(request) = next else {
                    break;
                };

                self.do_write(ws, WritePayload::Single(request.chunk), 1, request.callback);
            },
        }

        ws.state.lock().buffer_processing = false;
    }

    fn maybe_finish(self: &Arc<Self>, ws: &WritableSide) {
        let prefinish = {
            let mut state = ws.state.lock();
            if !state.need_finish() {
                return;
            }

            !std::mem::replace(&mut state.prefinished, true)
        };

        if prefinish {
            let _ = self.emit(Event::Prefinish);
        }

        let finish = {
            let mut state = ws.state.lock();
            if state.need_finish() && state.pending_callbacks == 0 {
                state.finished = true;
                state.writable = false;
                true
            } else {
                false
            }
        };

        if finish {
            log::trace!(target: "runnel", "{self:?} finished");
            let _ = self.emit(Event::Finish);
        }
    }

    pub(crate) fn writable_end(
        self: &Arc<Self>,
        chunk: Option<Chunk>,
        encoding: Option<Encoding>,
        callback: Option<EndCallback>,
    ) {
        let Some(ws) = &self.writable else {
            return;
        };

        if let Some(chunk) = chunk {
            let _ = self.writable_write(chunk, encoding, None);
        }

        let uncork = {
            let mut state = ws.state.lock();
            if state.corked > 0 {
                state.corked = 1;
                true
            } else {
                false
            }
        };

        if uncork {
            self.writable_uncork();
        }

        let start = {
            let mut state = ws.state.lock();
            if state.ending || state.finished {
                false
            } else {
                state.ending = true;
                true
            }
        };

        if start {
            log::trace!(target: "runnel", "{self:?} ending");
            self.maybe_finish(ws);
        }

        if let Some(callback) = callback {
            let finished = ws.state.lock().finished;
            if finished {
                self.scheduler.schedule(callback);
            } else {
                let _ = self.events.once(EventKind::Finish, move |_| callback());
            }
        }
    }

    pub(crate) fn writable_cork(&self) {
        if let Some(ws) = &self.writable {
            ws.state.lock().corked += 1;
        }
    }

    pub(crate) fn writable_uncork(self: &Arc<Self>) {
        let Some(ws) = &self.writable else {
            return;
        };

        let clear = {
            let mut state = ws.state.lock();
            if state.corked == 0 {
                return;
            }

            state.corked -= 1;
            state.can_clear_buffer()
        };

        if clear {
            self.clear_buffer(ws);
        }
    }

    pub(crate) fn writable_snapshot(&self) -> WritableSnapshot {
        match &self.writable {
            Some(ws) => ws.state.lock().snapshot(),
            None => WritableState::new(&WritableOptions::default().with_high_water_mark(0))
                .snapshot(),
        }
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
            .as_ref()
            .map(|ws| ws.state.lock().writable)
            .unwrap_or(false)
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.writable
            .as_ref()
            .map(|ws| ws.state.lock().persistent)
            .unwrap_or(false)
    }
}
