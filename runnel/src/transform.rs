//! # Transform
//!
//! A duplex whose writable side feeds its readable side through a single
//! [`Transformer`] step. Each written chunk is held until the readable side
//! asks for more data; the transformer then runs exactly once for it, and its
//! output is pushed onto the readable side before the write is acknowledged.
//! At most one written chunk is ever held.
//!
//! When the writable side is ended and every write has been transformed, the
//! transformer's `flush` runs and the readable side is ended.

use crate::engine::StreamCore;
use crate::error::StreamError;
use crate::events::{Event, EventKind};
use crate::options::DuplexOptions;
use crate::readable::ReadableSide;
use crate::stream::private::Sealed;
use crate::stream::{
    Chunk, EventSource, FlushCallback, ReadableStream, TransformCallback, Transformer,
    WritableStream, WriteCallback, WriteChunk,
};
use crate::writable::WritableSide;
use runnel_io::{Mutex, Scheduler};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct TransformState {
    pub(crate) write_chunk: Option<WriteChunk>,
    pub(crate) write_callback: Option<WriteCallback>,
    pub(crate) transforming: bool,
    pub(crate) need_transform: bool,
}

pub(crate) struct TransformSide {
    pub(crate) state: Mutex<TransformState>,
    transformer: Box<dyn Transformer>,
}

#[derive(Clone)]
pub struct Transform {
    core: Arc<StreamCore>,
}

impl Transform {
    pub fn new<T: Transformer>(
        scheduler: &Scheduler,
        transformer: T,
        options: DuplexOptions,
    ) -> Self {
        let readable = ReadableSide::new(&options.readable, None);
        let writable = WritableSide::new(&options.writable, None);
        let transform = TransformSide {
            state: Mutex::new(TransformState::default()),
            transformer: Box::new(transformer),
        };

        let core = StreamCore::new(scheduler, Some(readable), Some(writable), Some(transform));
        core.configure_duplex(&options);

        if let Some(rs) = &core.readable {
            let mut state = rs.state.lock();
            state.need_readable = true;
            state.sync = false;
        }

        let weak = Arc::downgrade(&core);
        let _ = core.events.once(EventKind::Prefinish, move |_| {
            if let Some(core) = weak.upgrade() {
                core.transform_flush();
            }
        });

        Self { core }
    }
}

impl StreamCore {
    /// Sink half: hold the chunk, then start a read cycle if the readable
    /// side can take more
    pub(crate) fn transform_write(self: &Arc<Self>, chunk: WriteChunk, done: WriteCallback) {
        let Some(ts) = &self.transform else {
            done(Err(StreamError::NotImplemented("transform")));
            return;
        };

        let need_transform = {
            let mut state = ts.state.lock();
            debug_assert!(state.write_callback.is_none(), "transform holds more than one write");
            state.write_chunk = Some(chunk);
            state.write_callback = Some(done);
            if state.transforming {
                return;
            }
            state.need_transform
        };

        if need_transform || self.readable_is_hungry() {
            self.transform_read();
        }
    }

    /// Source half: run the transformer on the held chunk, or remember that the
    /// readable side is waiting for one
    pub(crate) fn transform_read(self: &Arc<Self>) {
        let Some(ts) = &self.transform else {
            return;
        };

        let chunk = {
            let mut state = ts.state.lock();
            if !state.transforming
                && state.write_callback.is_some()
                && state.write_chunk.is_some()
            {
                state.transforming = true;
                state.write_chunk.take()
            } else {
                state.need_transform = true;
                None
            }
        };

        if let Some(chunk) = chunk {
            let core = self.clone();
            let done: TransformCallback = Box::new(move |result| core.after_transform(result));
            ts.transformer.transform(chunk, &self.as_readable(), done);
        }
    }

    pub(crate) fn after_transform(self: &Arc<Self>, result: Result<Option<Chunk>, StreamError>) {
        let Some(ts) = &self.transform else {
            return;
        };

        let callback = {
            let mut state = ts.state.lock();
            state.transforming = false;
            state.write_chunk = None;
            state.write_callback.take()
        };

        let Some(callback) = callback else {
            let _ = self.emit(Event::Error(StreamError::MissingTransformCallback));
            return;
        };

        let result = match result {
            Ok(output) => {
                if let Some(output) = output {
                    let _ = self.readable_add_chunk(Some(output), false);
                }
                Ok(())
            }
            Err(err) => Err(err),
        };

        callback(result);

        let hungry = match &self.readable {
            Some(rs) => {
                let mut state = rs.state.lock();
                state.reading = false;
                state.need_readable || state.buffer.len() < state.high_water_mark
            }
            None => false,
        };

        if hungry {
            self.transform_read();
        }
    }

    fn readable_is_hungry(&self) -> bool {
        self.readable
            .as_ref()
            .map(|rs| {
                let state = rs.state.lock();
                state.need_readable || state.buffer.len() < state.high_water_mark
            })
            .unwrap_or(false)
    }

    fn transform_flush(self: &Arc<Self>) {
        let Some(ts) = &self.transform else {
            return;
        };

        let core = self.clone();
        let done: FlushCallback = Box::new(move |result| core.transform_finish(result));
        ts.transformer.flush(&self.as_readable(), done);
    }

    fn transform_finish(self: &Arc<Self>, result: Result<(), StreamError>) {
        if let Err(err) = result {
            let _ = self.emit(Event::Error(err));
            return;
        }

        if let Some(ws) = &self.writable {
            assert_eq!(
                ws.state.lock().length,
                0,
                "transform finishing with writes still pending"
            );
        }

        if let Some(ts) = &self.transform {
            assert!(
                !ts.state.lock().transforming,
                "transform finishing while still transforming"
            );
        }

        log::trace!(target: "runnel", "{self:?} flushed, ending readable side");
        let _ = self.readable_add_chunk(None, false);
    }
}

impl Sealed for Transform {
    fn core(&self) -> &Arc<StreamCore> {
        &self.core
    }
}

impl EventSource for Transform {}
impl ReadableStream for Transform {}
impl WritableStream for Transform {}

impl Debug for Transform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.core, f)
    }
}
