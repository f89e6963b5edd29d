//! A stream that is both readable and writable. The two sides keep separate
//! state and flow control but share one event channel, so `data` and `finish`
//! (for example) are observed on the same handle.
//!
//! By default the sides close independently. With
//! [`DuplexOptions::allow_half_open`] set to false, the writable side is ended
//! on the tick after the readable side emits `end`.

use crate::engine::StreamCore;
use crate::events::EventKind;
use crate::options::DuplexOptions;
use crate::readable::ReadableSide;
use crate::stream::private::Sealed;
use crate::stream::{EventSource, ReadableStream, Sink, Source, WritableStream};
use crate::writable::WritableSide;
use runnel_io::Scheduler;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

#[derive(Clone)]
pub struct Duplex {
    core: Arc<StreamCore>,
}

impl Duplex {
    pub fn new<R: Source, W: Sink>(
        scheduler: &Scheduler,
        source: R,
        sink: W,
        options: DuplexOptions,
    ) -> Self {
        Self::build(scheduler, Some(Box::new(source)), sink, options)
    }

    /// A duplex whose readable side is fed only through explicit pushes
    pub fn manual<W: Sink>(scheduler: &Scheduler, sink: W, options: DuplexOptions) -> Self {
        Self::build(scheduler, None, sink, options)
    }

    fn build<W: Sink>(
        scheduler: &Scheduler,
        source: Option<Box<dyn Source>>,
        sink: W,
        options: DuplexOptions,
    ) -> Self {
        let readable = ReadableSide::new(&options.readable, source);
        let writable = WritableSide::new(&options.writable, Some(Box::new(sink)));
        let core = StreamCore::new(scheduler, Some(readable), Some(writable), None);
        core.configure_duplex(&options);
        Self { core }
    }
}

impl StreamCore {
    pub(crate) fn configure_duplex(self: &Arc<Self>, options: &DuplexOptions) {
        if !options.readable_enabled {
            if let Some(rs) = &self.readable {
                rs.state.lock().readable = false;
            }
        }

        if !options.writable_enabled {
            if let Some(ws) = &self.writable {
                ws.state.lock().writable = false;
            }
        }

        if !options.allow_half_open {
            let weak = Arc::downgrade(self);
            let _ = self.events.once(EventKind::End, move |_| {
                if let Some(core) = weak.upgrade() {
                    core.defer(|core| core.close_writable_half());
                }
            });
        }
    }

    fn close_writable_half(self: &Arc<Self>) {
        let Some(ws) = &self.writable else {
            return;
        };

        let already_closing = {
            let state = ws.state.lock();
            state.ending || state.finished
        };

        if !already_closing {
            log::trace!(target: "runnel", "{self:?} readable side ended, ending writable side");
            self.writable_end(None, None, None);
        }
    }
}

impl Sealed for Duplex {
    fn core(&self) -> &Arc<StreamCore> {
        &self.core
    }
}

impl EventSource for Duplex {}
impl ReadableStream for Duplex {}
impl WritableStream for Duplex {}

impl Debug for Duplex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.core, f)
    }
}
