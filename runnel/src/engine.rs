use crate::events::{Event, EventEmitter, EventKind, ListenerId};
use crate::readable::{Readable, ReadableSide};
use crate::stream::StreamId;
use crate::transform::TransformSide;
use crate::writable::WritableSide;
use runnel_io::Scheduler;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// The state shared by every handle to one stream. Each side keeps its own
/// lock, and no lock is ever held while a hook, callback or listener runs.
pub struct StreamCore {
    pub(crate) id: StreamId,
    pub(crate) scheduler: Scheduler,
    pub(crate) events: EventEmitter,
    pub(crate) readable: Option<ReadableSide>,
    pub(crate) writable: Option<WritableSide>,
    pub(crate) transform: Option<TransformSide>,
}

impl StreamCore {
    pub(crate) fn new(
        scheduler: &Scheduler,
        readable: Option<ReadableSide>,
        writable: Option<WritableSide>,
        transform: Option<TransformSide>,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            id: StreamId::next(),
            scheduler: scheduler.clone(),
            events: EventEmitter::new(),
            readable,
            writable,
            transform,
        });

        log::trace!(target: "runnel", "Created {:?}", core);
        core
    }

    pub(crate) fn emit(&self, event: Event) -> bool {
        self.events.emit(event)
    }

    pub(crate) fn on<F>(self: &Arc<Self>, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.events.on(kind, listener);
        self.on_subscribed(kind);
        id
    }

    pub(crate) fn once<F>(self: &Arc<Self>, kind: EventKind, listener: F) -> ListenerId
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        let id = self.events.once(kind, listener);
        self.on_subscribed(kind);
        id
    }

    pub(crate) fn on_subscribed(self: &Arc<Self>, kind: EventKind) {
        match kind {
            EventKind::Data => self.on_data_subscribed(),
            EventKind::Readable => self.on_readable_subscribed(),
            _ => {}
        }
    }

    /// Runs `task` on a later tick. The stream stays alive until it has run.
    pub(crate) fn defer<F>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(&Arc<StreamCore>) + Send + 'static,
    {
        let core = self.clone();
        self.scheduler.schedule(move || task(&core));
    }

    /// A readable view handed to sources and transformers
    pub(crate) fn as_readable(self: &Arc<Self>) -> Readable {
        Readable::from_core(self.clone())
    }

    fn kind_name(&self) -> &'static str {
        match (&self.readable, &self.writable, &self.transform) {
            (_, _, Some(_)) => "Transform",
            (Some(_), Some(_), None) => "Duplex",
            (Some(_), None, None) => "Readable",
            (None, Some(_), None) => "Writable",
            (None, None, None) => "Stream",
        }
    }
}

impl Debug for StreamCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind_name(), self.id)
    }
}
