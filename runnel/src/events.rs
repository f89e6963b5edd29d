//! # Event Channel
//!
//! A named-event registry shared by every stream. Listeners are invoked
//! synchronously, in registration order, over a snapshot of the list taken
//! when the emission starts. A listener removed while an emission is running
//! is skipped if it has not been reached yet.
//!
//! Emitting [`Event::Error`] while nobody listens for errors is treated as an
//! unrecoverable fault and panics.

use crate::error::StreamError;
use crate::stream::{Chunk, StreamId};
use runnel_io::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Listener count above which a leak warning is logged, per event kind
pub const DEFAULT_MAX_LISTENERS: usize = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Data,
    Readable,
    End,
    Close,
    Drain,
    Finish,
    Prefinish,
    Pipe,
    Unpipe,
    Error,
    Pause,
    Resume,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Readable => "readable",
            Self::End => "end",
            Self::Close => "close",
            Self::Drain => "drain",
            Self::Finish => "finish",
            Self::Prefinish => "prefinish",
            Self::Pipe => "pipe",
            Self::Unpipe => "unpipe",
            Self::Error => "error",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An emitted event together with its payload
#[derive(Clone, Debug)]
pub enum Event {
    Data(Chunk),
    Readable,
    End,
    Close,
    Drain,
    Finish,
    Prefinish,
    /// A source (identified here) started piping into the receiving stream
    Pipe(StreamId),
    /// A source (identified here) stopped piping into the receiving stream
    Unpipe(StreamId),
    Error(StreamError),
    Pause,
    Resume,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Readable => EventKind::Readable,
            Self::End => EventKind::End,
            Self::Close => EventKind::Close,
            Self::Drain => EventKind::Drain,
            Self::Finish => EventKind::Finish,
            Self::Prefinish => EventKind::Prefinish,
            Self::Pipe(_) => EventKind::Pipe,
            Self::Unpipe(_) => EventKind::Unpipe,
            Self::Error(_) => EventKind::Error,
            Self::Pause => EventKind::Pause,
            Self::Resume => EventKind::Resume,
        }
    }
}

/// Handle returned on subscription, used to remove the listener later
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type PersistentFn = Arc<dyn Fn(&Event) + Send + Sync>;
type OnceFn = Box<dyn FnOnce(&Event) + Send>;

#[derive(Clone)]
enum Callback {
    Persistent(PersistentFn),
    Once(Arc<Mutex<Option<OnceFn>>>),
}

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    active: Arc<AtomicBool>,
    callback: Callback,
}

pub struct EventEmitter {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
    next_id: AtomicU64,
    max_listeners: AtomicUsize,
    warned: Mutex<HashSet<EventKind>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            max_listeners: AtomicUsize::new(DEFAULT_MAX_LISTENERS),
            warned: Mutex::new(HashSet::new()),
        }
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(kind, Callback::Persistent(Arc::new(listener)), false)
    }

    /// The listener is removed before it runs, so it fires at most once
    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        let callback: OnceFn = Box::new(listener);
        self.add(kind, Callback::Once(Arc::new(Mutex::new(Some(callback)))), false)
    }

    /// Registers a listener ahead of every existing listener for `kind`
    pub fn prepend<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(kind, Callback::Persistent(Arc::new(listener)), true)
    }

    fn add(&self, kind: EventKind, callback: Callback, front: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Listener {
            id,
            active: Arc::new(AtomicBool::new(true)),
            callback,
        };

        let count = {
            let mut listeners = self.listeners.lock();
            let list = listeners.entry(kind).or_default();
            if front {
                list.insert(0, listener);
            } else {
                list.push(listener);
            }
            list.len()
        };

        let max = self.max_listeners.load(Ordering::Relaxed);
        if max > 0 && count > max && self.warned.lock().insert(kind) {
            log::warn!(target: "runnel", "Possible listener leak detected: {count} '{kind}' listeners added. Use set_max_listeners() to raise the limit");
        }

        id
    }

    /// Returns false if the listener was not registered under `kind`
    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };

        match list.iter().position(|listener| listener.id == id) {
            Some(idx) => {
                let listener = list.remove(idx);
                listener.active.store(false, Ordering::Release);
                if list.is_empty() {
                    listeners.remove(&kind);
                }
                true
            }
            None => false,
        }
    }

    /// Removes every listener for `kind`, or every listener at all if `None`
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        let removed: Vec<Listener> = {
            let mut listeners = self.listeners.lock();
            match kind {
                Some(kind) => listeners.remove(&kind).unwrap_or_default(),
                None => listeners.drain().flat_map(|(_, list)| list).collect(),
            }
        };

        for listener in removed {
            listener.active.store(false, Ordering::Release);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// 0 disables the leak warning
    pub fn set_max_listeners(&self, max: usize) {
        self.max_listeners.store(max, Ordering::Relaxed);
    }

    pub fn max_listeners(&self) -> usize {
        self.max_listeners.load(Ordering::Relaxed)
    }

    /// Invokes every listener for the event's kind. Returns whether any listener
    /// was registered.
    ///
    /// # Panics
    /// If `event` is an [`Event::Error`] and no error listener is registered
    pub fn emit(&self, event: Event) -> bool {
        let kind = event.kind();
        let snapshot = self
            .listeners
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        if snapshot.is_empty() {
            if let Event::Error(err) = &event {
                panic!("Unhandled stream error: {err}");
            }

            return false;
        }

        for listener in snapshot {
            match &listener.callback {
                Callback::Persistent(callback) => {
                    if listener.active.load(Ordering::Acquire) {
                        (callback)(&event)
                    }
                }

                Callback::Once(slot) => {
                    if listener.active.swap(false, Ordering::AcqRel) {
                        let _ = self.remove_listener(kind, listener.id);
                        let callback = slot.lock().take();
                        if let Some(callback) = callback {
                            (callback)(&event)
                        }
                    }
                }
            }
        }

        true
    }
}

impl Debug for EventEmitter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<EventKind, usize> = self
            .listeners
            .lock()
            .iter()
            .map(|(kind, list)| (*kind, list.len()))
            .collect();
        f.debug_struct("EventEmitter")
            .field("listeners", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventEmitter, EventKind};
    use crate::error::StreamError;
    use runnel_io::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Event) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move |_: &Event| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn listeners_run_in_registration_order() {
        runnel_logging::setup_log();
        let emitter = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            let _ = emitter.on(EventKind::Drain, move |_| order.lock().push(tag));
        }
        let front = order.clone();
        let _ = emitter.prepend(EventKind::Drain, move |_| front.lock().push("prepended"));

        assert!(emitter.emit(Event::Drain));
        assert_eq!(
            *order.lock(),
            vec!["prepended", "first", "second", "third"]
        );
        assert!(!emitter.emit(Event::Finish));
    }

    #[test]
    fn once_fires_a_single_time() {
        runnel_logging::setup_log();
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let _ = emitter.once(EventKind::End, move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(emitter.listener_count(EventKind::End), 1);
        assert!(emitter.emit(Event::End));
        assert!(!emitter.emit(Event::End));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(EventKind::End), 0);
    }

    #[test]
    fn listener_removed_mid_emit_is_skipped() {
        runnel_logging::setup_log();
        let emitter = Arc::new(EventEmitter::new());
        let (count, second) = counter();
        let victim = Arc::new(Mutex::new(None));

        let remover_emitter = emitter.clone();
        let remover_victim = victim.clone();
        let _ = emitter.on(EventKind::Drain, move |_| {
            if let Some(id) = remover_victim.lock().take() {
                assert!(remover_emitter.remove_listener(EventKind::Drain, id));
            }
        });
        *victim.lock() = Some(emitter.on(EventKind::Drain, second));

        assert!(emitter.emit(Event::Drain));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(emitter.listener_count(EventKind::Drain), 1);
    }

    #[test]
    fn listener_added_mid_emit_waits_for_next_emission() {
        runnel_logging::setup_log();
        let emitter = Arc::new(EventEmitter::new());
        let (count, late) = counter();
        let late = Arc::new(Mutex::new(Some(late)));
        let inner = emitter.clone();
        let _ = emitter.on(EventKind::Resume, move |_| {
            if let Some(late) = late.lock().take() {
                let _ = inner.on(EventKind::Resume, late);
            }
        });

        assert!(emitter.emit(Event::Resume));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(emitter.emit(Event::Resume));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_all_listeners() {
        runnel_logging::setup_log();
        let emitter = EventEmitter::new();
        let (count, listener) = counter();
        let listener = Arc::new(listener);
        for kind in [EventKind::Data, EventKind::Data, EventKind::End] {
            let listener = listener.clone();
            let _ = emitter.on(kind, move |event| listener(event));
        }

        emitter.remove_all_listeners(Some(EventKind::Data));
        assert_eq!(emitter.listener_count(EventKind::Data), 0);
        assert_eq!(emitter.listener_count(EventKind::End), 1);

        emitter.remove_all_listeners(None);
        assert!(!emitter.emit(Event::End));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn error_with_listener_does_not_panic() {
        runnel_logging::setup_log();
        let emitter = EventEmitter::new();
        let seen = Arc::new(Mutex::new(None));
        let inner = seen.clone();
        let _ = emitter.on(EventKind::Error, move |event| {
            if let Event::Error(err) = event {
                *inner.lock() = Some(err.clone());
            }
        });

        assert!(emitter.emit(Event::Error(StreamError::WriteAfterEnd)));
        assert_eq!(*seen.lock(), Some(StreamError::WriteAfterEnd));
    }

    #[test]
    fn max_listeners_is_advisory() {
        runnel_logging::setup_log();
        let emitter = EventEmitter::new();
        emitter.set_max_listeners(2);
        let (count, listener) = counter();
        let listener = Arc::new(listener);
        for _ in 0..5 {
            let listener = listener.clone();
            let _ = emitter.on(EventKind::Pipe, move |event| listener(event));
        }

        assert_eq!(emitter.max_listeners(), 2);
        assert_eq!(emitter.listener_count(EventKind::Pipe), 5);
        assert!(emitter.emit(Event::Pipe(crate::stream::StreamId::next())));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
