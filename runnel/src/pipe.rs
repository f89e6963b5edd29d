//! # Piping
//!
//! Connects a readable side to a writable side. Every `data` chunk of the source
//! is written into the destination. When a write reports backpressure the
//! source pauses until the destination emits `drain`. When the source ends, the
//! destination is ended too, unless the pipe was created with
//! [`PipeOptions::end`] unset or the destination is persistent.
//!
//! All listeners a pipe installs are removed together, exactly once, when the
//! destination is unpiped, finishes, closes, or errors.

use crate::engine::StreamCore;
use crate::events::{Event, EventKind, ListenerId};
use crate::options::PipeOptions;
use crate::stream::StreamId;
use runnel_io::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct Registration {
    core: Weak<StreamCore>,
    kind: EventKind,
    id: ListenerId,
}

/// The listeners belonging to one source/destination pair
pub(crate) struct PipeLinks {
    cleaned: AtomicBool,
    registrations: Mutex<Vec<Registration>>,
}

impl PipeLinks {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cleaned: AtomicBool::new(false),
            registrations: Mutex::new(Vec::new()),
        })
    }

    fn track(&self, core: &Arc<StreamCore>, kind: EventKind, id: ListenerId) {
        let mut registrations = self.registrations.lock();
        if self.cleaned.load(Ordering::SeqCst) {
            drop(registrations);
            let _ = core.events.remove_listener(kind, id);
            return;
        }

        registrations.push(Registration {
            core: Arc::downgrade(core),
            kind,
            id,
        });
    }

    fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        let registrations = std::mem::take(&mut *self.registrations.lock());
        for registration in registrations {
            if let Some(core) = registration.core.upgrade() {
                let _ = core.events.remove_listener(registration.kind, registration.id);
            }
        }
    }

    fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

impl StreamCore {
    pub(crate) fn pipe(self: &Arc<Self>, dest: &Arc<StreamCore>, options: PipeOptions) {
        let Some(rs) = &self.readable else {
            log::warn!(target: "runnel", "{self:?} has no readable side, cannot pipe into {dest:?}");
            return;
        };

        let emitted_end = {
            let mut state = rs.state.lock();
            state.pipes.push(dest.clone());
            state.emitted_end
        };

        let do_end = options.end && !dest.is_persistent();
        log::trace!(target: "runnel", "{self:?} piping into {dest:?} (end: {do_end})");

        let links = PipeLinks::new();
        let src_id = self.id;
        let dest_id = dest.id;

        let on_end = {
            let dest = Arc::downgrade(dest);
            let links = links.clone();
            move || {
                if do_end {
                    if let Some(dest) = dest.upgrade() {
                        dest.writable_end(None, None, None);
                    }
                } else {
                    links.cleanup();
                }
            }
        };

        if emitted_end {
            self.scheduler.schedule(on_end);
        } else {
            let id = self.events.once(EventKind::End, move |_| on_end());
            links.track(self, EventKind::End, id);
        }

        let id = dest.events.on(EventKind::Unpipe, {
            let links = links.clone();
            move |event| {
                if let Event::Unpipe(source) = event {
                    if *source == src_id {
                        links.cleanup();
                    }
                }
            }
        });
        links.track(dest, EventKind::Unpipe, id);

        let id = dest.events.on(EventKind::Drain, {
            let src = Arc::downgrade(self);
            move |_| {
                if let Some(src) = src.upgrade() {
                    src.pipe_on_drain(dest_id);
                }
            }
        });
        links.track(dest, EventKind::Drain, id);

        let id = self.events.on(EventKind::Data, {
            let src = Arc::downgrade(self);
            let dest = Arc::downgrade(dest);
            let links = links.clone();
            move |event| {
                let (Event::Data(chunk), Some(src), Some(dest)) =
                    (event, src.upgrade(), dest.upgrade())
                else {
                    return;
                };

                if !dest.writable_write(chunk.clone(), None, None) && !links.is_cleaned() {
                    src.await_drain_for(&dest);
                }
            }
        });
        links.track(self, EventKind::Data, id);
        self.on_subscribed(EventKind::Data);

        let id = dest.events.prepend(EventKind::Error, {
            let src = Arc::downgrade(self);
            let dest = Arc::downgrade(dest);
            let links = links.clone();
            move |event| {
                let Event::Error(err) = event else {
                    return;
                };

                if let Some(src) = src.upgrade() {
                    src.unpipe(Some(dest_id));
                }
                links.cleanup();

                if let Some(dest) = dest.upgrade() {
                    if dest.events.listener_count(EventKind::Error) == 0 {
                        let _ = dest.emit(Event::Error(err.clone()));
                    }
                }
            }
        });
        links.track(dest, EventKind::Error, id);

        for kind in [EventKind::Close, EventKind::Finish] {
            let src = Arc::downgrade(self);
            let owned = links.clone();
            let id = dest.events.once(kind, move |_| {
                if let Some(src) = src.upgrade() {
                    src.unpipe(Some(dest_id));
                }
                owned.cleanup();
            });
            links.track(dest, kind, id);
        }

        let _ = dest.emit(Event::Pipe(src_id));

        let flowing = rs.state.lock().flowing;
        if flowing != Some(true) {
            self.readable_resume();
        }
    }

    /// Called from a pipe's data listener when `dest` refused more data. Each
    /// destination counts once towards `await_drain` until it drains.
    fn await_drain_for(self: &Arc<Self>, dest: &Arc<StreamCore>) {
        let Some(rs) = &self.readable else {
            return;
        };

        let still_piped = {
            let mut state = rs.state.lock();
            let piped = state.pipes.iter().any(|pipe| Arc::ptr_eq(pipe, dest));
            if piped && state.awaiting_drain.insert(dest.id) {
                state.await_drain += 1;
            }
            piped
        };

        if still_piped {
            log::trace!(target: "runnel", "{dest:?} applied backpressure to {self:?}");
            self.readable_pause();
        }
    }

    fn pipe_on_drain(self: &Arc<Self>, dest_id: StreamId) {
        let Some(rs) = &self.readable else {
            return;
        };

        let relieved = {
            let mut state = rs.state.lock();
            if state.awaiting_drain.remove(&dest_id) {
                state.await_drain -= 1;
                true
            } else {
                false
            }
        };

        if relieved {
            self.resume_after_drain();
        }
    }

    /// Restarts the flow once no destination holds the source back
    fn resume_after_drain(self: &Arc<Self>) {
        let data_listeners = self.events.listener_count(EventKind::Data);
        let Some(rs) = &self.readable else {
            return;
        };

        let resume = {
            let mut state = rs.state.lock();
            if state.await_drain == 0
                && data_listeners > 0
                && !state.pipes.is_empty()
                && state.flowing != Some(true)
            {
                state.flowing = Some(true);
                true
            } else {
                false
            }
        };

        if resume {
            log::trace!(target: "runnel", "{self:?} resumed after drain");
            let _ = self.emit(Event::Resume);
            self.flow();
        }
    }

    /// Detaches `target`, or every destination when `None`. Each detached
    /// destination receives an `unpipe` event naming this stream and stops
    /// holding the source back.
    pub(crate) fn unpipe(self: &Arc<Self>, target: Option<StreamId>) {
        let Some(rs) = &self.readable else {
            return;
        };

        let (detached, relieved) = {
            let mut state = rs.state.lock();
            let detached = match target {
                Some(id) => match state.pipes.iter().position(|pipe| pipe.id == id) {
                    Some(index) => vec![state.pipes.remove(index)],
                    None => Vec::new(),
                },
                None => std::mem::take(&mut state.pipes),
            };

            let mut relieved = false;
            for dest in &detached {
                if state.awaiting_drain.remove(&dest.id) {
                    state.await_drain -= 1;
                    relieved = true;
                }
            }

            if !detached.is_empty() && state.pipes.is_empty() {
                state.flowing = Some(false);
            }

            (detached, relieved && !state.pipes.is_empty())
        };

        for dest in detached {
            log::trace!(target: "runnel", "{self:?} unpiped from {dest:?}");
            let _ = dest.emit(Event::Unpipe(self.id));
        }

        // unpipe may run inside a data emission, so the flow restarts on the next tick
        if relieved {
            self.defer(|core| core.resume_after_drain());
        }
    }
}
