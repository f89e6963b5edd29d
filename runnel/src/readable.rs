//! # Readable Side
//!
//! The producer-facing half of a stream. A [`Source`] is asked for data with
//! `read(size)` and answers by pushing chunks, immediately or later. Chunks are
//! buffered until a consumer pulls them with [`ReadableStream::read`], or, once
//! the stream is flowing, delivered as `data` events as they arrive.
//!
//! ## Flow control
//!
//! The buffer is measured in chunks. [`ReadableStream::push`] returns false once
//! the buffer reaches the high-water mark; the signal is advisory, push never
//! drops data. While not flowing, the stream keeps asking its source for more
//! until the buffer reaches the high-water mark.
//!
//! ## Example
//!
//! ```rust
//! use runnel::prelude::*;
//! use bytes::Bytes;
//!
//! let scheduler = Scheduler::new();
//! let readable = Readable::manual(&scheduler, ReadableOptions::default());
//! readable.push(Some(Bytes::from_static(b"a")));
//! readable.push(None);
//!
//! assert_eq!(readable.read(None), Some(Bytes::from_static(b"a")));
//! assert_eq!(readable.read(None), None);
//! scheduler.run_until_idle(); // `end` fires here
//! ```

use crate::engine::StreamCore;
use crate::error::StreamError;
use crate::events::Event;
use crate::options::ReadableOptions;
use crate::stream::private::Sealed;
use crate::stream::{Chunk, EventSource, ReadableSnapshot, ReadableStream, Source, StreamId};
use runnel_io::{Mutex, Scheduler};
use std::collections::{HashSet, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub(crate) struct ReadableState {
    pub(crate) buffer: VecDeque<Chunk>,
    pub(crate) high_water_mark: usize,
    pub(crate) pipes: Vec<Arc<StreamCore>>,
    pub(crate) flowing: Option<bool>,
    pub(crate) ended: bool,
    pub(crate) emitted_end: bool,
    pub(crate) emitted_readable: bool,
    pub(crate) need_readable: bool,
    pub(crate) readable_listening: bool,
    pub(crate) reading: bool,
    pub(crate) reading_more: bool,
    pub(crate) resume_scheduled: bool,
    pub(crate) await_drain: usize,
    /// Destinations that refused a write and have not drained since
    pub(crate) awaiting_drain: HashSet<StreamId>,
    pub(crate) sync: bool,
    pub(crate) readable: bool,
}

impl ReadableState {
    fn new(options: &ReadableOptions) -> Self {
        Self {
            buffer: VecDeque::new(),
            high_water_mark: options.high_water_mark,
            pipes: Vec::new(),
            flowing: None,
            ended: false,
            emitted_end: false,
            emitted_readable: false,
            need_readable: false,
            readable_listening: false,
            reading: false,
            reading_more: false,
            resume_scheduled: false,
            await_drain: 0,
            awaiting_drain: HashSet::new(),
            sync: true,
            readable: true,
        }
    }

    fn needs_more_data(&self) -> bool {
        !self.ended
            && (self.need_readable
                || self.buffer.len() < self.high_water_mark
                || self.buffer.is_empty())
    }

    fn can_read_more(&self) -> bool {
        !self.reading
            && self.flowing != Some(true)
            && !self.ended
            && self.buffer.len() < self.high_water_mark
    }

    fn snapshot(&self) -> ReadableSnapshot {
        ReadableSnapshot {
            length: self.buffer.len(),
            high_water_mark: self.high_water_mark,
            flowing: self.flowing,
            ended: self.ended,
            emitted_end: self.emitted_end,
            reading: self.reading,
            need_readable: self.need_readable,
            pipes_count: self.pipes.len(),
            await_drain: self.await_drain,
        }
    }
}

pub(crate) struct ReadableSide {
    pub(crate) state: Mutex<ReadableState>,
    source: Option<Box<dyn Source>>,
}

impl ReadableSide {
    pub(crate) fn new(options: &ReadableOptions, source: Option<Box<dyn Source>>) -> Self {
        Self {
            state: Mutex::new(ReadableState::new(options)),
            source,
        }
    }
}

/// A stream that only produces data
#[derive(Clone)]
pub struct Readable {
    core: Arc<StreamCore>,
}

impl Readable {
    pub fn new<S: Source>(scheduler: &Scheduler, source: S, options: ReadableOptions) -> Self {
        Self::build(scheduler, Some(Box::new(source)), options)
    }

    /// A readable stream with no source. Data arrives only through
    /// [`ReadableStream::push`] calls made by its owner.
    pub fn manual(scheduler: &Scheduler, options: ReadableOptions) -> Self {
        Self::build(scheduler, None, options)
    }

    fn build(
        scheduler: &Scheduler,
        source: Option<Box<dyn Source>>,
        options: ReadableOptions,
    ) -> Self {
        let readable = ReadableSide::new(&options, source);
        Self {
            core: StreamCore::new(scheduler, Some(readable), None, None),
        }
    }

    pub(crate) fn from_core(core: Arc<StreamCore>) -> Self {
        Self { core }
    }
}

impl Sealed for Readable {
    fn core(&self) -> &Arc<StreamCore> {
        &self.core
    }
}

impl EventSource for Readable {}
impl ReadableStream for Readable {}

impl Debug for Readable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.core, f)
    }
}

enum AddOutcome {
    Rejected(StreamError),
    Flow(Chunk),
    Buffered { notify: bool },
}

fn how_much_to_read(size: Option<usize>) -> usize {
    if size == Some(0) {
        0
    } else {
        1
    }
}

impl StreamCore {
    pub(crate) fn readable_add_chunk(
        self: &Arc<Self>,
        chunk: Option<Chunk>,
        add_to_front: bool,
    ) -> bool {
        let Some(rs) = &self.readable else {
            log::warn!(target: "runnel", "{self:?} has no readable side, dropping pushed chunk");
            return false;
        };

        if !add_to_front {
            if let Some(ts) = &self.transform {
                ts.state.lock().need_transform = false;
            }
        }

        match chunk {
            None => {
                let first_eof = {
                    let mut state = rs.state.lock();
                    state.reading = false;
                    !std::mem::replace(&mut state.ended, true)
                };

                if first_eof {
                    log::trace!(target: "runnel", "{self:?} reached end of data");
                    self.emit_readable();
                }
            }

            Some(chunk) => {
                let outcome = {
                    let mut state = rs.state.lock();
                    if state.ended && !add_to_front {
                        AddOutcome::Rejected(StreamError::PushAfterEnd)
                    } else if state.emitted_end && add_to_front {
                        AddOutcome::Rejected(StreamError::UnshiftAfterEnd)
                    } else {
                        if !add_to_front {
                            state.reading = false;
                        }

                        if state.flowing == Some(true) && state.buffer.is_empty() && !state.sync {
                            AddOutcome::Flow(chunk)
                        } else {
                            if add_to_front {
                                state.buffer.push_front(chunk);
                            } else {
                                state.buffer.push_back(chunk);
                            }

                            AddOutcome::Buffered {
                                notify: state.need_readable,
                            }
                        }
                    }
                };

                match outcome {
                    AddOutcome::Rejected(err) => {
                        let _ = self.emit(Event::Error(err));
                    }

                    AddOutcome::Flow(chunk) => {
                        let _ = self.emit(Event::Data(chunk));
                        let _ = self.readable_read(Some(0));
                        self.maybe_read_more();
                    }

                    AddOutcome::Buffered { notify } => {
                        if notify {
                            self.emit_readable();
                        }
                        self.maybe_read_more();
                    }
                }
            }
        }

        rs.state.lock().needs_more_data()
    }

    pub(crate) fn readable_read(self: &Arc<Self>, size: Option<usize>) -> Option<Chunk> {
        let rs = self.readable.as_ref()?;
        let mut state = rs.state.lock();

        if size != Some(0) {
            state.emitted_readable = false;
        }

        if size == Some(0)
            && state.need_readable
            && (state.buffer.len() >= state.high_water_mark || state.ended)
        {
            let drained = state.buffer.is_empty() && state.ended;
            drop(state);
            if drained {
                self.end_readable();
            } else {
                self.emit_readable();
            }

            return None;
        }

        let mut want = how_much_to_read(size);

        if want == 0 && state.ended {
            let drained = state.buffer.is_empty();
            drop(state);
            if drained {
                self.end_readable();
            }

            return None;
        }

        let pull = !state.ended
            && !state.reading
            && (state.buffer.is_empty() || state.need_readable);

        if pull {
            state.reading = true;
            state.sync = true;
            if state.buffer.is_empty() {
                state.need_readable = true;
            }

            let high_water_mark = state.high_water_mark;
            drop(state);

            self.call_source(rs, high_water_mark);

            state = rs.state.lock();
            state.sync = false;
            // the source answered synchronously, so the request may be satisfiable now
            if !state.reading {
                want = how_much_to_read(size);
            }
        }

        let chunk = if want > 0 {
            state.buffer.pop_front()
        } else {
            None
        };

        if chunk.is_none() {
            state.need_readable = true;
            want = 0;
        }

        if state.buffer.is_empty() && !state.ended {
            state.need_readable = true;
        }

        let end_now = size != Some(want) && state.ended && state.buffer.is_empty();
        drop(state);

        if end_now {
            self.end_readable();
        }

        if let Some(chunk) = &chunk {
            let _ = self.emit(Event::Data(chunk.clone()));
        }

        chunk
    }

    fn call_source(self: &Arc<Self>, rs: &ReadableSide, size: usize) {
        if self.transform.is_some() {
            self.transform_read();
        } else if let Some(source) = &rs.source {
            source.read(&self.as_readable(), size);
        }
    }

    fn emit_readable(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        let deferred = {
            let mut state = rs.state.lock();
            state.need_readable = false;
            if state.emitted_readable {
                return;
            }
            state.emitted_readable = true;
            state.sync
        };

        if deferred {
            self.defer(|core| core.emit_readable_now());
        } else {
            self.emit_readable_now();
        }
    }

    fn emit_readable_now(self: &Arc<Self>) {
        let _ = self.emit(Event::Readable);
        self.flow();
    }

    /// Pulls and emits chunks for as long as the stream stays flowing
    pub(crate) fn flow(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        while rs.state.lock().flowing == Some(true) {
            if self.readable_read(None).is_none() {
                break;
            }
        }
    }

    fn end_readable(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        {
            let mut state = rs.state.lock();
            assert!(
                state.buffer.is_empty(),
                "end_readable called on a stream with buffered data"
            );

            if state.emitted_end {
                return;
            }

            state.ended = true;
        }

        self.defer(|core| core.emit_end());
    }

    fn emit_end(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        let emit = {
            let mut state = rs.state.lock();
            if !state.emitted_end && state.buffer.is_empty() {
                state.emitted_end = true;
                state.readable = false;
                true
            } else {
                false
            }
        };

        if emit {
            log::trace!(target: "runnel", "{self:?} emitting end");
            let _ = self.emit(Event::End);
        }
    }

    fn maybe_read_more(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        {
            let mut state = rs.state.lock();
            if state.reading_more {
                return;
            }
            state.reading_more = true;
        }

        self.defer(|core| core.maybe_read_more_now());
    }

    fn maybe_read_more_now(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        loop {
            let length = {
                let state = rs.state.lock();
                if !state.can_read_more() {
                    break;
                }
                state.buffer.len()
            };

            let _ = self.readable_read(Some(0));

            if rs.state.lock().buffer.len() == length {
                break;
            }
        }

        rs.state.lock().reading_more = false;
    }

    pub(crate) fn on_data_subscribed(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        let paused = rs.state.lock().flowing == Some(false);
        if !paused {
            self.readable_resume();
        }
    }

    pub(crate) fn on_readable_subscribed(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        let (notify, prime) = {
            let mut state = rs.state.lock();
            if !state.readable || state.readable_listening {
                return;
            }

            state.readable_listening = true;
            state.emitted_readable = false;
            state.need_readable = true;

            if state.reading {
                (!state.buffer.is_empty(), false)
            } else {
                (false, true)
            }
        };

        if notify {
            self.emit_readable();
        } else if prime {
            self.defer(|core| {
                let _ = core.readable_read(Some(0));
            });
        }
    }

    pub(crate) fn readable_resume(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        let (reading, schedule) = {
            let mut state = rs.state.lock();
            if state.flowing == Some(true) {
                return;
            }

            state.flowing = Some(true);
            let schedule = !state.resume_scheduled;
            state.resume_scheduled = true;
            (state.reading, schedule)
        };

        if !reading {
            let _ = self.readable_read(Some(0));
        }

        if schedule {
            self.defer(|core| core.resume_now());
        }
    }

    fn resume_now(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        rs.state.lock().resume_scheduled = false;
        log::trace!(target: "runnel", "{self:?} resumed");
        let _ = self.emit(Event::Resume);
        self.flow();

        let prime = {
            let state = rs.state.lock();
            state.flowing == Some(true) && !state.reading
        };

        if prime {
            let _ = self.readable_read(Some(0));
        }
    }

    pub(crate) fn readable_pause(self: &Arc<Self>) {
        let Some(rs) = &self.readable else {
            return;
        };

        let changed = rs.state.lock().flowing.replace(false) != Some(false);
        if changed {
            log::trace!(target: "runnel", "{self:?} paused");
            let _ = self.emit(Event::Pause);
        }
    }

    pub(crate) fn readable_is_paused(&self) -> bool {
        self.readable
            .as_ref()
            .map(|rs| rs.state.lock().flowing == Some(false))
            .unwrap_or(false)
    }

    pub(crate) fn readable_snapshot(&self) -> ReadableSnapshot {
        match &self.readable {
            Some(rs) => rs.state.lock().snapshot(),
            None => ReadableState::new(&ReadableOptions::default().with_high_water_mark(0))
                .snapshot(),
        }
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.readable
            .as_ref()
            .map(|rs| rs.state.lock().readable)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StreamError;
    use crate::events::{Event, EventKind};
    use crate::options::ReadableOptions;
    use crate::readable::Readable;
    use crate::stream::{EventSource, ReadableStream};
    use crate::test_utils::{
        chunk, chunks, strings, DataCollector, ErrorCollector, EventLog, VecSource,
    };
    use rstest::rstest;
    use runnel_io::Scheduler;

    fn manual() -> (Scheduler, Readable) {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let readable = Readable::manual(&scheduler, ReadableOptions::default());
        (scheduler, readable)
    }

    #[test]
    fn paused_reads_then_end_on_next_tick() {
        let (scheduler, readable) = manual();
        let log = EventLog::attach(&readable, &[EventKind::End]);

        for value in ["A", "B", "C"] {
            assert!(readable.push(Some(chunk(value))));
        }
        assert!(!readable.push(None));

        assert_eq!(readable.read(None), Some(chunk("A")));
        assert_eq!(readable.read(None), Some(chunk("B")));
        assert_eq!(readable.read(None), Some(chunk("C")));
        assert_eq!(readable.read(None), None);
        assert_eq!(log.count(EventKind::End), 0);

        let _ = scheduler.run_until_idle();
        assert_eq!(log.count(EventKind::End), 1);
        assert!(!readable.is_readable());

        let _ = scheduler.run_until_idle();
        assert_eq!(readable.read(None), None);
        let _ = scheduler.run_until_idle();
        assert_eq!(log.count(EventKind::End), 1);
    }

    #[test]
    fn flowing_delivers_in_order() {
        let (scheduler, readable) = manual();
        let log = EventLog::attach(&readable, &[EventKind::End]);
        let data = DataCollector::attach(&readable);
        let _ = scheduler.run_until_idle();

        for value in ["A", "B", "C"] {
            let _ = readable.push(Some(chunk(value)));
        }
        let _ = readable.push(None);
        let _ = scheduler.run_until_idle();

        assert_eq!(data.strings(), vec!["A", "B", "C"]);
        assert_eq!(log.kinds(), vec![EventKind::End]);
    }

    #[test]
    fn pushes_before_subscription_are_delivered_first() {
        let (scheduler, readable) = manual();
        let _ = readable.push(Some(chunk("early")));
        let data = DataCollector::attach(&readable);
        let _ = readable.push(Some(chunk("late")));
        let _ = readable.push(None);
        let _ = scheduler.run_until_idle();

        assert_eq!(data.strings(), vec!["early", "late"]);
    }

    #[test]
    fn synchronous_source_is_drained_in_order() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let source = VecSource::new(chunks("c", 40));
        let readable = Readable::new(&scheduler, source.clone(), ReadableOptions::default());
        let log = EventLog::attach(&readable, &[EventKind::End]);
        let data = DataCollector::attach(&readable);
        let _ = scheduler.run_until_idle();

        assert_eq!(data.strings(), strings(&chunks("c", 40)));
        assert_eq!(log.count(EventKind::End), 1);
        assert!(source.reads() >= 41);
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(16)]
    fn read_ahead_stops_at_high_water_mark(#[case] high_water_mark: usize) {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let source = VecSource::new(chunks("c", 100));
        let readable = Readable::new(
            &scheduler,
            source.clone(),
            ReadableOptions::default().with_high_water_mark(high_water_mark),
        );

        assert_eq!(readable.read(Some(0)), None);
        let _ = scheduler.run_until_idle();

        assert_eq!(readable.readable_state().length, high_water_mark);
        assert_eq!(source.reads(), high_water_mark);
        assert_eq!(readable.read(None), Some(chunk("c0")));
    }

    #[test]
    fn push_signals_backpressure() {
        runnel_logging::setup_log();
        let scheduler = Scheduler::new();
        let readable = Readable::manual(
            &scheduler,
            ReadableOptions::default().with_high_water_mark(2),
        );

        assert!(readable.push(Some(chunk("a"))));
        assert!(!readable.push(Some(chunk("b"))));
        assert!(!readable.push(Some(chunk("c"))));
        assert_eq!(readable.readable_state().length, 3);
    }

    #[test]
    fn push_after_end_is_reported() {
        let (scheduler, readable) = manual();
        let errors = ErrorCollector::attach(&readable);
        let _ = readable.push(None);
        assert!(!readable.push(Some(chunk("late"))));
        let _ = scheduler.run_until_idle();

        assert_eq!(errors.errors(), vec![StreamError::PushAfterEnd]);
        assert_eq!(readable.readable_state().length, 0);
    }

    #[test]
    fn unshift_prepends_and_fails_after_end() {
        let (scheduler, readable) = manual();
        let errors = ErrorCollector::attach(&readable);
        let _ = readable.push(Some(chunk("b")));
        let _ = readable.unshift(chunk("a"));
        let _ = readable.push(None);

        assert_eq!(readable.read(None), Some(chunk("a")));
        assert_eq!(readable.read(None), Some(chunk("b")));
        assert_eq!(readable.read(None), None);
        let _ = scheduler.run_until_idle();
        assert!(readable.readable_state().emitted_end);

        let _ = readable.unshift(chunk("z"));
        assert_eq!(errors.errors(), vec![StreamError::UnshiftAfterEnd]);
    }

    #[test]
    fn unshift_after_end_of_data_is_allowed_before_end_event() {
        let (_scheduler, readable) = manual();
        let _ = readable.push(None);
        let _ = readable.unshift(chunk("again"));
        assert_eq!(readable.read(None), Some(chunk("again")));
    }

    #[test]
    fn read_zero_never_consumes() {
        let (_scheduler, readable) = manual();
        let _ = readable.push(Some(chunk("a")));
        assert_eq!(readable.read(Some(0)), None);
        assert_eq!(readable.readable_state().length, 1);
        assert_eq!(readable.read(Some(64)), Some(chunk("a")));
    }

    #[test]
    fn pause_and_resume_emit_once_each() {
        let (scheduler, readable) = manual();
        let log = EventLog::attach(&readable, &[EventKind::Pause, EventKind::Resume]);
        let data = DataCollector::attach(&readable);
        let _ = scheduler.run_until_idle();

        readable.pause();
        readable.pause();
        assert!(readable.is_paused());
        let _ = readable.push(Some(chunk("held")));
        let _ = scheduler.run_until_idle();
        assert!(data.strings().is_empty());

        readable.resume();
        readable.resume();
        let _ = scheduler.run_until_idle();
        assert!(!readable.is_paused());
        assert_eq!(data.strings(), vec!["held"]);
        assert_eq!(
            log.kinds(),
            vec![EventKind::Resume, EventKind::Pause, EventKind::Resume]
        );
    }

    #[test]
    fn data_subscription_respects_explicit_pause() {
        let (scheduler, readable) = manual();
        readable.pause();
        let data = DataCollector::attach(&readable);
        let _ = readable.push(Some(chunk("a")));
        let _ = scheduler.run_until_idle();

        assert!(data.strings().is_empty());
        assert_eq!(readable.readable_state().flowing, Some(false));
    }

    #[test]
    fn readable_event_announces_buffered_data() {
        let (scheduler, readable) = manual();
        let handle = readable.clone();
        let pulled = DataCollector::detached();
        let sink = pulled.clone();
        let _ = readable.on(EventKind::Readable, move |_| {
            while let Some(chunk) = handle.read(None) {
                sink.record(chunk);
            }
        });
        let _ = scheduler.run_until_idle();

        let _ = readable.push(Some(chunk("x")));
        let _ = readable.push(Some(chunk("y")));
        let _ = scheduler.run_until_idle();

        assert_eq!(pulled.strings(), vec!["x", "y"]);
    }

    #[test]
    fn end_is_not_emitted_while_data_remains() {
        let (scheduler, readable) = manual();
        let log = EventLog::attach(&readable, &[EventKind::End]);
        let _ = readable.push(Some(chunk("a")));
        let _ = readable.push(None);
        let _ = scheduler.run_until_idle();
        assert_eq!(log.count(EventKind::End), 0);

        let _ = readable.read(None);
        let _ = scheduler.run_until_idle();
        assert_eq!(log.count(EventKind::End), 1);
    }

    #[test]
    fn listener_sees_data_event_for_pulled_chunks() {
        let (_scheduler, readable) = manual();
        let seen = DataCollector::detached();
        let sink = seen.clone();
        // a prepended listener does not switch the stream into flowing mode
        let _ = readable.prepend_listener(EventKind::Data, move |event| {
            if let Event::Data(chunk) = event {
                sink.record(chunk.clone());
            }
        });
        let _ = readable.push(Some(chunk("a")));
        assert_eq!(readable.read(None), Some(chunk("a")));
        assert_eq!(seen.strings(), vec!["a"]);
    }
}
