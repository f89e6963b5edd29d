//! Fixtures shared by the unit and integration tests: canned sources, recording
//! sinks and listeners that capture what a stream emitted.

use crate::error::StreamError;
use crate::events::{Event, EventKind};
use crate::readable::Readable;
use crate::stream::{Chunk, EventSource, ReadableStream, Sink, Source, WriteCallback, WriteChunk};
use runnel_io::{Mutex, Scheduler};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub fn chunk(value: &str) -> Chunk {
    Chunk::copy_from_slice(value.as_bytes())
}

/// `prefix0`, `prefix1`, ... `prefix{count - 1}`
pub fn chunks(prefix: &str, count: usize) -> Vec<Chunk> {
    (0..count).map(|idx| chunk(&format!("{prefix}{idx}"))).collect()
}

pub fn strings(chunks: &[Chunk]) -> Vec<String> {
    chunks
        .iter()
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

/// Pushes one queued chunk per read request, synchronously, then end of data
#[derive(Clone)]
pub struct VecSource {
    remaining: Arc<Mutex<VecDeque<Chunk>>>,
    reads: Arc<AtomicUsize>,
}

impl VecSource {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            remaining: Arc::new(Mutex::new(chunks.into())),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times the stream asked for data
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Source for VecSource {
    fn read(&self, stream: &Readable, _size: usize) {
        let _ = self.reads.fetch_add(1, Ordering::SeqCst);
        let next = self.remaining.lock().pop_front();
        let _ = stream.push(next);
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Completion {
    Immediate,
    NextTick,
    Manual,
}

/// A sink that records every chunk it receives. Completions are reported
/// synchronously, on the next scheduler tick, or only when the test calls
/// [`RecordingSink::complete_next`].
#[derive(Clone)]
pub struct RecordingSink {
    scheduler: Scheduler,
    completion: Completion,
    writev: Arc<AtomicBool>,
    failures: Arc<Mutex<Vec<(usize, StreamError)>>>,
    written: Arc<Mutex<Vec<WriteChunk>>>,
    batches: Arc<Mutex<Vec<usize>>>,
    pending: Arc<Mutex<VecDeque<WriteCallback>>>,
}

impl RecordingSink {
    fn with_completion(scheduler: &Scheduler, completion: Completion) -> Self {
        Self {
            scheduler: scheduler.clone(),
            completion,
            writev: Arc::new(AtomicBool::new(false)),
            failures: Arc::new(Mutex::new(Vec::new())),
            written: Arc::new(Mutex::new(Vec::new())),
            batches: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn immediate(scheduler: &Scheduler) -> Self {
        Self::with_completion(scheduler, Completion::Immediate)
    }

    pub fn next_tick(scheduler: &Scheduler) -> Self {
        Self::with_completion(scheduler, Completion::NextTick)
    }

    pub fn manual(scheduler: &Scheduler) -> Self {
        Self::with_completion(scheduler, Completion::Manual)
    }

    /// Accept batched writes
    pub fn with_writev(self) -> Self {
        self.writev.store(true, Ordering::SeqCst);
        self
    }

    /// Fail the write of the `index`th chunk (counting from zero) with `err`
    pub fn failing_at(self, index: usize, err: StreamError) -> Self {
        self.failures.lock().push((index, err));
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn written(&self) -> Vec<WriteChunk> {
        self.written.lock().clone()
    }

    pub fn written_strings(&self) -> Vec<String> {
        let chunks: Vec<Chunk> = self.written.lock().iter().map(|w| w.chunk.clone()).collect();
        strings(&chunks)
    }

    /// The size of every batched write received
    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    /// Writes waiting for [`RecordingSink::complete_next`]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Completes the oldest pending write. Returns false if none was pending.
    pub fn complete_next(&self, result: Result<(), StreamError>) -> bool {
        let next = self.pending.lock().pop_front();
        match next {
            Some(done) => {
                done(result);
                true
            }
            None => false,
        }
    }

    fn record(&self, chunks: Vec<WriteChunk>) -> Result<(), StreamError> {
        let mut written = self.written.lock();
        let first = written.len();
        written.extend(chunks);
        let range = first..written.len();
        drop(written);

        self.failures
            .lock()
            .iter()
            .find(|(index, _)| range.contains(index))
            .map(|(_, err)| Err(err.clone()))
            .unwrap_or(Ok(()))
    }

    fn complete(&self, result: Result<(), StreamError>, done: WriteCallback) {
        match self.completion {
            Completion::Immediate => done(result),
            Completion::NextTick => self.scheduler.schedule(move || done(result)),
            Completion::Manual => self.pending.lock().push_back(done),
        }
    }
}

impl Sink for RecordingSink {
    fn write(&self, chunk: WriteChunk, done: WriteCallback) {
        let result = self.record(vec![chunk]);
        self.complete(result, done)
    }

    fn writev(&self, chunks: Vec<WriteChunk>, done: WriteCallback) {
        self.batches.lock().push(chunks.len());
        let result = self.record(chunks);
        self.complete(result, done)
    }

    fn supports_writev(&self) -> bool {
        self.writev.load(Ordering::SeqCst)
    }
}

/// Collects `data` payloads
#[derive(Clone, Default)]
pub struct DataCollector {
    chunks: Arc<Mutex<Vec<Chunk>>>,
}

impl DataCollector {
    /// Subscribes to `data`, which switches the stream into flowing mode
    pub fn attach<S: EventSource>(stream: &S) -> Self {
        let collector = Self::detached();
        let sink = collector.clone();
        let _ = stream.on(EventKind::Data, move |event| {
            if let Event::Data(chunk) = event {
                sink.record(chunk.clone());
            }
        });

        collector
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn record(&self, chunk: Chunk) {
        self.chunks.lock().push(chunk);
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks.lock().clone()
    }

    pub fn strings(&self) -> Vec<String> {
        strings(&self.chunks.lock())
    }
}

/// Collects emitted errors. Attaching one also keeps error emissions from
/// panicking.
#[derive(Clone, Default)]
pub struct ErrorCollector {
    errors: Arc<Mutex<Vec<StreamError>>>,
}

impl ErrorCollector {
    pub fn attach<S: EventSource>(stream: &S) -> Self {
        let collector = Self::default();
        let errors = collector.errors.clone();
        let _ = stream.on(EventKind::Error, move |event| {
            if let Event::Error(err) = event {
                errors.lock().push(err.clone());
            }
        });

        collector
    }

    pub fn errors(&self) -> Vec<StreamError> {
        self.errors.lock().clone()
    }
}

/// Records the order in which the chosen event kinds were emitted
#[derive(Clone, Default)]
pub struct EventLog {
    kinds: Arc<Mutex<Vec<EventKind>>>,
}

impl EventLog {
    pub fn attach<S: EventSource>(stream: &S, kinds: &[EventKind]) -> Self {
        let log = Self::default();
        for kind in kinds {
            let kinds = log.kinds.clone();
            let _ = stream.on(*kind, move |event| kinds.lock().push(event.kind()));
        }

        log
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.kinds.lock().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds.lock().iter().filter(|k| **k == kind).count()
    }
}
